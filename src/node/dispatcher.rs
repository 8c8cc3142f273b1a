// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! `Command` dispatcher.
//!
//! One loop per node pulls a single event at a time (transport datagram,
//! facade call, or timer expiry) and runs its handler to completion on the
//! core, then carries out the I/O the handler produced. Timers are sleeps
//! on the runtime that re-enqueue a `HandleTimeout`; dropping the
//! dispatcher cancels all of them, including future ones.

use super::command::Command;
use super::core::Core;
use crate::comm::{Comm, ConnectionEvent};
use crate::log_markers::LogMarker;
use crate::messages::WireMsg;
use std::collections::VecDeque;
use tokio::sync::{mpsc, watch};
use tokio::time;

pub(crate) struct Dispatcher {
    core: Core,
    comm: Comm,
    command_tx: mpsc::Sender<Command>,
    command_rx: mpsc::Receiver<Command>,
    incoming_rx: mpsc::Receiver<ConnectionEvent>,
    cancel_timer_tx: watch::Sender<bool>,
    cancel_timer_rx: watch::Receiver<bool>,
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Cancel all scheduled timers including any future ones.
        let _ = self.cancel_timer_tx.send(true);
    }
}

impl Dispatcher {
    pub(crate) fn new(
        core: Core,
        comm: Comm,
        command_tx: mpsc::Sender<Command>,
        command_rx: mpsc::Receiver<Command>,
        incoming_rx: mpsc::Receiver<ConnectionEvent>,
    ) -> Self {
        let (cancel_timer_tx, cancel_timer_rx) = watch::channel(false);
        Self {
            core,
            comm,
            command_tx,
            command_rx,
            incoming_rx,
            cancel_timer_tx,
            cancel_timer_rx,
        }
    }

    /// Drives the node until it leaves the tree or every input closes.
    pub(crate) async fn run(mut self) {
        enum Input {
            Command(Option<Command>),
            Datagram(Option<ConnectionEvent>),
        }

        loop {
            let input = tokio::select! {
                command = self.command_rx.recv() => Input::Command(command),
                event = self.incoming_rx.recv() => Input::Datagram(event),
            };
            match input {
                Input::Command(Some(command)) => self.process(command).await,
                Input::Datagram(Some((sender, bytes))) => match WireMsg::from_bytes(&bytes) {
                    Ok(wire_msg) => {
                        self.process(Command::HandleMessage { sender, wire_msg }).await
                    }
                    Err(error) => {
                        debug!(
                            "{} undecodable datagram from {}: {:?}",
                            LogMarker::MessageDropped,
                            sender,
                            error
                        );
                    }
                },
                Input::Command(None) | Input::Datagram(None) => break,
            }
            if self.core.is_shutdown() {
                break;
            }
        }
        self.core.cancel_pending();
        let _ = self.cancel_timer_tx.send(true);
    }

    /// Handles one command and transitively every command it produces.
    async fn process(&mut self, command: Command) {
        let mut queue = VecDeque::new();
        queue.push_back(command);
        while let Some(command) = queue.pop_front() {
            trace!("{} {}", LogMarker::CommandHandleStart, command);
            match command {
                Command::SendMessage {
                    recipient,
                    wire_msg,
                } => {
                    if let Err(error) = self.comm.send(&recipient, &wire_msg).await {
                        warn!("sending {} failed: {:?}", wire_msg, error);
                        if recipient.is_complete() {
                            queue.push_back(Command::HandlePeerLost(recipient));
                        }
                    }
                }
                Command::SendDiscovery(wire_msg) => {
                    if let Err(error) = self.comm.send_discovery(&wire_msg).await {
                        warn!("discovery probe failed: {:?}", error);
                    }
                }
                Command::ScheduleTimeout {
                    duration,
                    kind,
                    ref_event,
                    token,
                } => {
                    trace!("{} {:?} #{}", LogMarker::TimeoutScheduled, kind, token);
                    self.spawn_timer(duration, kind, ref_event, token);
                }
                other => {
                    let cmd_display = other.to_string();
                    match self.core.handle_command(other) {
                        Ok(follow_ups) => {
                            trace!("{} {}", LogMarker::CommandHandleEnd, cmd_display);
                            queue.extend(follow_ups);
                        }
                        Err(error) => {
                            error!(
                                "{} {}: {:?}",
                                LogMarker::CommandHandleError,
                                cmd_display,
                                error
                            );
                        }
                    }
                }
            }
        }
    }

    fn spawn_timer(
        &self,
        duration: std::time::Duration,
        kind: crate::timeouts::TimeoutKind,
        ref_event: Option<crate::messages::EventId>,
        token: u64,
    ) {
        if *self.cancel_timer_rx.borrow() {
            // timers are already cancelled, do nothing
            return;
        }
        let mut cancel_rx = self.cancel_timer_rx.clone();
        let command_tx = self.command_tx.clone();
        let _ = tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(duration) => {
                    let _ = command_tx
                        .send(Command::HandleTimeout { token, kind, ref_event })
                        .await;
                }
                _ = cancel_rx.changed() => {}
            }
        });
    }
}

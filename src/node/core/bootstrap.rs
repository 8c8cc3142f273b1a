// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! Bootstrap discovery: a joining peer multicasts a probe and joins via the
//! first connected peer that answers. The listen window grows with an
//! exponential backoff until a responder shows up or the overall budget is
//! exhausted.

use super::Core;
use crate::error::Result;
use crate::fsm::{FsmEvent, State};
use crate::messages::{Header, MsgTag, NodeMsg, WireMsg};
use crate::node::command::{next_timer_token, Command};
use crate::node::event::Event;
use crate::node::NodeState;
use crate::peer::NodeInfo;
use crate::timeouts::TimeoutKind;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::net::SocketAddr;
use std::time::Duration;

impl Core {
    pub(super) fn start_discovery(&mut self) -> Result<Vec<Command>> {
        let _ = self.fsm.apply(FsmEvent::Send(MsgTag::Bootstrap))?;
        self.discovery_backoff = Some(ExponentialBackoff {
            initial_interval: self.config.timeouts.bootstrap_response,
            max_interval: self.config.timeouts.bootstrap_response * 8,
            max_elapsed_time: Some(Duration::from_secs(15)),
            ..ExponentialBackoff::default()
        });
        Ok(vec![
            self.discovery_probe(),
            self.schedule(TimeoutKind::BootstrapResponse, None),
        ])
    }

    fn discovery_probe(&self) -> Command {
        // the probe is addressed at whoever listens on the group
        let wire_msg = WireMsg::new(
            self.node(),
            self.node(),
            NodeMsg::Bootstrap {
                joiner_endpoint: self.local_addr(),
            },
        );
        Command::SendDiscovery(wire_msg)
    }

    /// A connected peer answers every probe with its own identity.
    pub(super) fn handle_bootstrap(
        &mut self,
        _header: &Header,
        joiner_endpoint: SocketAddr,
    ) -> Result<Vec<Command>> {
        if joiner_endpoint == self.local_addr() {
            // our own probe reflected by the group
            return Ok(vec![]);
        }
        let joiner = NodeInfo::new(
            crate::position::Position::root(self.fanout)?,
            joiner_endpoint,
            crate::peer::Uuid::nil(),
        );
        let (_, send) = self.prepare(
            joiner,
            NodeMsg::BootstrapResponse {
                responder: self.node(),
            },
            None,
        )?;
        Ok(vec![send])
    }

    /// First responder wins; later ones are kept as fallback contacts for
    /// join retries.
    pub(super) fn handle_bootstrap_response(
        &mut self,
        _header: &Header,
        responder: NodeInfo,
    ) -> Result<Vec<Command>> {
        let endpoint = match responder.endpoint() {
            Some(endpoint) => endpoint,
            None => return Ok(vec![]),
        };
        if self.fsm.state() == State::WaitForBootstrapResponse {
            self.discovery_backoff = None;
            return self.send_join_request(endpoint, 0);
        }
        if !self.bootstrap_candidates.contains(&endpoint) {
            self.bootstrap_candidates.push(endpoint);
        }
        Ok(vec![])
    }

    pub(super) fn handle_bootstrap_timeout(&mut self) -> Result<Vec<Command>> {
        if self.fsm.state() != State::WaitForBootstrapResponse {
            return Ok(vec![]);
        }
        if let Some(delay) = self
            .discovery_backoff
            .as_mut()
            .and_then(Backoff::next_backoff)
        {
            debug!("no bootstrap response, probing again for {:?}", delay);
            return Ok(vec![
                self.discovery_probe(),
                Command::ScheduleTimeout {
                    duration: delay,
                    kind: TimeoutKind::BootstrapResponse,
                    ref_event: None,
                    token: next_timer_token(),
                },
            ]);
        }

        let _ = self
            .fsm
            .apply(FsmEvent::Timeout(TimeoutKind::BootstrapResponse))?;
        error!("no bootstrap contact answered");
        self.publish_event(Event::JoinFailed);
        self.set_state(NodeState::Error);
        Ok(vec![])
    }
}

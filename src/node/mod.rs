// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! The public face of a peer: start it, feed it attributes, query the
//! overlay, stop it.

pub(crate) mod command;
mod core;
mod dispatcher;
pub(crate) mod event;
pub(crate) mod procedures;

pub use event::{Event, EventStream};

use self::command::Command;
use self::core::Core;
use self::dispatcher::Dispatcher;
use crate::comm::{Comm, ConnectionEvent, Transport, UdpTransport};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::esearch::{FindQuery, FindResult};
use crate::peer::{NodeInfo, Uuid};
use crate::position::Position;
use crate::store::Entry;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

static EVENT_CHANNEL_SIZE: usize = 64;
static COMMAND_CHANNEL_SIZE: usize = 256;
static INCOMING_CHANNEL_SIZE: usize = 256;

/// Facade-visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Starting up or joining.
    Started,
    /// Member of the tree.
    Connected,
    /// Out of the tree after a graceful leave.
    Idle,
    /// The join attempt failed terminally.
    Error,
}

/// A running overlay peer.
///
/// Dropping the handle does not stop the peer; call [`Node::stop`] for a
/// graceful leave.
#[allow(missing_debug_implementations)]
pub struct Node {
    command_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<NodeState>,
    node_rx: watch::Receiver<NodeInfo>,
}

impl Node {
    /// Creates a node over UDP using the configured local address and
    /// bootstraps it into the tree.
    pub async fn start(config: Config) -> Result<(Self, EventStream)> {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CHANNEL_SIZE);
        let transport =
            UdpTransport::bind(config.local_addr, config.discovery_group, incoming_tx).await?;
        Self::with_transport(config, transport, incoming_rx).await
    }

    /// Creates a node over a caller-provided transport; used with the
    /// in-memory hub in tests and by embedders with their own datagram
    /// layer.
    pub async fn with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
        incoming_rx: mpsc::Receiver<ConnectionEvent>,
    ) -> Result<(Self, EventStream)> {
        config.validate()?;
        let local_addr = transport.local_addr();

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(NodeState::Started);
        let placeholder = NodeInfo::new(
            Position::root(config.fanout)?,
            local_addr,
            Uuid::random(),
        );
        let (node_tx, node_rx) = watch::channel(placeholder);

        let comm = Comm::new(transport, config.discovery_group);
        let core = Core::new(config, local_addr, event_tx, state_tx, node_tx)?;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let dispatcher = Dispatcher::new(
            core,
            comm,
            command_tx.clone(),
            command_rx,
            incoming_rx,
        );
        let _ = tokio::spawn(dispatcher.run());

        command_tx
            .send(Command::InitiateJoin)
            .await
            .map_err(|_| Error::Cancelled)?;

        // resolve once the join concluded either way
        let mut joining = state_rx.clone();
        loop {
            match *joining.borrow() {
                NodeState::Connected => break,
                NodeState::Error => {
                    return Err(Error::JoinFailed("could not enter the tree".to_string()))
                }
                _ => {}
            }
            if joining.changed().await.is_err() {
                return Err(Error::JoinFailed("node terminated while joining".to_string()));
            }
        }

        Ok((
            Self {
                command_tx,
                state_rx,
                node_rx,
            },
            EventStream::new(event_rx),
        ))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        *self.state_rx.borrow()
    }

    /// Our current identity in the tree; the position can change when the
    /// node fills a leaver's slot.
    pub fn local_node(&self) -> NodeInfo {
        *self.node_rx.borrow()
    }

    /// Inserts fresh attributes into the local store. Returns once the
    /// store is mutated; propagation to subscribers and the responsible
    /// DSN happens in the background.
    pub async fn insert(&self, entries: Vec<Entry>) -> Result<()> {
        self.roundtrip(|reply| Command::Insert(entries, reply)).await
    }

    /// Updates present attributes; static values and value types are
    /// immutable.
    pub async fn update(&self, entries: Vec<Entry>) -> Result<()> {
        self.roundtrip(|reply| Command::Update(entries, reply)).await
    }

    /// Removes attributes; unknown keys are ignored.
    pub async fn remove(&self, keys: Vec<String>) -> Result<()> {
        self.roundtrip(|reply| Command::Remove(keys, reply)).await
    }

    async fn roundtrip(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<()>>) -> Command,
    ) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .await
            .map_err(|_| Error::Cancelled)?;
        done.await.map_err(|_| Error::Cancelled)?
    }

    /// Runs a find query over the overlay. The future resolves on this
    /// node's loop when the final answer arrives.
    pub async fn find(&self, query: FindQuery) -> Result<FindResult> {
        let (reply, result) = oneshot::channel();
        self.command_tx
            .send(Command::Find(query, reply))
            .await
            .map_err(|_| Error::Cancelled)?;
        result.await.map_err(|_| Error::Cancelled)?
    }

    /// Gracefully leaves the tree, drains and terminates the node.
    /// Idempotent: stopping an already idle node succeeds immediately.
    pub async fn stop(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        if self
            .command_tx
            .send(Command::InitiateLeave(reply))
            .await
            .is_err()
        {
            // the loop is already gone
            return Ok(());
        }
        match done.await {
            Ok(outcome) => outcome,
            Err(_) => Ok(()),
        }
    }
}

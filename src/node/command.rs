// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

use crate::error::Result;
use crate::esearch::{FindQuery, FindResult};
use crate::messages::{EventId, WireMsg};
use crate::peer::NodeInfo;
use crate::store::Entry;
use crate::timeouts::TimeoutKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{fmt, time::Duration};
use tokio::sync::oneshot;

/// Command for the node's event loop. Every stimulus, network or local,
/// becomes one of these and is handled to completion before the next.
#[derive(Debug)]
pub(crate) enum Command {
    /// Handle a message received from the transport.
    HandleMessage {
        sender: SocketAddr,
        wire_msg: WireMsg,
    },
    /// Handle a timeout previously scheduled with `ScheduleTimeout`.
    HandleTimeout {
        token: u64,
        kind: TimeoutKind,
        ref_event: Option<EventId>,
    },
    /// Handle a peer that a send has failed toward.
    HandlePeerLost(NodeInfo),
    /// Send a message to the given recipient.
    SendMessage {
        recipient: NodeInfo,
        wire_msg: WireMsg,
    },
    /// Send a discovery probe to the multicast group.
    SendDiscovery(WireMsg),
    /// Schedule a timeout after the given duration; on expiry a
    /// `HandleTimeout` with the same token is raised.
    ScheduleTimeout {
        duration: Duration,
        kind: TimeoutKind,
        ref_event: Option<EventId>,
        token: u64,
    },
    /// Enter the tree as configured (root, contact, or discovery).
    InitiateJoin,
    /// Gracefully leave the tree and shut the loop down afterwards.
    InitiateLeave(oneshot::Sender<Result<()>>),
    /// Mutate the local attribute store.
    Insert(Vec<Entry>, oneshot::Sender<Result<()>>),
    Update(Vec<Entry>, oneshot::Sender<Result<()>>),
    Remove(Vec<String>, oneshot::Sender<Result<()>>),
    /// Run a find query; the reply resolves the caller's future.
    Find(FindQuery, oneshot::Sender<Result<FindResult>>),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::HandleMessage { wire_msg, .. } => write!(f, "HandleMessage {}", wire_msg),
            Command::HandleTimeout { kind, token, .. } => {
                write!(f, "HandleTimeout {:?} #{}", kind, token)
            }
            Command::HandlePeerLost(peer) => write!(f, "HandlePeerLost {}", peer),
            Command::SendMessage { wire_msg, .. } => write!(f, "SendMessage {}", wire_msg),
            Command::SendDiscovery(wire_msg) => write!(f, "SendDiscovery {}", wire_msg),
            Command::ScheduleTimeout { kind, token, .. } => {
                write!(f, "ScheduleTimeout {:?} #{}", kind, token)
            }
            Command::InitiateJoin => write!(f, "InitiateJoin"),
            Command::InitiateLeave(_) => write!(f, "InitiateLeave"),
            Command::Insert(entries, _) => write!(f, "Insert x{}", entries.len()),
            Command::Update(entries, _) => write!(f, "Update x{}", entries.len()),
            Command::Remove(keys, _) => write!(f, "Remove x{}", keys.len()),
            Command::Find(query, _) => write!(f, "Find {}", query.expression()),
        }
    }
}

/// Generate unique timer token.
pub(crate) fn next_timer_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

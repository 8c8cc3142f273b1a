// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

use crate::peer::NodeInfo;
use crate::routing_info::Relationship;
use tokio::sync::mpsc;

/// What the embedding host observes about the node's life in the tree.
#[derive(Debug, Clone)]
#[allow(clippy::large_enum_variant)]
pub enum Event {
    /// The node entered the tree at the given identity.
    Joined(NodeInfo),
    /// The current join attempt failed terminally.
    JoinFailed,
    /// A new child was admitted below us.
    ChildJoined(NodeInfo),
    /// The node moved to a different position by replacement.
    Relocated {
        previous: NodeInfo,
        current: NodeInfo,
    },
    /// A neighbor slot changed occupant.
    NeighborChanged {
        relationship: Relationship,
        old: Option<NodeInfo>,
        new: Option<NodeInfo>,
    },
    /// A neighbor stopped answering and was dropped.
    PeerLost(NodeInfo),
    /// The node left the tree.
    Left,
}

/// Stream of node events.
///
/// Async subscriber for the events raised by a running node.
pub struct EventStream {
    events: mpsc::Receiver<Event>,
}

impl EventStream {
    pub(crate) fn new(events: mpsc::Receiver<Event>) -> Self {
        Self { events }
    }

    /// Returns the next event, or `None` once the node terminated.
    pub async fn next(&mut self) -> Option<Event> {
        self.events.recv().await
    }
}

// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

use crate::position::Position;
use hex_fmt::HexFmt;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    net::SocketAddr,
};

/// Stable identity of a peer, unchanged across position moves.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Uuid([u8; 16]);

impl Uuid {
    /// Generates a fresh random identity.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// The all-zero identity, used for placeholder peers whose occupant is
    /// not known yet.
    pub(crate) fn nil() -> Self {
        Self([0; 16])
    }
}

impl Display for Uuid {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:0.8}", HexFmt(&self.0))
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Overlay peer identity.
///
/// When a node knows another node as a `NodeInfo` it's logically connected
/// to it: `position` is the slot the peer occupies in the tree, `endpoint`
/// is where datagrams reach it. Two `NodeInfo`s with equal position but a
/// different endpoint or uuid denote the same slot under a different
/// occupant, which every holder must treat as a neighbor change.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    position: Position,
    endpoint: Option<SocketAddr>,
    uuid: Uuid,
}

impl Display for NodeInfo {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.endpoint {
            Some(addr) => write!(f, "{} at {} ({})", self.position, addr, self.uuid),
            None => write!(f, "{} unreachable ({})", self.position, self.uuid),
        }
    }
}

impl Eq for NodeInfo {}

// Equality is (position, endpoint); the uuid rides along as the stable
// identity used for tie-breaks and occupant comparison.
impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.position == other.position && self.endpoint == other.endpoint
    }
}

impl Hash for NodeInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.position.hash(state);
        self.endpoint.hash(state);
    }
}

impl Ord for NodeInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.position
            .cmp(&other.position)
            .then_with(|| self.endpoint.cmp(&other.endpoint))
    }
}

impl PartialOrd for NodeInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl NodeInfo {
    /// Creates a new `NodeInfo` for a reachable peer.
    pub fn new(position: Position, endpoint: SocketAddr, uuid: Uuid) -> Self {
        Self {
            position,
            endpoint: Some(endpoint),
            uuid,
        }
    }

    /// A `NodeInfo` whose endpoint is not known yet.
    pub(crate) fn unreachable(position: Position, uuid: Uuid) -> Self {
        Self {
            position,
            endpoint: None,
            uuid,
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Whether both the logical and the physical part are usable.
    pub fn is_complete(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Same slot, same occupant.
    pub fn same_occupant(&self, other: &NodeInfo) -> bool {
        self == other && self.uuid == other.uuid
    }

    /// This peer under a new position, keeping endpoint and uuid.
    pub(crate) fn at_position(&self, position: Position) -> NodeInfo {
        NodeInfo { position, ..*self }
    }

    /// Horizontal value of the occupied slot.
    pub fn horizontal(&self, treemapper_root: u16) -> f64 {
        self.position.horizontal(treemapper_root)
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    /// A reachable `NodeInfo` with a synthetic loopback endpoint derived
    /// from the coordinates, handy wherever tests need distinct peers.
    pub(crate) fn node(level: u32, number: u32, fanout: u16) -> NodeInfo {
        let position = Position::new(level, number, fanout).expect("valid position");
        let port = (10_000 + level * 512 + number) as u16;
        NodeInfo::new(
            position,
            SocketAddr::from(([127, 0, 0, 1], port)),
            Uuid::random(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::node;
    use super::*;

    #[test]
    fn equality_ignores_uuid() {
        let a = node(2, 1, 2);
        let b = NodeInfo::new(
            a.position(),
            a.endpoint().expect("endpoint"),
            Uuid::random(),
        );
        assert_eq!(a, b);
        assert!(!a.same_occupant(&b));
    }

    #[test]
    fn same_slot_different_endpoint_is_a_different_occupant() {
        let a = node(2, 1, 2);
        let b = NodeInfo::new(
            a.position(),
            SocketAddr::from(([127, 0, 0, 1], 39_999)),
            a.uuid(),
        );
        assert_ne!(a, b);
    }

    #[test]
    fn reposition_keeps_identity() {
        let a = node(3, 4, 2);
        let moved = a.at_position(Position::new(1, 1, 2).expect("valid position"));
        assert_eq!(moved.uuid(), a.uuid());
        assert_eq!(moved.endpoint(), a.endpoint());
        assert_eq!(moved.position(), Position::new(1, 1, 2).expect("valid"));
    }
}

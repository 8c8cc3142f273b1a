// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! Typed overlay messages and their wire form.
//!
//! Every message is a standard header (sender, target, event id, optional
//! referenced event id) plus one [`NodeMsg`] payload, serialized with
//! bincode into a length-prefixed blob. One datagram carries one message.

use crate::error::{Error, Result};
use crate::esearch::FindQuery;
use crate::peer::NodeInfo;
use crate::position::Position;
use crate::routing_info::RoutingSnapshot;
use crate::store::{Record, Value};
use bytes::{Bytes, BytesMut};
use hex_fmt::HexFmt;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;

/// Unique id of a message exchange; answers reference it in
/// `ref_event_id`, and the procedure registry keys its scratch state by it.
#[derive(Ord, PartialOrd, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Hash)]
pub struct EventId(u64);

impl EventId {
    /// Generates a new `EventId` with random content.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:0.8}", HexFmt(self.0.to_be_bytes()))
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The standard header carried by every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub sender: NodeInfo,
    pub target: NodeInfo,
    pub event_id: EventId,
    pub ref_event_id: Option<EventId>,
}

/// Why a join attempt was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinRejectionReason {
    /// The acceptor is already admitting another joiner.
    ConcurrentJoin,
    /// The receiver cannot currently take or route joiners.
    NotAccepting,
}

/// Which part of the tree the receiving DSN is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    None,
    Left,
    Right,
}

/// Why an exact search could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchFailureReason {
    /// No peer occupies the destination position.
    PositionEmpty,
    /// The hop budget ran out before reaching the destination.
    HopBudgetExhausted,
}

/// The message payloads of the overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(clippy::large_enum_variant)]
pub enum NodeMsg {
    /// A new peer asks to be placed in the tree; routed toward the
    /// insertion position.
    Join { joiner_endpoint: SocketAddr },
    /// The accepting parent places the joiner and seeds its routing state.
    JoinAccept {
        fanout: u16,
        treemapper_root: u16,
        new_position: Position,
        adjacent_left: Option<NodeInfo>,
        adjacent_right: Option<NodeInfo>,
        routing_seed: Vec<NodeInfo>,
    },
    /// The joiner confirms its installation to the parent and adjacents.
    JoinAcceptAck { joiner: NodeInfo },
    /// Terminal refusal of this join attempt.
    JoinRejected { reason: JoinRejectionReason },
    /// Multicast discovery probe of a joining peer.
    Bootstrap { joiner_endpoint: SocketAddr },
    /// A connected peer answers a discovery probe.
    BootstrapResponse { responder: NodeInfo },
    /// Routed toward the last peer in level order to fill `vacant`.
    FindReplacement { requester: NodeInfo, vacant: Position },
    /// The last peer offers to move into the vacated position.
    ReplacementOffer {
        offered_position: Position,
        incumbent: NodeInfo,
    },
    /// The leaver hands its routing state over to the incumbent.
    ReplacementAck { vacated: RoutingSnapshot },
    /// The sender no longer occupies `removed`'s slot.
    RemoveNeighbor { removed: NodeInfo },
    /// The sender informs about the (new) occupant of a slot.
    UpdateNeighbor { neighbor: NodeInfo },
    /// Point-to-point routing envelope toward a tree position.
    SearchExact {
        destination: Position,
        hops_left: u32,
        payload: Box<WireMsg>,
    },
    /// Returned to the originator when routing cannot reach `destination`.
    SearchExactFailure {
        destination: Position,
        reason: SearchFailureReason,
    },
    /// A DSN asks a peer for attribute values.
    AttributeInquiryRequest {
        keys: Vec<String>,
        inquire_all: bool,
    },
    /// Attribute values pushed to a DSN, solicited or not.
    AttributeInquiryAnswer {
        inquired: NodeInfo,
        attributes: Vec<(String, Record)>,
        removed_keys: Vec<String>,
    },
    /// Subscribe to or unsubscribe from pushed updates of `keys`.
    SubscriptionOrder { keys: Vec<String>, subscribe: bool },
    /// Pushed update of a single subscribed key.
    SubscriptionUpdate {
        key: String,
        value: Option<Value>,
        timestamp: u64,
    },
    /// A find query travelling through the DSN aggregation tree.
    FindQueryRequest {
        query: FindQuery,
        direction: Direction,
        /// Horizontal interval the receiver is responsible for.
        interval: (f64, f64),
    },
    /// Aggregated results flowing back toward the initiator.
    FindQueryAnswer {
        nodes_with_attributes: Vec<(NodeInfo, Vec<(String, Value)>)>,
    },
}

/// Lightweight message-kind discriminant for FSM gating and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgTag {
    Join,
    JoinAccept,
    JoinAcceptAck,
    JoinRejected,
    Bootstrap,
    BootstrapResponse,
    FindReplacement,
    ReplacementOffer,
    ReplacementAck,
    RemoveNeighbor,
    UpdateNeighbor,
    SearchExact,
    SearchExactFailure,
    AttributeInquiryRequest,
    AttributeInquiryAnswer,
    SubscriptionOrder,
    SubscriptionUpdate,
    FindQueryRequest,
    FindQueryAnswer,
}

impl NodeMsg {
    pub fn tag(&self) -> MsgTag {
        match self {
            NodeMsg::Join { .. } => MsgTag::Join,
            NodeMsg::JoinAccept { .. } => MsgTag::JoinAccept,
            NodeMsg::JoinAcceptAck { .. } => MsgTag::JoinAcceptAck,
            NodeMsg::JoinRejected { .. } => MsgTag::JoinRejected,
            NodeMsg::Bootstrap { .. } => MsgTag::Bootstrap,
            NodeMsg::BootstrapResponse { .. } => MsgTag::BootstrapResponse,
            NodeMsg::FindReplacement { .. } => MsgTag::FindReplacement,
            NodeMsg::ReplacementOffer { .. } => MsgTag::ReplacementOffer,
            NodeMsg::ReplacementAck { .. } => MsgTag::ReplacementAck,
            NodeMsg::RemoveNeighbor { .. } => MsgTag::RemoveNeighbor,
            NodeMsg::UpdateNeighbor { .. } => MsgTag::UpdateNeighbor,
            NodeMsg::SearchExact { .. } => MsgTag::SearchExact,
            NodeMsg::SearchExactFailure { .. } => MsgTag::SearchExactFailure,
            NodeMsg::AttributeInquiryRequest { .. } => MsgTag::AttributeInquiryRequest,
            NodeMsg::AttributeInquiryAnswer { .. } => MsgTag::AttributeInquiryAnswer,
            NodeMsg::SubscriptionOrder { .. } => MsgTag::SubscriptionOrder,
            NodeMsg::SubscriptionUpdate { .. } => MsgTag::SubscriptionUpdate,
            NodeMsg::FindQueryRequest { .. } => MsgTag::FindQueryRequest,
            NodeMsg::FindQueryAnswer { .. } => MsgTag::FindQueryAnswer,
        }
    }
}

/// A full message as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMsg {
    pub header: Header,
    pub msg: NodeMsg,
}

impl Display for WireMsg {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:?} {} from {} to {}",
            self.msg.tag(),
            self.header.event_id,
            self.header.sender.position(),
            self.header.target.position()
        )
    }
}

impl WireMsg {
    pub fn new(sender: NodeInfo, target: NodeInfo, msg: NodeMsg) -> Self {
        Self {
            header: Header {
                sender,
                target,
                event_id: EventId::random(),
                ref_event_id: None,
            },
            msg,
        }
    }

    /// A message answering an earlier one, carrying its event id as
    /// reference.
    pub fn reply_to(sender: NodeInfo, target: NodeInfo, ref_event_id: EventId, msg: NodeMsg) -> Self {
        Self {
            header: Header {
                sender,
                target,
                event_id: EventId::random(),
                ref_event_id: Some(ref_event_id),
            },
            msg,
        }
    }

    pub fn tag(&self) -> MsgTag {
        self.msg.tag()
    }

    pub fn event_id(&self) -> EventId {
        self.header.event_id
    }

    /// Serializes into the length-prefixed wire blob.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let body = bincode::serialize(self)?;
        let len = u32::try_from(body.len()).map_err(|_| Error::InvalidMessage)?;
        let mut framed = BytesMut::with_capacity(4 + body.len());
        framed.extend_from_slice(&len.to_le_bytes());
        framed.extend_from_slice(&body);
        Ok(framed.freeze())
    }

    /// Parses a length-prefixed wire blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::InvalidMessage);
        }
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let body = &bytes[4..];
        if body.len() != len {
            return Err(Error::InvalidMessage);
        }
        Ok(bincode::deserialize(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::esearch::{Expression, FindQueryScope, Selection};
    use crate::peer::test_utils::node;
    use crate::store::ValueType;

    fn roundtrip(msg: NodeMsg) {
        let wire = WireMsg::new(node(1, 0, 2), node(0, 0, 2), msg);
        let bytes = wire.to_bytes().expect("serialize");
        let parsed = WireMsg::from_bytes(&bytes).expect("deserialize");
        assert_eq!(parsed, wire);
    }

    #[test]
    fn every_message_kind_roundtrips() {
        let position = node(2, 1, 2).position();
        let peer = node(2, 1, 2);
        let record = Record {
            value: Value::from(42),
            timestamp: 1200,
            value_type: ValueType::Dynamic,
        };

        roundtrip(NodeMsg::Join {
            joiner_endpoint: peer.endpoint().expect("endpoint"),
        });
        roundtrip(NodeMsg::JoinAccept {
            fanout: 2,
            treemapper_root: 100,
            new_position: position,
            adjacent_left: Some(node(1, 0, 2)),
            adjacent_right: None,
            routing_seed: vec![node(2, 0, 2), node(2, 3, 2)],
        });
        roundtrip(NodeMsg::JoinAcceptAck { joiner: peer });
        roundtrip(NodeMsg::JoinRejected {
            reason: JoinRejectionReason::ConcurrentJoin,
        });
        roundtrip(NodeMsg::Bootstrap {
            joiner_endpoint: peer.endpoint().expect("endpoint"),
        });
        roundtrip(NodeMsg::BootstrapResponse {
            responder: node(0, 0, 2),
        });
        roundtrip(NodeMsg::FindReplacement {
            requester: peer,
            vacant: position,
        });
        roundtrip(NodeMsg::ReplacementOffer {
            offered_position: position,
            incumbent: peer,
        });
        roundtrip(NodeMsg::ReplacementAck {
            vacated: RoutingSnapshot {
                node: peer,
                parent: Some(node(1, 0, 2)),
                children: vec![None, Some(node(3, 3, 2))],
                adjacent_left: None,
                adjacent_right: Some(node(1, 1, 2)),
                routing_table: vec![node(2, 0, 2)],
                routing_table_children: vec![node(3, 1, 2)],
            },
        });
        roundtrip(NodeMsg::RemoveNeighbor { removed: peer });
        roundtrip(NodeMsg::UpdateNeighbor { neighbor: peer });
        roundtrip(NodeMsg::SearchExact {
            destination: position,
            hops_left: 12,
            payload: Box::new(WireMsg::new(
                node(1, 1, 2),
                node(2, 1, 2),
                NodeMsg::UpdateNeighbor { neighbor: peer },
            )),
        });
        roundtrip(NodeMsg::SearchExactFailure {
            destination: position,
            reason: SearchFailureReason::PositionEmpty,
        });
        roundtrip(NodeMsg::AttributeInquiryRequest {
            keys: vec!["pos_x".to_string()],
            inquire_all: false,
        });
        roundtrip(NodeMsg::AttributeInquiryAnswer {
            inquired: peer,
            attributes: vec![("pos_x".to_string(), record)],
            removed_keys: vec!["stale".to_string()],
        });
        roundtrip(NodeMsg::SubscriptionOrder {
            keys: vec!["pos_x".to_string()],
            subscribe: true,
        });
        roundtrip(NodeMsg::SubscriptionUpdate {
            key: "pos_x".to_string(),
            value: Some(Value::from(7)),
            timestamp: 1000,
        });
        roundtrip(NodeMsg::FindQueryRequest {
            query: FindQuery::new(Expression::has("topicA").or(Expression::string_eq(
                "wetter",
                "schlecht",
            )))
            .with_scope(FindQueryScope::Some)
            .with_selection(Selection::Specific(vec!["wetter".to_string()])),
            direction: Direction::Left,
            interval: (f64::NEG_INFINITY, 125.0),
        });
        roundtrip(NodeMsg::FindQueryAnswer {
            nodes_with_attributes: vec![(peer, vec![("wetter".to_string(), Value::from("gut"))])],
        });
    }

    #[test]
    fn truncated_blobs_are_rejected() {
        let wire = WireMsg::new(
            node(1, 0, 2),
            node(0, 0, 2),
            NodeMsg::UpdateNeighbor {
                neighbor: node(1, 1, 2),
            },
        );
        let bytes = wire.to_bytes().expect("serialize");
        assert_matches::assert_matches!(
            WireMsg::from_bytes(&bytes[..bytes.len() - 1]),
            Err(Error::InvalidMessage)
        );
        assert_matches::assert_matches!(WireMsg::from_bytes(&[1, 0]), Err(Error::InvalidMessage));
    }

    #[test]
    fn replies_reference_the_request() {
        let request = WireMsg::new(
            node(1, 0, 2),
            node(0, 0, 2),
            NodeMsg::FindReplacement {
                requester: node(1, 0, 2),
                vacant: node(1, 0, 2).position(),
            },
        );
        let reply = WireMsg::reply_to(
            node(0, 0, 2),
            node(1, 0, 2),
            request.event_id(),
            NodeMsg::ReplacementOffer {
                offered_position: node(0, 0, 2).position(),
                incumbent: node(0, 0, 2),
            },
        );
        assert_eq!(reply.header.ref_event_id, Some(request.event_id()));
    }
}

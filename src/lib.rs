// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! Tree-structured peer-to-peer management overlay with distributed entity
//! search.
//!
//! Peers self-organize into a compact m-ary search tree embedded over an
//! unreliable datagram network. The overlay offers three primitives to the
//! embedding host:
//!
//!  * membership: peers join and leave while the tree invariants hold,
//!  * routing: exact position lookup in `O(log_f n)` hops,
//!  * discovery: Boolean queries over typed, time-stamped attributes,
//!    answered by the dominating-set peers without a central index.
//!
//! The entry point is [`Node`]: start one as root or joiner, `insert`
//! attributes, `find` peers, `stop` gracefully.

#[macro_use]
extern crate tracing;

// ############################################################################
// Public API
// ############################################################################

pub use self::{
    comm::{memory, ConnectionEvent, Transport, UdpTransport},
    config::{
        AlgorithmSet, Config, JoinMode, DEFAULT_DISCOVERY_GROUP, DEFAULT_FANOUT,
        DEFAULT_TIMESTAMP_STORAGE_LIMIT, DEFAULT_TREEMAPPER_ROOT,
    },
    error::{Error, Result},
    esearch::{
        Attributes, ComparisonOp, Expression, FindQuery, FindQueryScope, FindResult, FuzzyValue,
        Operand, Selection,
    },
    node::{Event, EventStream, Node, NodeState},
    peer::{NodeInfo, Uuid},
    position::Position,
    routing_info::Relationship,
    store::{Entry, Value, ValueType},
    timeouts::{TimeoutKind, Timeouts},
};

/// Standardised log markers for various events
pub mod log_markers;

// ############################################################################
// Private
// ############################################################################

mod comm;
mod config;
mod error;
mod esearch;
mod fsm;
mod messages;
mod node;
mod peer;
mod position;
mod routing_info;
mod store;
mod timeouts;

// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

use crate::fsm::{FsmEvent, State};
use crate::position::Position;
use crate::timeouts::TimeoutKind;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// The type returned by the treeline message handling methods.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Internal error.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("Invalid tree position: level {level}, number {number}, fanout {fanout}")]
    InvalidPosition {
        level: u32,
        number: u32,
        fanout: u16,
    },
    #[error("Fanout must be at least 2, got {0}")]
    InvalidFanout(u16),
    #[error("Installing {candidate} as {slot} would corrupt the routing information")]
    InvalidRouting { candidate: Position, slot: String },
    #[error("Event {event} is not legal in state {state:?}")]
    FsmViolation { state: State, event: FsmEvent },
    #[error("Timeout of kind {0:?} expired")]
    TimeoutExpired(TimeoutKind),
    #[error("No peer reachable at position {0}")]
    SearchUnreachable(Position),
    #[error("Join attempt failed: {0}")]
    JoinFailed(String),
    #[error("Could not reach any bootstrap contact")]
    BootstrapFailed,
    #[error("Node is shutting down, pending operation cancelled")]
    Cancelled,
    #[error("The node is not in a state to handle the action")]
    InvalidState,
    #[error("Content of a received message is inconsistent")]
    InvalidMessage,
    #[error("Attribute {0:?} already present")]
    AttributePresent(String),
    #[error("Attribute {0:?} not present")]
    AttributeMissing(String),
    #[error("Value type of attribute {0:?} cannot change")]
    ValueTypeChanged(String),
    #[error("Static attribute {0:?} cannot be updated with a different value")]
    StaticValueChanged(String),
    #[error("Update timestamps must be monotone for attribute {0:?}")]
    NonMonotoneTimestamp(String),
    #[error("Failed to send a message to {0}")]
    FailedSend(SocketAddr),
    #[error("The requested operation is currently not supported: {0}")]
    Unsupported(&'static str),
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Bincode error.
    #[error("Bincode error:: {0}")]
    Bincode(#[from] bincode::Error),
}

// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! Finite state machine gating every message a peer sends or receives.
//!
//! Events are the union of (message kind x direction), internal signals and
//! timeout expiries. An outgoing message is only emitted if the transition
//! for `(kind, sending)` exists from the current state; attempting anything
//! else fails with [`Error::FsmViolation`] and the message is dropped. An
//! incoming message with no legal transition is dropped and logged while the
//! machine stays put. The transition table itself is the pure function
//! [`transition`]; guards and side effects live with the protocol handlers.

use crate::error::{Error, Result};
use crate::messages::MsgTag;
use crate::timeouts::TimeoutKind;
use std::fmt::{self, Display, Formatter};

/// Peer lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    WaitForBootstrapResponse,
    WaitForJoinAccept,
    Connected,
    ConnectedAcceptingChild,
    ConnectedReplacing,
    WaitForReplacementOffer,
    ConnectedWaitingParentResponse,
    SignOffFromInlevelNeighbors,
    JoinFailed,
    ErrorState,
}

impl State {
    /// Whether the peer participates in the tree in this state.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            State::Connected
                | State::ConnectedAcceptingChild
                | State::ConnectedReplacing
                | State::WaitForReplacementOffer
                | State::ConnectedWaitingParentResponse
                | State::SignOffFromInlevelNeighbors
        )
    }
}

/// Internal control signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// This node is the root of a fresh tree.
    Rooted,
    /// Leave without replacement: start signing off from all neighbors.
    SignOff,
    /// Sign-off finished, the peer is out of the tree.
    Departed,
    /// Start re-electing a replacement for a vacated position.
    RecoverPosition,
}

/// One event against the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsmEvent {
    Recv(MsgTag),
    Send(MsgTag),
    Signal(Signal),
    Timeout(TimeoutKind),
}

impl Display for FsmEvent {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            FsmEvent::Recv(tag) => write!(f, "recv {:?}", tag),
            FsmEvent::Send(tag) => write!(f, "send {:?}", tag),
            FsmEvent::Signal(signal) => write!(f, "signal {:?}", signal),
            FsmEvent::Timeout(kind) => write!(f, "timeout {:?}", kind),
        }
    }
}

/// The transition table. `None` means the event is illegal in that state.
pub fn transition(state: State, event: &FsmEvent) -> Option<State> {
    use FsmEvent::*;
    use MsgTag::*;
    use State::*;

    let specific = match (state, event) {
        // joining
        (Idle | JoinFailed, FsmEvent::Signal(self::Signal::Rooted)) => Some(Connected),
        (Idle | JoinFailed, Send(Bootstrap)) => Some(WaitForBootstrapResponse),
        (Idle | JoinFailed, Send(Join)) => Some(WaitForJoinAccept),
        (WaitForBootstrapResponse, Recv(BootstrapResponse)) => Some(WaitForBootstrapResponse),
        (WaitForBootstrapResponse, Send(Join)) => Some(WaitForJoinAccept),
        (WaitForBootstrapResponse, Timeout(TimeoutKind::BootstrapResponse)) => Some(JoinFailed),
        (WaitForJoinAccept, Recv(JoinAccept)) => Some(Connected),
        (WaitForJoinAccept, Recv(JoinRejected)) => Some(JoinFailed),
        (WaitForJoinAccept, Timeout(TimeoutKind::JoinResponse)) => Some(JoinFailed),
        (Connected, Send(JoinAcceptAck)) => Some(Connected),

        // accepting a child
        (Connected, Recv(Join)) => Some(Connected),
        (Connected, Send(Join)) => Some(Connected), // forwarding
        (Connected, Send(JoinAccept)) => Some(ConnectedAcceptingChild),
        (Connected | ConnectedAcceptingChild | ConnectedReplacing, Send(JoinRejected)) => {
            Some(state)
        }
        (ConnectedAcceptingChild | ConnectedReplacing, Recv(Join)) => Some(state),
        (ConnectedAcceptingChild, Recv(JoinAcceptAck)) => Some(Connected),
        (ConnectedAcceptingChild, Timeout(TimeoutKind::JoinAcceptAckResponse)) => Some(Connected),

        // leaving with replacement, leaver side
        (Connected, Send(FindReplacement)) => Some(WaitForReplacementOffer),
        (Connected, Recv(FindReplacement)) => Some(Connected), // forwarding or offering
        (WaitForReplacementOffer, Recv(ReplacementOffer)) => Some(WaitForReplacementOffer),
        (WaitForReplacementOffer, Send(ReplacementAck)) => Some(SignOffFromInlevelNeighbors),
        (WaitForReplacementOffer, Timeout(TimeoutKind::ReplacementOfferResponse)) => {
            Some(Connected)
        }
        (WaitForReplacementOffer, Send(FindReplacement)) => Some(WaitForReplacementOffer),

        // replacement candidate side
        (Connected, Send(ReplacementOffer)) => Some(ConnectedReplacing),
        (ConnectedReplacing, Recv(ReplacementAck)) => Some(Connected),
        (ConnectedReplacing, Timeout(TimeoutKind::ReplacementAckResponse)) => Some(Connected),

        // leave without replacement
        (Connected, FsmEvent::Signal(self::Signal::SignOff)) => Some(SignOffFromInlevelNeighbors),
        (SignOffFromInlevelNeighbors, Send(RemoveNeighbor)) => {
            Some(SignOffFromInlevelNeighbors)
        }
        (Connected, Send(RemoveNeighbor)) => Some(Connected),
        (SignOffFromInlevelNeighbors, FsmEvent::Signal(self::Signal::Departed)) => Some(Idle),

        // failure recovery: re-electing a replacement for a vacated slot
        (Connected, FsmEvent::Signal(self::Signal::RecoverPosition)) => Some(ConnectedWaitingParentResponse),
        (ConnectedWaitingParentResponse, Send(FindReplacement)) => {
            Some(ConnectedWaitingParentResponse)
        }
        (ConnectedWaitingParentResponse, Recv(ReplacementOffer)) => {
            Some(ConnectedWaitingParentResponse)
        }
        (ConnectedWaitingParentResponse, Send(ReplacementAck)) => Some(Connected),
        (ConnectedWaitingParentResponse, Timeout(TimeoutKind::ReplacementOfferResponse)) => {
            Some(Connected)
        }

        _ => None,
    };
    if specific.is_some() {
        return specific;
    }

    // Traffic that is legal in every connected state: exact routing,
    // neighbor upkeep and the entity-search subsystem.
    if state.is_connected() {
        match event {
            Recv(
                SearchExact | SearchExactFailure | UpdateNeighbor | RemoveNeighbor
                | AttributeInquiryRequest | AttributeInquiryAnswer | SubscriptionOrder
                | SubscriptionUpdate | FindQueryRequest | FindQueryAnswer | JoinAcceptAck
                | Bootstrap,
            )
            | Send(
                SearchExact | SearchExactFailure | UpdateNeighbor | BootstrapResponse
                | AttributeInquiryRequest | AttributeInquiryAnswer | SubscriptionOrder
                | SubscriptionUpdate | FindQueryRequest | FindQueryAnswer,
            )
            | Timeout(TimeoutKind::DsnAggregation | TimeoutKind::InquiryAggregation) => {
                return Some(state);
            }
            _ => {}
        }
    }
    None
}

/// The per-peer machine.
#[derive(Debug, Clone, Copy)]
pub struct StateMachine {
    state: State,
}

impl StateMachine {
    pub fn new(initial: State) -> Self {
        Self { state: initial }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Whether `event` has a legal transition from the current state.
    pub fn permits(&self, event: &FsmEvent) -> bool {
        transition(self.state, event).is_some()
    }

    /// Applies `event`, failing with `FsmViolation` when illegal.
    pub fn apply(&mut self, event: FsmEvent) -> Result<State> {
        match transition(self.state, &event) {
            Some(next) => {
                if next != self.state {
                    trace!("fsm {:?} --[{}]--> {:?}", self.state, event, next);
                }
                self.state = next;
                Ok(next)
            }
            None => Err(Error::FsmViolation {
                state: self.state,
                event,
            }),
        }
    }

    /// Forces the error state; nothing but a restart leaves it.
    pub fn fail(&mut self) {
        self.state = State::ErrorState;
    }
}

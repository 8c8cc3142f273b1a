// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The kinds of timers a node may have pending. Each pending procedure owns
/// at most one timer; timers of independent procedures may coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutKind {
    /// Waiting for a `BootstrapResponse` after multicast discovery.
    BootstrapResponse,
    /// Joiner waiting for `JoinAccept` (or `JoinFailed`).
    JoinResponse,
    /// Accepting parent waiting for the joiner's `JoinAcceptAck`.
    JoinAcceptAckResponse,
    /// Leaver waiting for a `ReplacementOffer`.
    ReplacementOfferResponse,
    /// Replacement candidate waiting for the leaver's `ReplacementAck`.
    ReplacementAckResponse,
    /// DSN waiting for `FindQueryAnswer`s of the DSNs it forwarded to.
    DsnAggregation,
    /// DSN waiting for `AttributeInquiryAnswer`s of undecided cover peers.
    InquiryAggregation,
}

/// Timeout lengths, configurable per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub bootstrap_response: Duration,
    pub join_response: Duration,
    pub join_accept_ack_response: Duration,
    pub replacement_offer_response: Duration,
    pub replacement_ack_response: Duration,
    pub dsn_aggregation: Duration,
    pub inquiry_aggregation: Duration,
}

impl Timeouts {
    pub(crate) fn length_of(&self, kind: TimeoutKind) -> Duration {
        match kind {
            TimeoutKind::BootstrapResponse => self.bootstrap_response,
            TimeoutKind::JoinResponse => self.join_response,
            TimeoutKind::JoinAcceptAckResponse => self.join_accept_ack_response,
            TimeoutKind::ReplacementOfferResponse => self.replacement_offer_response,
            TimeoutKind::ReplacementAckResponse => self.replacement_ack_response,
            TimeoutKind::DsnAggregation => self.dsn_aggregation,
            TimeoutKind::InquiryAggregation => self.inquiry_aggregation,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            bootstrap_response: Duration::from_millis(500),
            join_response: Duration::from_millis(2500),
            join_accept_ack_response: Duration::from_millis(1500),
            replacement_offer_response: Duration::from_millis(2500),
            replacement_ack_response: Duration::from_millis(1500),
            dsn_aggregation: Duration::from_millis(4000),
            inquiry_aggregation: Duration::from_millis(1000),
        }
    }
}

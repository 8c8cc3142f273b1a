// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

// this gets us to_string easily enough
use strum_macros::{Display as StrumDisplay, EnumIter, EnumString};

/// Internal log marker, to be used in tests asserts.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, EnumIter, StrumDisplay, EnumString)]
#[allow(missing_docs)]
pub enum LogMarker {
    // dispatch
    CommandHandleStart,
    CommandHandleEnd,
    CommandHandleError,
    TimeoutScheduled,
    TimeoutCancelledLate,
    // membership
    SendJoinRequest,
    JoinRequestReceived,
    JoinForwarded,
    SendJoinAccept,
    SendJoinRejected,
    JoinedNetwork,
    ChildAccepted,
    LeaveInitiated,
    SendReplacementOffer,
    ReplacementAdopted,
    SignOffComplete,
    PeerLost,
    // routing
    NeighborInstalled,
    NeighborReplaced,
    NeighborRemoved,
    SearchExactDelivered,
    SearchExactForwarded,
    SearchExactExhausted,
    // entity search
    DsnActivated,
    DsnDeactivated,
    DsnCoverRebuilt,
    FindQueryStarted,
    FindQueryForwarded,
    InquiryAggregationStart,
    InquiryAggregationConcluded,
    DsnAggregationConcluded,
    FindQueryConcluded,
    SubscriptionPlaced,
    SubscriptionDropped,
    AttributePushed,
    // transport
    ConnectionOpened,
    MessageDropped,
}

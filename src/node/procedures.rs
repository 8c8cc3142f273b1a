// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! Short-lived per-procedure scratch state, keyed by the event id of the
//! message that opened the procedure. Every entry owns at most one pending
//! timer; timers of vanished entries are ignored on expiry.

use crate::error::{Error, Result};
use crate::esearch::{FindQuery, FindResult};
use crate::messages::{Direction, EventId};
use crate::peer::NodeInfo;
use crate::position::Position;
use crate::store::Value;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::oneshot;

/// Where an aggregation's results are owed.
#[derive(Debug)]
pub(crate) enum AggregationParent {
    /// Another DSN in the aggregation tree; answered by message.
    Dsn(NodeInfo),
    /// The local `find()` caller.
    LocalRequester(oneshot::Sender<Result<FindResult>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AggregationPhase {
    /// Waiting for attribute inquiry answers of undecided cover peers.
    Inquiring,
    /// Waiting for the answers of forwarded requests.
    Forwarded,
}

/// In-flight find-query aggregation on a DSN.
#[derive(Debug)]
pub(crate) struct AggregationState {
    pub query: FindQuery,
    pub direction: Direction,
    pub interval: (f64, f64),
    pub answer_to: AggregationParent,
    pub phase: AggregationPhase,
    /// Outstanding inquiries: event id of the request -> inquired peer.
    pub pending_inquiries: HashMap<EventId, NodeInfo>,
    /// Outstanding forwarded requests: event id -> the DSN position asked.
    pub pending_forwards: HashMap<EventId, Position>,
    /// Fulfilling peers with their reported attributes, deduplicated.
    pub results: HashMap<NodeInfo, Vec<(String, Value)>>,
}

impl AggregationState {
    pub(crate) fn merge_results(
        &mut self,
        nodes_with_attributes: impl IntoIterator<Item = (NodeInfo, Vec<(String, Value)>)>,
    ) {
        for (node, attributes) in nodes_with_attributes {
            let entry = self.results.entry(node).or_default();
            for (key, value) in attributes {
                if !entry.iter().any(|(existing, _)| *existing == key) {
                    entry.push((key, value));
                }
            }
        }
    }
}

/// One pending procedure.
#[derive(Debug)]
pub(crate) enum Procedure {
    /// Joiner waiting for `JoinAccept`; retried with backoff on timeout.
    JoinAttempt {
        contact: SocketAddr,
        attempts: u32,
    },
    /// Accepting parent waiting for the joiner's ack.
    PendingChild { joiner: NodeInfo },
    /// Leaver (or failure-recovery initiator) waiting for an offer.
    ReplacementSearch { vacant: Position },
    /// Replacement candidate waiting for the leaver's ack.
    PendingReplacementAck,
    /// A local `find()` waiting for its final answer.
    PendingFind {
        reply: oneshot::Sender<Result<FindResult>>,
    },
    /// A DSN's in-flight aggregation.
    Aggregation(Box<AggregationState>),
}

/// The registry of pending procedures.
#[derive(Default)]
pub(crate) struct ProcedureRegistry {
    procedures: DashMap<EventId, Procedure>,
}

impl ProcedureRegistry {
    pub(crate) fn insert(&self, event_id: EventId, procedure: Procedure) {
        let _ = self.procedures.insert(event_id, procedure);
    }

    pub(crate) fn remove(&self, event_id: &EventId) -> Option<Procedure> {
        self.procedures.remove(event_id).map(|(_, procedure)| procedure)
    }

    pub(crate) fn contains(&self, event_id: &EventId) -> bool {
        self.procedures.contains_key(event_id)
    }

    /// Runs `f` on the procedure under `event_id`, if it is still pending.
    pub(crate) fn with_mut<R>(
        &self,
        event_id: &EventId,
        f: impl FnOnce(&mut Procedure) -> R,
    ) -> Option<R> {
        self.procedures.get_mut(event_id).map(|mut entry| f(&mut entry))
    }

    /// Finds the aggregation that is waiting on `ref_event` as an inquiry
    /// or forward, returning its key.
    pub(crate) fn aggregation_waiting_on(&self, ref_event: &EventId) -> Option<EventId> {
        self.procedures.iter().find_map(|entry| match entry.value() {
            Procedure::Aggregation(state)
                if state.pending_inquiries.contains_key(ref_event)
                    || state.pending_forwards.contains_key(ref_event) =>
            {
                Some(*entry.key())
            }
            _ => None,
        })
    }

    /// Keys of pending join attempts (at most one in practice).
    pub(crate) fn join_attempt_keys(&self) -> Vec<EventId> {
        self.procedures
            .iter()
            .filter(|entry| matches!(entry.value(), Procedure::JoinAttempt { .. }))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Whether any child-admission is currently pending.
    pub(crate) fn admitting_child(&self) -> bool {
        self.procedures
            .iter()
            .any(|entry| matches!(entry.value(), Procedure::PendingChild { .. }))
    }

    /// Resolves every pending find with `Cancelled` and clears the rest.
    pub(crate) fn cancel_all(&self) {
        let keys: Vec<EventId> = self.procedures.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, procedure)) = self.procedures.remove(&key) {
                match procedure {
                    Procedure::PendingFind { reply } => {
                        let _ = reply.send(Err(Error::Cancelled));
                    }
                    Procedure::Aggregation(state) => {
                        if let AggregationParent::LocalRequester(reply) = state.answer_to {
                            let _ = reply.send(Err(Error::Cancelled));
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.procedures.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::esearch::Expression;
    use crate::peer::test_utils::node;

    #[test]
    fn cancel_all_resolves_pending_finds() {
        let registry = ProcedureRegistry::default();
        let (reply, mut rx) = oneshot::channel();
        registry.insert(EventId::random(), Procedure::PendingFind { reply });
        registry.insert(
            EventId::random(),
            Procedure::ReplacementSearch {
                vacant: node(1, 0, 2).position(),
            },
        );

        registry.cancel_all();
        assert_eq!(registry.len(), 0);
        assert_matches::assert_matches!(rx.try_recv(), Ok(Err(Error::Cancelled)));
    }

    #[test]
    fn aggregations_are_found_by_their_outstanding_events() {
        let registry = ProcedureRegistry::default();
        let agg_id = EventId::random();
        let forward_id = EventId::random();

        let mut state = AggregationState {
            query: FindQuery::new(Expression::Empty),
            direction: Direction::None,
            interval: (f64::NEG_INFINITY, f64::INFINITY),
            answer_to: AggregationParent::Dsn(node(2, 1, 2)),
            phase: AggregationPhase::Forwarded,
            pending_inquiries: HashMap::new(),
            pending_forwards: HashMap::new(),
            results: HashMap::new(),
        };
        let _ = state
            .pending_forwards
            .insert(forward_id, node(2, 3, 2).position());
        registry.insert(agg_id, Procedure::Aggregation(Box::new(state)));

        assert_eq!(registry.aggregation_waiting_on(&forward_id), Some(agg_id));
        assert_eq!(registry.aggregation_waiting_on(&EventId::random()), None);
    }

    #[test]
    fn merge_results_deduplicates_nodes_and_keys() {
        let mut state = AggregationState {
            query: FindQuery::new(Expression::Empty),
            direction: Direction::None,
            interval: (f64::NEG_INFINITY, f64::INFINITY),
            answer_to: AggregationParent::Dsn(node(2, 1, 2)),
            phase: AggregationPhase::Inquiring,
            pending_inquiries: HashMap::new(),
            pending_forwards: HashMap::new(),
            results: HashMap::new(),
        };
        let peer = node(3, 2, 2);
        state.merge_results(vec![(peer, vec![("a".to_string(), Value::from(1))])]);
        state.merge_results(vec![(
            peer,
            vec![
                ("a".to_string(), Value::from(2)),
                ("b".to_string(), Value::from(3)),
            ],
        )]);

        assert_eq!(state.results.len(), 1);
        let attributes = &state.results[&peer];
        assert_eq!(attributes.len(), 2);
        assert!(attributes.contains(&("a".to_string(), Value::from(1))));
        assert!(attributes.contains(&("b".to_string(), Value::from(3))));
    }
}

// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! Exact position routing.
//!
//! Each hop greedily forwards to the neighbor closest to the destination,
//! first by level distance, then by horizontal distance, with the uuid as a
//! stable tie-break. When no neighbor improves on the current hop or the
//! hop budget runs out, a failure message travels back to the originator.

use super::Core;
use crate::error::Result;
use crate::log_markers::LogMarker;
use crate::messages::{EventId, Header, NodeMsg, SearchFailureReason, WireMsg};
use crate::node::command::Command;
use crate::peer::{NodeInfo, Uuid};
use crate::position::Position;
use crate::routing_info::Relationship;
use std::cmp::Ordering;

impl Core {
    /// Wraps `msg` into a search-exact envelope toward whatever peer
    /// occupies `destination`. Returns the inner message's event id, which
    /// later answers and failure notices reference.
    pub(super) fn send_via_search_exact(
        &mut self,
        destination: Position,
        msg: NodeMsg,
        ref_event: Option<EventId>,
    ) -> Result<(EventId, Vec<Command>)> {
        // the embedded message passes FSM preparation like any other
        let _ = self.fsm.apply(crate::fsm::FsmEvent::Send(msg.tag()))?;
        let placeholder = NodeInfo::unreachable(destination, Uuid::nil());
        let payload = match ref_event {
            Some(id) => WireMsg::reply_to(self.node(), placeholder, id, msg),
            None => WireMsg::new(self.node(), placeholder, msg),
        };
        let inner_id = payload.event_id();

        if destination == self.node().position() {
            // local delivery without touching the network
            let commands = self.deliver_payload(payload)?;
            return Ok((inner_id, commands));
        }

        let budget = self.hop_budget();
        let commands = self.route_search_exact(destination, budget, payload)?;
        Ok((inner_id, commands))
    }

    /// `2 * (tree height + fanout)` as visible from here.
    fn hop_budget(&self) -> u32 {
        let deepest = self
            .routing
            .all_neighbors()
            .iter()
            .map(|peer| peer.position().level())
            .chain(std::iter::once(self.node().position().level()))
            .max()
            .unwrap_or(0);
        2 * (deepest + 1 + u32::from(self.fanout))
    }

    pub(super) fn handle_search_exact(
        &mut self,
        header: &Header,
        destination: Position,
        hops_left: u32,
        payload: WireMsg,
    ) -> Result<Vec<Command>> {
        // peers observed through routing traffic become neighbors
        if self.routing.classify(&header.sender.position()) != Relationship::Unknown
            && header.sender.is_complete()
        {
            let _ = self.routing.update_neighbor(header.sender);
        }

        if destination == self.node().position() {
            trace!("{} {}", LogMarker::SearchExactDelivered, payload);
            return self.deliver_payload(payload);
        }
        self.route_search_exact(destination, hops_left, payload)
    }

    /// Hands the embedded message to the regular dispatch, as if it had
    /// arrived directly.
    fn deliver_payload(&mut self, payload: WireMsg) -> Result<Vec<Command>> {
        let sender_addr = payload
            .header
            .sender
            .endpoint()
            .unwrap_or_else(|| self.local_addr());
        self.handle_message(sender_addr, payload)
    }

    fn route_search_exact(
        &mut self,
        destination: Position,
        hops_left: u32,
        payload: WireMsg,
    ) -> Result<Vec<Command>> {
        if hops_left == 0 {
            debug!("{} toward {}", LogMarker::SearchExactExhausted, destination);
            return self.report_search_failure(
                destination,
                SearchFailureReason::HopBudgetExhausted,
                payload,
            );
        }

        let target_h = destination.horizontal(self.treemapper_root);
        let own_metric = self.search_metric(&self.node(), &destination, target_h);
        let next_hop = self
            .routing
            .all_neighbors()
            .into_iter()
            .min_by(|a, b| {
                let metric_a = self.search_metric(a, &destination, target_h);
                let metric_b = self.search_metric(b, &destination, target_h);
                Self::compare_metric(&metric_a, &metric_b)
            })
            .filter(|best| {
                let metric = self.search_metric(best, &destination, target_h);
                Self::compare_metric(&metric, &own_metric) == Ordering::Less
            });

        match next_hop {
            Some(next) => {
                trace!(
                    "{} {} via {}",
                    LogMarker::SearchExactForwarded,
                    destination,
                    next.position()
                );
                let (_, send) = self.prepare(
                    next,
                    NodeMsg::SearchExact {
                        destination,
                        hops_left: hops_left - 1,
                        payload: Box::new(payload),
                    },
                    None,
                )?;
                Ok(vec![send])
            }
            // nobody is closer than us, yet we are not the destination:
            // the position is unoccupied as far as the tree can tell
            None => self.report_search_failure(
                destination,
                SearchFailureReason::PositionEmpty,
                payload,
            ),
        }
    }

    fn search_metric(&self, peer: &NodeInfo, destination: &Position, target_h: f64) -> (u32, f64, Uuid) {
        let level_distance = peer.position().level().abs_diff(destination.level());
        let h_distance = (peer.horizontal(self.treemapper_root) - target_h).abs();
        (level_distance, h_distance, peer.uuid())
    }

    fn compare_metric(a: &(u32, f64, Uuid), b: &(u32, f64, Uuid)) -> Ordering {
        a.0.cmp(&b.0)
            .then_with(|| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
            .then_with(|| a.2.cmp(&b.2))
    }

    /// Returns a failure notice to the search originator, or handles it
    /// right away when the search started here.
    fn report_search_failure(
        &mut self,
        destination: Position,
        reason: SearchFailureReason,
        payload: WireMsg,
    ) -> Result<Vec<Command>> {
        let originator = payload.header.sender;
        let inner_id = payload.event_id();
        if originator.position() == self.node().position() {
            return self.note_search_failure(destination, reason, inner_id);
        }
        let (_, send) = self.prepare(
            originator,
            NodeMsg::SearchExactFailure {
                destination,
                reason,
            },
            Some(inner_id),
        )?;
        Ok(vec![send])
    }

    pub(super) fn handle_search_exact_failure(
        &mut self,
        header: &Header,
        destination: Position,
        reason: SearchFailureReason,
    ) -> Result<Vec<Command>> {
        let inner_id = match header.ref_event_id {
            Some(id) => id,
            None => return Ok(vec![]),
        };
        self.note_search_failure(destination, reason, inner_id)
    }
}

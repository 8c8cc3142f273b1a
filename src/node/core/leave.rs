// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! Leave and replacement.
//!
//! A leaver that is the last peer in level order signs off from all its
//! neighbors directly. Anyone else locates the last peer by routing a
//! `FindReplacement` toward ever greater (level, number) coordinates; the
//! last peer offers itself, detaches from its old slot on ack, adopts the
//! leaver's routing state under its own identity and announces the occupant
//! change to every inherited neighbor. The same offer/ack exchange re-fills
//! a slot whose occupant crashed, driven by the failed peer's parent.

use super::Core;
use crate::error::{Error, Result};
use crate::fsm::{FsmEvent, Signal, State};
use crate::log_markers::LogMarker;
use crate::messages::{EventId, Header, NodeMsg};
use crate::node::command::Command;
use crate::node::event::Event;
use crate::node::procedures::Procedure;
use crate::peer::{NodeInfo, Uuid};
use crate::position::Position;
use crate::routing_info::RoutingSnapshot;
use crate::timeouts::TimeoutKind;
use tokio::sync::oneshot;

impl Core {
    pub(super) fn initiate_leave(
        &mut self,
        reply: oneshot::Sender<Result<()>>,
    ) -> Result<Vec<Command>> {
        match self.fsm.state() {
            State::Idle | State::JoinFailed | State::ErrorState => {
                // not in the tree; stopping is trivially done
                let _ = reply.send(Ok(()));
                self.procedures.cancel_all();
                self.shutdown = true;
                return Ok(vec![]);
            }
            State::Connected => {}
            _ => {
                let _ = reply.send(Err(Error::InvalidState));
                return Ok(vec![]);
            }
        }

        info!("{} from {}", LogMarker::LeaveInitiated, self.node());
        self.pending_stop = Some(reply);

        if self.believes_last_in_level_order() {
            return self.leave_direct();
        }

        let target = match self.greatest_known_peer(None) {
            Some(target) => target,
            None => return self.leave_direct(),
        };
        let (event_id, send) = self.prepare(
            target,
            NodeMsg::FindReplacement {
                requester: self.node(),
                vacant: self.node().position(),
            },
            None,
        )?;
        self.procedures.insert(
            event_id,
            Procedure::ReplacementSearch {
                vacant: self.node().position(),
            },
        );
        Ok(vec![
            send,
            self.schedule(TimeoutKind::ReplacementOfferResponse, Some(event_id)),
        ])
    }

    /// Leave without replacement: we are the last peer, every neighbor just
    /// drops us.
    fn leave_direct(&mut self) -> Result<Vec<Command>> {
        let _ = self.fsm.apply(FsmEvent::Signal(Signal::SignOff))?;
        let mut commands = Vec::new();
        for neighbor in self.routing.all_neighbors() {
            let (_, send) = self.prepare(
                neighbor,
                NodeMsg::RemoveNeighbor {
                    removed: self.node(),
                },
                None,
            )?;
            commands.push(send);
        }
        self.conclude_departure();
        Ok(commands)
    }

    /// Whether the local view admits no peer behind us in level order.
    pub(super) fn believes_last_in_level_order(&self) -> bool {
        self.greatest_known_peer(None)
            .map(|peer| {
                let own = self.node().position();
                (peer.position().level(), peer.position().number())
                    <= (own.level(), own.number())
            })
            .unwrap_or(true)
    }

    /// The known peer occupying the greatest (level, number) coordinate,
    /// optionally ignoring one position.
    fn greatest_known_peer(&self, excluding: Option<Position>) -> Option<NodeInfo> {
        self.routing
            .all_neighbors()
            .into_iter()
            .filter(|peer| Some(peer.position()) != excluding)
            .max_by_key(|peer| (peer.position().level(), peer.position().number()))
    }

    pub(super) fn handle_find_replacement(
        &mut self,
        header: &Header,
        requester: NodeInfo,
        vacant: Position,
    ) -> Result<Vec<Command>> {
        if vacant == self.node().position() {
            // circled back to the slot being vacated
            return Ok(vec![]);
        }
        let chain_ref = header.ref_event_id.unwrap_or(header.event_id);

        if !self.believes_last_in_level_order() {
            let target = match self.greatest_known_peer(Some(vacant)) {
                Some(target) => target,
                None => return Ok(vec![]),
            };
            let (_, send) = self.prepare(
                target,
                NodeMsg::FindReplacement { requester, vacant },
                Some(chain_ref),
            )?;
            return Ok(vec![send]);
        }

        // we are the last peer: offer to fill the slot
        let (offer_id, send) = self.prepare(
            requester,
            NodeMsg::ReplacementOffer {
                offered_position: self.node().position(),
                incumbent: self.node(),
            },
            Some(chain_ref),
        )?;
        self.procedures
            .insert(offer_id, Procedure::PendingReplacementAck);
        info!("{} for {}", LogMarker::SendReplacementOffer, vacant);
        Ok(vec![
            send,
            self.schedule(TimeoutKind::ReplacementAckResponse, Some(offer_id)),
        ])
    }

    pub(super) fn handle_replacement_offer(
        &mut self,
        header: &Header,
        _offered_position: Position,
        incumbent: NodeInfo,
    ) -> Result<Vec<Command>> {
        let search = header
            .ref_event_id
            .and_then(|ref_id| self.procedures.remove(&ref_id));
        let vacant = match search {
            Some(Procedure::ReplacementSearch { vacant }) => vacant,
            _ => {
                debug!("unsolicited replacement offer from {}", incumbent);
                return Ok(vec![]);
            }
        };

        match self.fsm.state() {
            State::WaitForReplacementOffer => {
                // leaving: hand our routing state over and sign off
                let snapshot = self.routing.snapshot();
                let (_, send) = self.prepare(
                    incumbent,
                    NodeMsg::ReplacementAck { vacated: snapshot },
                    Some(header.event_id),
                )?;
                self.conclude_departure();
                Ok(vec![send])
            }
            State::ConnectedWaitingParentResponse => {
                // failure recovery: reconstruct the crashed peer's state
                // from our own knowledge of its surroundings
                let snapshot = self.reconstruct_vacated_state(vacant);
                let (_, send) = self.prepare(
                    incumbent,
                    NodeMsg::ReplacementAck { vacated: snapshot },
                    Some(header.event_id),
                )?;
                Ok(vec![send])
            }
            _ => Ok(vec![]),
        }
    }

    /// Best-effort routing snapshot for a position whose occupant is gone.
    fn reconstruct_vacated_state(&self, vacant: Position) -> RoutingSnapshot {
        let (adjacent_left, adjacent_right) = self.adjacents_for(&vacant);
        let mut routing_table = Vec::new();
        for rt_position in vacant
            .routing_table_left()
            .into_iter()
            .chain(vacant.routing_table_right())
        {
            if let Some(peer) = self.routing.get(&rt_position) {
                routing_table.push(peer);
            }
        }
        RoutingSnapshot {
            node: NodeInfo::unreachable(vacant, Uuid::nil()),
            parent: Some(self.node()),
            children: vec![None; usize::from(self.fanout)],
            adjacent_left,
            adjacent_right,
            routing_table,
            routing_table_children: Vec::new(),
        }
    }

    pub(super) fn handle_replacement_ack(
        &mut self,
        header: &Header,
        vacated: RoutingSnapshot,
    ) -> Result<Vec<Command>> {
        if let Some(ref_id) = header.ref_event_id {
            let _ = self.procedures.remove(&ref_id);
        }

        let previous = self.node();
        let old_neighbors = self.routing.all_neighbors();
        let adopted_position = vacated.node.position();
        let new_self = previous.at_position(adopted_position);

        let mut commands = Vec::new();
        // everyone around the old slot forgets us; the slot is empty now
        for neighbor in &old_neighbors {
            if neighbor.position() == adopted_position {
                continue;
            }
            let (_, send) = self.prepare(
                *neighbor,
                NodeMsg::RemoveNeighbor { removed: previous },
                None,
            )?;
            commands.push(send);
        }

        // adopt the vacated state, dropping references to our old slot
        let mut snapshot = vacated;
        let stale = previous.position();
        snapshot.children.iter_mut().for_each(|slot| {
            if slot.map(|n| n.position()) == Some(stale) {
                *slot = None;
            }
        });
        snapshot.routing_table.retain(|n| n.position() != stale);
        snapshot
            .routing_table_children
            .retain(|n| n.position() != stale);
        if snapshot.adjacent_left.map(|n| n.position()) == Some(stale) {
            snapshot.adjacent_left = None;
        }
        if snapshot.adjacent_right.map(|n| n.position()) == Some(stale) {
            snapshot.adjacent_right = None;
        }
        self.routing.adopt_snapshot(new_self, snapshot);
        self.publish_node_info();
        info!("{} {} -> {}", LogMarker::ReplacementAdopted, previous, new_self);
        self.publish_event(Event::Relocated {
            previous,
            current: new_self,
        });

        // everyone around the adopted slot learns its new occupant
        for neighbor in self.routing.all_neighbors() {
            let (_, send) = self.prepare(
                neighbor,
                NodeMsg::UpdateNeighbor { neighbor: new_self },
                None,
            )?;
            commands.push(send);
        }

        // re-home our attributes with the DSN responsible for the new slot
        commands.extend(self.push_all_attributes_to_dsn()?);
        Ok(commands)
    }

    pub(super) fn handle_replacement_offer_timeout(
        &mut self,
        ref_event: Option<EventId>,
    ) -> Result<Vec<Command>> {
        if let Some(ref_id) = ref_event {
            let _ = self.procedures.remove(&ref_id);
        }
        let _ = self
            .fsm
            .apply(FsmEvent::Timeout(TimeoutKind::ReplacementOfferResponse))?;
        if let Some(reply) = self.pending_stop.take() {
            let _ = reply.send(Err(Error::TimeoutExpired(
                TimeoutKind::ReplacementOfferResponse,
            )));
        }
        warn!("no replacement offer arrived, staying in the tree");
        Ok(vec![])
    }

    pub(super) fn handle_replacement_ack_timeout(
        &mut self,
        ref_event: Option<EventId>,
    ) -> Result<Vec<Command>> {
        if let Some(ref_id) = ref_event {
            let _ = self.procedures.remove(&ref_id);
        }
        let _ = self
            .fsm
            .apply(FsmEvent::Timeout(TimeoutKind::ReplacementAckResponse))?;
        warn!("replacement ack never arrived, keeping our position");
        Ok(vec![])
    }

    /// As parent of a crashed peer, re-elect the last peer into its slot.
    pub(super) fn recover_vacated_position(
        &mut self,
        vacant: Position,
    ) -> Result<Vec<Command>> {
        if self.fsm.state() != State::Connected {
            return Ok(vec![]);
        }
        let target = match self.greatest_known_peer(Some(vacant)) {
            Some(target) => target,
            // the crashed peer was the last one; the slot just stays empty
            None => return Ok(vec![]),
        };
        if (target.position().level(), target.position().number())
            <= (vacant.level(), vacant.number())
        {
            return Ok(vec![]);
        }

        let _ = self.fsm.apply(FsmEvent::Signal(Signal::RecoverPosition))?;
        let (event_id, send) = self.prepare(
            target,
            NodeMsg::FindReplacement {
                requester: self.node(),
                vacant,
            },
            None,
        )?;
        self.procedures
            .insert(event_id, Procedure::ReplacementSearch { vacant });
        Ok(vec![
            send,
            self.schedule(TimeoutKind::ReplacementOfferResponse, Some(event_id)),
        ])
    }
}

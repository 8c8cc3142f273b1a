// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! Join protocol.
//!
//! A `Join` is routed toward the insertion position, the leftmost empty
//! child slot at minimum depth as visible from each hop's local view. The
//! peer that finds the slot among its own children accepts, seeds the
//! joiner's routing state and waits for the joiner's ack; the joiner
//! installs itself and confirms to parent and adjacents-to-be. Concurrent
//! joiners at one acceptor are refused and have to retry.

use super::Core;
use crate::config::JoinMode;
use crate::error::{Error, Result};
use crate::fsm::{FsmEvent, Signal, State};
use crate::log_markers::LogMarker;
use crate::messages::{EventId, Header, JoinRejectionReason, NodeMsg};
use crate::node::command::Command;
use crate::node::event::Event;
use crate::node::procedures::Procedure;
use crate::node::NodeState;
use crate::peer::{NodeInfo, Uuid};
use crate::position::Position;
use crate::timeouts::TimeoutKind;
use std::collections::HashSet;
use std::net::SocketAddr;

/// Give up joining after this many refused or unanswered attempts.
const MAX_JOIN_ATTEMPTS: u32 = 3;

impl Core {
    pub(super) fn initiate_join(&mut self) -> Result<Vec<Command>> {
        self.set_state(NodeState::Started);
        match self.config.join.clone() {
            JoinMode::Root => {
                let _ = self.fsm.apply(FsmEvent::Signal(Signal::Rooted))?;
                self.set_state(NodeState::Connected);
                self.publish_event(Event::Joined(self.node()));
                info!("{} as root {}", LogMarker::JoinedNetwork, self.node());
                Ok(vec![])
            }
            JoinMode::KnownEndpoint(contact) => self.send_join_request(contact, 0),
            JoinMode::Discovery => self.start_discovery(),
        }
    }

    /// Fires a `Join` at a contact peer and arms the response timeout.
    pub(super) fn send_join_request(
        &mut self,
        contact: SocketAddr,
        attempts: u32,
    ) -> Result<Vec<Command>> {
        let contact_info = NodeInfo::new(Position::root(self.fanout)?, contact, Uuid::nil());
        let (event_id, send) = self.prepare(
            contact_info,
            NodeMsg::Join {
                joiner_endpoint: self.local_addr(),
            },
            None,
        )?;
        self.procedures
            .insert(event_id, Procedure::JoinAttempt { contact, attempts });
        info!("{} to {} (attempt {})", LogMarker::SendJoinRequest, contact, attempts);
        Ok(vec![
            send,
            self.schedule(TimeoutKind::JoinResponse, Some(event_id)),
        ])
    }

    pub(super) fn handle_join(
        &mut self,
        header: &Header,
        joiner_endpoint: SocketAddr,
    ) -> Result<Vec<Command>> {
        debug!("{} from {}", LogMarker::JoinRequestReceived, joiner_endpoint);
        let joiner = NodeInfo::new(Position::root(self.fanout)?, joiner_endpoint, Uuid::nil());

        // one admission at a time; a contended joiner must retry
        if matches!(
            self.fsm.state(),
            State::ConnectedAcceptingChild | State::ConnectedReplacing
        ) || self.procedures.admitting_child()
        {
            let (_, send) = self.prepare(
                joiner,
                NodeMsg::JoinRejected {
                    reason: JoinRejectionReason::ConcurrentJoin,
                },
                Some(header.event_id),
            )?;
            info!("{} concurrent join from {}", LogMarker::SendJoinRejected, joiner_endpoint);
            return Ok(vec![send]);
        }

        match self.visible_insertion_host(&header.sender) {
            Some(host) if host.position() == self.node().position() => {
                self.accept_join(header, joiner)
            }
            Some(host) => {
                let (_, send) = self.prepare(
                    host,
                    NodeMsg::Join { joiner_endpoint },
                    Some(header.ref_event_id.unwrap_or(header.event_id)),
                )?;
                debug!("{} toward {}", LogMarker::JoinForwarded, host.position());
                Ok(vec![send])
            }
            None => {
                let (_, send) = self.prepare(
                    joiner,
                    NodeMsg::JoinRejected {
                        reason: JoinRejectionReason::NotAccepting,
                    },
                    Some(header.event_id),
                )?;
                Ok(vec![send])
            }
        }
    }

    /// The peer hosting the leftmost empty child slot at minimum depth, as
    /// far as the local view can tell. Unknown child slots of known peers
    /// count as empty; wrong guesses resolve by forwarding.
    fn visible_insertion_host(&self, from: &NodeInfo) -> Option<NodeInfo> {
        let own = self.node();
        let known: HashSet<Position> = self
            .routing
            .all_neighbors()
            .iter()
            .map(|n| n.position())
            .chain(std::iter::once(own.position()))
            .collect();

        let mut hosts = vec![own];
        hosts.extend(self.routing.all_neighbors());

        let mut best: Option<(Position, NodeInfo)> = None;
        for host in hosts {
            // never bounce a join straight back to the hop it came from
            if host.position() == from.position() && host.position() != own.position() {
                continue;
            }
            for index in 0..self.fanout {
                let slot = match host.position().child(index) {
                    Ok(slot) => slot,
                    Err(_) => continue,
                };
                if known.contains(&slot) {
                    continue;
                }
                if best
                    .map(|(current, _)| (slot.level(), slot.number()) < (current.level(), current.number()))
                    .unwrap_or(true)
                {
                    best = Some((slot, host));
                }
                break; // further slots of this host are further right
            }
        }
        best.map(|(_, host)| host)
    }

    fn accept_join(&mut self, header: &Header, joiner: NodeInfo) -> Result<Vec<Command>> {
        let slot = self
            .routing
            .leftmost_empty_child_slot()
            .ok_or_else(|| Error::JoinFailed("no empty child slot".to_string()))?;
        let new_position = self.node().position().child(slot)?;

        let (adjacent_left, adjacent_right) = self.adjacents_for(&new_position);
        let mut routing_seed = self.routing.all_neighbors();
        routing_seed.push(self.node());

        let (accept_id, send) = self.prepare(
            joiner,
            NodeMsg::JoinAccept {
                fanout: self.fanout,
                treemapper_root: self.treemapper_root,
                new_position,
                adjacent_left,
                adjacent_right,
                routing_seed,
            },
            Some(header.event_id),
        )?;
        self.procedures.insert(
            accept_id,
            Procedure::PendingChild {
                joiner: joiner.at_position(new_position),
            },
        );
        info!("{} {} at {}", LogMarker::SendJoinAccept, joiner, new_position);
        Ok(vec![
            send,
            self.schedule(TimeoutKind::JoinAcceptAckResponse, Some(accept_id)),
        ])
    }

    /// Inorder predecessor and successor of a position among the peers we
    /// know of, including ourselves.
    pub(super) fn adjacents_for(&self, position: &Position) -> (Option<NodeInfo>, Option<NodeInfo>) {
        let target_h = position.horizontal(self.treemapper_root);
        let mut left: Option<(f64, NodeInfo)> = None;
        let mut right: Option<(f64, NodeInfo)> = None;
        for peer in self
            .routing
            .all_neighbors()
            .into_iter()
            .chain(std::iter::once(self.node()))
        {
            let h = peer.horizontal(self.treemapper_root);
            if h < target_h {
                if left.map(|(best, _)| h > best).unwrap_or(true) {
                    left = Some((h, peer));
                }
            } else if h > target_h && right.map(|(best, _)| h < best).unwrap_or(true) {
                right = Some((h, peer));
            }
        }
        (left.map(|(_, n)| n), right.map(|(_, n)| n))
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn handle_join_accept(
        &mut self,
        header: &Header,
        fanout: u16,
        treemapper_root: u16,
        new_position: Position,
        adjacent_left: Option<NodeInfo>,
        adjacent_right: Option<NodeInfo>,
        routing_seed: Vec<NodeInfo>,
    ) -> Result<Vec<Command>> {
        let _ = self.take_join_attempt();
        self.fanout = fanout;
        self.treemapper_root = treemapper_root;

        let own = NodeInfo::new(new_position, self.local_addr(), self.uuid());
        self.install_identity(own);

        if let Err(error) = self.routing.set_parent(header.sender) {
            // an acceptor that is not our structural parent is a protocol
            // breach; bail out of this attempt
            error!("join accept from non-parent {}: {:?}", header.sender, error);
            self.fsm.fail();
            self.set_state(NodeState::Error);
            return Err(error);
        }
        if let Err(error) = self.routing.set_adjacent_left(adjacent_left) {
            debug!("ignoring seeded adjacent-left: {:?}", error);
        }
        if let Err(error) = self.routing.set_adjacent_right(adjacent_right) {
            debug!("ignoring seeded adjacent-right: {:?}", error);
        }
        for seed in routing_seed {
            if seed.position() == own.position() {
                continue;
            }
            if self.routing.update_neighbor(seed).is_err() {
                // seeds outside our neighbor algebra are just dropped
                continue;
            }
        }

        let mut commands = Vec::new();
        let ack = NodeMsg::JoinAcceptAck { joiner: own };
        let (_, send) = self.prepare(header.sender, ack.clone(), Some(header.event_id))?;
        commands.push(send);
        for adjacent in [self.routing.adjacent_left(), self.routing.adjacent_right()]
            .into_iter()
            .flatten()
        {
            if adjacent.position() != header.sender.position() {
                let (_, send) = self.prepare(adjacent, ack.clone(), Some(header.event_id))?;
                commands.push(send);
            }
        }

        self.set_state(NodeState::Connected);
        self.publish_event(Event::Joined(own));
        info!("{} at {}", LogMarker::JoinedNetwork, own);
        Ok(commands)
    }

    pub(super) fn handle_join_accept_ack(
        &mut self,
        header: &Header,
        joiner: NodeInfo,
    ) -> Result<Vec<Command>> {
        let pending = header
            .ref_event_id
            .and_then(|ref_id| self.procedures.remove(&ref_id));

        if let Err(error) = self.routing.update_neighbor(joiner) {
            debug!("joiner {} outside our algebra: {:?}", joiner, error);
        }
        self.adopt_adjacent_if_closer(joiner);

        let mut commands = Vec::new();
        if let Some(Procedure::PendingChild { .. }) = pending {
            // as the accepting parent, spread the news to everyone who has
            // the new child in their neighbor algebra
            info!("{} {}", LogMarker::ChildAccepted, joiner);
            self.publish_event(Event::ChildJoined(joiner));
            let update = NodeMsg::UpdateNeighbor { neighbor: joiner };

            let mut recipients: Vec<NodeInfo> = Vec::new();
            recipients.extend(self.routing.routing_table_left());
            recipients.extend(self.routing.routing_table_right());
            for rt_position in joiner
                .position()
                .routing_table_left()
                .into_iter()
                .chain(joiner.position().routing_table_right())
            {
                if let Some(peer) = self.routing.get(&rt_position) {
                    recipients.push(peer);
                }
            }
            recipients.sort_by_key(|n| n.position());
            recipients.dedup_by_key(|n| n.position());
            for recipient in recipients {
                if recipient.position() == joiner.position() {
                    continue;
                }
                let (_, send) = self.prepare(recipient, update.clone(), None)?;
                commands.push(send);
            }
        }
        Ok(commands)
    }

    pub(super) fn handle_join_rejected(
        &mut self,
        _header: &Header,
        reason: JoinRejectionReason,
    ) -> Result<Vec<Command>> {
        warn!("join attempt rejected: {:?}", reason);
        let attempt = self.take_join_attempt();
        self.retry_or_fail_join(attempt)
    }

    pub(super) fn handle_join_response_timeout(
        &mut self,
        ref_event: Option<EventId>,
    ) -> Result<Vec<Command>> {
        let attempt = ref_event.and_then(|id| self.procedures.remove(&id));
        let _ = self.fsm.apply(FsmEvent::Timeout(TimeoutKind::JoinResponse))?;
        let attempt = match attempt {
            Some(Procedure::JoinAttempt { contact, attempts }) => Some((contact, attempts)),
            _ => None,
        };
        self.retry_or_fail_join(attempt)
    }

    fn retry_or_fail_join(
        &mut self,
        attempt: Option<(SocketAddr, u32)>,
    ) -> Result<Vec<Command>> {
        // prefer a fresh contact from discovery over hammering the same one
        if let Some(contact) = self.bootstrap_candidates.pop() {
            return self.send_join_request(contact, 0);
        }
        if let Some((contact, attempts)) = attempt {
            if attempts + 1 < MAX_JOIN_ATTEMPTS {
                return self.send_join_request(contact, attempts + 1);
            }
        }
        self.publish_event(Event::JoinFailed);
        self.set_state(NodeState::Error);
        Ok(vec![])
    }

    pub(super) fn handle_join_ack_timeout(
        &mut self,
        ref_event: Option<EventId>,
    ) -> Result<Vec<Command>> {
        if let Some(ref_id) = ref_event {
            if let Some(Procedure::PendingChild { joiner }) = self.procedures.remove(&ref_id) {
                warn!("joiner {} never confirmed, dropping admission", joiner);
            }
        }
        let _ = self
            .fsm
            .apply(FsmEvent::Timeout(TimeoutKind::JoinAcceptAckResponse))?;
        Ok(vec![])
    }

    fn take_join_attempt(&mut self) -> Option<(SocketAddr, u32)> {
        let mut attempt = None;
        for key in self.procedures.join_attempt_keys() {
            if let Some(Procedure::JoinAttempt { contact, attempts }) =
                self.procedures.remove(&key)
            {
                attempt = Some((contact, attempts));
            }
        }
        attempt
    }
}

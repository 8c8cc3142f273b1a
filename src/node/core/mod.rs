// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! The single-threaded heart of a peer.
//!
//! All mutable state lives here and is only ever touched from the owning
//! event loop: the dispatcher feeds one [`Command`] at a time and every
//! handler runs to completion, returning the follow-up commands (sends,
//! timer arms, recursions) for the dispatcher to carry out.

mod bootstrap;
mod entity_search;
mod join;
mod leave;
mod search_exact;

use super::command::{next_timer_token, Command};
use super::event::Event;
use super::procedures::ProcedureRegistry;
use super::NodeState;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::esearch::DsnHandler;
use crate::fsm::{FsmEvent, Signal, State, StateMachine};
use crate::log_markers::LogMarker;
use crate::messages::{EventId, MsgTag, NodeMsg, WireMsg};
use crate::peer::{NodeInfo, Uuid};
use crate::position::Position;
use crate::routing_info::{NeighborChange, Relationship, RoutingInformation};
use crate::store::LocalData;
use crate::timeouts::TimeoutKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, watch};

/// Milliseconds since the unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) struct Core {
    pub(super) config: Config,
    /// Effective tree parameters; joiners adopt them from `JoinAccept`.
    pub(super) fanout: u16,
    pub(super) treemapper_root: u16,
    uuid: Uuid,
    local_addr: SocketAddr,
    pub(super) fsm: StateMachine,
    pub(super) routing: RoutingInformation,
    pub(super) procedures: ProcedureRegistry,
    pub(super) local_data: LocalData,
    pub(super) dsn: Arc<Mutex<DsnHandler>>,
    event_tx: mpsc::Sender<Event>,
    state_tx: watch::Sender<NodeState>,
    node_tx: watch::Sender<NodeInfo>,
    pub(super) pending_stop: Option<oneshot::Sender<Result<()>>>,
    /// Responders collected during multicast discovery.
    pub(super) bootstrap_candidates: Vec<SocketAddr>,
    /// Listen-window pacing for discovery probes.
    pub(super) discovery_backoff: Option<backoff::ExponentialBackoff>,
    /// Set once the loop should stop after draining.
    pub(super) shutdown: bool,
    last_timestamp: u64,
}

impl Core {
    pub(crate) fn new(
        config: Config,
        local_addr: SocketAddr,
        event_tx: mpsc::Sender<Event>,
        state_tx: watch::Sender<NodeState>,
        node_tx: watch::Sender<NodeInfo>,
    ) -> Result<Self> {
        config.validate()?;
        let fanout = config.fanout;
        let treemapper_root = config.treemapper_root;
        let uuid = Uuid::random();
        // Non-root nodes start with a provisional root coordinate; the real
        // position arrives with the JoinAccept.
        let node = NodeInfo::new(Position::root(fanout)?, local_addr, uuid);

        let dsn = Arc::new(Mutex::new(DsnHandler::new(
            node,
            treemapper_root,
            config.timestamp_storage_limit,
        )));
        let routing = Self::build_routing(node, treemapper_root, &dsn, &event_tx);

        Ok(Self {
            config,
            fanout,
            treemapper_root,
            uuid,
            local_addr,
            fsm: StateMachine::new(State::Idle),
            routing,
            procedures: ProcedureRegistry::default(),
            local_data: LocalData::default(),
            dsn,
            event_tx,
            state_tx,
            node_tx,
            pending_stop: None,
            bootstrap_candidates: Vec::new(),
            discovery_backoff: None,
            shutdown: false,
            last_timestamp: 0,
        })
    }

    fn build_routing(
        node: NodeInfo,
        treemapper_root: u16,
        dsn: &Arc<Mutex<DsnHandler>>,
        event_tx: &mpsc::Sender<Event>,
    ) -> RoutingInformation {
        let mut routing = RoutingInformation::new(node, treemapper_root);
        let observer = dsn.clone();
        routing.register_observer(Box::new(move |change| {
            observer
                .lock()
                .expect("dsn handler lock")
                .on_neighbor_change(change, now_ms());
        }));
        // the host sees every slot mutation too; identity swaps are
        // reported separately as Joined/Relocated
        let events = event_tx.clone();
        routing.register_observer(Box::new(move |change| {
            if change.relationship == Relationship::Unknown {
                return;
            }
            let _ = events.try_send(Event::NeighborChanged {
                relationship: change.relationship,
                old: change.old,
                new: change.new,
            });
        }));
        routing
    }

    pub(crate) fn node(&self) -> NodeInfo {
        self.routing.node()
    }

    pub(super) fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub(super) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Monotone per-peer timestamp in ms.
    pub(super) fn stamp(&mut self) -> u64 {
        self.last_timestamp = self.last_timestamp.max(now_ms());
        self.last_timestamp
    }

    /// Swaps identity (position change on join or replacement) and rebuilds
    /// the routing shell around it. The DSN handler notices the own-position
    /// change through the observer and rebuilds its cover.
    pub(super) fn install_identity(&mut self, node: NodeInfo) {
        self.routing = Self::build_routing(node, self.treemapper_root, &self.dsn, &self.event_tx);
        self.dsn
            .lock()
            .expect("dsn handler lock")
            .on_neighbor_change(
                &NeighborChange {
                    own: node,
                    relationship: Relationship::Unknown,
                    old: None,
                    new: Some(node),
                },
                now_ms(),
            );
        let _ = self.node_tx.send(node);
    }

    pub(super) fn set_state(&mut self, state: NodeState) {
        let _ = self.state_tx.send(state);
    }

    pub(super) fn publish_event(&self, event: Event) {
        let _ = self.event_tx.try_send(event);
    }

    pub(super) fn publish_node_info(&self) {
        let _ = self.node_tx.send(self.routing.node());
    }

    ////////////////////////////////////////////////////////////////////////
    // Outgoing messages and timers
    ////////////////////////////////////////////////////////////////////////

    /// Passes the outgoing message through the FSM and wraps it for the
    /// dispatcher. Emission in an illegal state fails with `FsmViolation`
    /// and nothing is sent.
    pub(super) fn prepare(
        &mut self,
        recipient: NodeInfo,
        msg: NodeMsg,
        ref_event: Option<EventId>,
    ) -> Result<(EventId, Command)> {
        let _ = self.fsm.apply(FsmEvent::Send(msg.tag()))?;
        let wire_msg = match ref_event {
            Some(id) => WireMsg::reply_to(self.node(), recipient, id, msg),
            None => WireMsg::new(self.node(), recipient, msg),
        };
        let event_id = wire_msg.event_id();
        Ok((event_id, Command::SendMessage {
            recipient,
            wire_msg,
        }))
    }

    /// Arms a timer of the given kind; the dispatcher raises a
    /// `HandleTimeout` when it expires.
    pub(super) fn schedule(&self, kind: TimeoutKind, ref_event: Option<EventId>) -> Command {
        Command::ScheduleTimeout {
            duration: self.config.timeouts.length_of(kind),
            kind,
            ref_event,
            token: next_timer_token(),
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Command and message dispatch
    ////////////////////////////////////////////////////////////////////////

    pub(crate) fn handle_command(&mut self, command: Command) -> Result<Vec<Command>> {
        match command {
            Command::HandleMessage { sender, wire_msg } => self.handle_message(sender, wire_msg),
            Command::HandleTimeout {
                token,
                kind,
                ref_event,
            } => self.handle_timeout(token, kind, ref_event),
            Command::HandlePeerLost(peer) => self.handle_peer_lost(peer),
            Command::InitiateJoin => self.initiate_join(),
            Command::InitiateLeave(reply) => self.initiate_leave(reply),
            Command::Insert(entries, reply) => {
                let outcome = self.local_insert(entries);
                Self::resolve(reply, outcome)
            }
            Command::Update(entries, reply) => {
                let outcome = self.local_update(entries);
                Self::resolve(reply, outcome)
            }
            Command::Remove(keys, reply) => {
                let outcome = self.local_remove(keys);
                Self::resolve(reply, outcome)
            }
            Command::Find(query, reply) => self.initiate_find(query, reply),
            Command::SendMessage { .. }
            | Command::SendDiscovery(_)
            | Command::ScheduleTimeout { .. } => {
                // I/O commands belong to the dispatcher
                Err(Error::InvalidState)
            }
        }
    }

    fn resolve(
        reply: oneshot::Sender<Result<()>>,
        outcome: Result<Vec<Command>>,
    ) -> Result<Vec<Command>> {
        match outcome {
            Ok(commands) => {
                let _ = reply.send(Ok(()));
                Ok(commands)
            }
            Err(error) => {
                let _ = reply.send(Err(error));
                Ok(vec![])
            }
        }
    }

    /// Validates an incoming message against the FSM and dispatches it to
    /// the owning algorithm. Messages with no legal transition are dropped.
    pub(crate) fn handle_message(
        &mut self,
        sender: SocketAddr,
        wire_msg: WireMsg,
    ) -> Result<Vec<Command>> {
        let tag = wire_msg.tag();
        if !self.fsm.permits(&FsmEvent::Recv(tag)) {
            debug!(
                "{} {:?} in state {:?}",
                LogMarker::MessageDropped,
                tag,
                self.fsm.state()
            );
            return Ok(vec![]);
        }
        let _ = self.fsm.apply(FsmEvent::Recv(tag))?;

        let header = wire_msg.header;
        let mut commands = match wire_msg.msg {
            NodeMsg::Join { joiner_endpoint } => self.handle_join(&header, joiner_endpoint)?,
            NodeMsg::JoinAccept {
                fanout,
                treemapper_root,
                new_position,
                adjacent_left,
                adjacent_right,
                routing_seed,
            } => self.handle_join_accept(
                &header,
                fanout,
                treemapper_root,
                new_position,
                adjacent_left,
                adjacent_right,
                routing_seed,
            )?,
            NodeMsg::JoinAcceptAck { joiner } => self.handle_join_accept_ack(&header, joiner)?,
            NodeMsg::JoinRejected { reason } => self.handle_join_rejected(&header, reason)?,
            NodeMsg::Bootstrap { joiner_endpoint } => {
                self.handle_bootstrap(&header, joiner_endpoint)?
            }
            NodeMsg::BootstrapResponse { responder } => {
                self.handle_bootstrap_response(&header, responder)?
            }
            NodeMsg::FindReplacement { requester, vacant } => {
                self.handle_find_replacement(&header, requester, vacant)?
            }
            NodeMsg::ReplacementOffer {
                offered_position,
                incumbent,
            } => self.handle_replacement_offer(&header, offered_position, incumbent)?,
            NodeMsg::ReplacementAck { vacated } => {
                self.handle_replacement_ack(&header, vacated)?
            }
            NodeMsg::RemoveNeighbor { removed } => self.handle_remove_neighbor(&header, removed)?,
            NodeMsg::UpdateNeighbor { neighbor } => {
                self.handle_update_neighbor(&header, neighbor)?
            }
            NodeMsg::SearchExact {
                destination,
                hops_left,
                payload,
            } => self.handle_search_exact(&header, destination, hops_left, *payload)?,
            NodeMsg::SearchExactFailure {
                destination,
                reason,
            } => self.handle_search_exact_failure(&header, destination, reason)?,
            NodeMsg::AttributeInquiryRequest { keys, inquire_all } => {
                self.handle_attribute_inquiry_request(&header, keys, inquire_all)?
            }
            NodeMsg::AttributeInquiryAnswer {
                inquired,
                attributes,
                removed_keys,
            } => self.handle_attribute_inquiry_answer(&header, inquired, attributes, removed_keys)?,
            NodeMsg::SubscriptionOrder { keys, subscribe } => {
                self.handle_subscription_order(&header, keys, subscribe)?
            }
            NodeMsg::SubscriptionUpdate {
                key,
                value,
                timestamp,
            } => self.handle_subscription_update(&header, key, value, timestamp)?,
            NodeMsg::FindQueryRequest {
                query,
                direction,
                interval,
            } => self.handle_find_query_request(&header, query, direction, interval)?,
            NodeMsg::FindQueryAnswer {
                nodes_with_attributes,
            } => self.handle_find_query_answer(&header, nodes_with_attributes)?,
        };

        commands.extend(self.flush_cover_inquiries()?);
        Ok(commands)
    }

    fn handle_timeout(
        &mut self,
        token: u64,
        kind: TimeoutKind,
        ref_event: Option<EventId>,
    ) -> Result<Vec<Command>> {
        // a timer whose procedure has concluded is stale
        if let Some(event_id) = &ref_event {
            if !self.procedures.contains(event_id) {
                trace!("{} {:?} #{}", LogMarker::TimeoutCancelledLate, kind, token);
                return Ok(vec![]);
            }
        }
        debug!("timeout {:?} #{} expired", kind, token);
        match kind {
            TimeoutKind::BootstrapResponse => self.handle_bootstrap_timeout(),
            TimeoutKind::JoinResponse => self.handle_join_response_timeout(ref_event),
            TimeoutKind::JoinAcceptAckResponse => self.handle_join_ack_timeout(ref_event),
            TimeoutKind::ReplacementOfferResponse => {
                self.handle_replacement_offer_timeout(ref_event)
            }
            TimeoutKind::ReplacementAckResponse => self.handle_replacement_ack_timeout(ref_event),
            TimeoutKind::DsnAggregation => self.handle_dsn_aggregation_timeout(ref_event),
            TimeoutKind::InquiryAggregation => self.handle_inquiry_aggregation_timeout(ref_event),
        }
    }

    /// A send toward `peer` failed: clean the neighbor out and, if we are
    /// its parent, drive the replacement re-election for its slot.
    fn handle_peer_lost(&mut self, peer: NodeInfo) -> Result<Vec<Command>> {
        if !self.fsm.state().is_connected() {
            return Ok(vec![]);
        }
        warn!("{} {}", LogMarker::PeerLost, peer);
        let removed = self.routing.remove_neighbor(&peer.position());
        if removed.is_none() {
            return Ok(vec![]);
        }
        self.publish_event(Event::PeerLost(peer));

        let mut commands = Vec::new();
        if self.node().position().is_parent_of(&peer.position()) {
            commands.extend(self.recover_vacated_position(peer.position())?);
        }
        commands.extend(self.flush_cover_inquiries()?);
        Ok(commands)
    }

    /// Neighbor upkeep: install or refresh the sender-announced occupant.
    fn handle_update_neighbor(
        &mut self,
        _header: &crate::messages::Header,
        neighbor: NodeInfo,
    ) -> Result<Vec<Command>> {
        match self.routing.update_neighbor(neighbor) {
            Ok(()) => {
                trace!("{} {}", LogMarker::NeighborInstalled, neighbor);
            }
            Err(error) => {
                // unrelated positions are dropped, the peer stays untouched
                debug!("ignoring neighbor update {}: {:?}", neighbor, error);
            }
        }
        self.adopt_adjacent_if_closer(neighbor);
        Ok(vec![])
    }

    fn handle_remove_neighbor(
        &mut self,
        _header: &crate::messages::Header,
        removed: NodeInfo,
    ) -> Result<Vec<Command>> {
        if self.routing.remove_neighbor(&removed.position()).is_some() {
            trace!("{} {}", LogMarker::NeighborRemoved, removed);
        }
        Ok(vec![])
    }

    /// Re-points an adjacency slot when a peer slots in between us and the
    /// current adjacent on the horizontal line.
    pub(super) fn adopt_adjacent_if_closer(&mut self, candidate: NodeInfo) {
        if candidate.position() == self.node().position() {
            return;
        }
        let own_h = self.node().horizontal(self.treemapper_root);
        let candidate_h = candidate.horizontal(self.treemapper_root);
        if candidate_h < own_h {
            let closer = match self.routing.adjacent_left() {
                Some(current) => candidate_h > current.horizontal(self.treemapper_root),
                None => true,
            };
            if closer {
                let _ = self.routing.set_adjacent_left(Some(candidate));
            }
        } else {
            let closer = match self.routing.adjacent_right() {
                Some(current) => candidate_h < current.horizontal(self.treemapper_root),
                None => true,
            };
            if closer {
                let _ = self.routing.set_adjacent_right(Some(candidate));
            }
        }
    }

    /// Sends cover-maintenance inquiries the DSN handler queued up while
    /// neighbor changes were applied.
    pub(super) fn flush_cover_inquiries(&mut self) -> Result<Vec<Command>> {
        let pending = self
            .dsn
            .lock()
            .expect("dsn handler lock")
            .drain_pending_inquiries();
        let mut commands = Vec::new();
        for peer in pending {
            if !self.fsm.permits(&FsmEvent::Send(MsgTag::AttributeInquiryRequest)) {
                break;
            }
            let (_, command) = self.prepare(
                peer,
                NodeMsg::AttributeInquiryRequest {
                    keys: Vec::new(),
                    inquire_all: true,
                },
                None,
            )?;
            commands.push(command);
        }
        Ok(commands)
    }

    /// Resolves everything still pending when the loop winds down.
    pub(crate) fn cancel_pending(&mut self) {
        self.procedures.cancel_all();
        if let Some(reply) = self.pending_stop.take() {
            let _ = reply.send(Err(Error::Cancelled));
        }
    }

    /// Graceful shutdown bookkeeping once the peer is out of the tree.
    pub(super) fn conclude_departure(&mut self) {
        let _ = self.fsm.apply(FsmEvent::Signal(Signal::Departed));
        self.procedures.cancel_all();
        self.set_state(NodeState::Idle);
        self.publish_event(Event::Left);
        if let Some(reply) = self.pending_stop.take() {
            let _ = reply.send(Ok(()));
        }
        self.shutdown = true;
        info!("{}", LogMarker::SignOffComplete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::esearch::{Expression, FindQuery};
    use crate::messages::{JoinRejectionReason, MsgTag, SearchFailureReason};
    use crate::node::event::Event;
    use crate::store::{Entry, Value, ValueType};
    use assert_matches::assert_matches;
    use tokio::sync::oneshot;

    struct TestPeer {
        core: Core,
        state_rx: watch::Receiver<NodeState>,
        event_rx: mpsc::Receiver<Event>,
        _node_rx: watch::Receiver<NodeInfo>,
    }

    impl TestPeer {
        fn drain_events(&mut self) -> Vec<Event> {
            let mut events = Vec::new();
            while let Ok(event) = self.event_rx.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn peer_with(config: Config) -> TestPeer {
        let local_addr = config.local_addr;
        let (event_tx, event_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(NodeState::Started);
        let placeholder = NodeInfo::new(
            Position::root(config.fanout).expect("root position"),
            local_addr,
            Uuid::random(),
        );
        let (node_tx, node_rx) = watch::channel(placeholder);
        let core = Core::new(config, local_addr, event_tx, state_tx, node_tx)
            .expect("core construction");
        TestPeer {
            core,
            state_rx,
            event_rx,
            _node_rx: node_rx,
        }
    }

    fn connected_root() -> TestPeer {
        let mut peer = peer_with(Config::root(SocketAddr::from(([127, 0, 0, 1], 7000))));
        let commands = peer
            .core
            .handle_command(Command::InitiateJoin)
            .expect("root start");
        assert!(commands.is_empty());
        assert_eq!(*peer.state_rx.borrow(), NodeState::Connected);
        peer
    }

    fn joiner_endpoint(index: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 7100 + index))
    }

    /// Runs the full admission handshake of one joiner against `core`,
    /// returning the joiner's final identity.
    fn admit_joiner(core: &mut Core, index: u16) -> NodeInfo {
        let endpoint = joiner_endpoint(index);
        let join = WireMsg::new(
            NodeInfo::new(
                Position::root(2).expect("root position"),
                endpoint,
                Uuid::random(),
            ),
            core.node(),
            NodeMsg::Join {
                joiner_endpoint: endpoint,
            },
        );
        let commands = core.handle_message(endpoint, join).expect("join handled");
        let (accept_id, new_position) = commands
            .iter()
            .find_map(|command| match command {
                Command::SendMessage { wire_msg, .. } => match &wire_msg.msg {
                    NodeMsg::JoinAccept { new_position, .. } => {
                        Some((wire_msg.event_id(), *new_position))
                    }
                    _ => None,
                },
                _ => None,
            })
            .expect("join accept sent");

        let joiner = NodeInfo::new(new_position, endpoint, Uuid::random());
        let ack = WireMsg::reply_to(
            joiner,
            core.node(),
            accept_id,
            NodeMsg::JoinAcceptAck { joiner },
        );
        let _ = core.handle_message(endpoint, ack).expect("ack handled");
        joiner
    }

    #[test]
    fn root_places_the_first_joiner_on_its_leftmost_slot() {
        let mut peer = connected_root();
        let joiner = admit_joiner(&mut peer.core, 1);
        assert_eq!(joiner.position(), Position::new(1, 0, 2).expect("valid"));
        assert_eq!(peer.core.routing.child(0), Some(joiner));
        assert_eq!(peer.core.routing.adjacent_left(), Some(joiner));
        assert_eq!(peer.core.fsm.state(), State::Connected);

        // the host observes the slot mutation on the event stream
        let events = peer.drain_events();
        assert!(events.iter().any(|event| matches!(
            event,
            Event::NeighborChanged {
                relationship: crate::routing_info::Relationship::Child,
                old: None,
                new: Some(new),
            } if *new == joiner
        )));
    }

    #[test]
    fn concurrent_joins_are_refused() {
        let mut peer = connected_root();
        let first = joiner_endpoint(1);
        let join = |endpoint: SocketAddr, target: NodeInfo| {
            WireMsg::new(
                NodeInfo::new(
                    Position::root(2).expect("root position"),
                    endpoint,
                    Uuid::random(),
                ),
                target,
                NodeMsg::Join {
                    joiner_endpoint: endpoint,
                },
            )
        };
        let _ = peer
            .core
            .handle_message(first, join(first, peer.core.node()))
            .expect("first join");
        assert_eq!(peer.core.fsm.state(), State::ConnectedAcceptingChild);

        let second = joiner_endpoint(2);
        let commands = peer
            .core
            .handle_message(second, join(second, peer.core.node()))
            .expect("second join");
        assert_matches!(
            &commands[..],
            [Command::SendMessage { wire_msg, .. }]
                if matches!(wire_msg.msg, NodeMsg::JoinRejected { reason: JoinRejectionReason::ConcurrentJoin })
        );
    }

    #[test]
    fn unanswered_admission_times_out_and_reopens_the_slot() {
        let mut peer = connected_root();
        let endpoint = joiner_endpoint(1);
        let join = WireMsg::new(
            NodeInfo::new(
                Position::root(2).expect("root position"),
                endpoint,
                Uuid::random(),
            ),
            peer.core.node(),
            NodeMsg::Join {
                joiner_endpoint: endpoint,
            },
        );
        let commands = peer.core.handle_message(endpoint, join).expect("join");
        let (token, ref_event) = commands
            .iter()
            .find_map(|command| match command {
                Command::ScheduleTimeout {
                    kind: TimeoutKind::JoinAcceptAckResponse,
                    token,
                    ref_event,
                    ..
                } => Some((*token, *ref_event)),
                _ => None,
            })
            .expect("ack timeout armed");

        let _ = peer
            .core
            .handle_command(Command::HandleTimeout {
                token,
                kind: TimeoutKind::JoinAcceptAckResponse,
                ref_event,
            })
            .expect("timeout handled");
        assert_eq!(peer.core.fsm.state(), State::Connected);
        // the next joiner is admitted again
        let joiner = admit_joiner(&mut peer.core, 2);
        assert_eq!(joiner.position(), Position::new(1, 0, 2).expect("valid"));
    }

    #[test]
    fn messages_without_legal_transition_are_dropped() {
        let mut peer = peer_with(Config::joining(
            SocketAddr::from(([127, 0, 0, 1], 7001)),
            SocketAddr::from(([127, 0, 0, 1], 7000)),
        ));
        // still Idle: neighbor upkeep is not legal yet
        let update = WireMsg::new(
            NodeInfo::new(
                Position::new(1, 1, 2).expect("valid"),
                joiner_endpoint(3),
                Uuid::random(),
            ),
            peer.core.node(),
            NodeMsg::UpdateNeighbor {
                neighbor: NodeInfo::new(
                    Position::new(1, 1, 2).expect("valid"),
                    joiner_endpoint(3),
                    Uuid::random(),
                ),
            },
        );
        let commands = peer
            .core
            .handle_message(joiner_endpoint(3), update)
            .expect("dropped silently");
        assert!(commands.is_empty());
        assert_eq!(peer.core.fsm.state(), State::Idle);
    }

    #[test]
    fn search_prefers_the_destination_level() {
        let mut peer = connected_root();
        let joiner = admit_joiner(&mut peer.core, 1);

        // 1:1 is unoccupied, but 1:0 sits on the destination level and is
        // the better next hop than staying at the root
        let (inner_id, commands) = peer
            .core
            .send_via_search_exact(
                Position::new(1, 1, 2).expect("valid"),
                NodeMsg::UpdateNeighbor {
                    neighbor: peer.core.node(),
                },
                None,
            )
            .expect("search dispatched");
        let forwarded_to = commands
            .iter()
            .find_map(|command| match command {
                Command::SendMessage {
                    recipient,
                    wire_msg,
                } if matches!(wire_msg.msg, NodeMsg::SearchExact { .. }) => Some(*recipient),
                _ => None,
            })
            .expect("envelope forwarded");
        assert_eq!(forwarded_to, joiner);

        // the failure notice for the probe settles without pending work
        let failure = WireMsg::reply_to(
            joiner,
            peer.core.node(),
            inner_id,
            NodeMsg::SearchExactFailure {
                destination: Position::new(1, 1, 2).expect("valid"),
                reason: SearchFailureReason::PositionEmpty,
            },
        );
        let commands = peer
            .core
            .handle_message(joiner.endpoint().expect("endpoint"), failure)
            .expect("failure absorbed");
        assert!(commands.is_empty());
    }

    #[test]
    fn find_aggregates_cover_inquiries_and_subtree_probes() {
        let mut peer = connected_root();
        let joiner = admit_joiner(&mut peer.core, 1);

        // the cover cache learns the joiner's attribute
        let answer = WireMsg::new(
            joiner,
            peer.core.node(),
            NodeMsg::AttributeInquiryAnswer {
                inquired: joiner,
                attributes: vec![(
                    "wetter".to_string(),
                    crate::store::Record {
                        value: Value::from("schlecht"),
                        timestamp: now_ms(),
                        value_type: ValueType::Dynamic,
                    },
                )],
                removed_keys: Vec::new(),
            },
        );
        let _ = peer
            .core
            .handle_message(joiner.endpoint().expect("endpoint"), answer)
            .expect("answer cached");

        let (reply, mut result_rx) = oneshot::channel();
        let query = FindQuery::new(Expression::has("wetter"))
            .with_validity_threshold(60_000);
        let commands = peer
            .core
            .handle_command(Command::Find(query, reply))
            .expect("find started");

        // the subtree probe toward the level-2 DSN is still outstanding
        assert!(result_rx.try_recv().is_err());
        let probe_id = commands
            .iter()
            .find_map(|command| match command {
                Command::SendMessage { wire_msg, .. } => match &wire_msg.msg {
                    NodeMsg::SearchExact { payload, .. } => Some(payload.event_id()),
                    _ => None,
                },
                _ => None,
            })
            .expect("subtree probe sent");

        let failure = WireMsg::reply_to(
            joiner,
            peer.core.node(),
            probe_id,
            NodeMsg::SearchExactFailure {
                destination: Position::new(2, 2, 2).expect("valid"),
                reason: SearchFailureReason::PositionEmpty,
            },
        );
        let _ = peer
            .core
            .handle_message(joiner.endpoint().expect("endpoint"), failure)
            .expect("probe settled");

        let result = result_rx
            .try_recv()
            .expect("find resolved")
            .expect("find succeeded");
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].0, joiner);
    }

    #[test]
    fn local_store_errors_reach_the_caller() {
        let mut peer = connected_root();
        let (reply, mut rx) = oneshot::channel();
        let _ = peer
            .core
            .handle_command(Command::Insert(
                vec![Entry::new("vendor", "acme", ValueType::Static)],
                reply,
            ))
            .expect("insert");
        assert_matches!(rx.try_recv(), Ok(Ok(())));

        let (reply, mut rx) = oneshot::channel();
        let _ = peer
            .core
            .handle_command(Command::Update(
                vec![Entry::new("vendor", "emca", ValueType::Static)],
                reply,
            ))
            .expect("update handled");
        assert_matches!(rx.try_recv(), Ok(Err(Error::StaticValueChanged(_))));
    }

    #[test]
    fn outgoing_emission_is_refused_while_idle() {
        let mut peer = peer_with(Config::joining(
            SocketAddr::from(([127, 0, 0, 1], 7002)),
            SocketAddr::from(([127, 0, 0, 1], 7000)),
        ));
        let target = NodeInfo::new(
            Position::root(2).expect("valid"),
            SocketAddr::from(([127, 0, 0, 1], 7000)),
            Uuid::random(),
        );
        let attempt = peer.core.prepare(
            target,
            NodeMsg::UpdateNeighbor { neighbor: target },
            None,
        );
        assert_matches!(attempt, Err(Error::FsmViolation { .. }));
        assert!(!peer.core.fsm.permits(&FsmEvent::Send(MsgTag::UpdateNeighbor)));
    }

    #[test]
    fn stopping_an_idle_peer_is_trivial() {
        let mut peer = peer_with(Config::joining(
            SocketAddr::from(([127, 0, 0, 1], 7003)),
            SocketAddr::from(([127, 0, 0, 1], 7000)),
        ));
        let (reply, mut rx) = oneshot::channel();
        let _ = peer
            .core
            .handle_command(Command::InitiateLeave(reply))
            .expect("leave handled");
        assert_matches!(rx.try_recv(), Ok(Ok(())));
        assert!(peer.core.is_shutdown());
    }
}

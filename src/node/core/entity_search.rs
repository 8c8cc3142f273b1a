// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! Distributed find-query evaluation and attribute maintenance.
//!
//! A query enters at the initiator's responsible DSN, is relayed to the
//! root of the tree and cascades from there: every DSN evaluates its own
//! cover inside the horizontal interval it was handed, inquires undecided
//! peers, splits the remaining interval between its in-level DSN neighbors
//! and delegates the subtree two levels below its cover. Answers aggregate
//! back hop by hop. Local inserts, updates and removals notify subscribers
//! immediately and keep the responsible DSN's cache current.

use super::Core;
use crate::error::{Error, Result};
use crate::esearch::{
    FindQuery, FindQueryScope, FindResult, MissingAttributes, Selection,
};
use crate::log_markers::LogMarker;
use crate::messages::{Direction, EventId, Header, NodeMsg, SearchFailureReason};
use crate::node::command::Command;
use crate::node::procedures::{
    AggregationParent, AggregationPhase, AggregationState, Procedure,
};
use crate::peer::NodeInfo;
use crate::position::Position;
use crate::store::{Entry, NodeRecords, Record, Value};
use crate::timeouts::TimeoutKind;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// With scope Some, stop aggregating once this many fulfilling peers are
/// known.
const SOME_SCOPE_THRESHOLD: usize = 2;

const FULL_INTERVAL: (f64, f64) = (f64::NEG_INFINITY, f64::INFINITY);

impl Core {
    ////////////////////////////////////////////////////////////////////////
    // Local attribute store operations
    ////////////////////////////////////////////////////////////////////////

    pub(super) fn local_insert(&mut self, entries: Vec<Entry>) -> Result<Vec<Command>> {
        let timestamp = self.stamp();
        let mut changed = Vec::new();
        for entry in entries {
            let record = Record {
                value: entry.value,
                timestamp,
                value_type: entry.value_type,
            };
            self.local_data.insert(&entry.key, record.clone())?;
            changed.push((entry.key, record));
        }
        self.after_local_change(changed, Vec::new())
    }

    pub(super) fn local_update(&mut self, entries: Vec<Entry>) -> Result<Vec<Command>> {
        let timestamp = self.stamp();
        let mut changed = Vec::new();
        for entry in entries {
            let record = Record {
                value: entry.value,
                timestamp,
                value_type: entry.value_type,
            };
            self.local_data.update(&entry.key, record.clone())?;
            changed.push((entry.key, record));
        }
        self.after_local_change(changed, Vec::new())
    }

    pub(super) fn local_remove(&mut self, keys: Vec<String>) -> Result<Vec<Command>> {
        let mut removed = Vec::new();
        for key in keys {
            if self.local_data.remove(&key).is_some() {
                removed.push(key);
            }
        }
        self.after_local_change(Vec::new(), removed)
    }

    /// After each mutation: push updates to subscribers and refresh the
    /// responsible DSN's cache.
    fn after_local_change(
        &mut self,
        changed: Vec<(String, Record)>,
        removed: Vec<String>,
    ) -> Result<Vec<Command>> {
        if !self.fsm.state().is_connected() {
            return Ok(vec![]);
        }
        let mut commands = Vec::new();

        for (key, record) in &changed {
            for subscriber in self.local_data.subscribers(key).to_vec() {
                let (_, send) = self.prepare(
                    subscriber,
                    NodeMsg::SubscriptionUpdate {
                        key: key.clone(),
                        value: Some(record.value.clone()),
                        timestamp: record.timestamp,
                    },
                    None,
                )?;
                commands.push(send);
            }
        }
        let removal_stamp = self.stamp();
        for key in &removed {
            for subscriber in self.local_data.subscribers(key).to_vec() {
                let (_, send) = self.prepare(
                    subscriber,
                    NodeMsg::SubscriptionUpdate {
                        key: key.clone(),
                        value: None,
                        timestamp: removal_stamp,
                    },
                    None,
                )?;
                commands.push(send);
            }
        }

        commands.extend(self.push_attributes_to_dsn(changed, removed)?);
        Ok(commands)
    }

    /// Unsolicited inquiry answer toward the DSN indexing our position.
    fn push_attributes_to_dsn(
        &mut self,
        attributes: Vec<(String, Record)>,
        removed_keys: Vec<String>,
    ) -> Result<Vec<Command>> {
        if attributes.is_empty() && removed_keys.is_empty() {
            return Ok(vec![]);
        }
        let own = self.node();
        let dsn_position = own.position().responsible_dsn();
        if dsn_position == own.position() {
            let mut handler = self.dsn.lock().expect("dsn handler lock");
            handler.update_attribute_values(&own, attributes);
            handler.update_removed_attributes(&own, &removed_keys);
            return Ok(vec![]);
        }
        trace!("{} toward {}", LogMarker::AttributePushed, dsn_position);
        let (_, commands) = self.send_via_search_exact(
            dsn_position,
            NodeMsg::AttributeInquiryAnswer {
                inquired: own,
                attributes,
                removed_keys,
            },
            None,
        )?;
        Ok(commands)
    }

    /// Pushes the entire local store, used after relocating to a slot with
    /// a different responsible DSN.
    pub(super) fn push_all_attributes_to_dsn(&mut self) -> Result<Vec<Command>> {
        let attributes: Vec<(String, Record)> = self
            .local_data
            .iter()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect();
        if attributes.is_empty() {
            return Ok(vec![]);
        }
        self.push_attributes_to_dsn(attributes, Vec::new())
    }

    ////////////////////////////////////////////////////////////////////////
    // Find queries
    ////////////////////////////////////////////////////////////////////////

    pub(super) fn initiate_find(
        &mut self,
        mut query: FindQuery,
        reply: oneshot::Sender<Result<FindResult>>,
    ) -> Result<Vec<Command>> {
        if !self.fsm.state().is_connected() {
            let _ = reply.send(Err(Error::InvalidState));
            return Ok(vec![]);
        }
        query.set_requesting_node(self.node());
        info!("{} {}", LogMarker::FindQueryStarted, query.expression());

        let own_position = self.node().position();
        let dsn_position = own_position.responsible_dsn();
        if dsn_position == own_position {
            let key = EventId::random();
            return self.start_aggregation(
                key,
                query,
                Direction::None,
                FULL_INTERVAL,
                AggregationParent::LocalRequester(reply),
            );
        }

        let (inner_id, mut commands) = self.send_via_search_exact(
            dsn_position,
            NodeMsg::FindQueryRequest {
                query,
                direction: Direction::None,
                interval: FULL_INTERVAL,
            },
            None,
        )?;
        self.procedures
            .insert(inner_id, Procedure::PendingFind { reply });
        commands.push(self.schedule(TimeoutKind::DsnAggregation, Some(inner_id)));
        Ok(commands)
    }

    pub(super) fn handle_find_query_request(
        &mut self,
        header: &Header,
        query: FindQuery,
        direction: Direction,
        interval: (f64, f64),
    ) -> Result<Vec<Command>> {
        self.start_aggregation(
            header.event_id,
            query,
            direction,
            interval,
            AggregationParent::Dsn(header.sender),
        )
    }

    fn start_aggregation(
        &mut self,
        key: EventId,
        query: FindQuery,
        direction: Direction,
        interval: (f64, f64),
        answer_to: AggregationParent,
    ) -> Result<Vec<Command>> {
        let own_position = self.node().position();
        if !self.dsn.lock().expect("dsn handler lock").is_active() {
            return self.answer_aggregation(key, answer_to, Vec::new());
        }

        let mut state = AggregationState {
            query,
            direction,
            interval,
            answer_to,
            phase: AggregationPhase::Inquiring,
            pending_inquiries: HashMap::new(),
            pending_forwards: HashMap::new(),
            results: HashMap::new(),
        };

        // a request entering at a non-root DSN is relayed to the root of
        // the tree, where the cascade over all cover areas starts
        if direction == Direction::None && !own_position.is_root() {
            state.phase = AggregationPhase::Forwarded;
            let root = Position::root(self.fanout)?;
            let (forward_id, mut commands) = self.send_via_search_exact(
                root,
                NodeMsg::FindQueryRequest {
                    query: state.query.clone(),
                    direction: Direction::None,
                    interval: FULL_INTERVAL,
                },
                None,
            )?;
            let _ = state.pending_forwards.insert(forward_id, root);
            commands.push(self.schedule(TimeoutKind::DsnAggregation, Some(key)));
            self.procedures
                .insert(key, Procedure::Aggregation(Box::new(state)));
            return Ok(commands);
        }

        let now = self.stamp();
        let undecided = {
            let mut handler = self.dsn.lock().expect("dsn handler lock");
            handler.notify_query_request(&state.query, now);
            handler.undecided_nodes_and_missing_keys(&state.query, interval, now)
        };

        let mut commands = Vec::new();
        if !undecided.is_empty() {
            debug!(
                "{} for {} undecided peers",
                LogMarker::InquiryAggregationStart,
                undecided.len()
            );
            for (peer, missing) in undecided {
                let (keys, inquire_all) = match missing {
                    MissingAttributes::All => (Vec::new(), true),
                    MissingAttributes::Keys(keys) => (keys, false),
                };
                let (inquiry_id, send) = self.prepare(
                    peer,
                    NodeMsg::AttributeInquiryRequest { keys, inquire_all },
                    None,
                )?;
                let _ = state.pending_inquiries.insert(inquiry_id, peer);
                commands.push(send);
            }
            commands.push(self.schedule(TimeoutKind::InquiryAggregation, Some(key)));
            self.procedures
                .insert(key, Procedure::Aggregation(Box::new(state)));
            return Ok(commands);
        }

        self.procedures
            .insert(key, Procedure::Aggregation(Box::new(state)));
        self.conclude_inquiry_phase(key)
    }

    /// Inquiries are in (or timed out): settle the cover verdicts, merge
    /// our own data, and spread the query over the rest of the tree.
    fn conclude_inquiry_phase(&mut self, key: EventId) -> Result<Vec<Command>> {
        let mut state = match self.procedures.remove(&key) {
            Some(Procedure::Aggregation(state)) => state,
            Some(other) => {
                self.procedures.insert(key, other);
                return Ok(vec![]);
            }
            None => return Ok(vec![]),
        };
        if state.phase != AggregationPhase::Inquiring {
            self.procedures.insert(key, Procedure::Aggregation(state));
            return Ok(vec![]);
        }
        state.phase = AggregationPhase::Forwarded;
        state.pending_inquiries.clear();

        let now = self.stamp();
        let interval = state.interval;

        // every inquiry that could arrive has arrived; undecided is final
        let cover_results: Vec<(NodeInfo, Vec<(String, Value)>)> = {
            let handler = self.dsn.lock().expect("dsn handler lock");
            handler
                .true_nodes(&state.query, interval, true, now)
                .into_iter()
                .map(|peer| {
                    let attributes = Self::select_attributes(
                        state.query.selection(),
                        handler.node_attributes(&peer),
                    );
                    (peer, attributes)
                })
                .collect()
        };
        state.merge_results(cover_results);

        // the DSN itself is part of nobody's cover; evaluate our own data
        let own = self.node();
        let own_h = own.horizontal(self.treemapper_root);
        if own_h >= interval.0
            && own_h <= interval.1
            && state.query.evaluate(&self.local_data, true, now).is_true()
        {
            let own_attributes = Self::select_attributes(
                state.query.selection(),
                self.local_data
                    .iter()
                    .map(|(key, record)| (key.clone(), record.clone()))
                    .collect(),
            );
            state.merge_results(vec![(own, own_attributes)]);
        }

        if state.query.scope() == FindQueryScope::Some
            && state.results.len() >= SOME_SCOPE_THRESHOLD
        {
            return self.finalize_aggregation(key, state);
        }

        let mut commands = Vec::new();
        commands.extend(self.spread_query(&mut state)?);

        if state.pending_forwards.is_empty() {
            let mut finalized = self.finalize_aggregation(key, state)?;
            commands.append(&mut finalized);
            return Ok(commands);
        }
        commands.push(self.schedule(TimeoutKind::DsnAggregation, Some(key)));
        self.procedures.insert(key, Procedure::Aggregation(state));
        Ok(commands)
    }

    /// Forwards the query to the in-level DSN neighbors responsible for the
    /// interval remainders and to the DSNs two levels below our cover.
    fn spread_query(&mut self, state: &mut AggregationState) -> Result<Vec<Command>> {
        let own_position = self.node().position();
        let direction = state.direction;
        let (cover_min, cover_max) = match self
            .dsn
            .lock()
            .expect("dsn handler lock")
            .cover_extent_h()
        {
            Some(extent) => extent,
            None => (
                own_position.horizontal(self.treemapper_root),
                own_position.horizontal(self.treemapper_root),
            ),
        };

        let mut commands = Vec::new();
        let forward = |core: &mut Core,
                           state: &mut AggregationState,
                           target: Position,
                           direction: Direction,
                           interval: (f64, f64)|
         -> Result<Vec<Command>> {
            let (forward_id, commands) = core.send_via_search_exact(
                target,
                NodeMsg::FindQueryRequest {
                    query: state.query.clone(),
                    direction,
                    interval,
                },
                None,
            )?;
            let _ = state.pending_forwards.insert(forward_id, target);
            trace!("{} to {}", LogMarker::FindQueryForwarded, target);
            Ok(commands)
        };

        // horizontal remainders at our own level, only in the direction we
        // were handed; a Right request never turns back left and vice versa
        let go_left = matches!(direction, Direction::None | Direction::Left)
            && state.interval.0 < cover_min;
        if go_left {
            if let Some(left) = own_position.dsn_neighbor(true) {
                commands.extend(forward(
                    self,
                    state,
                    left,
                    Direction::Left,
                    (state.interval.0, cover_min),
                )?);
            }
        }
        let go_right = matches!(direction, Direction::None | Direction::Right)
            && state.interval.1 > cover_max;
        if go_right {
            if let Some(right) = own_position.dsn_neighbor(false) {
                commands.extend(forward(
                    self,
                    state,
                    right,
                    Direction::Right,
                    (cover_max, state.interval.1),
                )?);
            }
        }

        // the subtree below our cover, delegated per slice
        for target in self.down_fan_targets(&own_position) {
            let slice = self.cover_extent_h_of(&target);
            commands.extend(forward(self, state, target, Direction::Right, slice)?);
        }
        Ok(commands)
    }

    /// DSN positions two levels below whose covers tile our cover extent's
    /// descendants.
    fn down_fan_targets(&self, position: &Position) -> Vec<Position> {
        let (lo, hi) = match position.cover_extent() {
            Some(extent) => extent,
            None => return Vec::new(),
        };
        let fanout = u32::from(position.fanout());
        let level = position.level() + 2;
        let from = lo.saturating_mul(fanout).saturating_mul(fanout);
        let to = hi
            .saturating_add(1)
            .saturating_mul(fanout)
            .saturating_mul(fanout)
            .saturating_sub(1);
        let mut targets = Vec::new();
        let mut number = fanout + 2 * fanout * (from / (2 * fanout));
        while number <= to {
            if number >= from {
                if let Ok(target) = Position::new(level, number, position.fanout()) {
                    targets.push(target);
                }
            }
            number += 2 * fanout;
        }
        targets
    }

    fn cover_extent_h_of(&self, position: &Position) -> (f64, f64) {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for covered in position.cover_area() {
            let h = covered.horizontal(self.treemapper_root);
            min = min.min(h);
            max = max.max(h);
        }
        if min.is_finite() {
            (min, max)
        } else {
            let h = position.horizontal(self.treemapper_root);
            (h, h)
        }
    }

    fn select_attributes(
        selection: &Selection,
        records: Vec<(String, Record)>,
    ) -> Vec<(String, Value)> {
        match selection {
            Selection::Unspecific => Vec::new(),
            Selection::AllAttributes => records
                .into_iter()
                .map(|(key, record)| (key, record.value))
                .collect(),
            Selection::Specific(keys) => records
                .into_iter()
                .filter(|(key, _)| keys.contains(key))
                .map(|(key, record)| (key, record.value))
                .collect(),
        }
    }

    fn finalize_aggregation(
        &mut self,
        key: EventId,
        state: Box<AggregationState>,
    ) -> Result<Vec<Command>> {
        let mut results: FindResult = state.results.into_iter().collect();
        results.sort_by_key(|(node, _)| node.position());
        info!(
            "{} with {} fulfilling peers",
            LogMarker::FindQueryConcluded,
            results.len()
        );
        let mut commands = self.answer_aggregation(key, state.answer_to, results)?;
        commands.extend(self.optimize_subscriptions()?);
        Ok(commands)
    }

    fn answer_aggregation(
        &mut self,
        key: EventId,
        answer_to: AggregationParent,
        results: FindResult,
    ) -> Result<Vec<Command>> {
        match answer_to {
            AggregationParent::LocalRequester(reply) => {
                let _ = reply.send(Ok(results));
                Ok(vec![])
            }
            AggregationParent::Dsn(parent) => {
                let (_, send) = self.prepare(
                    parent,
                    NodeMsg::FindQueryAnswer {
                        nodes_with_attributes: results,
                    },
                    Some(key),
                )?;
                Ok(vec![send])
            }
        }
    }

    pub(super) fn handle_find_query_answer(
        &mut self,
        header: &Header,
        nodes_with_attributes: Vec<(NodeInfo, Vec<(String, Value)>)>,
    ) -> Result<Vec<Command>> {
        let ref_id = match header.ref_event_id {
            Some(id) => id,
            None => return Ok(vec![]),
        };

        // the final answer of a remotely-run query
        if let Some(procedure) = self.procedures.remove(&ref_id) {
            match procedure {
                Procedure::PendingFind { reply } => {
                    let _ = reply.send(Ok(nodes_with_attributes));
                    return Ok(vec![]);
                }
                other => self.procedures.insert(ref_id, other),
            }
        }

        // a child DSN reporting into one of our aggregations
        let agg_key = match self.procedures.aggregation_waiting_on(&ref_id) {
            Some(key) => key,
            None => return Ok(vec![]),
        };
        let mut state = match self.procedures.remove(&agg_key) {
            Some(Procedure::Aggregation(state)) => state,
            _ => return Ok(vec![]),
        };
        let _ = state.pending_forwards.remove(&ref_id);
        state.merge_results(nodes_with_attributes);

        let some_satisfied = state.query.scope() == FindQueryScope::Some
            && state.results.len() >= SOME_SCOPE_THRESHOLD;
        if state.pending_forwards.is_empty() || some_satisfied {
            debug!("{}", LogMarker::DsnAggregationConcluded);
            return self.finalize_aggregation(agg_key, state);
        }
        self.procedures
            .insert(agg_key, Procedure::Aggregation(state));
        Ok(vec![])
    }

    /// A search toward an unoccupied position: the referenced pending work
    /// is settled as answered-empty.
    pub(super) fn note_search_failure(
        &mut self,
        destination: Position,
        reason: SearchFailureReason,
        inner_id: EventId,
    ) -> Result<Vec<Command>> {
        debug!(
            "search toward {} failed: {:?}",
            destination, reason
        );
        if let Some(procedure) = self.procedures.remove(&inner_id) {
            match procedure {
                Procedure::PendingFind { reply } => {
                    let _ = reply.send(Err(Error::SearchUnreachable(destination)));
                    return Ok(vec![]);
                }
                other => self.procedures.insert(inner_id, other),
            }
        }

        let agg_key = match self.procedures.aggregation_waiting_on(&inner_id) {
            Some(key) => key,
            None => return Ok(vec![]),
        };
        let mut state = match self.procedures.remove(&agg_key) {
            Some(Procedure::Aggregation(state)) => state,
            _ => return Ok(vec![]),
        };
        let _ = state.pending_forwards.remove(&inner_id);
        let _ = state.pending_inquiries.remove(&inner_id);
        match state.phase {
            AggregationPhase::Inquiring if state.pending_inquiries.is_empty() => {
                self.procedures
                    .insert(agg_key, Procedure::Aggregation(state));
                self.conclude_inquiry_phase(agg_key)
            }
            AggregationPhase::Forwarded if state.pending_forwards.is_empty() => {
                self.finalize_aggregation(agg_key, state)
            }
            _ => {
                self.procedures
                    .insert(agg_key, Procedure::Aggregation(state));
                Ok(vec![])
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Attribute inquiries and subscriptions
    ////////////////////////////////////////////////////////////////////////

    pub(super) fn handle_attribute_inquiry_request(
        &mut self,
        header: &Header,
        keys: Vec<String>,
        inquire_all: bool,
    ) -> Result<Vec<Command>> {
        let attributes: Vec<(String, Record)> = if inquire_all {
            self.local_data
                .iter()
                .map(|(key, record)| (key.clone(), record.clone()))
                .collect()
        } else {
            keys.iter()
                .filter_map(|key| {
                    self.local_data
                        .record(key)
                        .map(|record| (key.clone(), record.clone()))
                })
                .collect()
        };
        let removed_keys: Vec<String> = keys
            .into_iter()
            .filter(|key| !self.local_data.has_key(key))
            .collect();

        let (_, send) = self.prepare(
            header.sender,
            NodeMsg::AttributeInquiryAnswer {
                inquired: self.node(),
                attributes,
                removed_keys,
            },
            Some(header.event_id),
        )?;
        Ok(vec![send])
    }

    pub(super) fn handle_attribute_inquiry_answer(
        &mut self,
        header: &Header,
        inquired: NodeInfo,
        attributes: Vec<(String, Record)>,
        removed_keys: Vec<String>,
    ) -> Result<Vec<Command>> {
        {
            let mut handler = self.dsn.lock().expect("dsn handler lock");
            handler.update_attribute_values(&inquired, attributes);
            handler.update_removed_attributes(&inquired, &removed_keys);
        }

        let ref_id = match header.ref_event_id {
            Some(id) => id,
            None => return Ok(vec![]),
        };
        let agg_key = match self.procedures.aggregation_waiting_on(&ref_id) {
            Some(key) => key,
            None => return Ok(vec![]),
        };
        let inquiry_done = self
            .procedures
            .with_mut(&agg_key, |procedure| {
                if let Procedure::Aggregation(state) = procedure {
                    let _ = state.pending_inquiries.remove(&ref_id);
                    state.phase == AggregationPhase::Inquiring && state.pending_inquiries.is_empty()
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if inquiry_done {
            debug!("{}", LogMarker::InquiryAggregationConcluded);
            return self.conclude_inquiry_phase(agg_key);
        }
        Ok(vec![])
    }

    pub(super) fn handle_subscription_order(
        &mut self,
        header: &Header,
        keys: Vec<String>,
        subscribe: bool,
    ) -> Result<Vec<Command>> {
        let mut commands = Vec::new();
        let now = self.stamp();
        for key in keys {
            if subscribe {
                self.local_data.add_subscriber(&key, header.sender);
                // seed the new subscriber with the current value
                if let Some(record) = self.local_data.record(&key).cloned() {
                    let (_, send) = self.prepare(
                        header.sender,
                        NodeMsg::SubscriptionUpdate {
                            key: key.clone(),
                            value: Some(record.value),
                            timestamp: now.max(record.timestamp),
                        },
                        Some(header.event_id),
                    )?;
                    commands.push(send);
                }
            } else {
                self.local_data.remove_subscriber(&key, &header.sender);
            }
        }
        Ok(commands)
    }

    pub(super) fn handle_subscription_update(
        &mut self,
        header: &Header,
        key: String,
        value: Option<Value>,
        timestamp: u64,
    ) -> Result<Vec<Command>> {
        let mut handler = self.dsn.lock().expect("dsn handler lock");
        match value {
            Some(value) => handler.update_attribute_values(
                &header.sender,
                vec![(
                    key,
                    Record {
                        value,
                        timestamp,
                        value_type: crate::store::ValueType::Dynamic,
                    },
                )],
            ),
            None => handler.update_removed_attributes(&header.sender, &[key]),
        }
        Ok(vec![])
    }

    /// Converts hot inquiry traffic into standing subscriptions and drops
    /// ones that went quiet, per the rate policy of the DSN handler.
    fn optimize_subscriptions(&mut self) -> Result<Vec<Command>> {
        let (to_subscribe, to_unsubscribe) = {
            let handler = self.dsn.lock().expect("dsn handler lock");
            if !handler.is_active() {
                return Ok(vec![]);
            }
            (
                handler.nodes_and_keys_to_subscribe(),
                handler.nodes_and_keys_to_unsubscribe(),
            )
        };

        let mut commands = Vec::new();
        for (peer, keys) in &to_subscribe {
            let (_, send) = self.prepare(
                *peer,
                NodeMsg::SubscriptionOrder {
                    keys: keys.clone(),
                    subscribe: true,
                },
                None,
            )?;
            info!("{} {:?} at {}", LogMarker::SubscriptionPlaced, keys, peer);
            commands.push(send);
        }
        for (peer, keys) in &to_unsubscribe {
            let (_, send) = self.prepare(
                *peer,
                NodeMsg::SubscriptionOrder {
                    keys: keys.clone(),
                    subscribe: false,
                },
                None,
            )?;
            info!("{} {:?} at {}", LogMarker::SubscriptionDropped, keys, peer);
            commands.push(send);
        }
        {
            let mut handler = self.dsn.lock().expect("dsn handler lock");
            handler.set_placed_subscription_orders(&to_subscribe);
            handler.set_placed_unsubscription_orders(&to_unsubscribe);
        }
        Ok(commands)
    }

    ////////////////////////////////////////////////////////////////////////
    // Aggregation timeouts
    ////////////////////////////////////////////////////////////////////////

    pub(super) fn handle_inquiry_aggregation_timeout(
        &mut self,
        ref_event: Option<EventId>,
    ) -> Result<Vec<Command>> {
        match ref_event {
            Some(key) => self.conclude_inquiry_phase(key),
            None => Ok(vec![]),
        }
    }

    pub(super) fn handle_dsn_aggregation_timeout(
        &mut self,
        ref_event: Option<EventId>,
    ) -> Result<Vec<Command>> {
        let key = match ref_event {
            Some(key) => key,
            None => return Ok(vec![]),
        };
        match self.procedures.remove(&key) {
            Some(Procedure::Aggregation(state)) => {
                warn!(
                    "dsn aggregation timed out with {} answers outstanding",
                    state.pending_forwards.len()
                );
                self.finalize_aggregation(key, state)
            }
            Some(Procedure::PendingFind { reply }) => {
                // the network never answered; report what we know: nothing
                let _ = reply.send(Ok(Vec::new()));
                Ok(vec![])
            }
            Some(other) => {
                self.procedures.insert(key, other);
                Ok(vec![])
            }
            None => Ok(vec![]),
        }
    }
}

// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! Cover-area index maintained on dominating-set positions.
//!
//! A peer sitting on a DSN position keeps a [`DistributedData`] entry for
//! every occupied position of its cover area, fed by neighbor change
//! notifications, attribute inquiry answers and subscription updates. The
//! handler also watches how often keys are asked for and how often they
//! actually change, and derives from that which subscriptions to place or
//! drop.

use super::query::{FindQuery, MissingAttributes};
use crate::log_markers::LogMarker;
use crate::peer::NodeInfo;
use crate::position::Position;
use crate::routing_info::NeighborChange;
use crate::store::{DistributedData, Record};
use std::collections::{HashMap, VecDeque};

/// Ask-rate above which a key is worth a standing subscription (Hz).
const SUBSCRIBE_REQUEST_RATE: f64 = 0.5;
/// Ask-rate and change-rate below which a standing subscription is dropped
/// again (Hz). Kept well under the subscribe rate for hysteresis.
const UNSUBSCRIBE_RATE: f64 = 0.1;
/// Minimum spacing between two inquiries to the same cover peer (ms).
const INQUIRY_RATE_LIMIT_MS: u64 = 1000;

/// The DSN side of the entity-search subsystem.
pub struct DsnHandler {
    own: NodeInfo,
    active: bool,
    treemapper_root: u16,
    timestamp_storage_limit: usize,
    cover_data: HashMap<Position, DistributedData>,
    /// Timestamps of query requests per key, to estimate the ask rate.
    request_timestamps: HashMap<String, VecDeque<u64>>,
    /// Peers whose cover entry is empty and should be inquired.
    pending_inquiries: Vec<NodeInfo>,
    last_inquiry: HashMap<Position, u64>,
}

impl DsnHandler {
    pub fn new(own: NodeInfo, treemapper_root: u16, timestamp_storage_limit: usize) -> Self {
        let mut handler = Self {
            own,
            active: false,
            treemapper_root,
            timestamp_storage_limit,
            cover_data: HashMap::new(),
            request_timestamps: HashMap::new(),
            pending_inquiries: Vec::new(),
            last_inquiry: HashMap::new(),
        };
        handler.rebuild_cover();
        handler
    }

    /// Whether this peer currently sits on a DSN position.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn cover_data(&self) -> &HashMap<Position, DistributedData> {
        &self.cover_data
    }

    /// The horizontal extent `[min, max]` of the cover area.
    pub fn cover_extent_h(&self) -> Option<(f64, f64)> {
        let positions = self.own.position().cover_area();
        let values = positions
            .iter()
            .map(|p| p.horizontal(self.treemapper_root));
        let min = values.clone().fold(f64::INFINITY, f64::min);
        let max = values.fold(f64::NEG_INFINITY, f64::max);
        if min.is_finite() {
            Some((min, max))
        } else {
            None
        }
    }

    /// Routes every neighbor change into the cover index. Fired by the
    /// routing information synchronously on each mutation.
    pub fn on_neighbor_change(&mut self, change: &NeighborChange, now: u64) {
        if !change.own.same_occupant(&self.own) {
            // our own position changed: the old cover is void
            self.own = change.own;
            self.rebuild_cover();
            return;
        }
        if !self.active {
            return;
        }

        let own_position = self.own.position();
        if let Some(removed) = change.old {
            let in_cover = own_position.covers(&removed.position());
            let replaced_by_new = change
                .new
                .map(|n| n.position() == removed.position())
                .unwrap_or(false);
            if in_cover && !replaced_by_new {
                let _ = self.cover_data.remove(&removed.position());
            }
        }
        if let Some(added) = change.new {
            if own_position.covers(&added.position()) {
                self.observe_peer(added, now);
            }
        }
    }

    fn observe_peer(&mut self, peer: NodeInfo, now: u64) {
        let limit = self.timestamp_storage_limit;
        let entry = self
            .cover_data
            .entry(peer.position())
            .or_insert_with(|| DistributedData::new(peer, limit));
        if !entry.occupant().same_occupant(&peer) {
            // same slot, new occupant: cached attributes belong to whoever
            // sat there before
            *entry = DistributedData::new(peer, limit);
        }
        let needs_inquiry = entry.is_empty();
        if needs_inquiry {
            self.request_inquiry(peer, now);
        }
    }

    fn request_inquiry(&mut self, peer: NodeInfo, now: u64) {
        let last = self.last_inquiry.get(&peer.position()).copied();
        if let Some(last) = last {
            if now.saturating_sub(last) < INQUIRY_RATE_LIMIT_MS {
                return;
            }
        }
        let _ = self.last_inquiry.insert(peer.position(), now);
        if !self
            .pending_inquiries
            .iter()
            .any(|pending| pending.position() == peer.position())
        {
            self.pending_inquiries.push(peer);
        }
    }

    /// Peers that should receive an `AttributeInquiryRequest`, drained by
    /// the protocol layer after each batch of mutations.
    pub fn drain_pending_inquiries(&mut self) -> Vec<NodeInfo> {
        std::mem::take(&mut self.pending_inquiries)
    }

    /// Recomputes cover membership from scratch after a position change.
    /// Entries that stay in the cover keep their cached attributes.
    fn rebuild_cover(&mut self) {
        let was_active = self.active;
        self.active = self.own.position().is_dsn();
        if !self.active {
            if was_active {
                debug!("{}", LogMarker::DsnDeactivated);
            }
            self.cover_data.clear();
            self.pending_inquiries.clear();
            return;
        }

        let own_position = self.own.position();
        self.cover_data
            .retain(|position, _| own_position.covers(position));
        if !was_active {
            debug!("{} at {}", LogMarker::DsnActivated, own_position);
        }
        debug!(
            "{} cover of {} positions",
            LogMarker::DsnCoverRebuilt,
            own_position.cover_area().len()
        );
    }

    /// Cover peers whose data definitely fulfills the query, restricted to
    /// the horizontal interval this DSN is responsible for. With
    /// `all_information_present` every remaining Undecided counts as False.
    pub fn true_nodes(
        &self,
        query: &FindQuery,
        interval: (f64, f64),
        all_information_present: bool,
        now: u64,
    ) -> Vec<NodeInfo> {
        self.cover_in_interval(interval)
            .filter(|(_, data)| {
                query
                    .evaluate(*data, all_information_present, now)
                    .is_true()
            })
            .map(|(_, data)| data.occupant())
            .collect()
    }

    /// Cover peers the query cannot decide yet, with the keys whose values
    /// would settle them.
    pub fn undecided_nodes_and_missing_keys(
        &self,
        query: &FindQuery,
        interval: (f64, f64),
        now: u64,
    ) -> Vec<(NodeInfo, MissingAttributes)> {
        self.cover_in_interval(interval)
            .filter(|(_, data)| query.evaluate(*data, false, now).is_undecided())
            .map(|(_, data)| (data.occupant(), query.missing_attributes(&*data, now)))
            .filter(|(_, missing)| !missing.is_empty())
            .collect()
    }

    fn cover_in_interval(
        &self,
        interval: (f64, f64),
    ) -> impl Iterator<Item = (&Position, &DistributedData)> {
        let root = self.treemapper_root;
        self.cover_data.iter().filter(move |(position, _)| {
            let h = position.horizontal(root);
            h >= interval.0 && h <= interval.1
        })
    }

    /// Feeds an inquiry answer or subscription update into the cover cache.
    pub fn update_attribute_values(
        &mut self,
        peer: &NodeInfo,
        values: impl IntoIterator<Item = (String, Record)>,
    ) {
        let limit = self.timestamp_storage_limit;
        if !self.cover_data.contains_key(&peer.position()) {
            // answers may race a cover rebuild; ignore strangers
            if !self.active || !self.own.position().covers(&peer.position()) {
                return;
            }
            let _ = self
                .cover_data
                .insert(peer.position(), DistributedData::new(*peer, limit));
        }
        let entry = self
            .cover_data
            .get_mut(&peer.position())
            .expect("entry ensured above");
        if !entry.occupant().same_occupant(peer) {
            *entry = DistributedData::new(*peer, limit);
        }
        for (key, record) in values {
            if let Err(error) = entry.upsert(&key, record) {
                debug!("dropping stale attribute report for {}: {:?}", key, error);
            }
        }
    }

    /// Removes attributes a peer reported as deleted.
    pub fn update_removed_attributes(&mut self, peer: &NodeInfo, removed_keys: &[String]) {
        if let Some(entry) = self.cover_data.get_mut(&peer.position()) {
            for key in removed_keys {
                let _ = entry.remove(key);
            }
        }
    }

    /// All attributes currently cached for a peer.
    pub fn node_attributes(&self, peer: &NodeInfo) -> Vec<(String, Record)> {
        self.cover_data
            .get(&peer.position())
            .map(|entry| {
                entry
                    .iter()
                    .map(|(key, record)| (key.clone(), record.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Records that a query asked for its relevant keys, for the ask-rate
    /// estimate behind the subscription policy.
    pub fn notify_query_request(&mut self, query: &FindQuery, now: u64) {
        for key in query.relevant_attributes() {
            let ring = self.request_timestamps.entry(key).or_default();
            ring.push_back(now);
            while ring.len() > self.timestamp_storage_limit {
                let _ = ring.pop_front();
            }
        }
    }

    fn request_frequency(&self, key: &str) -> f64 {
        self.request_timestamps.get(key).map_or(0.0, frequency)
    }

    /// Keys asked for often enough to subscribe, per cover peer.
    pub fn nodes_and_keys_to_subscribe(&self) -> Vec<(NodeInfo, Vec<String>)> {
        self.cover_data
            .values()
            .filter_map(|entry| {
                let keys: Vec<String> = self
                    .request_timestamps
                    .keys()
                    .filter(|key| !entry.is_key_subscribed(key))
                    .filter(|key| self.request_frequency(key) > SUBSCRIBE_REQUEST_RATE)
                    .cloned()
                    .collect();
                if keys.is_empty() {
                    None
                } else {
                    Some((entry.occupant(), keys))
                }
            })
            .collect()
    }

    /// Subscribed keys that went quiet on both the ask and the update side.
    pub fn nodes_and_keys_to_unsubscribe(&self) -> Vec<(NodeInfo, Vec<String>)> {
        self.cover_data
            .values()
            .filter_map(|entry| {
                let keys: Vec<String> = entry
                    .subscription_order_keys()
                    .iter()
                    .filter(|key| self.request_frequency(key) < UNSUBSCRIBE_RATE)
                    .filter(|key| entry.update_frequency(key) < UNSUBSCRIBE_RATE)
                    .cloned()
                    .collect();
                if keys.is_empty() {
                    None
                } else {
                    Some((entry.occupant(), keys))
                }
            })
            .collect()
    }

    /// Marks subscription orders as placed so they are not re-sent.
    pub fn set_placed_subscription_orders(&mut self, orders: &[(NodeInfo, Vec<String>)]) {
        for (peer, keys) in orders {
            if let Some(entry) = self.cover_data.get_mut(&peer.position()) {
                for key in keys {
                    entry.add_subscription_order_key(key);
                }
            }
        }
    }

    /// Marks subscriptions as dropped.
    pub fn set_placed_unsubscription_orders(&mut self, orders: &[(NodeInfo, Vec<String>)]) {
        for (peer, keys) in orders {
            if let Some(entry) = self.cover_data.get_mut(&peer.position()) {
                for key in keys {
                    entry.remove_subscription_order_key(key);
                }
            }
        }
    }
}

/// Events per second over a window of millisecond timestamps.
fn frequency(timestamps: &VecDeque<u64>) -> f64 {
    if timestamps.len() < 2 {
        return 0.0;
    }
    let oldest = *timestamps.front().expect("len checked");
    let newest = *timestamps.back().expect("len checked");
    if newest == oldest {
        return 0.0;
    }
    (timestamps.len() - 1) as f64 * 1000.0 / (newest - oldest) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::esearch::expression::Expression;
    use crate::peer::test_utils::node;
    use crate::routing_info::Relationship;
    use crate::store::{Value, ValueType};

    const ROOT_H: u16 = 100;
    const FULL: (f64, f64) = (f64::NEG_INFINITY, f64::INFINITY);

    fn handler_at(level: u32, number: u32, fanout: u16) -> DsnHandler {
        DsnHandler::new(node(level, number, fanout), ROOT_H, 5)
    }

    fn install(handler: &mut DsnHandler, peer: NodeInfo, now: u64) {
        handler.on_neighbor_change(
            &NeighborChange {
                own: handler.own,
                relationship: Relationship::RoutingTable,
                old: None,
                new: Some(peer),
            },
            now,
        );
    }

    fn record(value: impl Into<Value>, timestamp: u64) -> Record {
        Record {
            value: value.into(),
            timestamp,
            value_type: ValueType::Dynamic,
        }
    }

    #[test]
    fn only_dsn_positions_are_active() {
        assert!(handler_at(4, 2, 2).is_active());
        assert!(handler_at(0, 0, 2).is_active());
        assert!(!handler_at(4, 4, 2).is_active());
        assert!(!handler_at(3, 1, 2).is_active());
    }

    #[test]
    fn cover_entries_follow_neighbor_changes() {
        let mut handler = handler_at(4, 2, 2);
        let inside = node(4, 1, 2);
        let below = node(5, 6, 2);
        let outside = node(4, 4, 2);

        install(&mut handler, inside, 0);
        install(&mut handler, below, 0);
        install(&mut handler, outside, 0);

        assert!(handler.cover_data().contains_key(&inside.position()));
        assert!(handler.cover_data().contains_key(&below.position()));
        assert!(!handler.cover_data().contains_key(&outside.position()));

        // empty entries trigger inquiries, rate limited per peer
        let pending = handler.drain_pending_inquiries();
        assert_eq!(pending.len(), 2);
        install(&mut handler, inside, 100);
        assert!(handler.drain_pending_inquiries().is_empty());

        handler.on_neighbor_change(
            &NeighborChange {
                own: handler.own,
                relationship: Relationship::RoutingTable,
                old: Some(inside),
                new: None,
            },
            200,
        );
        assert!(!handler.cover_data().contains_key(&inside.position()));
    }

    #[test]
    fn occupant_change_resets_cached_attributes() {
        let mut handler = handler_at(4, 2, 2);
        let first = node(4, 1, 2);
        install(&mut handler, first, 0);
        handler.update_attribute_values(&first, vec![("pos_x".to_string(), record(5, 100))]);
        assert!(!handler.cover_data()[&first.position()].is_empty());

        let second = NodeInfo::new(
            first.position(),
            std::net::SocketAddr::from(([127, 0, 0, 1], 41_000)),
            crate::peer::Uuid::random(),
        );
        handler.on_neighbor_change(
            &NeighborChange {
                own: handler.own,
                relationship: Relationship::RoutingTable,
                old: Some(first),
                new: Some(second),
            },
            2000,
        );
        assert!(handler.cover_data()[&first.position()].is_empty());
    }

    #[test]
    fn own_position_change_rebuilds_the_cover() {
        let mut handler = handler_at(4, 2, 2);
        install(&mut handler, node(4, 1, 2), 0);
        assert_eq!(handler.cover_data().len(), 1);

        // moved to a non-DSN slot: cover is void
        let moved = handler.own.at_position(crate::position::Position::new(4, 4, 2).expect("valid"));
        handler.on_neighbor_change(
            &NeighborChange {
                own: moved,
                relationship: Relationship::Unknown,
                old: None,
                new: None,
            },
            0,
        );
        assert!(!handler.is_active());
        assert!(handler.cover_data().is_empty());
    }

    #[test]
    fn true_and_undecided_nodes_in_interval() {
        let mut handler = handler_at(4, 2, 2);
        let yes = node(4, 1, 2);
        let unknown = node(4, 3, 2);
        install(&mut handler, yes, 0);
        install(&mut handler, unknown, 0);
        handler.update_attribute_values(&yes, vec![("topicA".to_string(), record(true, 900))]);

        let query = FindQuery::new(Expression::has("topicA"));
        let trues = handler.true_nodes(&query, FULL, false, 1000);
        assert_eq!(trues, vec![yes]);

        let undecided = handler.undecided_nodes_and_missing_keys(&query, FULL, 1000);
        assert_eq!(undecided.len(), 1);
        assert_eq!(undecided[0].0, unknown);

        // restricting the interval to the left of 4:3 hides it
        let h_of_unknown = unknown.position().horizontal(ROOT_H);
        let left_only = (f64::NEG_INFINITY, h_of_unknown - 1.0);
        assert!(handler
            .undecided_nodes_and_missing_keys(&query, left_only, 1000)
            .is_empty());
    }

    #[test]
    fn subscription_policy_follows_request_rate() {
        let mut handler = handler_at(4, 2, 2);
        let peer = node(4, 1, 2);
        install(&mut handler, peer, 0);
        handler.update_attribute_values(&peer, vec![("pos_x".to_string(), record(1, 100))]);

        let query = FindQuery::new(Expression::has("pos_x"));
        // five requests in two seconds: 2 Hz, well above the threshold
        for t in [0u64, 500, 1000, 1500, 2000] {
            handler.notify_query_request(&query, t);
        }
        let to_subscribe = handler.nodes_and_keys_to_subscribe();
        assert_eq!(to_subscribe, vec![(peer, vec!["pos_x".to_string()])]);

        handler.set_placed_subscription_orders(&to_subscribe);
        assert!(handler.nodes_and_keys_to_subscribe().is_empty());
        // rate stays high: nothing to drop yet
        assert!(handler.nodes_and_keys_to_unsubscribe().is_empty());

        // requests go quiet: the ring now spans a long window
        for t in [100_000u64, 200_000, 300_000, 400_000, 500_000] {
            handler.notify_query_request(&query, t);
        }
        let to_unsubscribe = handler.nodes_and_keys_to_unsubscribe();
        assert_eq!(to_unsubscribe, vec![(peer, vec!["pos_x".to_string()])]);
        handler.set_placed_unsubscription_orders(&to_unsubscribe);
        assert!(handler.nodes_and_keys_to_unsubscribe().is_empty());
    }
}

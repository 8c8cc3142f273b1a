// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

use super::{NodeRecords, Record, RecordMap, ValueType};
use crate::error::{Error, Result};
use crate::peer::NodeInfo;
use std::collections::{HashMap, VecDeque};

/// A remote peer's attributes as cached by a DSN, plus the keys we hold a
/// standing subscription for and a bounded ring of recent update timestamps
/// per key used to estimate how often the value actually changes.
#[derive(Debug, Clone)]
pub struct DistributedData {
    occupant: NodeInfo,
    records: RecordMap,
    subscription_ordered_keys: Vec<String>,
    update_timestamps: HashMap<String, VecDeque<u64>>,
    timestamp_storage_limit: usize,
}

impl DistributedData {
    pub fn new(occupant: NodeInfo, timestamp_storage_limit: usize) -> Self {
        Self {
            occupant,
            records: RecordMap::default(),
            subscription_ordered_keys: Vec::new(),
            update_timestamps: HashMap::new(),
            timestamp_storage_limit,
        }
    }

    /// The peer this cache entry describes.
    pub fn occupant(&self) -> NodeInfo {
        self.occupant
    }

    /// Called when the slot changes occupant; the cached attributes belong
    /// to the old occupant and are discarded by the DSN handler.
    pub fn set_occupant(&mut self, occupant: NodeInfo) {
        self.occupant = occupant;
    }

    pub fn insert(&mut self, key: &str, record: Record) -> Result<()> {
        let timestamp = record.timestamp;
        self.records.insert(key, record)?;
        let mut ring = VecDeque::with_capacity(self.timestamp_storage_limit);
        ring.push_back(timestamp);
        let _ = self.update_timestamps.insert(key.to_string(), ring);
        Ok(())
    }

    pub fn update(&mut self, key: &str, record: Record) -> Result<()> {
        let timestamp = record.timestamp;
        if let Some(ring) = self.update_timestamps.get(key) {
            if ring.back().copied().unwrap_or(0) > timestamp {
                return Err(Error::NonMonotoneTimestamp(key.to_string()));
            }
        }
        self.records.update(key, record)?;
        let ring = self.update_timestamps.entry(key.to_string()).or_default();
        ring.push_back(timestamp);
        while ring.len() > self.timestamp_storage_limit {
            let _ = ring.pop_front();
        }
        Ok(())
    }

    /// Inserts or updates, whichever applies; inquiry answers and
    /// subscription updates do not distinguish the two.
    pub fn upsert(&mut self, key: &str, record: Record) -> Result<()> {
        if self.records.has_key(key) {
            self.update(key, record)
        } else {
            self.insert(key, record)
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Record> {
        let _ = self.update_timestamps.remove(key);
        self.records.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Record)> {
        self.records.iter()
    }

    pub fn add_subscription_order_key(&mut self, key: &str) {
        if !self.is_key_subscribed(key) {
            self.subscription_ordered_keys.push(key.to_string());
        }
    }

    pub fn remove_subscription_order_key(&mut self, key: &str) {
        self.subscription_ordered_keys.retain(|k| k != key);
    }

    pub fn subscription_order_keys(&self) -> &[String] {
        &self.subscription_ordered_keys
    }

    pub fn is_key_subscribed(&self, key: &str) -> bool {
        self.subscription_ordered_keys.iter().any(|k| k == key)
    }

    pub fn update_timestamps(&self, key: &str) -> Vec<u64> {
        self.update_timestamps
            .get(key)
            .map(|ring| ring.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Estimated update rate of `key` in Hz over the timestamp ring.
    pub fn update_frequency(&self, key: &str) -> f64 {
        match self.update_timestamps.get(key) {
            Some(ring) if ring.len() >= 2 => {
                let oldest = *ring.front().expect("len checked");
                let newest = *ring.back().expect("len checked");
                if newest == oldest {
                    return 0.0;
                }
                (ring.len() - 1) as f64 * 1000.0 / (newest - oldest) as f64
            }
            _ => 0.0,
        }
    }
}

impl NodeRecords for DistributedData {
    fn has_key(&self, key: &str) -> bool {
        self.records.has_key(key)
    }

    fn record(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    /// Fresh iff subscribed, static, or recently updated.
    fn is_up_to_date(&self, key: &str, validity_threshold: u64) -> bool {
        let record = match self.records.get(key) {
            Some(record) => record,
            None => return false,
        };
        if self.is_key_subscribed(key) {
            return true;
        }
        if record.value_type == ValueType::Static {
            return true;
        }
        record.timestamp >= validity_threshold
    }

    fn is_local(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::test_utils::node;
    use crate::store::Value;
    use assert_matches::assert_matches;

    fn record(value: impl Into<Value>, timestamp: u64, value_type: ValueType) -> Record {
        Record {
            value: value.into(),
            timestamp,
            value_type,
        }
    }

    fn data() -> DistributedData {
        DistributedData::new(node(4, 2, 2), 5)
    }

    #[test]
    fn timestamp_ring_is_bounded() {
        let mut data = data();
        data.insert("pos_x", record(0, 0, ValueType::Dynamic))
            .expect("insert");
        for t in 1..10u64 {
            data.update("pos_x", record(t as i32, t * 100, ValueType::Dynamic))
                .expect("update");
        }
        let ring = data.update_timestamps.get("pos_x").expect("ring");
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.front().copied(), Some(500));
        assert_eq!(ring.back().copied(), Some(900));
    }

    #[test]
    fn update_timestamps_must_be_monotone() {
        let mut data = data();
        data.insert("pos_x", record(0, 1000, ValueType::Dynamic))
            .expect("insert");
        assert_matches!(
            data.update("pos_x", record(1, 900, ValueType::Dynamic)),
            Err(Error::NonMonotoneTimestamp(_))
        );
        data.update("pos_x", record(1, 1000, ValueType::Dynamic))
            .expect("equal timestamp is fine");
    }

    #[test]
    fn freshness_honors_threshold_static_and_subscription() {
        let mut data = data();
        data.insert("pos_x", record(7, 1000, ValueType::Dynamic))
            .expect("insert");
        data.insert("vendor", record("acme", 10, ValueType::Static))
            .expect("insert");

        assert!(data.is_up_to_date("pos_x", 1000));
        assert!(!data.is_up_to_date("pos_x", 1001));
        // static values never age out
        assert!(data.is_up_to_date("vendor", u64::MAX));
        // a subscription keeps the key fresh regardless of age
        data.add_subscription_order_key("pos_x");
        assert!(data.is_up_to_date("pos_x", u64::MAX));
        // unknown keys are never fresh
        assert!(!data.is_up_to_date("pos_y", 0));
    }

    #[test]
    fn update_frequency_is_estimated_over_the_ring() {
        let mut data = data();
        data.insert("pos_x", record(0, 0, ValueType::Dynamic))
            .expect("insert");
        for t in [250u64, 500, 750, 1000] {
            data.update("pos_x", record(1, t, ValueType::Dynamic))
                .expect("update");
        }
        // 5 stamps spanning 1000ms: 4 intervals per second
        let frequency = data.update_frequency("pos_x");
        assert!((frequency - 4.0).abs() < f64::EPSILON);
        assert_eq!(data.update_frequency("pos_y"), 0.0);
    }
}

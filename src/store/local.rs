// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

use super::{NodeRecords, Record, RecordMap};
use crate::error::Result;
use crate::peer::NodeInfo;
use std::collections::HashMap;

/// The peer's own attributes plus the subscribers to notify per key.
#[derive(Debug, Clone, Default)]
pub struct LocalData {
    records: RecordMap,
    subscribers: HashMap<String, Vec<NodeInfo>>,
}

impl LocalData {
    pub fn insert(&mut self, key: &str, record: Record) -> Result<()> {
        self.records.insert(key, record)
    }

    pub fn update(&mut self, key: &str, record: Record) -> Result<()> {
        self.records.update(key, record)
    }

    pub fn remove(&mut self, key: &str) -> Option<Record> {
        self.records.remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Record)> {
        self.records.iter()
    }

    /// The peers currently subscribed to pushed updates of `key`.
    pub fn subscribers(&self, key: &str) -> &[NodeInfo] {
        self.subscribers.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn add_subscriber(&mut self, key: &str, subscriber: NodeInfo) {
        let entry = self.subscribers.entry(key.to_string()).or_default();
        if !entry.contains(&subscriber) {
            entry.push(subscriber);
        }
    }

    pub fn remove_subscriber(&mut self, key: &str, unsubscriber: &NodeInfo) {
        if let Some(entry) = self.subscribers.get_mut(key) {
            entry.retain(|peer| peer != unsubscriber);
            if entry.is_empty() {
                let _ = self.subscribers.remove(key);
            }
        }
    }
}

impl NodeRecords for LocalData {
    fn has_key(&self, key: &str) -> bool {
        self.records.has_key(key)
    }

    fn record(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    // our own data is current by definition
    fn is_up_to_date(&self, key: &str, _validity_threshold: u64) -> bool {
        self.has_key(key)
    }

    fn is_local(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::test_utils::node;
    use crate::store::{Value, ValueType};

    fn record(value: impl Into<Value>, timestamp: u64) -> Record {
        Record {
            value: value.into(),
            timestamp,
            value_type: ValueType::Dynamic,
        }
    }

    #[test]
    fn subscribers_are_tracked_per_key_without_duplicates() {
        let mut data = LocalData::default();
        data.insert("pos_x", record(5, 1)).expect("insert");

        let peer = node(2, 1, 2);
        data.add_subscriber("pos_x", peer);
        data.add_subscriber("pos_x", peer);
        assert_eq!(data.subscribers("pos_x"), &[peer]);
        assert_eq!(data.subscribers("pos_y"), &[] as &[NodeInfo]);

        data.remove_subscriber("pos_x", &peer);
        assert_eq!(data.subscribers("pos_x"), &[] as &[NodeInfo]);
    }

    #[test]
    fn local_data_is_always_up_to_date() {
        let mut data = LocalData::default();
        data.insert("pos_x", record(5, 1)).expect("insert");
        assert!(data.is_up_to_date("pos_x", u64::MAX));
        assert!(!data.is_up_to_date("pos_y", 0));
        assert!(data.is_local());
    }
}

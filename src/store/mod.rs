// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! Typed, time-stamped key/value attributes.
//!
//! Each peer keeps its own attributes in [`LocalData`]; a DSN additionally
//! caches the attributes of every peer in its cover area in
//! [`DistributedData`]. Both share the same record semantics: the value type
//! of a key is fixed at insert, static values never change, and update
//! timestamps are monotone per key.

mod distributed;
mod local;

pub use distributed::DistributedData;
pub use local::LocalData;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

/// An attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i32),
    Float(f32),
    Bool(bool),
    Text(String),
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Whether a value may ever change after insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Dynamic,
    Static,
}

/// What the facade hands in on insert/update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: Value,
    pub value_type: ValueType,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<Value>, value_type: ValueType) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            value_type,
        }
    }
}

/// A stored attribute: value, update timestamp (ms) and value type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub value: Value,
    pub timestamp: u64,
    pub value_type: ValueType,
}

/// The shared record map underneath both store flavors.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordMap {
    records: HashMap<String, Record>,
}

impl RecordMap {
    /// Inserts a fresh key. A present key fails with `AttributePresent`
    /// whatever its value, so a repeated insert is a detectable no-op.
    pub(crate) fn insert(&mut self, key: &str, record: Record) -> Result<()> {
        if self.records.contains_key(key) {
            return Err(Error::AttributePresent(key.to_string()));
        }
        let _ = self.records.insert(key.to_string(), record);
        Ok(())
    }

    /// Updates a present key. The value type is fixed at insert; a static
    /// value may only be "updated" to the value it already has.
    pub(crate) fn update(&mut self, key: &str, record: Record) -> Result<()> {
        let current = self
            .records
            .get_mut(key)
            .ok_or_else(|| Error::AttributeMissing(key.to_string()))?;
        if current.value_type != record.value_type {
            return Err(Error::ValueTypeChanged(key.to_string()));
        }
        if current.value_type == ValueType::Static {
            if current.value == record.value {
                return Ok(());
            }
            return Err(Error::StaticValueChanged(key.to_string()));
        }
        *current = record;
        Ok(())
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Record> {
        self.records.remove(key)
    }

    pub(crate) fn has_key(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &Record)> {
        self.records.iter()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Read access shared by local and cached remote attribute sets; the
/// Boolean-expression evaluator works against this seam only.
pub trait NodeRecords {
    fn has_key(&self, key: &str) -> bool;

    fn record(&self, key: &str) -> Option<&Record>;

    fn value_of(&self, key: &str) -> Option<&Value> {
        self.record(key).map(|record| &record.value)
    }

    /// Whether the stored value counts as fresh relative to the validity
    /// threshold timestamp.
    fn is_up_to_date(&self, key: &str, validity_threshold: u64) -> bool;

    /// Local data is always complete and current; remote data may be
    /// unknown or outdated.
    fn is_local(&self) -> bool;
}

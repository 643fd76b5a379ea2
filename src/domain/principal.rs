//! Principals: the product containers of runs, subruns and events.
//!
//! Run and subrun principals can be merged when the same occurrence is
//! delivered in several fragments (for example split over input files).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::ids::{EventId, RunId, SubRunId};
use super::products::{InputTag, ProductKey};
use crate::error::FrameworkError;

/// Names of the processes that produced the data, oldest first
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessHistory {
    processes: Vec<String>,
}

impl ProcessHistory {
    pub fn new(processes: Vec<String>) -> Self {
        Self { processes }
    }

    pub fn processes(&self) -> &[String] {
        &self.processes
    }

    pub fn contains(&self, process: &str) -> bool {
        self.processes.iter().any(|p| p == process)
    }

    /// Hex SHA-256 over the process names
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        for process in &self.processes {
            hasher.update(process.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    fn rank(&self, process: &str) -> usize {
        // processes missing from the history are the current one
        self.processes
            .iter()
            .position(|p| p == process)
            .unwrap_or(self.processes.len())
    }
}

/// Products of one occurrence plus its identity and timing
#[derive(Debug, Clone)]
pub struct Principal<I> {
    id: I,
    history: ProcessHistory,
    products: BTreeMap<ProductKey, Value>,
    begin_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
}

pub type RunPrincipal = Principal<RunId>;
pub type SubRunPrincipal = Principal<SubRunId>;
pub type EventPrincipal = Principal<EventId>;

impl<I> Principal<I>
where
    I: Copy + PartialEq + fmt::Display,
{
    pub fn new(id: I, history: ProcessHistory) -> Self {
        Self {
            id,
            history,
            products: BTreeMap::new(),
            begin_time: Utc::now(),
            end_time: None,
        }
    }

    pub fn with_times(mut self, begin: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        self.begin_time = begin;
        self.end_time = end;
        self
    }

    pub fn id(&self) -> I {
        self.id
    }

    pub fn history(&self) -> &ProcessHistory {
        &self.history
    }

    pub fn begin_time(&self) -> DateTime<Utc> {
        self.begin_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn set_end_time(&mut self, time: DateTime<Utc>) {
        self.end_time = Some(time);
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    pub fn products(&self) -> impl Iterator<Item = (&ProductKey, &Value)> {
        self.products.iter()
    }

    pub fn contains(&self, key: &ProductKey) -> bool {
        self.products.contains_key(key)
    }

    pub fn get(&self, key: &ProductKey) -> Option<&Value> {
        self.products.get(key)
    }

    /// Store a product; each signature may only be stored once
    pub fn put(&mut self, key: ProductKey, value: Value) -> Result<(), FrameworkError> {
        if self.products.contains_key(&key) {
            return Err(FrameworkError::logic(format!(
                "Product {} was already put into {}",
                key, self.id
            )));
        }
        self.products.insert(key, value);
        Ok(())
    }

    /// Find a product by class and tag.
    ///
    /// An empty process name in the tag selects the most recent process.
    pub fn find(&self, class: &str, tag: &InputTag) -> Option<(&ProductKey, &Value)> {
        self.products
            .iter()
            .filter(|(key, _)| key.matches(class, tag))
            .max_by_key(|(key, _)| self.history.rank(&key.process))
    }

    /// All products of the given class
    pub fn find_many(&self, class: &str) -> Vec<(&ProductKey, &Value)> {
        self.products
            .iter()
            .filter(|(key, _)| key.friendly_class_name == class)
            .collect()
    }

    /// Absorb another fragment of the same occurrence.
    ///
    /// Identity and process history must agree. Products present in both
    /// are aggregated; begin time becomes the earliest and end time the
    /// latest of the two.
    pub fn merge(&mut self, other: Self) -> Result<(), FrameworkError> {
        if self.id != other.id {
            return Err(FrameworkError::Merge(format!(
                "Cannot merge {} into {}",
                other.id, self.id
            )));
        }
        if self.history.id() != other.history.id() {
            return Err(FrameworkError::Merge(format!(
                "Cannot merge fragments of {} with different process histories ({:?} vs {:?})",
                self.id,
                self.history.processes(),
                other.history.processes()
            )));
        }

        for (key, value) in other.products {
            match self.products.get_mut(&key) {
                Some(existing) => aggregate(existing, value).map_err(|reason| {
                    FrameworkError::Merge(format!(
                        "Product {} in {} cannot be merged: {}",
                        key, self.id, reason
                    ))
                })?,
                None => {
                    self.products.insert(key, value);
                }
            }
        }

        self.begin_time = self.begin_time.min(other.begin_time);
        self.end_time = match (self.end_time, other.end_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        Ok(())
    }
}

/// Combine two product values of the same signature
fn aggregate(target: &mut Value, other: Value) -> Result<(), String> {
    match (target, other) {
        (Value::Number(a), Value::Number(b)) => {
            let sum = match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => x
                    .checked_add(y)
                    .map(Value::from)
                    .ok_or_else(|| "integer overflow".to_string())?,
                _ => {
                    let x = a.as_f64().ok_or("non-finite number")?;
                    let y = b.as_f64().ok_or("non-finite number")?;
                    serde_json::Number::from_f64(x + y)
                        .map(Value::Number)
                        .ok_or_else(|| "non-finite sum".to_string())?
                }
            };
            *a = match sum {
                Value::Number(n) => n,
                _ => return Err("non-numeric sum".to_string()),
            };
            Ok(())
        }
        (Value::Array(a), Value::Array(b)) => {
            a.extend(b);
            Ok(())
        }
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in b {
                match a.get_mut(&k) {
                    Some(existing) => aggregate(existing, v)?,
                    None => {
                        a.insert(k, v);
                    }
                }
            }
            Ok(())
        }
        (a, b) if *a == b => Ok(()),
        (a, b) => Err(format!("{} and {} have no aggregation rule", a, b)),
    }
}

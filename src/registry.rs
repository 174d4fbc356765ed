//! Datapoint registry seam
//!
//! All live inputs and outputs go through a keyed value store owned by the
//! host platform. The engine only ever sees it through [`DatapointRegistry`];
//! [`MemoryRegistry`] is the in-process implementation used by the binary and
//! the tests.

use crate::error::{GridshareError, Result};
use crate::logging::get_logger;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

/// Raw registry value, coerced at the input edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatapointValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl DatapointValue {
    /// Numeric view; booleans map to 0/1, text is parsed
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DatapointValue::Number(n) if n.is_finite() => Some(*n),
            DatapointValue::Number(_) => None,
            DatapointValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            DatapointValue::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DatapointValue::Bool(b) => Some(*b),
            DatapointValue::Number(n) if n.is_finite() => Some(*n != 0.0),
            DatapointValue::Number(_) => None,
            DatapointValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "on" | "yes" | "1" => Some(true),
                "false" | "off" | "no" | "0" => Some(false),
                _ => None,
            },
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            DatapointValue::Bool(b) => b.to_string(),
            DatapointValue::Number(n) => n.to_string(),
            DatapointValue::Text(s) => s.clone(),
        }
    }
}

impl From<f64> for DatapointValue {
    fn from(v: f64) -> Self {
        DatapointValue::Number(v)
    }
}

impl From<bool> for DatapointValue {
    fn from(v: bool) -> Self {
        DatapointValue::Bool(v)
    }
}

impl From<&str> for DatapointValue {
    fn from(v: &str) -> Self {
        DatapointValue::Text(v.to_string())
    }
}

impl From<String> for DatapointValue {
    fn from(v: String) -> Self {
        DatapointValue::Text(v)
    }
}

/// A value with the time it was last updated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub value: DatapointValue,
    pub timestamp: DateTime<Utc>,
}

impl Datapoint {
    pub fn new(value: impl Into<DatapointValue>, timestamp: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            timestamp,
        }
    }

    /// Age relative to `now`; future timestamps count as fresh
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).max(Duration::zero())
    }
}

/// Keyed value store shared with the host platform
#[async_trait::async_trait]
pub trait DatapointRegistry: Send + Sync {
    /// Non-blocking cache lookup
    fn cached(&self, id: &str) -> Option<Datapoint>;

    /// Slow path for cache misses
    async fn fetch(&self, id: &str) -> Result<Option<Datapoint>>;

    async fn write(&self, id: &str, value: DatapointValue) -> Result<()>;
}

/// In-memory registry.
///
/// Values set with [`MemoryRegistry::set_uncached`] are only visible through
/// [`DatapointRegistry::fetch`], which lets tests exercise the slow path.
#[derive(Debug)]
pub struct MemoryRegistry {
    values: RwLock<HashMap<String, Datapoint>>,
    backing: RwLock<HashMap<String, Datapoint>>,
    writes: Mutex<Vec<(String, DatapointValue)>>,
    failing: RwLock<Vec<String>>,
    logger: crate::logging::StructuredLogger,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            backing: RwLock::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            failing: RwLock::new(Vec::new()),
            logger: get_logger("registry"),
        }
    }

    /// Build a registry from a flat JSON object of `id -> value`.
    /// Every value is stamped with `now`.
    pub fn from_json(seed: &serde_json::Value, now: DateTime<Utc>) -> Result<Self> {
        let obj = seed
            .as_object()
            .ok_or_else(|| GridshareError::registry("Seed must be a JSON object"))?;
        let registry = Self::new();
        for (id, raw) in obj {
            let value: DatapointValue = serde_json::from_value(raw.clone())?;
            registry.set(id, value, now);
        }
        registry
            .logger
            .info(&format!("Seeded {} datapoint(s)", obj.len()));
        Ok(registry)
    }

    /// Load a JSON seed file
    pub fn from_json_file<P: AsRef<Path>>(path: P, now: DateTime<Utc>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GridshareError::io(format!(
                "Failed to read seed file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let seed: serde_json::Value = serde_json::from_str(&content)?;
        Self::from_json(&seed, now)
    }

    pub fn set(&self, id: &str, value: impl Into<DatapointValue>, timestamp: DateTime<Utc>) {
        if let Ok(mut values) = self.values.write() {
            values.insert(id.to_string(), Datapoint::new(value, timestamp));
        }
    }

    /// Store a value reachable only through `fetch`
    pub fn set_uncached(&self, id: &str, value: impl Into<DatapointValue>, timestamp: DateTime<Utc>) {
        if let Ok(mut backing) = self.backing.write() {
            backing.insert(id.to_string(), Datapoint::new(value, timestamp));
        }
    }

    pub fn remove(&self, id: &str) {
        if let Ok(mut values) = self.values.write() {
            values.remove(id);
        }
        if let Ok(mut backing) = self.backing.write() {
            backing.remove(id);
        }
    }

    /// Make writes to ids starting with `prefix` fail
    pub fn fail_writes_to(&self, prefix: &str) {
        if let Ok(mut failing) = self.failing.write() {
            failing.push(prefix.to_string());
        }
    }

    /// All writes so far, oldest first
    pub fn writes(&self) -> Vec<(String, DatapointValue)> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Writes to one id, oldest first
    pub fn writes_to(&self, id: &str) -> Vec<DatapointValue> {
        self.writes()
            .into_iter()
            .filter(|(k, _)| k == id)
            .map(|(_, v)| v)
            .collect()
    }

    pub fn clear_writes(&self) {
        if let Ok(mut w) = self.writes.lock() {
            w.clear();
        }
    }

    /// Snapshot of all cached values
    pub fn snapshot(&self) -> HashMap<String, Datapoint> {
        self.values.read().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl DatapointRegistry for MemoryRegistry {
    fn cached(&self, id: &str) -> Option<Datapoint> {
        self.values.read().ok()?.get(id).cloned()
    }

    async fn fetch(&self, id: &str) -> Result<Option<Datapoint>> {
        let backing = self
            .backing
            .read()
            .map_err(|_| GridshareError::registry("Backing store lock poisoned"))?;
        if let Some(dp) = backing.get(id) {
            return Ok(Some(dp.clone()));
        }
        drop(backing);
        Ok(self.cached(id))
    }

    async fn write(&self, id: &str, value: DatapointValue) -> Result<()> {
        let rejected = self
            .failing
            .read()
            .map(|f| f.iter().any(|p| id.starts_with(p.as_str())))
            .unwrap_or(false);
        if rejected {
            return Err(GridshareError::registry(format!("Write to {} rejected", id)));
        }

        self.logger.trace(&format!("write {} = {}", id, value.as_text()));
        self.writes
            .lock()
            .map_err(|_| GridshareError::registry("Write log lock poisoned"))?
            .push((id.to_string(), value.clone()));
        self.set(id, value, Utc::now());
        Ok(())
    }
}

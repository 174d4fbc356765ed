//! Setpoint application
//!
//! The engine hands one [`Setpoint`] per connector to a [`SetpointApplier`].
//! The registry-backed applier pushes writes into a [`WriteQueue`] which
//! deduplicates by target, throttles and deadbands them, and flushes with
//! bounded concurrency. A queued write counts as success.

use crate::config::{ConnectorConfig, WriteQueueConfig};
use crate::error::{GridshareError, Result};
use crate::logging::get_logger;
use crate::model::ControlBasis;
use crate::registry::{DatapointRegistry, DatapointValue};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};

/// Where and how a connector is commanded
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerDescriptor {
    pub key: String,
    pub control_basis: ControlBasis,
    pub setpoint_current_dp: Option<String>,
    pub setpoint_power_dp: Option<String>,
    pub enable_dp: Option<String>,
}

impl ConsumerDescriptor {
    pub fn from_config(cfg: &ConnectorConfig) -> Self {
        Self {
            key: cfg.key.clone(),
            control_basis: cfg.control_basis,
            setpoint_current_dp: cfg.datapoints.setpoint_current.clone(),
            setpoint_power_dp: cfg.datapoints.setpoint_power.clone(),
            enable_dp: cfg.datapoints.enable_write.clone(),
        }
    }

    /// Setpoint target id for the control basis
    pub fn target(&self) -> Option<&str> {
        match self.control_basis {
            ControlBasis::Current => self.setpoint_current_dp.as_deref(),
            ControlBasis::Power => self.setpoint_power_dp.as_deref(),
            ControlBasis::None => None,
        }
    }
}

/// One connector command
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Setpoint {
    pub target_power_w: f64,
    pub target_current_a: f64,
    pub control_basis: ControlBasis,
    /// Explicit enable/disable write, if any
    pub enable: Option<bool>,
}

/// Outcome of handing a setpoint to the applier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    Queued,
    Unchanged,
    Throttled,
    NoTarget,
    Failed,
}

impl ApplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyStatus::Queued => "queued",
            ApplyStatus::Unchanged => "unchanged",
            ApplyStatus::Throttled => "throttled",
            ApplyStatus::NoTarget => "no_target",
            ApplyStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyResult {
    pub applied: bool,
    pub status: ApplyStatus,
    pub writes: usize,
    /// Error from the last flush to this target, if any
    pub error: Option<String>,
}

impl ApplyResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            applied: false,
            status: ApplyStatus::Failed,
            writes: 0,
            error: Some(message.into()),
        }
    }
}

/// Applies setpoints to physical connectors
#[async_trait::async_trait]
pub trait SetpointApplier: Send + Sync {
    async fn apply_setpoint(
        &self,
        consumer: &ConsumerDescriptor,
        setpoint: &Setpoint,
    ) -> Result<ApplyResult>;

    /// Push out anything buffered. Returns the targets whose write failed.
    async fn flush(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Write queue admission result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDecision {
    Queued,
    /// Within deadband of the last write and not yet due for refresh
    Unchanged,
    /// Changed, but the minimum interval has not elapsed
    Throttled,
}

#[derive(Debug, Clone)]
struct SentState {
    value: DatapointValue,
    at: Instant,
}

fn is_off(value: &DatapointValue) -> bool {
    match value {
        DatapointValue::Bool(b) => !b,
        other => other.as_f64().is_some_and(|v| v <= 0.0),
    }
}

fn within_deadband(a: &DatapointValue, b: &DatapointValue, deadband: f64) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if matches!(a, DatapointValue::Number(_)) => {
            // Crossing zero is never absorbed by the deadband
            (x <= 0.0) == (y <= 0.0) && (x - y).abs() <= deadband
        }
        _ => a == b,
    }
}

/// Deduplicating, throttled registry writer
pub struct WriteQueue {
    registry: Arc<dyn DatapointRegistry>,
    config: WriteQueueConfig,
    semaphore: Arc<Semaphore>,
    sent: Mutex<HashMap<String, SentState>>,
    pending: Mutex<Vec<(String, DatapointValue)>>,
    errors: Mutex<HashMap<String, String>>,
    logger: crate::logging::StructuredLogger,
}

impl WriteQueue {
    pub fn new(registry: Arc<dyn DatapointRegistry>, config: WriteQueueConfig) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            registry,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            sent: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            errors: Mutex::new(HashMap::new()),
            logger: get_logger("write_queue"),
        }
    }

    pub fn config(&self) -> &WriteQueueConfig {
        &self.config
    }

    /// Admit a write. The latest value per target replaces any pending one.
    pub fn enqueue(&self, id: &str, value: DatapointValue, deadband: f64) -> Result<QueueDecision> {
        let now = Instant::now();
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| GridshareError::apply("Write queue state poisoned"))?;

        if let Some(prev) = sent.get(id) {
            let elapsed = now.duration_since(prev.at);
            let refresh = Duration::from_millis(self.config.refresh_interval_ms);
            let min_interval = Duration::from_millis(self.config.min_interval_ms);
            if within_deadband(&prev.value, &value, deadband) && elapsed < refresh {
                return Ok(QueueDecision::Unchanged);
            }
            // Flags are one-shot commands and never throttled
            let flag = matches!(value, DatapointValue::Bool(_));
            let zeroing = is_off(&value) && !is_off(&prev.value);
            if !(zeroing || flag) && elapsed < min_interval {
                return Ok(QueueDecision::Throttled);
            }
        }

        sent.insert(
            id.to_string(),
            SentState {
                value: value.clone(),
                at: now,
            },
        );
        drop(sent);

        let mut pending = self
            .pending
            .lock()
            .map_err(|_| GridshareError::apply("Write queue poisoned"))?;
        match pending.iter_mut().find(|(k, _)| k == id) {
            Some(slot) => slot.1 = value,
            None => pending.push((id.to_string(), value)),
        }
        Ok(QueueDecision::Queued)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Error recorded for a target by the last flush
    pub fn last_error(&self, id: &str) -> Option<String> {
        self.errors.lock().ok()?.get(id).cloned()
    }

    /// Write everything pending with bounded concurrency.
    /// Failed targets are forgotten so the next cycle retries them.
    pub async fn flush(&self) -> Vec<(String, String)> {
        let batch = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return Vec::new(),
        };
        if batch.is_empty() {
            return Vec::new();
        }

        let mut set = JoinSet::new();
        for (id, value) in batch {
            let registry = Arc::clone(&self.registry);
            let semaphore = Arc::clone(&self.semaphore);
            set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return (id, Err(GridshareError::apply("Write queue closed"))),
                };
                let result = registry.write(&id, value).await;
                (id, result)
            });
        }

        let mut failures = Vec::new();
        let mut written = 0usize;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, Ok(()))) => {
                    written += 1;
                    if let Ok(mut errors) = self.errors.lock() {
                        errors.remove(&id);
                    }
                }
                Ok((id, Err(e))) => {
                    self.logger.warn(&format!("Write to {} failed: {}", id, e));
                    if let Ok(mut sent) = self.sent.lock() {
                        sent.remove(&id);
                    }
                    if let Ok(mut errors) = self.errors.lock() {
                        errors.insert(id.clone(), e.to_string());
                    }
                    failures.push((id, e.to_string()));
                }
                Err(e) => {
                    self.logger.error(&format!("Write task failed: {}", e));
                }
            }
        }
        self.logger.trace(&format!(
            "Flushed {} write(s), {} failed",
            written,
            failures.len()
        ));
        failures
    }
}

/// Applier that writes setpoints into the datapoint registry
pub struct RegistryApplier {
    queue: WriteQueue,
}

impl RegistryApplier {
    pub fn new(registry: Arc<dyn DatapointRegistry>, config: WriteQueueConfig) -> Self {
        Self {
            queue: WriteQueue::new(registry, config),
        }
    }

    pub fn queue(&self) -> &WriteQueue {
        &self.queue
    }
}

#[async_trait::async_trait]
impl SetpointApplier for RegistryApplier {
    async fn apply_setpoint(
        &self,
        consumer: &ConsumerDescriptor,
        setpoint: &Setpoint,
    ) -> Result<ApplyResult> {
        let mut writes = 0usize;
        let mut throttled = false;

        if let (Some(enable), Some(dp)) = (setpoint.enable, consumer.enable_dp.as_deref()) {
            match self.queue.enqueue(dp, DatapointValue::Bool(enable), 0.0)? {
                QueueDecision::Queued => writes += 1,
                QueueDecision::Throttled => throttled = true,
                QueueDecision::Unchanged => {}
            }
        }

        let (target, value, deadband) = match (setpoint.control_basis, consumer.target()) {
            (ControlBasis::Current, Some(dp)) => {
                (dp, setpoint.target_current_a, self.queue.config().deadband_a)
            }
            (ControlBasis::Power, Some(dp)) => {
                (dp, setpoint.target_power_w, self.queue.config().deadband_w)
            }
            _ => {
                return Ok(ApplyResult {
                    applied: writes > 0,
                    status: ApplyStatus::NoTarget,
                    writes,
                    error: None,
                });
            }
        };

        match self.queue.enqueue(target, DatapointValue::Number(value), deadband)? {
            QueueDecision::Queued => writes += 1,
            QueueDecision::Throttled => throttled = true,
            QueueDecision::Unchanged => {}
        }

        let status = if writes > 0 {
            ApplyStatus::Queued
        } else if throttled {
            ApplyStatus::Throttled
        } else {
            ApplyStatus::Unchanged
        };
        Ok(ApplyResult {
            applied: status != ApplyStatus::Throttled,
            status,
            writes,
            error: self.queue.last_error(target),
        })
    }

    async fn flush(&self) -> Vec<(String, String)> {
        self.queue.flush().await
    }
}

//! Cycle controller
//!
//! Wires the engine to the outside world: reads inputs from the registry,
//! runs one engine step, hands setpoints to the applier, flushes, and
//! publishes the cycle report. [`ChargingController::run`] repeats this on a
//! fixed interval until shut down.

use crate::apply::{ApplyResult, ConsumerDescriptor, RegistryApplier, Setpoint, SetpointApplier};
use crate::config::Config;
use crate::diagnostics::{CycleReport, publish_to_registry};
use crate::engine::AllocationEngine;
use crate::error::Result;
use crate::inputs::InputReader;
use crate::logging::get_logger;
use crate::registry::DatapointRegistry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, interval};

/// Latest published report, `None` before the first cycle
pub type ReportReceiver = watch::Receiver<Option<Arc<CycleReport>>>;

pub struct ChargingController {
    config: Config,
    engine: AllocationEngine,
    registry: Arc<dyn DatapointRegistry>,
    applier: Arc<dyn SetpointApplier>,
    consumers: HashMap<String, ConsumerDescriptor>,
    report_tx: watch::Sender<Option<Arc<CycleReport>>>,
    shutdown_tx: mpsc::UnboundedSender<()>,
    shutdown_rx: mpsc::UnboundedReceiver<()>,
    logger: crate::logging::StructuredLogger,
    total_cycles: u64,
    overrun_count: u64,
}

impl ChargingController {
    /// Controller writing setpoints back into the same registry
    pub fn new(config: Config, registry: Arc<dyn DatapointRegistry>) -> Result<Self> {
        let applier = Arc::new(RegistryApplier::new(
            Arc::clone(&registry),
            config.write_queue.clone(),
        ));
        Self::with_applier(config, registry, applier)
    }

    pub fn with_applier(
        config: Config,
        registry: Arc<dyn DatapointRegistry>,
        applier: Arc<dyn SetpointApplier>,
    ) -> Result<Self> {
        let engine = AllocationEngine::new(&config)?;
        let consumers = config
            .connectors
            .iter()
            .map(|c| (c.key.clone(), ConsumerDescriptor::from_config(c)))
            .collect();
        let (report_tx, _) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let logger = get_logger("controller");
        logger.info(&format!(
            "Controller ready: {} connector(s), {} station(s), cycle {} ms",
            engine.specs().len(),
            engine.stations().len(),
            config.cycle_interval_ms
        ));

        Ok(Self {
            config,
            engine,
            registry,
            applier,
            consumers,
            report_tx,
            shutdown_tx,
            shutdown_rx,
            logger,
            total_cycles: 0,
            overrun_count: 0,
        })
    }

    pub fn engine(&self) -> &AllocationEngine {
        &self.engine
    }

    pub fn subscribe(&self) -> ReportReceiver {
        self.report_tx.subscribe()
    }

    /// Sender that stops [`ChargingController::run`]
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<()> {
        self.shutdown_tx.clone()
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn overrun_count(&self) -> u64 {
        self.overrun_count
    }

    /// Map a written registry id back to its connector
    fn connector_for_target(&self, id: &str) -> Option<&str> {
        self.consumers
            .values()
            .find(|c| c.target() == Some(id) || c.enable_dp.as_deref() == Some(id))
            .map(|c| c.key.as_str())
    }

    /// One full cycle at `now`
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<Arc<CycleReport>> {
        let reader = InputReader::new(
            self.registry.as_ref(),
            self.config.registry.fetch_timeout_ms,
            now,
        );
        let inputs = reader.read_cycle(&self.config).await;
        let outcome = self.engine.step(&inputs, now);
        let mut report = CycleReport::from_outcome(&outcome);

        for c in &outcome.connectors {
            let (Some(setpoint), Some(consumer)) = (c.setpoint, self.consumers.get(&c.key)) else {
                continue;
            };
            let result = match self.applier.apply_setpoint(consumer, &setpoint).await {
                Ok(r) => r,
                Err(e) => {
                    self.logger
                        .for_connector(&c.key)
                        .warn(&format!("Apply failed: {}", e));
                    ApplyResult::failed(e.to_string())
                }
            };
            report.record_apply(&c.key, &result);
        }

        for (id, error) in self.applier.flush().await {
            if let Some(key) = self.connector_for_target(&id).map(str::to_string) {
                report.record_write_failure(&key, &error);
            }
        }

        if self.config.diagnostics.publish_to_registry {
            let failed =
                publish_to_registry(self.registry.as_ref(), &report, &self.config.diagnostics.prefix)
                    .await;
            if failed > 0 {
                self.logger
                    .debug(&format!("{} diagnostic write(s) failed", failed));
            }
        }

        let report = Arc::new(report);
        self.report_tx.send_replace(Some(Arc::clone(&report)));
        self.total_cycles = self.total_cycles.saturating_add(1);
        Ok(report)
    }

    /// Command every connector to zero and flush
    pub async fn shutdown(&mut self) -> Result<()> {
        self.logger.info("Commanding all connectors to zero before exit");
        for spec in self.engine.specs() {
            let Some(consumer) = self.consumers.get(&spec.key) else {
                continue;
            };
            if !spec.capability.has_setpoint() {
                continue;
            }
            let zero = Setpoint {
                target_power_w: 0.0,
                target_current_a: 0.0,
                control_basis: spec.capability.control_basis,
                enable: None,
            };
            if let Err(e) = self.applier.apply_setpoint(consumer, &zero).await {
                self.logger
                    .for_connector(&spec.key)
                    .warn(&format!("Zeroing failed: {}", e));
            }
        }
        let failures = self.applier.flush().await;
        if !failures.is_empty() {
            self.logger
                .warn(&format!("{} write(s) failed during shutdown", failures.len()));
        }
        Ok(())
    }

    /// Cycle loop until a shutdown signal arrives
    pub async fn run(&mut self) -> Result<()> {
        self.logger.info("Starting allocation loop");
        let period = self.config.cycle_interval_ms;
        let mut cycle_interval = interval(Duration::from_millis(period));

        loop {
            tokio::select! {
                _ = cycle_interval.tick() => {
                    let started = std::time::Instant::now();
                    if let Err(e) = self.run_cycle(Utc::now()).await {
                        self.logger.error(&format!("Cycle failed: {}", e));
                    }
                    let dur_ms = started.elapsed().as_millis() as u64;
                    if dur_ms > period {
                        self.overrun_count = self.overrun_count.saturating_add(1);
                        self.logger.warn(&format!("Cycle overran: {} ms > {} ms", dur_ms, period));
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    self.logger.info("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await
    }
}

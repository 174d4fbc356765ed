//! # Gridshare - per-cycle EV charging power allocator
//!
//! Every control cycle Gridshare computes a safe setpoint for every charging
//! connector in a building, under a stack of independently-sourced power
//! ceilings: installation safety limits, tariff and contract limits, PV
//! surplus, peak-shaving coordination, regulatory curtailment, per-connector
//! user modes, deadline charging and shared station caps.
//!
//! ## Architecture
//!
//! - `reason`: closed vocabulary of allocation outcomes
//! - `model`: validated connector and station definitions
//! - `pv`: PV surplus smoothing and availability hysteresis
//! - `budget`: budget components, hard safety caps, storage assist
//! - `session`, `mode`, `tariff`, `goal`: per-connector cross-cycle state
//! - `scheduler`: deterministic allocation order with station rotation
//! - `allocator`: connector-by-connector allocation against shared pools
//! - `engine`: one control cycle over typed inputs
//! - `registry`, `inputs`, `apply`: the datapoint registry seam
//! - `diagnostics`: per-cycle report
//! - `controller`: the cycle loop
//! - `config`, `error`, `logging`: configuration, errors and tracing

pub mod allocator;
pub mod apply;
pub mod budget;
pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod goal;
pub mod inputs;
pub mod logging;
pub mod mode;
pub mod model;
pub mod pv;
pub mod reason;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod tariff;

// Re-export commonly used types
pub use config::Config;
pub use controller::ChargingController;
pub use engine::{AllocationEngine, CycleOutcome};
pub use error::{GridshareError, Result};
pub use reason::Reason;
pub use registry::{DatapointRegistry, DatapointValue, MemoryRegistry};

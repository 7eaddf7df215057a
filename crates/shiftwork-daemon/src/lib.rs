//! # Shiftwork Daemon
//!
//! Assembles a running Shiftwork server from configuration.
//!
//! ## Features
//!
//! - Store selection and schema preparation from `[storage]`
//! - Scheduler loops, recurring evaluator and health loop under one shutdown token
//! - Signal handling (SIGTERM/SIGINT for graceful shutdown, a second signal skips the grace period)
//! - Health checks for store reachability and queue loop liveness
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shiftwork_daemon::{ServerRunner, SignalHandler};
//!
//! let server = ServerRunner::new(config, registry).build().await?;
//! let signals = SignalHandler::new();
//! signals.setup_os_signals().await?;
//! server.run(signals).await?;
//! ```

pub mod error;
pub mod health;
pub mod runner;
pub mod settings;
pub mod signal;

pub use error::DaemonError;
pub use health::{
    ComponentCheck, HealthCheckResult, HealthCheckable, HealthChecker, HealthStatus, StoreCheck,
    WorkerLivenessCheck,
};
pub use runner::{open_stores, Server, ServerRunner, Stores};
pub use signal::{DaemonSignal, SignalHandler};

//! # Shiftwork Config
//!
//! TOML configuration for a Shiftwork server: storage, queues, leases,
//! retries, retention, the recurring evaluator and recurring job definitions.

mod error;
mod loader;
mod schema;
mod validator;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::*;
pub use validator::{ConfigValidator, ValidationError, ValidationResult, ValidationWarning};

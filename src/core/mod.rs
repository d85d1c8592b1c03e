//! Core infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`context`] - Cancellation and deadlines for registry calls
//! - [`error`] - Registry error taxonomy
//! - [`telemetry`] - Logging setup
//! - [`time`] - Clocks and expiration arithmetic

pub mod config;
pub mod context;
pub mod error;
pub mod telemetry;
pub mod time;

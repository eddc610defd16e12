//! Data models for the connection manager.
//!
//! This module re-exports all model types used throughout the crate.

pub mod health;
pub mod status;
pub mod target;

// Re-export commonly used types
pub use health::{
    CircuitPolicy, CircuitState, HealthResult, HealthState, ResourcePressure, ResourceSnapshot,
    ResourceThresholds,
};
pub use status::TargetStatus;
pub use target::{ConnectionMode, TargetConfig};

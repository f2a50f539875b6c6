//! Configuration models for the manager and its scaling policy.

pub mod manager;

pub use manager::{ManagerConfig, ScalingConfig};

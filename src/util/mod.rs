//! Identifier generation and telemetry helpers.

pub mod ids;
pub mod telemetry;

pub use ids::{generate_job_id, WorkerId};
pub use telemetry::init_tracing;

//! Identifiers for jobs and workers.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a short random job id.
///
/// The id is the first hyphen-separated group of a v4 UUID: 8 hex characters,
/// collision-resistant at the scale of a single in-process queue.
pub fn generate_job_id() -> String {
    let id = Uuid::new_v4().to_string();
    match id.split('-').next() {
        Some(prefix) => prefix.to_owned(),
        None => id,
    }
}

/// Unique, sortable identifier of a worker within a pool.
///
/// Ids are drawn from a monotonically increasing counter, so ordering by
/// `WorkerId` is spawn order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub(crate) u64);

impl WorkerId {
    /// The raw numeric value of this id.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

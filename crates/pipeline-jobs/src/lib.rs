//! Job Control Plane and Lifecycle Monitor (§4.5).

mod error;
mod lifecycle;
mod store;

pub use error::JobError;
pub use lifecycle::LifecycleMonitor;
pub use store::{derive_job_id, JobStore, JOB_EVENTS_TOPIC};

//! Pipeline Command Handler (§4.6): translates external commands into job
//! graph mutations and owns per-project stage progression.

mod error;
mod handler;
mod stages;

pub use error::HandlerError;
pub use handler::{CommandHandler, CANCELLATIONS_TOPIC, COMMANDS_TOPIC, PIPELINE_EVENTS_TOPIC};
pub use stages::{scene_video_unit, stage_order, stage_status, work_units, Stage, StageStatus, WorkUnit};

//! Worker Dispatch Loop (§4.7): the process that turns a dispatched job
//! into generative agent work and a terminal job-state transition.

mod agent;
mod dispatch;
mod error;

pub use agent::{AgentExecutor, AgentOutcome, LedgerWrite, MockAgentExecutor, ScenesCreated, SceneTransition};
pub use dispatch::{WorkerConfig, WorkerLoop, CANCELLATIONS_TOPIC, PIPELINE_EVENTS_TOPIC};
pub use error::{AgentError, WorkerError};

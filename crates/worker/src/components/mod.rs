pub mod heartbeat_manager;
pub mod job_execution;
pub mod worker_lifecycle;

pub use heartbeat_manager::{HeartbeatManager, HeartbeatStatus};
pub use job_execution::{ExecutionOutcome, JobExecutionManager};
pub use worker_lifecycle::{WorkerLifecycle, WorkerSummary};

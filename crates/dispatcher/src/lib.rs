//! 调度核心
//!
//! `JobScheduler` 是任务存储之上的无状态请求处理层，`CleanupSweeper`
//! 独立周期运行，负责回收租约过期的任务。两者之间只通过存储协调。

pub mod retry;
pub mod scheduler;
pub mod sweeper;

pub use retry::StoreRetryPolicy;
pub use scheduler::JobScheduler;
pub use sweeper::{CleanupSweeper, SweepStats};

//! Worker 代理
//!
//! 一个 Worker 同一时间只持有一个任务：认领、启动、在等待执行器退出的同时
//! 周期性发送心跳，最后上报终态。失去归属时放弃任务，不做任何上报。

pub mod components;
pub mod executors;

pub use components::{
    ExecutionOutcome, HeartbeatManager, HeartbeatStatus, JobExecutionManager, WorkerLifecycle,
    WorkerSummary,
};
pub use executors::{JobRunner, RunningJob, ShellRunner};

/// 默认 Worker 标识：`<hostname>-<pid>`
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}

/// 配置为空时回退到默认标识
pub fn resolve_worker_id(configured: &str) -> String {
    if configured.trim().is_empty() {
        default_worker_id()
    } else {
        configured.trim().to_string()
    }
}

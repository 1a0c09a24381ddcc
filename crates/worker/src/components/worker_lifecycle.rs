use std::sync::Arc;
use std::time::Duration;

use gnomehat_config::WorkerConfig;
use gnomehat_dispatcher::JobScheduler;
use gnomehat_errors::SchedulerResult;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::heartbeat_manager::HeartbeatManager;
use super::job_execution::{ExecutionOutcome, JobExecutionManager};
use crate::executors::JobRunner;

/// Worker 退出时的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub reported: usize,
    pub abandoned: usize,
    pub interrupted: usize,
}

pub struct WorkerLifecycle {
    worker_id: String,
    scheduler: Arc<JobScheduler>,
    execution: JobExecutionManager,
    poll_backoff: Duration,
}

impl WorkerLifecycle {
    pub fn new(
        worker_id: String,
        scheduler: Arc<JobScheduler>,
        runner: Arc<dyn JobRunner>,
        heartbeat_interval: Duration,
        poll_backoff: Duration,
    ) -> Self {
        let heartbeat =
            HeartbeatManager::new(worker_id.clone(), Arc::clone(&scheduler), heartbeat_interval);
        let execution =
            JobExecutionManager::new(worker_id.clone(), Arc::clone(&scheduler), runner, heartbeat);
        Self {
            worker_id,
            scheduler,
            execution,
            poll_backoff,
        }
    }

    pub fn from_config(
        worker_id: String,
        scheduler: Arc<JobScheduler>,
        runner: Arc<dyn JobRunner>,
        config: &WorkerConfig,
    ) -> Self {
        Self::new(
            worker_id,
            scheduler,
            runner,
            config.heartbeat_interval(),
            config.poll_backoff(),
        )
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// 认领并执行一个任务；队列为空时返回 `None`
    pub async fn run_once(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> SchedulerResult<Option<ExecutionOutcome>> {
        match self.scheduler.claim(&self.worker_id).await? {
            Some(job) => Ok(Some(self.execution.execute(job, shutdown).await?)),
            None => Ok(None),
        }
    }

    /// 主循环，直到收到关闭信号
    ///
    /// 每次认领前先检查关闭信号，关闭后不再认领新任务。
    /// 认领时的存储错误（重试耗尽后）会结束循环，由进程守护负责重启。
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> SchedulerResult<WorkerSummary> {
        info!("Worker {} 启动", self.worker_id);
        let mut summary = WorkerSummary::default();

        loop {
            // 发送端已关闭或消息滞后同样视为关闭
            match shutdown.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                _ => break,
            }

            let outcome = match self.run_once(&mut shutdown).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Worker {} 无法继续运行: {}", self.worker_id, e);
                    return Err(e);
                }
            };

            match outcome {
                Some(ExecutionOutcome::Reported(job)) => {
                    summary.reported += 1;
                    info!(
                        "{} 完成: {}，耗时 {}ms",
                        job.display_name(),
                        job.state,
                        job.execution_duration_ms().unwrap_or_default()
                    );
                }
                Some(ExecutionOutcome::Abandoned { job_id, .. }) => {
                    summary.abandoned += 1;
                    info!("任务 {} 已放弃", job_id);
                }
                Some(ExecutionOutcome::Interrupted { .. }) => {
                    summary.interrupted += 1;
                    break;
                }
                None => {
                    debug!("队列为空，{:?} 后重试", self.poll_backoff);
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_backoff) => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }

        info!(
            "Worker {} 停止: 完成 {}，放弃 {}",
            self.worker_id, summary.reported, summary.abandoned
        );
        Ok(summary)
    }
}

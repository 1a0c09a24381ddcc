use std::sync::Arc;

use gnomehat_dispatcher::JobScheduler;
use gnomehat_domain::entities::{ExitInfo, Job, JobOutcome};
use gnomehat_errors::{SchedulerError, SchedulerResult};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::heartbeat_manager::{HeartbeatManager, HeartbeatStatus};
use crate::executors::{JobRunner, RunningJob};

/// 单个任务的执行结果
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// 终态已写入存储
    Reported(Job),
    /// 执行过程中失去归属，进程已终止，未上报
    Abandoned { job_id: i64, reason: SchedulerError },
    /// 收到关闭信号，进程已终止，租约留给 Sweeper 回收
    Interrupted { job_id: i64 },
}

enum RunEnd {
    Exited(SchedulerResult<ExitInfo>),
    Lost(SchedulerError),
    Shutdown,
}

pub struct JobExecutionManager {
    worker_id: String,
    scheduler: Arc<JobScheduler>,
    runner: Arc<dyn JobRunner>,
    heartbeat: HeartbeatManager,
}

impl JobExecutionManager {
    pub fn new(
        worker_id: String,
        scheduler: Arc<JobScheduler>,
        runner: Arc<dyn JobRunner>,
        heartbeat: HeartbeatManager,
    ) -> Self {
        Self {
            worker_id,
            scheduler,
            runner,
            heartbeat,
        }
    }

    /// 执行一个已认领的任务
    pub async fn execute(
        &self,
        job: Job,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> SchedulerResult<ExecutionOutcome> {
        let job_id = job.id;

        let job = match self.scheduler.start(job_id, &self.worker_id).await {
            Ok(job) => job,
            Err(e) if Self::lost_before_start(&e) => {
                warn!("任务 {} 在启动前已被终止或回收: {}", job_id, e);
                return Ok(ExecutionOutcome::Abandoned { job_id, reason: e });
            }
            Err(e) => return Err(e),
        };

        let mut running = match self.runner.spawn(&job, &self.worker_id).await {
            Ok(running) => running,
            Err(e) => {
                error!("任务 {} 启动失败: {}", job_id, e);
                let exit_info = ExitInfo::default().with_message(e.to_string());
                return self.report(job_id, JobOutcome::Failed(exit_info)).await;
            }
        };

        match self.supervise(job_id, running.as_mut(), shutdown).await {
            RunEnd::Exited(Ok(exit_info)) => {
                self.report(job_id, JobOutcome::from_exit(exit_info)).await
            }
            RunEnd::Exited(Err(e)) => {
                error!("等待任务 {} 退出时出错: {}", job_id, e);
                let exit_info = ExitInfo {
                    exit_code: None,
                    log_path: running.log_path().map(str::to_string),
                    message: Some(e.to_string()),
                };
                self.report(job_id, JobOutcome::Failed(exit_info)).await
            }
            RunEnd::Lost(reason) => {
                Self::stop(job_id, running.as_mut()).await;
                Ok(ExecutionOutcome::Abandoned { job_id, reason })
            }
            RunEnd::Shutdown => {
                Self::stop(job_id, running.as_mut()).await;
                info!("Worker 关闭，放弃任务 {}，等待租约过期后重新排队", job_id);
                Ok(ExecutionOutcome::Interrupted { job_id })
            }
        }
    }

    /// 等待进程退出，同时按间隔续约；心跳分支优先
    async fn supervise(
        &self,
        job_id: i64,
        running: &mut dyn RunningJob,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> RunEnd {
        let mut ticker = self.heartbeat.ticker();

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => {
                    match self.heartbeat.beat(job_id).await {
                        HeartbeatStatus::Renewed | HeartbeatStatus::Transient(_) => {}
                        HeartbeatStatus::Lost(e) => return RunEnd::Lost(e),
                    }
                }
                _ = shutdown.recv() => return RunEnd::Shutdown,
                result = running.wait() => return RunEnd::Exited(result),
            }
        }
    }

    async fn report(&self, job_id: i64, outcome: JobOutcome) -> SchedulerResult<ExecutionOutcome> {
        match self
            .scheduler
            .report_terminal(job_id, &self.worker_id, outcome)
            .await
        {
            Ok(job) => Ok(ExecutionOutcome::Reported(job)),
            Err(e) if e.is_ownership_lost() => {
                warn!("任务 {} 上报终态时已失去归属，放弃: {}", job_id, e);
                Ok(ExecutionOutcome::Abandoned { job_id, reason: e })
            }
            Err(e) => Err(e),
        }
    }

    async fn stop(job_id: i64, running: &mut dyn RunningJob) {
        if let Err(e) = running.terminate().await {
            error!("终止任务 {} 的进程失败: {}", job_id, e);
        }
    }

    fn lost_before_start(error: &SchedulerError) -> bool {
        matches!(
            error,
            SchedulerError::NotOwner { .. }
                | SchedulerError::InvalidStateTransition { .. }
                | SchedulerError::JobNotFound { .. }
        )
    }
}

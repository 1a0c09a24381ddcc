use std::sync::Arc;

use chrono::{DateTime, Utc};
use gnomehat_config::SchedulerConfig;
use gnomehat_domain::{
    entities::{ExitInfo, Job, JobFilter, JobMetadata, JobOutcome, JobState, NewJob},
    mutations::{CasOutcome, JobGuard, JobMutation},
    repositories::JobStore,
};
use gnomehat_errors::{SchedulerError, SchedulerResult};
use tracing::{debug, info, instrument};

use crate::retry::StoreRetryPolicy;

/// 单次操作内重新读取任务的上限，超过说明任务在被异常频繁地修改
const MAX_REREAD_ATTEMPTS: usize = 8;

/// 任务调度器
///
/// 自身不持有任何可变状态，所有并发正确性都来自存储的条件更新，
/// 因此可以被多个 Worker、Sweeper 和提交方同时调用。
#[derive(Clone)]
pub struct JobScheduler {
    store: Arc<dyn JobStore>,
    retry: StoreRetryPolicy,
    claim_batch_size: i64,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn JobStore>, config: &SchedulerConfig) -> Self {
        Self {
            store,
            retry: StoreRetryPolicy::from_config(config),
            claim_batch_size: config.claim_batch_size.max(1),
        }
    }

    pub fn with_retry_policy(mut self, retry: StoreRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    pub fn retry_policy(&self) -> &StoreRetryPolicy {
        &self.retry
    }

    #[instrument(skip(self, metadata))]
    pub async fn submit(&self, command: &str, metadata: JobMetadata) -> SchedulerResult<i64> {
        if command.trim().is_empty() {
            return Err(SchedulerError::invalid_params("任务命令不能为空"));
        }

        let new_job = NewJob::new(command, metadata);
        let id = self
            .retry
            .run("create", || self.store.create(&new_job))
            .await?;

        info!("提交任务 {}: {}", id, command);
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> SchedulerResult<Job> {
        self.retry.run("get", || self.store.get(id)).await
    }

    pub async fn list(&self, filter: &JobFilter) -> SchedulerResult<Vec<Job>> {
        self.retry.run("list", || self.store.list(filter)).await
    }

    async fn cas(
        &self,
        id: i64,
        expected: &JobGuard,
        mutation: &JobMutation,
    ) -> SchedulerResult<CasOutcome> {
        self.retry
            .run(mutation.name(), || {
                self.store.compare_and_swap(id, expected, mutation)
            })
            .await
    }

    pub async fn claim(&self, worker_id: &str) -> SchedulerResult<Option<Job>> {
        self.claim_at(worker_id, Utc::now()).await
    }

    /// 按提交顺序认领最早的排队任务，冲突时顺延到下一个候选
    #[instrument(skip(self, now))]
    pub async fn claim_at(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<Job>> {
        if worker_id.is_empty() {
            return Err(SchedulerError::invalid_params("worker_id 不能为空"));
        }

        let filter = JobFilter::with_state(JobState::Queued).limit(self.claim_batch_size);
        let mutation = JobMutation::Claim {
            worker_id: worker_id.to_string(),
            at: now,
        };

        loop {
            let candidates = self.list(&filter).await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            for candidate in candidates {
                match self.cas(candidate.id, &JobGuard::queued(), &mutation).await? {
                    CasOutcome::Applied(job) => {
                        info!(
                            "Worker {} 认领任务 {} (第 {} 次尝试)",
                            worker_id,
                            job.id,
                            job.attempt_count + 1
                        );
                        return Ok(Some(job));
                    }
                    CasOutcome::Conflict => {
                        debug!("任务 {} 已被其他 Worker 认领，尝试下一个", candidate.id);
                    }
                }
            }
        }
    }

    pub async fn start(&self, id: i64, worker_id: &str) -> SchedulerResult<Job> {
        self.start_at(id, worker_id, Utc::now()).await
    }

    #[instrument(skip(self, now))]
    pub async fn start_at(
        &self,
        id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Job> {
        let guard = JobGuard::owned(JobState::Claimed, worker_id);
        match self.cas(id, &guard, &JobMutation::Start { at: now }).await? {
            CasOutcome::Applied(job) => {
                debug!("任务 {} 开始运行", id);
                Ok(job)
            }
            CasOutcome::Conflict => {
                let job = self.get(id).await?;
                if job.state == JobState::Running && job.is_owned_by(worker_id) {
                    return Ok(job);
                }
                Err(Self::rejection(&job, worker_id, JobState::Running))
            }
        }
    }

    pub async fn heartbeat(&self, id: i64, worker_id: &str) -> SchedulerResult<Job> {
        self.heartbeat_at(id, worker_id, Utc::now()).await
    }

    /// 刷新租约；任务不再属于该 Worker 或已离开 Claimed/Running 时返回 `NotOwner`
    pub async fn heartbeat_at(
        &self,
        id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Job> {
        let mutation = JobMutation::Heartbeat { at: now };

        for _ in 0..MAX_REREAD_ATTEMPTS {
            let job = self.get(id).await?;
            if !job.state.is_leased() || !job.is_owned_by(worker_id) {
                return Err(SchedulerError::not_owner(id, worker_id));
            }

            let guard = JobGuard::owned(job.state, worker_id);
            if let CasOutcome::Applied(job) = self.cas(id, &guard, &mutation).await? {
                debug!("任务 {} 心跳已刷新", id);
                return Ok(job);
            }
        }

        Err(Self::contention(id))
    }

    pub async fn report_terminal(
        &self,
        id: i64,
        worker_id: &str,
        outcome: JobOutcome,
    ) -> SchedulerResult<Job> {
        self.report_terminal_at(id, worker_id, outcome, Utc::now())
            .await
    }

    /// 上报终态；同一 Worker 对同一终态、同一退出信息的重复上报是幂等的
    #[instrument(skip(self, outcome, now), fields(outcome = %outcome.state()))]
    pub async fn report_terminal_at(
        &self,
        id: i64,
        worker_id: &str,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Job> {
        let target = outcome.state();
        let mutation = JobMutation::Finish {
            state: target,
            exit_info: outcome.exit_info().clone(),
            at: now,
        };

        for _ in 0..MAX_REREAD_ATTEMPTS {
            let job = self.get(id).await?;

            if job.state.is_terminal() {
                // 只有同一 Worker 带着同一份退出信息的重复上报才算幂等；
                // Sweeper 强制失败的任务保留原 owner，但退出信息不同
                if job.state == target
                    && job.is_owned_by(worker_id)
                    && job.exit_info.as_ref() == Some(outcome.exit_info())
                {
                    debug!("任务 {} 已处于 {}，忽略重复上报", id, target);
                    return Ok(job);
                }
                return Err(SchedulerError::not_owner(id, worker_id));
            }

            if !job.is_owned_by(worker_id) {
                return Err(SchedulerError::not_owner(id, worker_id));
            }

            if job.state != JobState::Running {
                return Err(SchedulerError::invalid_transition(id, job.state, target));
            }

            let guard = JobGuard::owned(JobState::Running, worker_id);
            if let CasOutcome::Applied(job) = self.cas(id, &guard, &mutation).await? {
                info!(
                    "任务 {} 结束: {} (exit_code: {:?})",
                    id,
                    target,
                    job.exit_info.as_ref().and_then(|e| e.exit_code)
                );
                return Ok(job);
            }
        }

        Err(Self::contention(id))
    }

    pub async fn kill(&self, id: i64) -> SchedulerResult<Job> {
        self.kill_at(id, Utc::now()).await
    }

    /// 管理操作：无论归属，把未结束的任务置为 Killed，保留原 owner 记录
    #[instrument(skip(self, now))]
    pub async fn kill_at(&self, id: i64, now: DateTime<Utc>) -> SchedulerResult<Job> {
        let mutation = JobMutation::Finish {
            state: JobState::Killed,
            exit_info: ExitInfo::default().with_message("killed by user"),
            at: now,
        };

        for _ in 0..MAX_REREAD_ATTEMPTS {
            let job = self.get(id).await?;

            if job.state == JobState::Killed {
                return Ok(job);
            }
            if job.state.is_terminal() {
                return Err(SchedulerError::invalid_transition(
                    id,
                    job.state,
                    JobState::Killed,
                ));
            }

            let guard = JobGuard::new(job.state, job.owner.clone());
            if let CasOutcome::Applied(job) = self.cas(id, &guard, &mutation).await? {
                info!("任务 {} 已被终止 (owner: {:?})", id, job.owner);
                return Ok(job);
            }
            debug!("终止任务 {} 时发生冲突，重新读取", id);
        }

        Err(Self::contention(id))
    }

    fn rejection(job: &Job, worker_id: &str, target: JobState) -> SchedulerError {
        if job.is_owned_by(worker_id) && job.state.is_leased() {
            SchedulerError::invalid_transition(job.id, job.state, target)
        } else {
            SchedulerError::not_owner(job.id, worker_id)
        }
    }

    fn contention(id: i64) -> SchedulerError {
        SchedulerError::Internal(format!(
            "任务 {id} 在 {MAX_REREAD_ATTEMPTS} 次重新读取后仍然冲突"
        ))
    }
}

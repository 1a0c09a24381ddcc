use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gnomehat_config::{SchedulerConfig, SweeperConfig};
use gnomehat_domain::{
    entities::{ExitInfo, Job, JobFilter, JobState},
    mutations::{CasOutcome, JobGuard, JobMutation},
    repositories::JobStore,
};
use gnomehat_errors::SchedulerResult;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::retry::StoreRetryPolicy;

/// 单轮扫描统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub requeued: usize,
    pub failed: usize,
    /// 观察到的三元组已过时（期间有心跳或状态变化），本轮放弃
    pub conflicts: usize,
}

impl SweepStats {
    pub fn reclaimed(&self) -> usize {
        self.requeued + self.failed
    }
}

/// 租约过期回收
///
/// 系统中唯一感知 Worker 死亡的组件。只根据存储中的心跳时间判断，
/// 不与任何 Worker 直接通信。
pub struct CleanupSweeper {
    store: Arc<dyn JobStore>,
    retry: StoreRetryPolicy,
    expiry_timeout: chrono::Duration,
    max_attempts: i32,
    interval: Duration,
    max_consecutive_failures: u32,
}

impl CleanupSweeper {
    pub fn new(
        store: Arc<dyn JobStore>,
        scheduler_config: &SchedulerConfig,
        sweeper_config: &SweeperConfig,
    ) -> Self {
        Self {
            store,
            retry: StoreRetryPolicy::from_config(scheduler_config),
            expiry_timeout: chrono::Duration::seconds(
                scheduler_config.expiry_timeout_seconds as i64,
            ),
            max_attempts: scheduler_config.max_attempts,
            interval: sweeper_config.interval(),
            max_consecutive_failures: sweeper_config.max_consecutive_failures.max(1),
        }
    }

    pub fn with_retry_policy(mut self, retry: StoreRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 处于租约状态且最近一次续约早于 `now - expiry_timeout`
    pub fn is_expired(&self, job: &Job, now: DateTime<Utc>) -> bool {
        if !job.state.is_leased() {
            return false;
        }
        match job.lease_renewed_at() {
            Some(renewed_at) => now - renewed_at > self.expiry_timeout,
            None => true,
        }
    }

    fn reclaim_mutation(&self, job: &Job, now: DateTime<Utc>) -> JobMutation {
        if job.attempt_count < self.max_attempts {
            JobMutation::Requeue
        } else {
            JobMutation::Finish {
                state: JobState::Failed,
                exit_info: ExitInfo::default().with_message(format!(
                    "lease expired after {} attempts",
                    job.attempt_count + 1
                )),
                at: now,
            }
        }
    }

    pub async fn sweep_once(&self) -> SchedulerResult<SweepStats> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SchedulerResult<SweepStats> {
        let filter = JobFilter::with_states(&[JobState::Claimed, JobState::Running]);
        let leased = self
            .retry
            .run("list", || self.store.list(&filter))
            .await?;

        let mut stats = SweepStats::default();
        for job in leased {
            stats.scanned += 1;
            if !self.is_expired(&job, now) {
                continue;
            }

            let guard = JobGuard::observed(&job);
            let mutation = self.reclaim_mutation(&job, now);
            let outcome = self
                .retry
                .run(mutation.name(), || {
                    self.store.compare_and_swap(job.id, &guard, &mutation)
                })
                .await?;

            match outcome {
                CasOutcome::Applied(reclaimed) if reclaimed.state == JobState::Queued => {
                    stats.requeued += 1;
                    warn!(
                        "任务 {} 租约过期 (owner: {:?})，重新排队，已尝试 {} 次",
                        job.id, job.owner, reclaimed.attempt_count
                    );
                }
                CasOutcome::Applied(_) => {
                    stats.failed += 1;
                    warn!(
                        "任务 {} 租约过期且已达到最大尝试次数 {}，标记为失败",
                        job.id, self.max_attempts
                    );
                }
                CasOutcome::Conflict => {
                    stats.conflicts += 1;
                    debug!("任务 {} 在回收前已被更新，放弃本次回收", job.id);
                }
            }
        }

        if stats.reclaimed() > 0 {
            info!(
                "回收扫描完成: 扫描 {}，重新排队 {}，失败 {}，冲突 {}",
                stats.scanned, stats.requeued, stats.failed, stats.conflicts
            );
        } else {
            debug!("回收扫描完成: 扫描 {}，无过期任务", stats.scanned);
        }

        Ok(stats)
    }

    /// 周期性扫描直到收到关闭信号
    ///
    /// 单轮失败记录日志后在下一轮重试；致命错误或连续失败达到上限时返回错误，
    /// 由进程守护负责重启。
    pub async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> SchedulerResult<()> {
        info!(
            "启动回收服务，扫描间隔 {:?}，租约过期时间 {}s",
            self.interval,
            self.expiry_timeout.num_seconds()
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = interval.tick() => match self.sweep_once().await {
                    Ok(_) => consecutive_failures = 0,
                    Err(e) if e.is_fatal() => {
                        error!("回收扫描遇到致命错误，停止回收服务: {}", e);
                        return Err(e);
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures >= self.max_consecutive_failures {
                            error!(
                                "回收扫描连续失败 {} 次，停止回收服务: {}",
                                consecutive_failures, e
                            );
                            return Err(e);
                        }
                        warn!(
                            "回收扫描失败 ({}/{}): {}",
                            consecutive_failures, self.max_consecutive_failures, e
                        );
                    }
                },
                _ = shutdown.recv() => {
                    info!("收到关闭信号，停止回收服务");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use gnomehat_domain::entities::{JobMetadata, NewJob};
    use gnomehat_errors::SchedulerError;
    use gnomehat_infrastructure::InMemoryJobStore;

    fn sweeper(store: Arc<dyn JobStore>, max_attempts: i32) -> CleanupSweeper {
        let scheduler_config = SchedulerConfig {
            expiry_timeout_seconds: 10,
            max_attempts,
            ..SchedulerConfig::default()
        };
        CleanupSweeper::new(store, &scheduler_config, &SweeperConfig::default())
            .with_retry_policy(StoreRetryPolicy::no_retry())
    }

    async fn claimed_job(store: &Arc<dyn JobStore>, at: DateTime<Utc>) -> Job {
        let id = store
            .create(&NewJob::new("sleep 100", JobMetadata::default()))
            .await
            .unwrap();
        store
            .compare_and_swap(
                id,
                &JobGuard::queued(),
                &JobMutation::Claim {
                    worker_id: "worker-1".to_string(),
                    at,
                },
            )
            .await
            .unwrap()
            .applied()
            .unwrap()
    }

    #[tokio::test]
    async fn test_is_expired() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let sweeper = sweeper(store.clone(), 3);
        let t0 = Utc::now();
        let job = claimed_job(&store, t0).await;

        assert!(!sweeper.is_expired(&job, t0 + ChronoDuration::seconds(5)));
        assert!(!sweeper.is_expired(&job, t0 + ChronoDuration::seconds(10)));
        assert!(sweeper.is_expired(&job, t0 + ChronoDuration::seconds(11)));

        let queued = store.get(job.id).await.unwrap();
        let requeued = JobMutation::Requeue.apply(&queued);
        assert!(!sweeper.is_expired(&requeued, t0 + ChronoDuration::days(1)));
    }

    #[tokio::test]
    async fn test_fresh_leases_are_left_alone() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let sweeper = sweeper(store.clone(), 3);
        let t0 = Utc::now();
        claimed_job(&store, t0).await;

        let stats = sweeper.sweep_at(t0 + ChronoDuration::seconds(3)).await.unwrap();
        assert_eq!(
            stats,
            SweepStats {
                scanned: 1,
                ..SweepStats::default()
            }
        );
    }

    #[tokio::test]
    async fn test_expired_lease_is_requeued() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let sweeper = sweeper(store.clone(), 3);
        let t0 = Utc::now();
        let job = claimed_job(&store, t0).await;

        let stats = sweeper
            .sweep_at(t0 + ChronoDuration::seconds(11))
            .await
            .unwrap();
        assert_eq!(stats.requeued, 1);

        let job = store.get(job.id).await.unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt_count, 1);
        assert!(job.owner.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_budget_fails_job() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let sweeper = sweeper(store.clone(), 1);
        let t0 = Utc::now();
        let job = claimed_job(&store, t0).await;

        sweeper
            .sweep_at(t0 + ChronoDuration::seconds(11))
            .await
            .unwrap();
        let t1 = t0 + ChronoDuration::seconds(20);
        store
            .compare_and_swap(
                job.id,
                &JobGuard::queued(),
                &JobMutation::Claim {
                    worker_id: "worker-2".to_string(),
                    at: t1,
                },
            )
            .await
            .unwrap();

        let stats = sweeper
            .sweep_at(t1 + ChronoDuration::seconds(11))
            .await
            .unwrap();
        assert_eq!(stats.failed, 1);

        let job = store.get(job.id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.owner.as_deref(), Some("worker-2"));
        assert_eq!(
            job.exit_info.and_then(|e| e.message).as_deref(),
            Some("lease expired after 2 attempts")
        );
    }

    #[tokio::test]
    async fn test_start_stops_on_shutdown() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let sweeper = Arc::new(sweeper(store, 3));
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn({
            let sweeper = Arc::clone(&sweeper);
            async move { sweeper.start(rx).await }
        });

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    /// 列出候选时总是返回内部错误的存储
    struct BrokenStore;

    #[async_trait::async_trait]
    impl JobStore for BrokenStore {
        async fn create(&self, _job: &NewJob) -> SchedulerResult<i64> {
            Err(SchedulerError::Internal("schema mismatch".to_string()))
        }

        async fn get(&self, id: i64) -> SchedulerResult<Job> {
            Err(SchedulerError::job_not_found(id))
        }

        async fn list(&self, _filter: &JobFilter) -> SchedulerResult<Vec<Job>> {
            Err(SchedulerError::Internal("schema mismatch".to_string()))
        }

        async fn compare_and_swap(
            &self,
            _id: i64,
            _expected: &JobGuard,
            _mutation: &JobMutation,
        ) -> SchedulerResult<CasOutcome> {
            Err(SchedulerError::Internal("schema mismatch".to_string()))
        }
    }

    #[tokio::test]
    async fn test_start_stops_on_fatal_error() {
        // 默认允许 5 轮连续失败，致命错误第一轮就退出
        let sweeper = sweeper(Arc::new(BrokenStore), 3);
        let (_tx, rx) = broadcast::channel(1);

        let result = tokio::time::timeout(Duration::from_secs(5), sweeper.start(rx))
            .await
            .unwrap();
        assert!(matches!(result, Err(SchedulerError::Internal(_))));
    }
}

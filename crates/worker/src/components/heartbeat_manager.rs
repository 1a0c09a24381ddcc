use std::sync::Arc;
use std::time::Duration;

use gnomehat_dispatcher::JobScheduler;
use gnomehat_errors::SchedulerError;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

/// 单次心跳的结果
#[derive(Debug)]
pub enum HeartbeatStatus {
    Renewed,
    /// 任务已被回收、终止或转给其他 Worker
    Lost(SchedulerError),
    /// 存储暂时不可用，下一次心跳再试
    Transient(SchedulerError),
}

pub struct HeartbeatManager {
    worker_id: String,
    scheduler: Arc<JobScheduler>,
    heartbeat_interval: Duration,
}

impl HeartbeatManager {
    pub fn new(worker_id: String, scheduler: Arc<JobScheduler>, heartbeat_interval: Duration) -> Self {
        Self {
            worker_id,
            scheduler,
            heartbeat_interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// 第一次触发在一个完整间隔之后，认领本身已经刷新过租约
    pub fn ticker(&self) -> Interval {
        let mut ticker = interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    pub async fn beat(&self, job_id: i64) -> HeartbeatStatus {
        match self.scheduler.heartbeat(job_id, &self.worker_id).await {
            Ok(_) => {
                debug!("Worker {} 任务 {} 心跳成功", self.worker_id, job_id);
                HeartbeatStatus::Renewed
            }
            Err(e) if e.is_ownership_lost() || matches!(e, SchedulerError::JobNotFound { .. }) => {
                warn!("Worker {} 失去任务 {} 的归属: {}", self.worker_id, job_id, e);
                HeartbeatStatus::Lost(e)
            }
            Err(e) => {
                warn!("任务 {} 心跳失败，等待下一次重试: {}", job_id, e);
                HeartbeatStatus::Transient(e)
            }
        }
    }
}

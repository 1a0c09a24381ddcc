//! 领域仓储抽象
//!
//! 任务存储是系统唯一的协调点，调度器、Worker 与 Sweeper 之间不直接通信

use async_trait::async_trait;
use gnomehat_errors::SchedulerResult;

use crate::entities::{Job, JobFilter, NewJob};
use crate::mutations::{CasOutcome, JobGuard, JobMutation};

/// 任务存储抽象
///
/// `compare_and_swap` 必须是线性一致的：并发调用中对同一任务、同一 guard
/// 最多只有一个返回 `Applied`。`Conflict` 不是错误，调用方按正常分支处理。
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &NewJob) -> SchedulerResult<i64>;
    /// 不存在时返回 `SchedulerError::JobNotFound`
    async fn get(&self, id: i64) -> SchedulerResult<Job>;
    /// 按提交顺序（id 升序）返回
    async fn list(&self, filter: &JobFilter) -> SchedulerResult<Vec<Job>>;
    async fn compare_and_swap(
        &self,
        id: i64,
        expected: &JobGuard,
        mutation: &JobMutation,
    ) -> SchedulerResult<CasOutcome>;
}

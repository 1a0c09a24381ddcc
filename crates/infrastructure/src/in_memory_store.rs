use async_trait::async_trait;
use gnomehat_domain::{
    entities::{Job, JobFilter, NewJob},
    mutations::{CasOutcome, JobGuard, JobMutation},
    repositories::JobStore,
};
use gnomehat_errors::{SchedulerError, SchedulerResult};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct StoreState {
    jobs: BTreeMap<i64, Job>,
    next_id: i64,
}

/// 进程内任务存储
///
/// 单机嵌入模式和测试使用。条件更新在一把锁内完成读-比较-写，
/// 锁不会跨越 await 点。
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<StoreState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> SchedulerResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| SchedulerError::Internal("内存存储锁已中毒".to_string()))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|state| state.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &NewJob) -> SchedulerResult<i64> {
        let mut state = self.lock()?;
        state.next_id += 1;
        let id = state.next_id;
        state.jobs.insert(id, job.clone().into_job(id));
        debug!("内存存储创建任务: ID {}", id);
        Ok(id)
    }

    async fn get(&self, id: i64) -> SchedulerResult<Job> {
        self.lock()?
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| SchedulerError::job_not_found(id))
    }

    async fn list(&self, filter: &JobFilter) -> SchedulerResult<Vec<Job>> {
        let state = self.lock()?;
        let matching = state.jobs.values().filter(|job| filter.matches(job)).cloned();
        Ok(match filter.limit {
            Some(limit) => matching.take(limit.max(0) as usize).collect(),
            None => matching.collect(),
        })
    }

    async fn compare_and_swap(
        &self,
        id: i64,
        expected: &JobGuard,
        mutation: &JobMutation,
    ) -> SchedulerResult<CasOutcome> {
        if !mutation.is_legal_from(expected.state) {
            return Err(SchedulerError::invalid_transition(
                id,
                expected.state,
                mutation.target_state(expected.state),
            ));
        }

        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::job_not_found(id))?;

        if !expected.matches(job) {
            return Ok(CasOutcome::Conflict);
        }

        *job = mutation.apply(job);
        Ok(CasOutcome::Applied(job.clone()))
    }
}

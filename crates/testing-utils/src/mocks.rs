//! 测试替身
//!
//! 存储替身包装真实的 `JobStore` 注入故障，执行器替身按脚本退出，
//! 不启动任何真实进程。

use async_trait::async_trait;
use gnomehat_domain::{
    entities::{ExitInfo, Job, JobFilter, NewJob},
    mutations::{CasOutcome, JobGuard, JobMutation},
    repositories::JobStore,
};
use gnomehat_errors::{SchedulerError, SchedulerResult};
use gnomehat_worker::executors::{JobRunner, RunningJob};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 前 N 次调用返回 `StoreUnavailable` 的存储包装
pub struct FlakyJobStore {
    inner: Arc<dyn JobStore>,
    remaining_failures: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyJobStore {
    pub fn new(inner: Arc<dyn JobStore>, failures: usize) -> Self {
        Self {
            inner,
            remaining_failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, failures: usize) {
        self.remaining_failures.store(failures, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn inject(&self) -> SchedulerResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let tripped = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(SchedulerError::store_unavailable("database is locked"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobStore for FlakyJobStore {
    async fn create(&self, job: &NewJob) -> SchedulerResult<i64> {
        self.inject()?;
        self.inner.create(job).await
    }

    async fn get(&self, id: i64) -> SchedulerResult<Job> {
        self.inject()?;
        self.inner.get(id).await
    }

    async fn list(&self, filter: &JobFilter) -> SchedulerResult<Vec<Job>> {
        self.inject()?;
        self.inner.list(filter).await
    }

    async fn compare_and_swap(
        &self,
        id: i64,
        expected: &JobGuard,
        mutation: &JobMutation,
    ) -> SchedulerResult<CasOutcome> {
        self.inject()?;
        self.inner.compare_and_swap(id, expected, mutation).await
    }
}

/// 脚本化执行器每次 spawn 的行为
#[derive(Debug, Clone)]
pub enum ScriptedExit {
    /// 运行指定时长后以给定退出码结束
    After(Duration, i32),
    /// 永不退出，只能被终止
    Never,
    /// spawn 直接失败
    SpawnError(String),
}

/// 按脚本依次决定每个任务的结局；脚本用完后立即以 0 退出
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    script: Arc<Mutex<VecDeque<ScriptedExit>>>,
    spawned: Arc<Mutex<Vec<i64>>>,
    terminated: Arc<AtomicUsize>,
}

impl ScriptedRunner {
    pub fn new(script: Vec<ScriptedExit>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            ..Self::default()
        }
    }

    pub fn spawned(&self) -> Vec<i64> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobRunner for ScriptedRunner {
    async fn spawn(&self, job: &Job, _worker_id: &str) -> SchedulerResult<Box<dyn RunningJob>> {
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedExit::After(Duration::ZERO, 0));

        if let ScriptedExit::SpawnError(message) = &step {
            return Err(SchedulerError::runner_failure(message.clone()));
        }

        let deadline = match &step {
            ScriptedExit::After(duration, _) => Some(tokio::time::Instant::now() + *duration),
            _ => None,
        };

        self.spawned.lock().unwrap().push(job.id);
        Ok(Box::new(ScriptedProcess {
            step,
            log_path: format!("scripted/{}/stdout.txt", job.id),
            deadline,
            killed: false,
            terminated: Arc::clone(&self.terminated),
        }))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct ScriptedProcess {
    step: ScriptedExit,
    log_path: String,
    deadline: Option<tokio::time::Instant>,
    killed: bool,
    terminated: Arc<AtomicUsize>,
}

#[async_trait]
impl RunningJob for ScriptedProcess {
    async fn wait(&mut self) -> SchedulerResult<ExitInfo> {
        if self.killed {
            return Ok(ExitInfo::from_exit_code(None, Some(self.log_path.clone()))
                .with_message("terminated by signal 9"));
        }

        // 截止时间在 spawn 时确定，被取消后再次等待不会重新计时
        match (&self.step, self.deadline) {
            (ScriptedExit::After(_, code), Some(deadline)) => {
                tokio::time::sleep_until(deadline).await;
                Ok(ExitInfo::from_exit_code(Some(*code), Some(self.log_path.clone())))
            }
            _ => std::future::pending().await,
        }
    }

    async fn terminate(&mut self) -> SchedulerResult<()> {
        if !self.killed {
            self.killed = true;
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn log_path(&self) -> Option<&str> {
        Some(&self.log_path)
    }
}

//! 测试数据构造器

use chrono::{DateTime, Utc};
use gnomehat_domain::entities::{ExitInfo, Job, JobMetadata, JobState};

/// 直接构造 `Job`，绕过状态机，便于准备各种中间状态
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self {
            job: Job {
                id: 1,
                command: "python train.py".to_string(),
                metadata: JobMetadata::default(),
                state: JobState::Queued,
                owner: None,
                attempt_count: 0,
                submitted_at: Utc::now(),
                claimed_at: None,
                started_at: None,
                last_heartbeat_at: None,
                finished_at: None,
                exit_info: None,
            },
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.job.id = id;
        self
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.job.command = command.to_string();
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.job.metadata.name = Some(name.to_string());
        self
    }

    pub fn with_working_dir(mut self, dir: &str) -> Self {
        self.job.metadata.working_dir = Some(dir.to_string());
        self
    }

    pub fn with_attempt_count(mut self, attempt_count: i32) -> Self {
        self.job.attempt_count = attempt_count;
        self
    }

    pub fn submitted_at(mut self, at: DateTime<Utc>) -> Self {
        self.job.submitted_at = at;
        self
    }

    pub fn claimed_by(mut self, worker_id: &str, at: DateTime<Utc>) -> Self {
        self.job.state = JobState::Claimed;
        self.job.owner = Some(worker_id.to_string());
        self.job.claimed_at = Some(at);
        self.job.last_heartbeat_at = Some(at);
        self
    }

    pub fn running(mut self, worker_id: &str, at: DateTime<Utc>) -> Self {
        self = self.claimed_by(worker_id, at);
        self.job.state = JobState::Running;
        self.job.started_at = Some(at);
        self
    }

    pub fn with_last_heartbeat(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.job.last_heartbeat_at = at;
        self
    }

    pub fn finished(mut self, state: JobState, exit_code: Option<i32>) -> Self {
        let now = Utc::now();
        self.job.state = state;
        self.job.finished_at = Some(now);
        self.job.exit_info = Some(ExitInfo::from_exit_code(exit_code, None));
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

impl Default for JobBuilder {
    fn default() -> Self {
        Self::new()
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 实验任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub command: String,
    pub metadata: JobMetadata,
    pub state: JobState,
    pub owner: Option<String>,
    pub attempt_count: i32,
    pub submitted_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_info: Option<ExitInfo>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "CLAIMED")]
    Claimed,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "KILLED")]
    Killed,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Queued,
        JobState::Claimed,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Killed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Claimed => "CLAIMED",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Killed => "KILLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Killed
        )
    }

    /// 持有租约的状态，Sweeper 只关心这两种
    pub fn is_leased(&self) -> bool {
        matches!(self, JobState::Claimed | JobState::Running)
    }

    /// 状态机的唯一定义，Claimed/Running 回到 Queued 只允许 Sweeper 触发
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Queued, Claimed) => true,
            (Claimed, Running) => true,
            (Running, Succeeded) | (Running, Failed) => true,
            (Queued | Claimed | Running, Killed) => true,
            (Claimed | Running, Queued) => true,
            (Claimed, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "QUEUED" => Ok(JobState::Queued),
            "CLAIMED" => Ok(JobState::Claimed),
            "RUNNING" => Ok(JobState::Running),
            "SUCCEEDED" => Ok(JobState::Succeeded),
            "FAILED" => Ok(JobState::Failed),
            "KILLED" => Ok(JobState::Killed),
            _ => Err(format!("Invalid job state: {s}")),
        }
    }
}

/// 提交时附带的元数据，核心逻辑不解释其内容
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// 终态结果，只在 Succeeded/Failed/Killed 时设置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub exit_code: Option<i32>,
    pub log_path: Option<String>,
    pub message: Option<String>,
}

impl ExitInfo {
    pub fn from_exit_code(exit_code: Option<i32>, log_path: Option<String>) -> Self {
        Self {
            exit_code,
            log_path,
            message: None,
        }
    }

    pub fn with_message<S: Into<String>>(mut self, message: S) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Worker 上报的终态
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded(ExitInfo),
    Failed(ExitInfo),
}

impl JobOutcome {
    /// 退出码为 0 视为成功，其余（包括被信号终止）视为失败
    pub fn from_exit(exit_info: ExitInfo) -> Self {
        match exit_info.exit_code {
            Some(0) => JobOutcome::Succeeded(exit_info),
            _ => JobOutcome::Failed(exit_info),
        }
    }

    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Succeeded(_) => JobState::Succeeded,
            JobOutcome::Failed(_) => JobState::Failed,
        }
    }

    pub fn exit_info(&self) -> &ExitInfo {
        match self {
            JobOutcome::Succeeded(info) | JobOutcome::Failed(info) => info,
        }
    }
}

/// 新提交的任务
#[derive(Debug, Clone)]
pub struct NewJob {
    pub command: String,
    pub metadata: JobMetadata,
    pub submitted_at: DateTime<Utc>,
}

impl NewJob {
    pub fn new<S: Into<String>>(command: S, metadata: JobMetadata) -> Self {
        Self {
            command: command.into(),
            metadata,
            submitted_at: Utc::now(),
        }
    }

    pub fn into_job(self, id: i64) -> Job {
        Job {
            id,
            command: self.command,
            metadata: self.metadata,
            state: JobState::Queued,
            owner: None,
            attempt_count: 0,
            submitted_at: self.submitted_at,
            claimed_at: None,
            started_at: None,
            last_heartbeat_at: None,
            finished_at: None,
            exit_info: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub states: Option<Vec<JobState>>,
    pub owner: Option<String>,
    pub limit: Option<i64>,
}

impl JobFilter {
    pub fn with_state(state: JobState) -> Self {
        Self {
            states: Some(vec![state]),
            ..Default::default()
        }
    }

    pub fn with_states(states: &[JobState]) -> Self {
        Self {
            states: Some(states.to_vec()),
            ..Default::default()
        }
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn owned_by<S: Into<String>>(mut self, owner: S) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(states) = &self.states {
            if !states.contains(&job.state) {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if job.owner.as_deref() != Some(owner.as_str()) {
                return false;
            }
        }
        true
    }
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.owner.as_deref() == Some(worker_id)
    }

    /// 租约起点：最近一次心跳，没有心跳时退回到认领时间
    pub fn lease_renewed_at(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat_at.or(self.claimed_at)
    }

    pub fn display_name(&self) -> String {
        match &self.metadata.name {
            Some(name) => format!("任务[{}] {}", self.id, name),
            None => format!("任务[{}]", self.id),
        }
    }

    pub fn execution_duration_ms(&self) -> Option<i64> {
        if let (Some(started), Some(finished)) = (self.started_at, self.finished_at) {
            Some((finished - started).num_milliseconds())
        } else {
            None
        }
    }
}

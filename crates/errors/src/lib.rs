use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("任务存储不可用: {0}")]
    StoreUnavailable(String),
    #[error("任务未找到: {id}")]
    JobNotFound { id: i64 },
    #[error("Worker {worker_id} 不再持有任务 {job_id}")]
    NotOwner { job_id: i64, worker_id: String },
    #[error("非法的状态转换: 任务 {job_id} 从 {from} 到 {to}")]
    InvalidStateTransition {
        job_id: i64,
        from: String,
        to: String,
    },
    #[error("任务执行器错误: {0}")]
    RunnerFailure(String),
    #[error("无效的任务参数: {0}")]
    InvalidJobParams(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn job_not_found(id: i64) -> Self {
        Self::JobNotFound { id }
    }
    pub fn not_owner<S: Into<String>>(job_id: i64, worker_id: S) -> Self {
        Self::NotOwner {
            job_id,
            worker_id: worker_id.into(),
        }
    }
    pub fn invalid_transition<F: ToString, T: ToString>(job_id: i64, from: F, to: T) -> Self {
        Self::InvalidStateTransition {
            job_id,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
    pub fn store_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::StoreUnavailable(msg.into())
    }
    pub fn runner_failure<S: Into<String>>(msg: S) -> Self {
        Self::RunnerFailure(msg.into())
    }
    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidJobParams(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 进程无法自行恢复的错误，交由进程监管重启
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Internal(_) | SchedulerError::Configuration(_)
        )
    }

    /// 存储暂时不可达，可以退避后重试
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::StoreUnavailable(_) => true,
            SchedulerError::Database(e) => is_transient_sqlx_error(e),
            _ => false,
        }
    }

    /// 任务所有权已经丢失（被回收或被终止）
    pub fn is_ownership_lost(&self) -> bool {
        matches!(self, SchedulerError::NotOwner { .. })
    }

    pub fn user_message(&self) -> &str {
        match self {
            SchedulerError::JobNotFound { .. } => "请求的任务不存在",
            SchedulerError::NotOwner { .. } => "任务已被其他组件接管",
            SchedulerError::InvalidStateTransition { .. } => "任务当前状态不允许该操作",
            SchedulerError::InvalidJobParams(_) => "任务参数配置有误",
            SchedulerError::StoreUnavailable(_) => "任务存储暂时不可用，请稍后重试",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

/// SQLITE_BUSY(5) 与 SQLITE_LOCKED(6) 及其扩展码视为瞬时错误
fn is_transient_sqlx_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| matches!(code & 0xff, 5 | 6))
            .unwrap_or(false),
        _ => false,
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests;

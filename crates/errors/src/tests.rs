use crate::*;

#[test]
fn test_scheduler_error_display() {
    let not_found = SchedulerError::JobNotFound { id: 123 };
    assert_eq!(not_found.to_string(), "任务未找到: 123");

    let not_owner = SchedulerError::not_owner(7, "worker-1");
    assert_eq!(not_owner.to_string(), "Worker worker-1 不再持有任务 7");

    let transition = SchedulerError::invalid_transition(3, "SUCCEEDED", "RUNNING");
    assert_eq!(
        transition.to_string(),
        "非法的状态转换: 任务 3 从 SUCCEEDED 到 RUNNING"
    );

    let unavailable = SchedulerError::store_unavailable("connection refused");
    assert_eq!(unavailable.to_string(), "任务存储不可用: connection refused");

    let runner = SchedulerError::runner_failure("No such file");
    assert_eq!(runner.to_string(), "任务执行器错误: No such file");
}

#[test]
fn test_retryable_classification() {
    assert!(SchedulerError::store_unavailable("down").is_retryable());
    assert!(SchedulerError::Database(sqlx::Error::PoolTimedOut).is_retryable());
    assert!(SchedulerError::Database(sqlx::Error::PoolClosed).is_retryable());
    assert!(!SchedulerError::Database(sqlx::Error::RowNotFound).is_retryable());

    assert!(!SchedulerError::job_not_found(1).is_retryable());
    assert!(!SchedulerError::not_owner(1, "w").is_retryable());
    assert!(!SchedulerError::runner_failure("boom").is_retryable());
}

#[test]
fn test_ownership_and_fatal_classification() {
    assert!(SchedulerError::not_owner(1, "w").is_ownership_lost());
    assert!(!SchedulerError::job_not_found(1).is_ownership_lost());

    assert!(SchedulerError::config_error("bad").is_fatal());
    assert!(SchedulerError::Internal("bad".into()).is_fatal());
    assert!(!SchedulerError::store_unavailable("down").is_fatal());
}

#[test]
fn test_error_conversions() {
    let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let err: SchedulerError = json_err.into();
    assert!(matches!(err, SchedulerError::Serialization(_)));

    let err: SchedulerError = anyhow::anyhow!("oops").into();
    assert!(matches!(err, SchedulerError::Internal(ref m) if m == "oops"));
}

#[test]
fn test_user_message() {
    assert_eq!(
        SchedulerError::job_not_found(1).user_message(),
        "请求的任务不存在"
    );
    assert_eq!(
        SchedulerError::Internal("x".into()).user_message(),
        "系统繁忙，请稍后重试"
    );
}

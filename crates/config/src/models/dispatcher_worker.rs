use std::time::Duration;

use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 租约过期时间：超过该时间没有心跳的任务会被 Sweeper 回收
    pub expiry_timeout_seconds: u64,
    /// 最大回收次数，达到后任务直接进入 Failed
    pub max_attempts: i32,
    /// 存储瞬时错误的重试次数
    pub store_max_retries: u32,
    pub store_retry_initial_ms: u64,
    pub store_retry_max_ms: u64,
    /// 每次认领时读取的候选任务数量
    pub claim_batch_size: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            expiry_timeout_seconds: 60,
            max_attempts: 3,
            store_max_retries: 3,
            store_retry_initial_ms: 100,
            store_retry_max_ms: 2000,
            claim_batch_size: 16,
        }
    }
}

impl SchedulerConfig {
    pub fn expiry_timeout(&self) -> Duration {
        Duration::from_secs(self.expiry_timeout_seconds)
    }
}

impl ConfigValidator for SchedulerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_interval_seconds(
            self.expiry_timeout_seconds,
            "scheduler.expiry_timeout_seconds",
        )?;

        if self.max_attempts < 1 {
            return Err(crate::ConfigError::Validation(
                "scheduler.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.store_retry_initial_ms == 0 {
            return Err(crate::ConfigError::Validation(
                "scheduler.store_retry_initial_ms must be greater than 0".to_string(),
            ));
        }

        if self.store_retry_max_ms < self.store_retry_initial_ms {
            return Err(crate::ConfigError::Validation(
                "scheduler.store_retry_max_ms must not be less than store_retry_initial_ms"
                    .to_string(),
            ));
        }

        ValidationUtils::validate_count(
            self.claim_batch_size.max(0) as usize,
            "scheduler.claim_batch_size",
        )?;

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 为空时使用 `<hostname>-<pid>`
    pub worker_id: String,
    pub heartbeat_interval_seconds: u64,
    /// 队列为空时的轮询退避间隔
    pub poll_backoff_seconds: u64,
    /// 任务日志目录，每个任务写入 `<log_dir>/<job_id>/stdout.txt`
    pub log_dir: String,
    /// `all` 模式下进程内启动的 Worker 数量
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            heartbeat_interval_seconds: 10,
            poll_backoff_seconds: 5,
            log_dir: "logs".to_string(),
            concurrency: 1,
        }
    }
}

impl WorkerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn poll_backoff(&self) -> Duration {
        Duration::from_secs(self.poll_backoff_seconds)
    }
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_interval_seconds(
            self.heartbeat_interval_seconds,
            "worker.heartbeat_interval_seconds",
        )?;
        ValidationUtils::validate_interval_seconds(
            self.poll_backoff_seconds,
            "worker.poll_backoff_seconds",
        )?;
        ValidationUtils::validate_not_empty(&self.log_dir, "worker.log_dir")?;
        ValidationUtils::validate_count(self.concurrency, "worker.concurrency")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// 连续失败多少轮后退出，交给进程守护重启
    pub max_consecutive_failures: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 30,
            max_consecutive_failures: 5,
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

impl ConfigValidator for SweeperConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_interval_seconds(self.interval_seconds, "sweeper.interval_seconds")?;
        ValidationUtils::validate_count(
            self.max_consecutive_failures as usize,
            "sweeper.max_consecutive_failures",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_validation() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid = config.clone();
        invalid.max_attempts = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.expiry_timeout_seconds = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = config;
        invalid.store_retry_max_ms = 10;
        invalid.store_retry_initial_ms = 100;
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_worker_config_validation() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));

        let mut invalid = config.clone();
        invalid.heartbeat_interval_seconds = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = config;
        invalid.concurrency = 0;
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_sweeper_config_validation() {
        assert!(SweeperConfig::default().validate().is_ok());
        let invalid = SweeperConfig {
            interval_seconds: 0,
            ..SweeperConfig::default()
        };
        assert!(invalid.validate().is_err());
        let invalid = SweeperConfig {
            max_consecutive_failures: 0,
            ..SweeperConfig::default()
        };
        assert!(invalid.validate().is_err());
    }
}

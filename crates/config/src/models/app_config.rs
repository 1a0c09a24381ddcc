use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig,
    dispatcher_worker::{SchedulerConfig, SweeperConfig, WorkerConfig},
    logging::ObservabilityConfig,
};
use crate::validation::ConfigValidator;

/// 过期时间至少是心跳间隔的倍数，留出网络抖动和调度延迟的余量
pub const MIN_EXPIRY_TO_HEARTBEAT_RATIO: u64 = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub sweeper: SweeperConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/gnomehat.toml", "gnomehat.toml"];

            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("GNOMEHAT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.database.validate()?;
        self.scheduler.validate()?;
        self.worker.validate()?;
        self.sweeper.validate()?;
        self.observability.validate()?;

        let heartbeat = self.worker.heartbeat_interval_seconds;
        if self.scheduler.expiry_timeout_seconds < heartbeat * MIN_EXPIRY_TO_HEARTBEAT_RATIO {
            return Err(crate::ConfigError::Validation(format!(
                "scheduler.expiry_timeout_seconds ({}) must be at least {}x worker.heartbeat_interval_seconds ({})",
                self.scheduler.expiry_timeout_seconds, MIN_EXPIRY_TO_HEARTBEAT_RATIO, heartbeat
            )));
        }

        if self.sweeper.interval_seconds < heartbeat {
            return Err(crate::ConfigError::Validation(format!(
                "sweeper.interval_seconds ({}) must not be shorter than worker.heartbeat_interval_seconds ({})",
                self.sweeper.interval_seconds, heartbeat
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LogLevel, OutputFormat};

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.scheduler.expiry_timeout_seconds, 60);
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.worker.heartbeat_interval_seconds, 10);
        assert_eq!(config.sweeper.interval_seconds, 30);
        assert_eq!(config.observability.log_level, LogLevel::Info);
    }

    #[test]
    fn test_app_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_expiry_must_exceed_heartbeat_by_margin() {
        let mut config = AppConfig::default();
        config.worker.heartbeat_interval_seconds = 10;
        config.scheduler.expiry_timeout_seconds = 25;
        assert!(config.validate().is_err());

        config.scheduler.expiry_timeout_seconds = 30;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sweeper_interval_not_finer_than_heartbeat() {
        let mut config = AppConfig::default();
        config.sweeper.interval_seconds = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_app_config_from_toml() {
        let toml_str = r#"
[database]
url = "sqlite://test.db?mode=rwc"
max_connections = 2

[scheduler]
expiry_timeout_seconds = 120
max_attempts = 5

[worker]
worker_id = "gpu-box-1"
heartbeat_interval_seconds = 20
log_dir = "/var/log/gnomehat"

[observability]
log_level = "debug"
log_format = "json"
"#;

        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.database.url, "sqlite://test.db?mode=rwc");
        assert_eq!(config.database.max_connections, 2);
        assert_eq!(config.database.busy_timeout_ms, 5000);
        assert_eq!(config.scheduler.expiry_timeout_seconds, 120);
        assert_eq!(config.scheduler.max_attempts, 5);
        assert_eq!(config.scheduler.claim_batch_size, 16);
        assert_eq!(config.worker.worker_id, "gpu-box-1");
        assert_eq!(config.worker.log_dir, "/var/log/gnomehat");
        assert_eq!(config.sweeper.interval_seconds, 30);
        assert_eq!(config.observability.log_level, LogLevel::Debug);
        assert_eq!(config.observability.log_format, OutputFormat::Json);
    }

    #[test]
    fn test_app_config_from_toml_rejects_invalid() {
        let toml_str = r#"
[scheduler]
expiry_timeout_seconds = 10

[worker]
heartbeat_interval_seconds = 10
"#;
        assert!(AppConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_app_config_toml_round_trip() {
        let config = AppConfig::default();
        let serialized = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&serialized).unwrap();
        assert_eq!(parsed.database.url, config.database.url);
        assert_eq!(parsed.worker.log_dir, config.worker.log_dir);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gnomehat.toml");
        std::fs::write(
            &path,
            r#"
[scheduler]
max_attempts = 7

[sweeper]
interval_seconds = 45
"#,
        )
        .unwrap();

        let config = AppConfig::load(path.to_str()).unwrap();
        assert_eq!(config.scheduler.max_attempts, 7);
        assert_eq!(config.sweeper.interval_seconds, 45);
        assert_eq!(config.worker.heartbeat_interval_seconds, 10);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/gnomehat.toml")).is_err());
    }
}

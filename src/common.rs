use anyhow::{Context, Result};
use gnomehat_config::{AppConfig, LogLevel, OutputFormat};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 命令行上可以覆盖配置文件的启动参数
#[derive(Debug, Clone, Default)]
pub struct StartupOverrides {
    pub log_level: Option<LogLevel>,
    pub log_format: Option<OutputFormat>,
    pub worker_id: Option<String>,
    pub concurrency: Option<usize>,
}

impl StartupOverrides {
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.observability.log_format = format;
        }
        if let Some(ref worker_id) = self.worker_id {
            config.worker.worker_id = worker_id.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.worker.concurrency = concurrency;
        }
    }
}

/// 加载配置并叠加命令行参数
pub fn load_config(config_path: Option<&str>, overrides: &StartupOverrides) -> Result<AppConfig> {
    let mut config = AppConfig::load(config_path).with_context(|| match config_path {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载默认配置失败".to_string(),
    })?;
    overrides.apply(&mut config);
    Ok(config)
}

/// 初始化日志系统，`RUST_LOG` 优先于配置中的级别；日志写到 stderr，stdout 留给命令输出
pub fn init_logging(log_level: LogLevel, log_format: OutputFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        OutputFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .context("初始化JSON日志格式失败")?,
        OutputFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .context("初始化Pretty日志格式失败")?,
    }

    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("监听Ctrl+C信号失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("监听SIGTERM信号失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}

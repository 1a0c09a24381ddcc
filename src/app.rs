use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gnomehat_config::AppConfig;
use gnomehat_dispatcher::{CleanupSweeper, JobScheduler};
use gnomehat_infrastructure::DatabaseManager;
use gnomehat_worker::{resolve_worker_id, JobRunner, ShellRunner, WorkerLifecycle};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::shutdown::ShutdownManager;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行 Worker
    Worker,
    /// 仅运行回收服务
    Sweeper,
    /// 回收服务 + 进程内多个 Worker
    All,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    database: DatabaseManager,
    scheduler: Arc<JobScheduler>,
    runner: Arc<dyn JobRunner>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        let database = DatabaseManager::new(&config.database)
            .await
            .with_context(|| format!("连接数据库失败: {}", config.database.url))?;

        let scheduler = Arc::new(JobScheduler::new(database.job_store(), &config.scheduler));
        let runner: Arc<dyn JobRunner> = Arc::new(ShellRunner::new(&config.worker.log_dir));

        Ok(Self {
            config,
            mode,
            database,
            scheduler,
            runner,
        })
    }

    /// 替换执行器，嵌入式使用和测试时注入
    pub fn with_runner(mut self, runner: Arc<dyn JobRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn scheduler(&self) -> Arc<JobScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.database
    }

    /// 运行到 `signal` 完成或任一组件失败
    ///
    /// 组件在关闭信号之前失败时直接返回该错误，进程以非零状态退出；
    /// 收到信号后广播关闭并在 `shutdown_timeout` 内等待各组件退出。
    pub async fn serve_until<F>(self: Arc<Self>, signal: F, shutdown_timeout: Duration) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let shutdown_manager = ShutdownManager::new();
        let mut app_handle = {
            let app = Arc::clone(&self);
            let shutdown_rx = shutdown_manager.subscribe().await;
            tokio::spawn(async move { app.run(shutdown_rx).await })
        };

        tokio::select! {
            joined = &mut app_handle => {
                return match joined {
                    Ok(Ok(())) => {
                        warn!("没有需要运行的组件，应用退出");
                        Ok(())
                    }
                    Ok(Err(e)) => {
                        error!("应用运行失败: {e:#}");
                        Err(e)
                    }
                    Err(e) => Err(anyhow::Error::new(e).context("应用任务崩溃")),
                };
            }
            _ = signal => {}
        }

        info!("收到关闭信号，开始优雅关闭...");
        shutdown_manager.shutdown().await;

        match tokio::time::timeout(shutdown_timeout, app_handle).await {
            Ok(Ok(result)) => {
                if result.is_ok() {
                    info!("应用已优雅关闭");
                }
                result
            }
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("应用任务崩溃")),
            Err(_) => Err(anyhow::anyhow!("应用关闭超时: {:?}", shutdown_timeout)),
        }
    }

    /// 运行直到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);
        self.database.health_check().await.context("数据库健康检查失败")?;

        let mut tasks = JoinSet::new();

        if matches!(self.mode, AppMode::Sweeper | AppMode::All) {
            if self.config.sweeper.enabled {
                let sweeper = CleanupSweeper::new(
                    self.scheduler.store(),
                    &self.config.scheduler,
                    &self.config.sweeper,
                );
                let shutdown_rx = shutdown_rx.resubscribe();
                tasks.spawn(async move { sweeper.start(shutdown_rx).await });
            } else {
                warn!("回收服务已在配置中禁用，过期任务将不会被重新排队");
            }
        }

        if matches!(self.mode, AppMode::Worker | AppMode::All) {
            for worker_id in self.worker_ids() {
                let worker = WorkerLifecycle::from_config(
                    worker_id,
                    Arc::clone(&self.scheduler),
                    Arc::clone(&self.runner),
                    &self.config.worker,
                );
                let shutdown_rx = shutdown_rx.resubscribe();
                tasks.spawn(async move { worker.run(shutdown_rx).await.map(|_| ()) });
            }
        }

        // 任一组件失败即停止其余组件，整个进程交给守护重启
        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Err(e) if e.is_cancelled() => continue,
                Ok(Err(e)) => {
                    error!("组件异常退出: {}", e);
                    anyhow::Error::new(e).context("组件异常退出")
                }
                Err(e) => {
                    error!("组件任务崩溃: {}", e);
                    anyhow::Error::new(e).context("组件任务崩溃")
                }
            };
            if result.is_ok() {
                tasks.abort_all();
                result = Err(failure);
            }
        }

        self.database.close().await;
        info!("应用程序已停止");
        result
    }

    /// worker 模式只启动一个；all 模式按 concurrency 启动，并加序号区分
    fn worker_ids(&self) -> Vec<String> {
        let base = resolve_worker_id(&self.config.worker.worker_id);
        let count = match self.mode {
            AppMode::All => self.config.worker.concurrency.max(1),
            _ => 1,
        };

        if count == 1 {
            vec![base]
        } else {
            (1..=count).map(|i| format!("{base}-{i}")).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.database.url = "sqlite::memory:".to_string();
        config.worker.worker_id = "box".to_string();
        config
    }

    #[tokio::test]
    async fn test_worker_ids_per_mode() {
        let mut config = memory_config();
        config.worker.concurrency = 3;

        let app = Application::new(config.clone(), AppMode::All).await.unwrap();
        assert_eq!(app.worker_ids(), vec!["box-1", "box-2", "box-3"]);

        let app = Application::new(config, AppMode::Worker).await.unwrap();
        assert_eq!(app.worker_ids(), vec!["box"]);
    }
}

//! 测试环境装配和常用等待模式

use std::sync::Arc;
use std::time::Duration;

use gnomehat_config::SchedulerConfig;
use gnomehat_dispatcher::{JobScheduler, StoreRetryPolicy};
use gnomehat_domain::repositories::JobStore;
use gnomehat_infrastructure::InMemoryJobStore;
use tokio::time::sleep;

/// 测试环境装配
pub struct TestEnv;

impl TestEnv {
    /// 初始化测试日志，每个测试二进制调用一次即可
    pub fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();
    }

    /// 毫秒级退避、无抖动的重试策略
    pub fn fast_retry_policy(max_retries: u32) -> StoreRetryPolicy {
        StoreRetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    /// 基于给定存储的调度器
    pub fn scheduler_over(store: Arc<dyn JobStore>, config: &SchedulerConfig) -> Arc<JobScheduler> {
        Arc::new(JobScheduler::new(store, config).with_retry_policy(Self::fast_retry_policy(3)))
    }

    /// 内存存储 + 调度器
    pub fn memory_scheduler(config: &SchedulerConfig) -> (Arc<dyn JobStore>, Arc<JobScheduler>) {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let scheduler = Self::scheduler_over(Arc::clone(&store), config);
        (store, scheduler)
    }

    /// 轮询等待条件成立，超时返回 false
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }

        false
    }
}

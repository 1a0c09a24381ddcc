use std::future::Future;
use std::time::Duration;

use gnomehat_config::SchedulerConfig;
use gnomehat_errors::{SchedulerError, SchedulerResult};
use rand::Rng;
use tracing::warn;

/// 存储瞬时错误的重试策略
#[derive(Debug, Clone)]
pub struct StoreRetryPolicy {
    /// 首次失败之后的最大重试次数
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for StoreRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(2000),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl StoreRetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_retries: config.store_max_retries,
            initial_backoff: Duration::from_millis(config.store_retry_initial_ms),
            max_backoff: Duration::from_millis(config.store_retry_max_ms),
            ..Self::default()
        }
    }

    /// 不重试，测试中使用
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// 第 `attempt` 次重试前的等待时间（从 0 开始）
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.min(32) as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let jitter = if self.jitter_factor > 0.0 {
            let range = capped * self.jitter_factor;
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_secs_f64((capped + jitter).max(0.0))
    }

    /// 执行存储操作，可重试错误按指数退避重试，耗尽后返回 `StoreUnavailable`
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> SchedulerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SchedulerResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    if attempt >= self.max_retries {
                        return Err(SchedulerError::store_unavailable(format!(
                            "{operation} 重试 {attempt} 次后仍然失败: {e}"
                        )));
                    }
                    let backoff = self.backoff_for(attempt);
                    warn!(
                        "存储操作 {} 失败，{}ms 后重试 ({}/{}): {}",
                        operation,
                        backoff.as_millis(),
                        attempt + 1,
                        self.max_retries,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> StoreRetryPolicy {
        StoreRetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = StoreRetryPolicy {
            jitter_factor: 0.0,
            ..StoreRetryPolicy::default()
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(10), Duration::from_millis(2000));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let policy = StoreRetryPolicy::default();
        for _ in 0..100 {
            let backoff = policy.backoff_for(0);
            assert!(backoff >= Duration::from_millis(90));
            assert!(backoff <= Duration::from_millis(110));
        }
    }

    #[test]
    fn test_from_config() {
        let config = SchedulerConfig {
            store_max_retries: 7,
            store_retry_initial_ms: 50,
            store_retry_max_ms: 500,
            ..SchedulerConfig::default()
        };
        let policy = StoreRetryPolicy::from_config(&config);
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.initial_backoff, Duration::from_millis(50));
        assert_eq!(policy.max_backoff, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_transient_errors_are_hidden() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run("get", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SchedulerError::store_unavailable("database is locked"))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_store_unavailable() {
        let calls = AtomicU32::new(0);
        let result: SchedulerResult<()> = fast_policy(2)
            .run("claim", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SchedulerError::store_unavailable("database is locked"))
            })
            .await;
        assert!(matches!(result, Err(SchedulerError::StoreUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_errors_pass_through() {
        let calls = AtomicU32::new(0);
        let result: SchedulerResult<()> = fast_policy(5)
            .run("get", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SchedulerError::job_not_found(1))
            })
            .await;
        assert!(matches!(result, Err(SchedulerError::JobNotFound { id: 1 })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

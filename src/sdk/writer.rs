//! 远端写入调度器
//!
//! 所有写入都是"尽力而为"：在运行时上异步派发，调用方不等待结果。
//! 默认不重试；失败只记录日志，不回滚本地乐观状态。
//! 通过 [`WritePolicy::with_retry`] 可以显式开启指数退避重试。

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

/// 写入策略
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WritePolicy {
    /// 最大尝试次数（至少 1）
    pub max_attempts: u32,
    /// 首次重试前的等待时间，之后每次翻倍
    pub base_delay: Duration,
}

impl WritePolicy {
    /// 尽力而为：只尝试一次，不重试
    pub fn best_effort() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// 失败后按指数退避重试
    pub fn with_retry(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// 第 `attempt` 次失败后的等待时间（attempt 从 1 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self::best_effort()
    }
}

/// 写入调度器
#[derive(Clone, Debug, Default)]
pub struct WriteDispatcher {
    policy: WritePolicy,
}

impl WriteDispatcher {
    pub fn new(policy: WritePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    /// 派发一次写入，不等待结果
    ///
    /// `make` 每次尝试都会被重新调用以构造新的 future。
    pub fn dispatch<F, Fut>(&self, label: &'static str, make: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let policy = self.policy;
        tokio::spawn(async move {
            run_with_policy(policy, label, make).await;
        });
    }
}

/// 按策略执行写入，返回是否最终成功
pub(crate) async fn run_with_policy<F, Fut>(policy: WritePolicy, label: &'static str, make: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let max = policy.max_attempts.max(1);
    for attempt in 1..=max {
        match make().await {
            Ok(()) => {
                debug!("[Writer] {} 写入成功（第 {} 次尝试）", label, attempt);
                return true;
            }
            Err(e) if attempt < max => {
                let delay = policy.backoff(attempt);
                warn!(
                    "[Writer] {} 写入失败（第 {}/{} 次），{:?} 后重试: {:#}",
                    label, attempt, max, delay, e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(
                    "[Writer] ❌ {} 写入失败，已放弃（共 {} 次尝试）: {:#}",
                    label, max, e
                );
            }
        }
    }
    false
}

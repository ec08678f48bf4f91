use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// 自调节周期任务：每轮执行受超时约束，超时后下一轮延迟翻倍
/// （封顶 interval * backoff_bound），按时完成则回落到名义周期。
/// 心跳和缓存刷新循环都跑在它上面。
#[derive(Debug)]
pub struct TimedSupervisorTask {
    name: String,
    interval: Duration,
    max_delay_ms: u64,
    delay_ms: AtomicU64,
}

impl TimedSupervisorTask {
    pub fn new(name: impl Into<String>, interval: Duration, backoff_bound: u32) -> Self {
        let interval_ms = interval.as_millis() as u64;
        Self {
            name: name.into(),
            interval,
            max_delay_ms: interval_ms * u64::from(backoff_bound.max(1)),
            delay_ms: AtomicU64::new(interval_ms),
        }
    }

    pub fn current_delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.load(Ordering::SeqCst))
    }

    /// 执行一轮任务并根据耗时调整下一轮延迟，返回本轮是否按时完成
    pub async fn execute<Fut>(&self, task: Fut) -> bool
    where
        Fut: Future<Output = ()>,
    {
        match tokio::time::timeout(self.interval, task).await {
            Ok(()) => {
                // 按时完成，延迟回落到名义周期
                self.delay_ms
                    .store(self.interval.as_millis() as u64, Ordering::SeqCst);
                true
            }
            Err(_) => {
                let current = self.delay_ms.load(Ordering::SeqCst);
                let next = current.saturating_mul(2).min(self.max_delay_ms);
                self.delay_ms.store(next, Ordering::SeqCst);
                tracing::warn!(
                    task_name = %self.name,
                    next_delay_ms = next,
                    "Supervised task exceeded its budget, backing off"
                );
                false
            }
        }
    }

    /// 在tracker上启动调度循环。停止信号在两轮之间检查，
    /// 进行中的一轮自然跑完，不会被打断。
    pub fn spawn<F, Fut>(self: Arc<Self>, tracker: &TaskTracker, cancel: CancellationToken, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        tracker.spawn(async move {
            loop {
                let delay = self.current_delay();
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(task_name = %self.name, "Supervised task cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {
                        self.execute(task()).await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delay_doubles_on_timeout_and_resets_on_completion() {
        let task = TimedSupervisorTask::new("test", Duration::from_millis(20), 4);
        assert_eq!(task.current_delay(), Duration::from_millis(20));

        assert!(!task.execute(tokio::time::sleep(Duration::from_millis(200))).await);
        assert_eq!(task.current_delay(), Duration::from_millis(40));

        assert!(!task.execute(tokio::time::sleep(Duration::from_millis(200))).await);
        assert_eq!(task.current_delay(), Duration::from_millis(80));

        // 封顶 interval * bound
        assert!(!task.execute(tokio::time::sleep(Duration::from_millis(200))).await);
        assert_eq!(task.current_delay(), Duration::from_millis(80));

        assert!(task.execute(async {}).await);
        assert_eq!(task.current_delay(), Duration::from_millis(20));
    }
}

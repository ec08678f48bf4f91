use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// 滚动一分钟计数器：双桶结构，当前桶累加，
/// 读取总是返回上一个完整桶，避免读到只过了半分钟的偏低值。
#[derive(Debug)]
pub struct MeasuredRate {
    current: AtomicU64,
    previous: AtomicU64,
    interval: Duration,
}

impl MeasuredRate {
    pub fn new(interval: Duration) -> Self {
        Self {
            current: AtomicU64::new(0),
            previous: AtomicU64::new(0),
            interval,
        }
    }

    /// 每分钟一次的默认节奏
    pub fn per_minute() -> Self {
        Self::new(Duration::from_secs(60))
    }

    pub fn increment(&self) {
        self.current.fetch_add(1, Ordering::SeqCst);
    }

    /// 上一个完整周期内的计数
    pub fn count(&self) -> u64 {
        self.previous.load(Ordering::SeqCst)
    }

    /// 翻转桶：当前桶归零并成为上一个完整桶
    pub fn tick(&self) {
        let finished = self.current.swap(0, Ordering::SeqCst);
        self.previous.store(finished, Ordering::SeqCst);
    }

    /// 启动周期翻转任务
    pub fn start(self: &Arc<Self>, tracker: &TaskTracker, cancel: CancellationToken) {
        let rate = self.clone();
        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(rate.interval);
            // 第一个tick立即返回，跳过
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => rate.tick(),
                }
            }
        });
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::model::InstanceStatus;

use super::engine::RegistryClient;
use super::health::HealthCheckHandler;

/// 令牌桶限流器，约束按需注册的突发频率。
/// 桶容量即突发额度，令牌按平均速率（额度/周期）连续补充。
#[derive(Debug)]
pub struct RateLimiter {
    burst: f64,
    refill_per_sec: f64,
    inner: std::sync::Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(burst: u32, period: Duration) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            burst,
            refill_per_sec: burst / period.as_secs_f64().max(f64::MIN_POSITIVE),
            inner: std::sync::Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.burst);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// 实例信息复制器：周期性把本实例的健康状态和脏记录推送到服务端。
/// 状态变更可通过on_demand_update提前触发一轮，受令牌桶限流。
pub struct InstanceInfoReplicator {
    client: Arc<RegistryClient>,
    health: Arc<dyn HealthCheckHandler>,
    period: Duration,
    initial_delay: Duration,
    burst_limiter: RateLimiter,
    on_demand: tokio::sync::Notify,
    started: AtomicBool,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl InstanceInfoReplicator {
    pub fn new(client: Arc<RegistryClient>, health: Arc<dyn HealthCheckHandler>) -> Self {
        let config = client.config().clone();
        Self {
            client,
            health,
            period: config.instance_replication_interval(),
            initial_delay: config.initial_instance_replication_delay(),
            burst_limiter: RateLimiter::new(
                config.on_demand_update_burst,
                config.instance_replication_interval(),
            ),
            on_demand: tokio::sync::Notify::new(),
            started: AtomicBool::new(false),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// 启动复制循环。首轮前先置脏，保证启动后至少注册一次。
    pub fn start(self: &Arc<Self>) {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.client.local_instance().set_dirty();

        let this = self.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => return,
                _ = tokio::time::sleep(this.initial_delay) => {}
            }
            loop {
                this.run().await;
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = tokio::time::sleep(this.period) => {}
                    // 按需触发提前进入下一轮
                    _ = this.on_demand.notified() => {
                        tracing::debug!("Running an on-demand instance info replication");
                    }
                }
            }
        });
    }

    /// 状态变更后的按需推送。超出突发额度时放弃本次触发，
    /// 变更仍会在下一个常规周期被推送出去。
    pub fn on_demand_update(&self) -> bool {
        if !self.burst_limiter.try_acquire() {
            tracing::warn!("Ignoring an on-demand update due to rate limiting");
            return false;
        }
        if !self.started.load(Ordering::SeqCst) {
            tracing::warn!("Ignoring an on-demand update, replicator not started");
            return false;
        }
        self.on_demand.notify_one();
        true
    }

    /// 本地状态变更入口：更新自报状态，真的变了就按需触发一轮推送
    pub fn notify_status_change(&self, status: InstanceStatus) {
        if self.client.local_instance().set_status(status).is_some() {
            self.on_demand_update();
        }
    }

    /// 单轮：刷新健康状态，有脏记录则注册并按时间戳清脏
    pub async fn run(&self) {
        let local = self.client.local_instance();
        let refreshed = match self.health.status(local.status()) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(error = %e, "Health check handler failed, marking instance DOWN");
                InstanceStatus::Down
            }
        };
        local.set_status(refreshed);

        if local.is_dirty() {
            let timestamp = local.dirty_timestamp();
            match self.client.register().await {
                Ok(true) => local.unset_dirty(timestamp),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "There was a problem with the instance info replication");
                }
            }
        }
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::client::RegistryClient;
use crate::config::ServerConfig;
use crate::model::{Applications, InstanceRecord, InstanceStatus, now_millis};

use super::peer::{PeerNode, PeerNodes};
use super::rate::MeasuredRate;
use super::store::RegistryStore;

/// 本地注册表快照来源，由本服务器自身的客户端角色提供。
/// 启动同步和续约阈值重算都从这里读数。
pub trait SnapshotSource: Send + Sync {
    fn applications(&self) -> Arc<Applications>;
}

impl SnapshotSource for RegistryClient {
    fn applications(&self) -> Arc<Applications> {
        RegistryClient::applications(self)
    }
}

/// 复制到对等节点的注册表变更
#[derive(Debug, Clone)]
pub enum ReplicationAction {
    Register(InstanceRecord),
    Heartbeat {
        app_name: String,
        instance_id: String,
        record: Option<InstanceRecord>,
    },
    Cancel {
        app_name: String,
        instance_id: String,
    },
    StatusUpdate {
        app_name: String,
        instance_id: String,
        new_status: InstanceStatus,
    },
    DeleteStatusOverride {
        app_name: String,
        instance_id: String,
    },
}

impl ReplicationAction {
    fn kind(&self) -> &'static str {
        match self {
            ReplicationAction::Register(_) => "register",
            ReplicationAction::Heartbeat { .. } => "heartbeat",
            ReplicationAction::Cancel { .. } => "cancel",
            ReplicationAction::StatusUpdate { .. } => "status-update",
            ReplicationAction::DeleteStatusOverride { .. } => "delete-status-override",
        }
    }
}

#[derive(Debug)]
struct RenewalState {
    /// 当前认为会按时续约的客户端数量
    expected_clients: u64,
    /// 每分钟最低续约数阈值，低于它进入自我保护
    threshold: u64,
}

/// 对等感知注册表：变更先落本地存储，成功后异步扇出到所有对等节点。
/// 入站复制流量只落地不再扇出，防止复制环路。
pub struct PeerAwareRegistry {
    config: ServerConfig,
    local_region: String,
    store: Arc<RegistryStore>,
    peers: Arc<PeerNodes>,
    snapshot_source: Arc<dyn SnapshotSource>,
    renewal_state: std::sync::Mutex<RenewalState>,
    replications_last_min: Arc<MeasuredRate>,
    startup_timestamp: AtomicU64,
    // 启动同步没拿到任何实例时为true，期间拒绝对外读
    peer_sync_empty: AtomicBool,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl PeerAwareRegistry {
    pub fn new(
        config: ServerConfig,
        local_region: impl Into<String>,
        store: Arc<RegistryStore>,
        peers: Arc<PeerNodes>,
        snapshot_source: Arc<dyn SnapshotSource>,
    ) -> Self {
        Self {
            config,
            local_region: local_region.into(),
            store,
            peers,
            snapshot_source,
            renewal_state: std::sync::Mutex::new(RenewalState {
                expected_clients: 0,
                threshold: 0,
            }),
            replications_last_min: Arc::new(MeasuredRate::per_minute()),
            startup_timestamp: AtomicU64::new(0),
            peer_sync_empty: AtomicBool::new(true),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    pub fn expected_clients(&self) -> u64 {
        self.lock_renewal_state().expected_clients
    }

    pub fn renewal_threshold(&self) -> u64 {
        self.lock_renewal_state().threshold
    }

    pub fn replications_last_min(&self) -> u64 {
        self.replications_last_min.count()
    }

    /// 注册：全新租约在开门后提升预期续约数
    pub fn register(&self, record: InstanceRecord, is_replication: bool) {
        let is_new = self.store.register(record.clone());
        if is_new {
            let mut state = self.lock_renewal_state();
            if state.expected_clients > 0 {
                state.expected_clients += 1;
                self.recompute_threshold(&mut state);
            }
        }
        self.replicate_to_peers(ReplicationAction::Register(record), is_replication);
    }

    /// 心跳续约，本地成功后才扇出
    pub fn renew(&self, app_name: &str, instance_id: &str, is_replication: bool) -> bool {
        let renewed = self.store.renew(app_name, instance_id);
        if renewed {
            self.replicate_to_peers(
                ReplicationAction::Heartbeat {
                    app_name: app_name.to_string(),
                    instance_id: instance_id.to_string(),
                    record: self.store.get_lease(app_name, instance_id).map(|l| l.holder().clone()),
                },
                is_replication,
            );
        }
        renewed
    }

    /// 下线：成功后降低预期续约数并扇出
    pub fn cancel(&self, app_name: &str, instance_id: &str, is_replication: bool) -> bool {
        let cancelled = self.store.cancel(app_name, instance_id);
        if cancelled {
            {
                let mut state = self.lock_renewal_state();
                if state.expected_clients > 0 {
                    state.expected_clients -= 1;
                    self.recompute_threshold(&mut state);
                }
            }
            self.replicate_to_peers(
                ReplicationAction::Cancel {
                    app_name: app_name.to_string(),
                    instance_id: instance_id.to_string(),
                },
                is_replication,
            );
        }
        cancelled
    }

    pub fn status_update(
        &self,
        app_name: &str,
        instance_id: &str,
        new_status: InstanceStatus,
        is_replication: bool,
    ) -> bool {
        let updated = self.store.status_update(app_name, instance_id, new_status);
        if updated {
            self.replicate_to_peers(
                ReplicationAction::StatusUpdate {
                    app_name: app_name.to_string(),
                    instance_id: instance_id.to_string(),
                    new_status,
                },
                is_replication,
            );
        }
        updated
    }

    pub fn delete_status_override(
        &self,
        app_name: &str,
        instance_id: &str,
        is_replication: bool,
    ) -> bool {
        let deleted = self.store.delete_status_override(app_name, instance_id);
        if deleted {
            self.replicate_to_peers(
                ReplicationAction::DeleteStatusOverride {
                    app_name: app_name.to_string(),
                    instance_id: instance_id.to_string(),
                },
                is_replication,
            );
        }
        deleted
    }

    /// 扇出一条变更。入站复制流量只计数不再扇出；
    /// 单个节点失败只记日志，不影响本地结果和其他节点。
    fn replicate_to_peers(&self, action: ReplicationAction, is_replication: bool) {
        if is_replication {
            self.replications_last_min.increment();
            return;
        }
        let peers = self.peers.replication_targets();
        if peers.is_empty() {
            return;
        }
        self.tracker.spawn(async move {
            let tasks = peers.iter().map(|peer| Self::replicate_to_peer(peer, &action));
            join_all(tasks).await;
        });
    }

    async fn replicate_to_peer(peer: &Arc<dyn PeerNode>, action: &ReplicationAction) {
        let result = match action {
            ReplicationAction::Register(record) => peer.register(record).await,
            ReplicationAction::Heartbeat {
                app_name,
                instance_id,
                record,
            } => peer.heartbeat(app_name, instance_id, record.as_ref()).await,
            ReplicationAction::Cancel {
                app_name,
                instance_id,
            } => peer.cancel(app_name, instance_id).await,
            ReplicationAction::StatusUpdate {
                app_name,
                instance_id,
                new_status,
            } => peer.status_update(app_name, instance_id, *new_status).await,
            ReplicationAction::DeleteStatusOverride {
                app_name,
                instance_id,
            } => peer.delete_status_override(app_name, instance_id).await,
        };
        if let Err(e) = result {
            tracing::error!(
                peer_url = %peer.url(),
                action = action.kind(),
                error = %e,
                "Replication to peer failed"
            );
        }
    }

    /// 自我保护开关：自我保护被管理员关闭时总是允许剔除；
    /// 否则最近一分钟的实际续约数必须仍在阈值之上。
    pub fn is_lease_expiration_enabled(&self) -> bool {
        if !self.config.self_preservation_enabled {
            return true;
        }
        let threshold = self.lock_renewal_state().threshold;
        threshold > 0 && self.store.renews_last_min().count() > threshold
    }

    /// 自我保护是否正在生效（运维可观测）
    pub fn is_self_preservation_active(&self) -> bool {
        self.config.self_preservation_enabled && !self.is_lease_expiration_enabled()
    }

    /// 启动同步：从本机客户端角色的快照把整个注册表灌进本地存储。
    /// 专走本地落库路径，不扇出也不计入复制流量。
    /// 快照为空时按配置的次数和间隔重试，用尽后带空注册表继续启动。
    pub async fn sync_up(&self) -> u64 {
        let mut count = 0u64;
        for attempt in 1..=self.config.registry_sync_retries.max(1) {
            if count > 0 {
                break;
            }
            if attempt > 1 {
                tracing::info!(
                    attempt,
                    "Registry sync found no instances, retrying after wait"
                );
                tokio::time::sleep(self.config.registry_sync_retry_wait()).await;
            }
            let apps = self.snapshot_source.applications();
            for record in apps.iter_instances() {
                if self.is_registerable(record) {
                    self.register_local_only(record.clone());
                    count += 1;
                }
            }
        }
        tracing::info!(instance_count = count, "Finished syncing registry from neighboring peers");
        count
    }

    fn register_local_only(&self, record: InstanceRecord) {
        self.store.register(record);
    }

    /// 开门接客：以同步到的实例数初始化预期续约数和阈值，
    /// 记录启动时间，并启动剔除/计数/阈值重算等后台任务
    pub fn open_for_traffic(self: &Arc<Self>, count: u64) {
        {
            let mut state = self.lock_renewal_state();
            state.expected_clients = count;
            self.recompute_threshold(&mut state);
            tracing::info!(
                expected_clients = count,
                threshold = state.threshold,
                "Opening registry for traffic"
            );
        }
        self.startup_timestamp.store(now_millis(), Ordering::SeqCst);
        if count > 0 {
            self.peer_sync_empty.store(false, Ordering::SeqCst);
        }
        self.start_background_tasks();
    }

    /// 启动同步为空时，在宽限期内拒绝对外读，
    /// 避免把"什么都没注册"的假象端出去
    pub fn should_allow_access(&self) -> bool {
        if !self.peer_sync_empty.load(Ordering::SeqCst) {
            return true;
        }
        let startup = self.startup_timestamp.load(Ordering::SeqCst);
        now_millis() > startup + self.config.wait_time_when_sync_empty_ms()
    }

    /// 带外区标签的实例不归本服务器管
    pub fn is_registerable(&self, record: &InstanceRecord) -> bool {
        record
            .region
            .as_deref()
            .is_none_or(|r| r == self.local_region)
    }

    /// 周期重算预期续约数：从客户端快照重新点数。
    /// 阈值只升不降，除非自我保护被管理员关闭。
    pub fn update_renewal_threshold(&self) {
        let apps = self.snapshot_source.applications();
        let count = apps
            .iter_instances()
            .filter(|r| self.is_registerable(r))
            .count() as u64;

        let mut state = self.lock_renewal_state();
        if count as f64 > self.config.renewal_percent_threshold * state.expected_clients as f64
            || !self.config.self_preservation_enabled
        {
            state.expected_clients = count;
            self.recompute_threshold(&mut state);
        }
        tracing::info!(
            expected_clients = state.expected_clients,
            threshold = state.threshold,
            "Current renewal threshold"
        );
    }

    fn start_background_tasks(self: &Arc<Self>) {
        self.store
            .renews_last_min()
            .start(&self.tracker, self.cancel.clone());
        self.replications_last_min
            .start(&self.tracker, self.cancel.clone());

        let registry = self.clone();
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(registry.config.eviction_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = registry.cancel.cancelled() => break,
                    _ = ticker.tick() => registry.run_eviction_sweep(),
                }
            }
        });

        let registry = self.clone();
        self.tracker.spawn(async move {
            let mut ticker =
                tokio::time::interval(registry.config.renewal_threshold_update_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = registry.cancel.cancelled() => break,
                    _ = ticker.tick() => registry.update_renewal_threshold(),
                }
            }
        });
    }

    fn run_eviction_sweep(&self) {
        if !self.is_lease_expiration_enabled() {
            tracing::info!("Lease expiration is currently disabled, skipping the eviction sweep");
            return;
        }
        let evicted = self.store.evict(self.config.eviction_grace_ms());
        if !evicted.is_empty() {
            tracing::info!(evicted = evicted.len(), "Eviction sweep removed expired leases");
        }
    }

    pub async fn shutdown(&self) {
        tracing::info!("Shutting down peer aware registry");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn lock_renewal_state(&self) -> std::sync::MutexGuard<'_, RenewalState> {
        self.renewal_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 默认30秒心跳即每分钟两次，公式里的×2保持固定常数
    fn recompute_threshold(&self, state: &mut RenewalState) {
        state.threshold =
            (state.expected_clients as f64 * self.config.renewal_percent_threshold * 2.0) as u64;
    }
}

impl std::fmt::Debug for PeerAwareRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerAwareRegistry")
            .field("local_region", &self.local_region)
            .field("lease_count", &self.store.lease_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstanceStatus;

    struct FixedSnapshot(Arc<Applications>);

    impl SnapshotSource for FixedSnapshot {
        fn applications(&self) -> Arc<Applications> {
            self.0.clone()
        }
    }

    fn registry_with(config: ServerConfig, snapshot: Applications) -> Arc<PeerAwareRegistry> {
        Arc::new(PeerAwareRegistry::new(
            config,
            "default",
            Arc::new(RegistryStore::new()),
            Arc::new(PeerNodes::new("http://self")),
            Arc::new(FixedSnapshot(Arc::new(snapshot))),
        ))
    }

    fn record(app: &str, id: &str) -> InstanceRecord {
        let mut r = InstanceRecord::new(app, id);
        r.status = InstanceStatus::Up;
        r
    }

    #[tokio::test]
    async fn threshold_follows_expected_clients() {
        let registry = registry_with(ServerConfig::default(), Applications::new());
        registry.open_for_traffic(10);
        // 10 * 0.85 * 2 = 17
        assert_eq!(registry.renewal_threshold(), 17);

        registry.register(record("app-a", "i-1"), false);
        assert_eq!(registry.expected_clients(), 11);

        registry.register(record("app-a", "i-1"), false);
        // 重复注册不是新租约，预期数不变
        assert_eq!(registry.expected_clients(), 11);

        assert!(registry.cancel("app-a", "i-1", false));
        assert_eq!(registry.expected_clients(), 10);
        assert_eq!(registry.renewal_threshold(), 17);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn lease_expiration_disabled_below_threshold() {
        let registry = registry_with(ServerConfig::default(), Applications::new());
        registry.open_for_traffic(5);
        // 阈值 5 * 0.85 * 2 = 8，上一分钟0次续约，进入自我保护
        assert!(!registry.is_lease_expiration_enabled());
        assert!(registry.is_self_preservation_active());

        registry.register(record("app-a", "i-1"), false);
        for _ in 0..9 {
            assert!(registry.renew("app-a", "i-1", false));
        }
        registry.store().renews_last_min().tick();
        assert!(registry.is_lease_expiration_enabled());
        assert!(!registry.is_self_preservation_active());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_self_preservation_always_allows_expiration() {
        let config = ServerConfig {
            self_preservation_enabled: false,
            ..ServerConfig::default()
        };
        let registry = registry_with(config, Applications::new());
        registry.open_for_traffic(100);
        assert!(registry.is_lease_expiration_enabled());
        assert!(!registry.is_self_preservation_active());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn threshold_recount_never_lowers_the_bar() {
        let mut snapshot = Applications::new();
        snapshot
            .get_or_create_application("app-a")
            .add_instance(record("app-a", "i-1"));
        let registry = registry_with(ServerConfig::default(), snapshot);
        registry.open_for_traffic(10);
        assert_eq!(registry.renewal_threshold(), 17);

        // 快照里只剩1个实例，1 <= 0.85*10，不降阈值
        registry.update_renewal_threshold();
        assert_eq!(registry.expected_clients(), 10);
        assert_eq!(registry.renewal_threshold(), 17);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn access_denied_while_sync_empty_within_grace() {
        let config = ServerConfig {
            wait_time_when_sync_empty: 300,
            ..ServerConfig::default()
        };
        let registry = registry_with(config, Applications::new());
        registry.open_for_traffic(0);
        assert!(!registry.should_allow_access());
        registry.shutdown().await;

        let config = ServerConfig {
            wait_time_when_sync_empty: 0,
            ..ServerConfig::default()
        };
        let registry = registry_with(config, Applications::new());
        registry.open_for_traffic(0);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(registry.should_allow_access());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn foreign_region_instances_are_not_registerable() {
        let registry = registry_with(ServerConfig::default(), Applications::new());
        let mut foreign = record("app-a", "i-1");
        foreign.region = Some("other".to_string());
        assert!(!registry.is_registerable(&foreign));

        let mut local = record("app-a", "i-2");
        local.region = Some("default".to_string());
        assert!(registry.is_registerable(&local));
        assert!(registry.is_registerable(&record("app-a", "i-3")));
        registry.shutdown().await;
    }

    struct SequencedSnapshot(std::sync::Mutex<std::collections::VecDeque<Applications>>);

    impl SnapshotSource for SequencedSnapshot {
        fn applications(&self) -> Arc<Applications> {
            Arc::new(
                self.0
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_default(),
            )
        }
    }

    #[tokio::test]
    async fn sync_up_retries_until_the_peer_snapshot_has_instances() {
        let mut populated = Applications::new();
        populated
            .get_or_create_application("app-a")
            .add_instance(record("app-a", "i-1"));
        // 前两轮快照为空，第三轮才拿到实例
        let source = SequencedSnapshot(std::sync::Mutex::new(std::collections::VecDeque::from([
            Applications::new(),
            Applications::new(),
            populated,
        ])));

        let config = ServerConfig {
            registry_sync_retries: 5,
            registry_sync_retry_wait: 0,
            ..ServerConfig::default()
        };
        let registry = Arc::new(PeerAwareRegistry::new(
            config,
            "default",
            Arc::new(RegistryStore::new()),
            Arc::new(PeerNodes::new("http://self")),
            Arc::new(source),
        ));

        assert_eq!(registry.sync_up().await, 1);
        assert_eq!(registry.store().lease_count(), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn inbound_replication_traffic_is_counted() {
        let registry = registry_with(ServerConfig::default(), Applications::new());
        registry.register(record("app-a", "i-1"), true);
        assert!(registry.renew("app-a", "i-1", true));
        assert!(registry.cancel("app-a", "i-1", true));

        registry.replications_last_min.tick();
        assert_eq!(registry.replications_last_min(), 3);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn sync_up_uses_the_snapshot_and_skips_foreign_regions() {
        let mut snapshot = Applications::new();
        let app = snapshot.get_or_create_application("app-a");
        app.add_instance(record("app-a", "i-1"));
        let mut foreign = record("app-a", "i-2");
        foreign.region = Some("other".to_string());
        app.add_instance(foreign);

        let config = ServerConfig {
            registry_sync_retries: 1,
            ..ServerConfig::default()
        };
        let registry = registry_with(config, snapshot);
        let count = registry.sync_up().await;
        assert_eq!(count, 1);
        assert!(registry.store().get_lease("app-a", "i-1").is_some());
        assert!(registry.store().get_lease("app-a", "i-2").is_none());
        registry.shutdown().await;
    }
}

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use peer_registry::client::TransportError;
use peer_registry::cluster::{PeerAwareRegistry, PeerNode, PeerNodes, RegistryStore, SnapshotSource};
use peer_registry::config::ServerConfig;
use peer_registry::model::{Applications, InstanceRecord, InstanceStatus};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 记录收到的复制调用的对等节点，可配置为总是失败
struct RecordingPeer {
    url: String,
    fail: bool,
    calls: Mutex<Vec<String>>,
}

impl RecordingPeer {
    fn new(url: &str) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            fail: false,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn failing(url: &str) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            fail: true,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, call: String) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::Connection("peer unreachable".into()));
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerNode for RecordingPeer {
    fn url(&self) -> &str {
        &self.url
    }

    async fn register(&self, record: &InstanceRecord) -> Result<(), TransportError> {
        self.record(format!("register:{}/{}", record.app_name, record.instance_id))
    }

    async fn heartbeat(
        &self,
        app_name: &str,
        instance_id: &str,
        _record: Option<&InstanceRecord>,
    ) -> Result<(), TransportError> {
        self.record(format!("heartbeat:{app_name}/{instance_id}"))
    }

    async fn cancel(&self, app_name: &str, instance_id: &str) -> Result<(), TransportError> {
        self.record(format!("cancel:{app_name}/{instance_id}"))
    }

    async fn status_update(
        &self,
        app_name: &str,
        instance_id: &str,
        new_status: InstanceStatus,
    ) -> Result<(), TransportError> {
        self.record(format!("status-update:{app_name}/{instance_id}/{new_status}"))
    }

    async fn delete_status_override(
        &self,
        app_name: &str,
        instance_id: &str,
    ) -> Result<(), TransportError> {
        self.record(format!("delete-status-override:{app_name}/{instance_id}"))
    }
}

struct EmptySnapshot;

impl SnapshotSource for EmptySnapshot {
    fn applications(&self) -> Arc<Applications> {
        Arc::new(Applications::new())
    }
}

fn up_record(app: &str, id: &str) -> InstanceRecord {
    let mut record = InstanceRecord::new(app, id);
    record.status = InstanceStatus::Up;
    record
}

fn registry_with_peers(peers: Vec<Arc<dyn PeerNode>>) -> Arc<PeerAwareRegistry> {
    let nodes = Arc::new(PeerNodes::new("http://self"));
    nodes.update(peers);
    Arc::new(PeerAwareRegistry::new(
        ServerConfig::default(),
        "default",
        Arc::new(RegistryStore::new()),
        nodes,
        Arc::new(EmptySnapshot),
    ))
}

#[tokio::test]
async fn client_mutations_fan_out_to_all_peers_except_self() {
    init_tracing();
    let self_peer = RecordingPeer::new("http://self");
    let peer_a = RecordingPeer::new("http://peer-a");
    let peer_b = RecordingPeer::new("http://peer-b");
    let registry = registry_with_peers(vec![
        self_peer.clone() as Arc<dyn PeerNode>,
        peer_a.clone(),
        peer_b.clone(),
    ]);

    registry.register(up_record("app-a", "i-1"), false);
    assert!(registry.renew("app-a", "i-1", false));
    assert!(registry.status_update("app-a", "i-1", InstanceStatus::OutOfService, false));
    assert!(registry.delete_status_override("app-a", "i-1", false));
    assert!(registry.cancel("app-a", "i-1", false));

    // shutdown等待扇出任务全部跑完
    registry.shutdown().await;

    let expected = vec![
        "register:APP-A/i-1".to_string(),
        "heartbeat:APP-A/i-1".to_string(),
        "status-update:APP-A/i-1/OUT_OF_SERVICE".to_string(),
        "delete-status-override:APP-A/i-1".to_string(),
        "cancel:APP-A/i-1".to_string(),
    ];
    assert_eq!(peer_a.calls(), expected);
    assert_eq!(peer_b.calls(), expected);
    // 本机URL被排除在扇出之外
    assert!(self_peer.calls().is_empty());
}

#[tokio::test]
async fn replication_traffic_is_not_fanned_out_again() {
    init_tracing();
    let peer_a = RecordingPeer::new("http://peer-a");
    let registry = registry_with_peers(vec![peer_a.clone() as Arc<dyn PeerNode>]);

    // 来自对等节点的复制流量只落本地，不再扇出
    registry.register(up_record("app-a", "i-1"), true);
    assert!(registry.renew("app-a", "i-1", true));
    assert!(registry.cancel("app-a", "i-1", true));

    registry.shutdown().await;
    assert!(peer_a.calls().is_empty());
}

#[tokio::test]
async fn one_failing_peer_does_not_block_the_others() {
    init_tracing();
    let bad = RecordingPeer::failing("http://peer-bad");
    let good = RecordingPeer::new("http://peer-good");
    let registry = registry_with_peers(vec![bad.clone() as Arc<dyn PeerNode>, good.clone()]);

    registry.register(up_record("app-a", "i-1"), false);
    registry.shutdown().await;

    // 本地变更已生效，健康节点照常收到复制
    assert!(registry.store().get_lease("app-a", "i-1").is_some());
    assert_eq!(good.calls(), vec!["register:APP-A/i-1".to_string()]);
}

#[tokio::test]
async fn failed_local_apply_is_not_replicated() {
    init_tracing();
    let peer_a = RecordingPeer::new("http://peer-a");
    let registry = registry_with_peers(vec![peer_a.clone() as Arc<dyn PeerNode>]);

    // 本地没有这条租约，续约/下线失败，不应产生扇出
    assert!(!registry.renew("app-a", "i-404", false));
    assert!(!registry.cancel("app-a", "i-404", false));
    assert!(!registry.status_update("app-a", "i-404", InstanceStatus::Down, false));

    registry.shutdown().await;
    assert!(peer_a.calls().is_empty());
}

#[tokio::test]
async fn membership_update_resizes_the_fan_out_set() {
    init_tracing();
    let peer_a = RecordingPeer::new("http://peer-a");
    let peer_b = RecordingPeer::new("http://peer-b");
    let nodes = Arc::new(PeerNodes::new("http://self"));
    nodes.update(vec![peer_a.clone() as Arc<dyn PeerNode>]);
    let registry = Arc::new(PeerAwareRegistry::new(
        ServerConfig::default(),
        "default",
        Arc::new(RegistryStore::new()),
        nodes.clone(),
        Arc::new(EmptySnapshot),
    ));

    registry.register(up_record("app-a", "i-1"), false);
    // 成员变更后，新节点开始收到后续变更
    nodes.update(vec![peer_a.clone() as Arc<dyn PeerNode>, peer_b.clone()]);
    registry.register(up_record("app-a", "i-2"), false);

    registry.shutdown().await;
    assert_eq!(
        peer_a.calls(),
        vec!["register:APP-A/i-1".to_string(), "register:APP-A/i-2".to_string()]
    );
    assert_eq!(peer_b.calls(), vec!["register:APP-A/i-2".to_string()]);
}

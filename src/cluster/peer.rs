use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;

use crate::client::TransportError;
use crate::model::{InstanceRecord, InstanceStatus};

/// 单个对等节点的复制操作契约，具体传输绑定由外部实现
#[async_trait]
pub trait PeerNode: Send + Sync {
    fn url(&self) -> &str;

    async fn register(&self, record: &InstanceRecord) -> Result<(), TransportError>;

    async fn heartbeat(
        &self,
        app_name: &str,
        instance_id: &str,
        record: Option<&InstanceRecord>,
    ) -> Result<(), TransportError>;

    async fn cancel(&self, app_name: &str, instance_id: &str) -> Result<(), TransportError>;

    async fn status_update(
        &self,
        app_name: &str,
        instance_id: &str,
        new_status: InstanceStatus,
    ) -> Result<(), TransportError>;

    async fn delete_status_override(
        &self,
        app_name: &str,
        instance_id: &str,
    ) -> Result<(), TransportError>;
}

/// 对等节点目录。成员列表整体原子替换，
/// 扇出时取当前列表并排除本机URL。
pub struct PeerNodes {
    self_url: String,
    peers: ArcSwap<Vec<Arc<dyn PeerNode>>>,
}

impl PeerNodes {
    pub fn new(self_url: impl Into<String>) -> Self {
        Self {
            self_url: self_url.into(),
            peers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn self_url(&self) -> &str {
        &self.self_url
    }

    /// 成员变更：整体替换节点列表
    pub fn update(&self, peers: Vec<Arc<dyn PeerNode>>) {
        tracing::info!(peer_count = peers.len(), "Updated peer node membership");
        self.peers.store(Arc::new(peers));
    }

    /// 当前复制扇出目标，不含本机
    pub fn replication_targets(&self) -> Vec<Arc<dyn PeerNode>> {
        self.peers
            .load()
            .iter()
            .filter(|p| p.url() != self.self_url)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.load().is_empty()
    }
}

impl std::fmt::Debug for PeerNodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerNodes")
            .field("self_url", &self.self_url)
            .field("peer_count", &self.len())
            .finish()
    }
}

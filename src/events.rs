use std::sync::{Arc, RwLock};

use crate::model::InstanceStatus;

/// 注册表客户端对外广播的事件
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// 一次缓存刷新（全量或增量）完成
    CacheRefreshed,
    /// 在刷新后的快照中观察到本实例的远端状态发生变化
    RemoteStatusChanged {
        previous: InstanceStatus,
        current: InstanceStatus,
    },
}

/// 事件订阅者。返回错误只会被记录，不会中断发布方的刷新周期。
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &RegistryEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// 显式订阅者列表，同步fire-and-forget发布
#[derive(Default)]
pub struct EventListeners {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn EventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn publish(&self, event: &RegistryEvent) {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            if let Err(e) = listener.on_event(event) {
                tracing::warn!(error = %e, event = ?event, "Event listener failed, continuing");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListeners").field("count", &self.len()).finish()
    }
}

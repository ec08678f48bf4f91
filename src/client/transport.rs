use async_trait::async_trait;

use crate::model::{Applications, InstanceRecord, InstanceStatus};

/// 传输层错误（超时、连接失败等），由调用方按调度周期恢复
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Timeout error")]
    Timeout,
    #[error("Server error: {0}")]
    Server(String),
}

/// 边界操作的结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    /// 注册被接受
    NoContent,
    /// 租约不存在，续约方收到后需要重新注册
    NotFound,
    Other(u16),
}

impl StatusCode {
    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Ok | StatusCode::NoContent)
    }
}

/// 注册中心传输契约。具体编码和HTTP绑定由外部实现，
/// 客户端引擎和集群同步都只依赖该接口。
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    async fn register(&self, record: &InstanceRecord) -> Result<StatusCode, TransportError>;

    /// 心跳续约；服务端持有更新记录时随响应带回
    async fn renew(
        &self,
        app_name: &str,
        instance_id: &str,
        record: Option<&InstanceRecord>,
    ) -> Result<(StatusCode, Option<InstanceRecord>), TransportError>;

    async fn cancel(&self, app_name: &str, instance_id: &str) -> Result<StatusCode, TransportError>;

    /// 全量拉取
    async fn get_applications(
        &self,
        regions: &[String],
    ) -> Result<(StatusCode, Option<Applications>), TransportError>;

    /// 增量拉取；服务端无可用增量时返回None
    async fn get_delta(
        &self,
        regions: &[String],
    ) -> Result<(StatusCode, Option<Applications>), TransportError>;

    /// 按VIP地址做全量拉取
    async fn get_vip(
        &self,
        vip_address: &str,
        regions: &[String],
    ) -> Result<(StatusCode, Option<Applications>), TransportError>;

    async fn status_update(
        &self,
        app_name: &str,
        instance_id: &str,
        new_status: InstanceStatus,
    ) -> Result<StatusCode, TransportError>;

    async fn delete_status_override(
        &self,
        app_name: &str,
        instance_id: &str,
    ) -> Result<StatusCode, TransportError>;
}

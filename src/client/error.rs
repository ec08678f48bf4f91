use super::transport::{StatusCode, TransportError};

/// 注册中心客户端错误类型
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Unexpected status: {0:?}")]
    UnexpectedStatus(StatusCode),
    #[error("Registry fetch produced no data")]
    EmptyResponse,
}

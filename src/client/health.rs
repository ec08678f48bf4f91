use crate::model::InstanceStatus;

/// 健康状态来源，由实例信息复制器周期性轮询来决定是否需要重新注册。
/// 返回错误时调用方按DOWN处理。
pub trait HealthCheckHandler: Send + Sync {
    fn status(
        &self,
        current: InstanceStatus,
    ) -> Result<InstanceStatus, Box<dyn std::error::Error + Send + Sync>>;
}

/// 默认实现：维持当前状态不变
#[derive(Debug, Default)]
pub struct NoopHealthCheckHandler;

impl HealthCheckHandler for NoopHealthCheckHandler {
    fn status(
        &self,
        current: InstanceStatus,
    ) -> Result<InstanceStatus, Box<dyn std::error::Error + Send + Sync>> {
        Ok(current)
    }
}

use async_trait::async_trait;

use crate::model::Applications;

/// 备用注册表来源（文件、备用目录服务等），
/// 仅在启动时主传输完全不可用的情况下使用。
/// 实现通过显式配置在启动时注入。
#[async_trait]
pub trait BackupRegistry: Send + Sync {
    async fn fetch_registry(&self, regions: &[String]) -> Option<Applications>;
}

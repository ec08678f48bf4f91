use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config.toml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config_str = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&config_str)?;
        Ok(config)
    }
}

/// 客户端侧配置：拉取/续约节奏与快照策略
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// 本地区域名，增量合并时区分本区与远端区快照
    pub region: String,
    /// 注册表拉取间隔（秒）
    pub registry_fetch_interval: u64,
    /// 心跳续约间隔（秒）
    pub renewal_interval: u64,
    /// 实例信息复制器周期（秒）
    pub instance_replication_interval: u64,
    /// 实例信息复制器首次延迟（秒）
    pub initial_instance_replication_delay: u64,
    /// 按需注册的突发额度
    pub on_demand_update_burst: u32,
    /// 禁用增量拉取，总是全量
    pub disable_delta: bool,
    /// 仅保留UP状态实例
    pub filter_only_up_instances: bool,
    /// 配置后只按该VIP地址做全量拉取
    pub single_vip_address: Option<String>,
    /// 每次增量合并后强制做一次全量对账（诊断用）
    pub log_delta_diff: bool,
    /// 拉取远端区域列表
    pub fetch_remote_regions: Vec<String>,
    /// 缓存刷新任务的指数退避上限倍数
    pub cache_refresh_backoff_bound: u32,
    /// 心跳任务的指数退避上限倍数
    pub heartbeat_backoff_bound: u32,
    /// 关闭时是否主动下线
    pub unregister_on_shutdown: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            region: "default".to_string(),
            registry_fetch_interval: 30,
            renewal_interval: 30,
            instance_replication_interval: 30,
            initial_instance_replication_delay: 40,
            on_demand_update_burst: 2,
            disable_delta: false,
            filter_only_up_instances: true,
            single_vip_address: None,
            log_delta_diff: false,
            fetch_remote_regions: Vec::new(),
            cache_refresh_backoff_bound: 10,
            heartbeat_backoff_bound: 10,
            unregister_on_shutdown: true,
        }
    }
}

impl ClientConfig {
    pub fn registry_fetch_interval(&self) -> Duration {
        Duration::from_secs(self.registry_fetch_interval)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval)
    }

    pub fn instance_replication_interval(&self) -> Duration {
        Duration::from_secs(self.instance_replication_interval)
    }

    pub fn initial_instance_replication_delay(&self) -> Duration {
        Duration::from_secs(self.initial_instance_replication_delay)
    }

    pub fn is_remote_region(&self, region: &str) -> bool {
        region != self.region
    }
}

/// 服务端侧配置：自我保护、启动同步与剔除节奏
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 是否开启自我保护
    pub self_preservation_enabled: bool,
    /// 续约阈值比例，低于 预期续约数*该比例*2 时停止剔除
    pub renewal_percent_threshold: f64,
    /// 续约阈值重算周期（秒）
    pub renewal_threshold_update_interval: u64,
    /// 启动同步重试次数
    pub registry_sync_retries: u32,
    /// 启动同步重试等待（秒）
    pub registry_sync_retry_wait: u64,
    /// 启动同步为空时拒绝读请求的宽限期（秒）
    pub wait_time_when_sync_empty: u64,
    /// 剔除任务周期（秒）
    pub eviction_interval: u64,
    /// 剔除判定的额外宽限（秒）
    pub eviction_grace: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            self_preservation_enabled: true,
            renewal_percent_threshold: 0.85,
            renewal_threshold_update_interval: 900,
            registry_sync_retries: 5,
            registry_sync_retry_wait: 30,
            wait_time_when_sync_empty: 300,
            eviction_interval: 60,
            eviction_grace: 0,
        }
    }
}

impl ServerConfig {
    pub fn renewal_threshold_update_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_threshold_update_interval)
    }

    pub fn registry_sync_retry_wait(&self) -> Duration {
        Duration::from_secs(self.registry_sync_retry_wait)
    }

    pub fn wait_time_when_sync_empty_ms(&self) -> u64 {
        self.wait_time_when_sync_empty * 1000
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval)
    }

    pub fn eviction_grace_ms(&self) -> u64 {
        self.eviction_grace * 1000
    }
}

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::now_millis;

// 实例状态（自报状态，覆盖规则计算出的有效状态也使用该类型）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Up,
    Down,
    Starting,
    OutOfService,
    Unknown,
}

impl InstanceStatus {
    /// 一致性hash码中使用的状态名（按字典序参与计数）
    pub fn name(&self) -> &'static str {
        match self {
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::OutOfService => "OUT_OF_SERVICE",
            InstanceStatus::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// 增量记录的合并动作，仅出现在增量拉取返回的记录上
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    Added,
    Modified,
    Deleted,
}

/// 一个可注册的服务实例
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub app_name: String,
    pub instance_id: String,
    pub host_name: String,
    pub ip_addr: String,
    pub port: u16,
    pub vip_address: Option<String>,
    pub metadata: HashMap<String, String>,
    pub status: InstanceStatus,
    /// 实例所在区域，用于增量合并时选择目标分区
    pub region: Option<String>,
    /// 租约时长（秒），未设置时服务端采用默认值
    pub lease_duration_secs: Option<u64>,
    /// 仅增量记录携带
    pub action_type: Option<ActionType>,
    /// 最后一次本地状态变更时间（毫秒）
    pub last_dirty_timestamp: u64,
}

impl InstanceRecord {
    pub fn new(app_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into().to_uppercase(),
            instance_id: instance_id.into(),
            host_name: String::new(),
            ip_addr: String::new(),
            port: 0,
            vip_address: None,
            metadata: HashMap::new(),
            status: InstanceStatus::Starting,
            region: None,
            lease_duration_secs: None,
            action_type: None,
            last_dirty_timestamp: now_millis(),
        }
    }

    /// 调用方未提供实例ID时生成一个
    pub fn with_generated_id(app_name: impl Into<String>) -> Self {
        Self::new(app_name, Uuid::new_v4().to_string())
    }
}

/// 本进程自身注册的实例信息，带脏标记追踪。
/// 脏标记在任何对外可见的状态变化时设置，注册成功后按时间戳比较清除，
/// 保证注册期间发生的更新不会被误清。
#[derive(Debug)]
pub struct LocalInstance {
    record: RwLock<InstanceRecord>,
    dirty: AtomicBool,
    dirty_timestamp: AtomicU64,
}

impl LocalInstance {
    pub fn new(record: InstanceRecord) -> Self {
        let ts = record.last_dirty_timestamp;
        Self {
            record: RwLock::new(record),
            dirty: AtomicBool::new(true),
            dirty_timestamp: AtomicU64::new(ts),
        }
    }

    pub fn app_name(&self) -> String {
        self.record.read().unwrap_or_else(|e| e.into_inner()).app_name.clone()
    }

    pub fn instance_id(&self) -> String {
        self.record.read().unwrap_or_else(|e| e.into_inner()).instance_id.clone()
    }

    pub fn status(&self) -> InstanceStatus {
        self.record.read().unwrap_or_else(|e| e.into_inner()).status
    }

    /// 当前记录的一份拷贝，用于发起注册
    pub fn snapshot(&self) -> InstanceRecord {
        self.record.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 更新自报状态，发生变化时设置脏标记
    pub fn set_status(&self, status: InstanceStatus) -> Option<InstanceStatus> {
        let mut record = self.record.write().unwrap_or_else(|e| e.into_inner());
        if record.status == status {
            return None;
        }
        let previous = record.status;
        record.status = status;
        record.last_dirty_timestamp = now_millis();
        drop(record);
        self.set_dirty();
        Some(previous)
    }

    /// 设置脏标记并返回标记时间戳
    pub fn set_dirty(&self) -> u64 {
        let ts = now_millis();
        self.dirty_timestamp.fetch_max(ts, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
        self.dirty_timestamp.load(Ordering::SeqCst)
    }

    /// 仅当没有更新的变更竞争进来时清除脏标记
    pub fn unset_dirty(&self, timestamp: u64) {
        if self.dirty_timestamp.load(Ordering::SeqCst) <= timestamp {
            self.dirty.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn dirty_timestamp(&self) -> u64 {
        self.dirty_timestamp.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_flag_cleared_only_without_newer_mutation() {
        let local = LocalInstance::new(InstanceRecord::new("app-a", "i-1"));
        let ts = local.set_dirty();
        local.unset_dirty(ts);
        assert!(!local.is_dirty());

        let ts = local.set_dirty();
        // 注册期间又发生了一次变更，旧时间戳不能清除脏标记
        let newer = local.set_dirty();
        assert!(newer >= ts);
        local.unset_dirty(ts.saturating_sub(1));
        assert!(local.is_dirty());
    }

    #[test]
    fn status_change_marks_dirty() {
        let local = LocalInstance::new(InstanceRecord::new("app-a", "i-1"));
        local.unset_dirty(local.dirty_timestamp());
        assert_eq!(local.set_status(InstanceStatus::Up), Some(InstanceStatus::Starting));
        assert!(local.is_dirty());
        // 相同状态不再置脏
        local.unset_dirty(local.dirty_timestamp());
        assert_eq!(local.set_status(InstanceStatus::Up), None);
        assert!(!local.is_dirty());
    }
}

use std::sync::Arc;

use dashmap::DashMap;

use crate::model::{InstanceRecord, InstanceStatus, Lease};

/// 有效状态判定规则。返回Some表示该规则命中并给出有效状态。
/// 有效状态在每次需要时现算，不做缓存。
pub trait StatusOverrideRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(
        &self,
        record: &InstanceRecord,
        lease: Option<&Lease<InstanceRecord>>,
    ) -> Option<InstanceStatus>;
}

/// 管理员显式覆盖优先于一切自报状态
pub struct OverrideExistsRule {
    overrides: Arc<DashMap<String, InstanceStatus>>,
}

impl OverrideExistsRule {
    pub fn new(overrides: Arc<DashMap<String, InstanceStatus>>) -> Self {
        Self { overrides }
    }
}

impl StatusOverrideRule for OverrideExistsRule {
    fn name(&self) -> &'static str {
        "override-exists"
    }

    fn apply(
        &self,
        record: &InstanceRecord,
        _lease: Option<&Lease<InstanceRecord>>,
    ) -> Option<InstanceStatus> {
        self.overrides.get(&record.instance_id).map(|e| *e.value())
    }
}

/// 租约缺失，或实例自己声明了DOWN/STARTING时，采信自报状态
pub struct DownOrStartingRule;

impl StatusOverrideRule for DownOrStartingRule {
    fn name(&self) -> &'static str {
        "down-or-starting"
    }

    fn apply(
        &self,
        record: &InstanceRecord,
        lease: Option<&Lease<InstanceRecord>>,
    ) -> Option<InstanceStatus> {
        if lease.is_none()
            || matches!(record.status, InstanceStatus::Down | InstanceStatus::Starting)
        {
            Some(record.status)
        } else {
            None
        }
    }
}

/// 存在租约时采用租约持有记录的自报状态
pub struct LeaseExistsRule;

impl StatusOverrideRule for LeaseExistsRule {
    fn name(&self) -> &'static str {
        "lease-exists"
    }

    fn apply(
        &self,
        _record: &InstanceRecord,
        lease: Option<&Lease<InstanceRecord>>,
    ) -> Option<InstanceStatus> {
        lease.map(|l| l.holder().status)
    }
}

/// 顺序短路的规则链，无规则命中时回落到UNKNOWN
pub struct FirstMatchWinsRule {
    rules: Vec<Box<dyn StatusOverrideRule>>,
}

impl FirstMatchWinsRule {
    pub fn new(rules: Vec<Box<dyn StatusOverrideRule>>) -> Self {
        Self { rules }
    }

    /// 覆盖优先、再看显式DOWN/STARTING、最后才信租约记录
    pub fn standard(overrides: Arc<DashMap<String, InstanceStatus>>) -> Self {
        Self::new(vec![
            Box::new(OverrideExistsRule::new(overrides)),
            Box::new(DownOrStartingRule),
            Box::new(LeaseExistsRule),
        ])
    }

    pub fn effective_status(
        &self,
        record: &InstanceRecord,
        lease: Option<&Lease<InstanceRecord>>,
    ) -> InstanceStatus {
        for rule in &self.rules {
            if let Some(status) = rule.apply(record, lease) {
                tracing::trace!(
                    rule = rule.name(),
                    instance_id = %record.instance_id,
                    status = %status,
                    "Status rule matched"
                );
                return status;
            }
        }
        InstanceStatus::Unknown
    }
}

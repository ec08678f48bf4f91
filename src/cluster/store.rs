use std::sync::Arc;

use dashmap::DashMap;

use crate::model::{
    Application, Applications, DEFAULT_LEASE_DURATION_SECS, InstanceRecord, InstanceStatus, Lease,
};

use super::rate::MeasuredRate;
use super::rule::FirstMatchWinsRule;

/// 服务端本地注册表存储：应用名 -> 实例ID -> 租约，
/// 外加实例ID -> 管理员状态覆盖。锁粒度按应用/实例分片，
/// 不相关应用的注册/续约/下线互不串行。
pub struct RegistryStore {
    leases: DashMap<String, DashMap<String, Lease<InstanceRecord>>>,
    overrides: Arc<DashMap<String, InstanceStatus>>,
    rule: FirstMatchWinsRule,
    renews_last_min: Arc<MeasuredRate>,
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryStore {
    pub fn new() -> Self {
        let overrides = Arc::new(DashMap::new());
        Self {
            leases: DashMap::new(),
            rule: FirstMatchWinsRule::standard(overrides.clone()),
            overrides,
            renews_last_min: Arc::new(MeasuredRate::per_minute()),
        }
    }

    pub fn renews_last_min(&self) -> &Arc<MeasuredRate> {
        &self.renews_last_min
    }

    /// 注册一条租约，返回是否是全新租约。
    /// 已有租约携带更新的dirty时间戳时保留已有记录，防止旧复制流量回退状态。
    pub fn register(&self, mut record: InstanceRecord) -> bool {
        let duration = record
            .lease_duration_secs
            .unwrap_or(DEFAULT_LEASE_DURATION_SECS);
        let app = self.leases.entry(record.app_name.clone()).or_default();

        let existing = app.get(&record.instance_id).map(|l| {
            (
                l.holder().last_dirty_timestamp,
                l.holder().clone(),
                l.registration_timestamp(),
            )
        });

        let is_new = match existing {
            Some((existing_dirty, existing_record, registration_ts)) => {
                if existing_dirty > record.last_dirty_timestamp {
                    tracing::warn!(
                        app_name = %record.app_name,
                        instance_id = %record.instance_id,
                        existing_dirty,
                        incoming_dirty = record.last_dirty_timestamp,
                        "Existing lease has a newer dirty timestamp, keeping the existing record"
                    );
                    record = existing_record;
                }
                let mut lease = Lease::new(record.clone(), duration);
                // 重复注册保留首次注册时间
                lease.set_registration_timestamp(registration_ts);
                app.insert(record.instance_id.clone(), lease);
                false
            }
            None => {
                app.insert(record.instance_id.clone(), Lease::new(record.clone(), duration));
                true
            }
        };

        tracing::info!(
            app_name = %record.app_name,
            instance_id = %record.instance_id,
            is_new,
            "Registered instance lease"
        );
        is_new
    }

    /// 心跳续约，租约不存在时返回false
    pub fn renew(&self, app_name: &str, instance_id: &str) -> bool {
        let upper = app_name.to_uppercase();
        let Some(app) = self.leases.get(&upper) else {
            return false;
        };
        let Some(mut lease) = app.get_mut(instance_id) else {
            return false;
        };
        lease.renew();
        drop(lease);
        drop(app);
        self.renews_last_min.increment();
        true
    }

    /// 下线：移除租约和状态覆盖，应用空了就整条移除
    pub fn cancel(&self, app_name: &str, instance_id: &str) -> bool {
        let upper = app_name.to_uppercase();
        let removed = self
            .leases
            .get(&upper)
            .is_some_and(|app| app.remove(instance_id).is_some());
        if removed {
            self.overrides.remove(instance_id);
            self.leases.remove_if(&upper, |_, app| app.is_empty());
            tracing::info!(app_name = %upper, instance_id = %instance_id, "Cancelled instance lease");
        } else {
            tracing::warn!(
                app_name = %upper,
                instance_id = %instance_id,
                "Cancel requested for an unknown lease"
            );
        }
        removed
    }

    /// 管理员状态更新：写覆盖表并同步到持有记录
    pub fn status_update(
        &self,
        app_name: &str,
        instance_id: &str,
        new_status: InstanceStatus,
    ) -> bool {
        let upper = app_name.to_uppercase();
        let Some(app) = self.leases.get(&upper) else {
            return false;
        };
        let Some(mut lease) = app.get_mut(instance_id) else {
            return false;
        };
        self.overrides.insert(instance_id.to_string(), new_status);
        let record = lease.holder_mut();
        record.status = new_status;
        record.last_dirty_timestamp = crate::model::now_millis();
        true
    }

    /// 删除管理员状态覆盖，之后有效状态回到规则链的其余判定
    pub fn delete_status_override(&self, app_name: &str, instance_id: &str) -> bool {
        let upper = app_name.to_uppercase();
        let lease_exists = self
            .leases
            .get(&upper)
            .is_some_and(|app| app.contains_key(instance_id));
        if !lease_exists {
            return false;
        }
        self.overrides.remove(instance_id);
        true
    }

    pub fn get_lease(&self, app_name: &str, instance_id: &str) -> Option<Lease<InstanceRecord>> {
        self.leases
            .get(&app_name.to_uppercase())
            .and_then(|app| app.get(instance_id).map(|l| l.clone()))
    }

    pub fn override_status(&self, instance_id: &str) -> Option<InstanceStatus> {
        self.overrides.get(instance_id).map(|e| *e.value())
    }

    pub fn lease_count(&self) -> usize {
        self.leases.iter().map(|app| app.len()).sum()
    }

    /// 按规则链现算有效状态
    pub fn effective_status(&self, app_name: &str, instance_id: &str) -> InstanceStatus {
        match self.get_lease(app_name, instance_id) {
            Some(lease) => {
                let record = lease.holder().clone();
                self.rule.effective_status(&record, Some(&lease))
            }
            None => InstanceStatus::Unknown,
        }
    }

    /// 构建当前注册表快照，实例状态取规则链的有效状态
    pub fn applications(&self) -> Applications {
        let mut apps = Applications::new();
        for app_entry in self.leases.iter() {
            if app_entry.value().is_empty() {
                continue;
            }
            let mut app = Application::new(app_entry.key().clone());
            for lease_entry in app_entry.value().iter() {
                let mut record = lease_entry.value().holder().clone();
                record.status = self.rule.effective_status(&record, Some(lease_entry.value()));
                app.add_instance(record);
            }
            apps.add_application(app);
        }
        apps
    }

    /// 剔除过期租约，返回被剔除的(应用, 实例ID)列表。
    /// 调用方负责先确认isLeaseExpirationEnabled。
    pub fn evict(&self, grace_ms: u64) -> Vec<(String, String)> {
        let mut expired = Vec::new();
        for app in self.leases.iter() {
            for lease in app.value().iter() {
                if lease.value().is_expired(grace_ms) {
                    expired.push((app.key().clone(), lease.key().clone()));
                }
            }
        }
        for (app_name, instance_id) in &expired {
            tracing::warn!(
                app_name = %app_name,
                instance_id = %instance_id,
                "Evicting expired lease"
            );
            self.cancel(app_name, instance_id);
        }
        expired
    }
}

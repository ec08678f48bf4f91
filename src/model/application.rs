use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::instance::{InstanceRecord, InstanceStatus};

/// 一个应用名下的全部实例，插入顺序无语义
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    instances: Vec<InstanceRecord>,
}

impl Application {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_uppercase(),
            instances: Vec::new(),
        }
    }

    /// 按实例ID插入或替换（后写覆盖）
    pub fn add_instance(&mut self, record: InstanceRecord) {
        self.instances.retain(|i| i.instance_id != record.instance_id);
        self.instances.push(record);
    }

    /// 按实例ID移除，返回是否移除了记录
    pub fn remove_instance(&mut self, instance_id: &str) -> bool {
        let before = self.instances.len();
        self.instances.retain(|i| i.instance_id != instance_id);
        self.instances.len() != before
    }

    pub fn get_by_id(&self, instance_id: &str) -> Option<&InstanceRecord> {
        self.instances.iter().find(|i| i.instance_id == instance_id)
    }

    pub fn get_by_vip(&self, vip_address: &str) -> Vec<&InstanceRecord> {
        self.instances
            .iter()
            .filter(|i| i.vip_address.as_deref() == Some(vip_address))
            .collect()
    }

    pub fn instances(&self) -> &[InstanceRecord] {
        &self.instances
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// 按策略过滤非UP实例，并随机打乱实例顺序，
    /// 避免确定性排序下首个实例被集中访问
    pub fn shuffle_instances(&mut self, filter_only_up: bool) {
        if filter_only_up {
            self.instances.retain(|i| i.status == InstanceStatus::Up);
        }
        self.instances.shuffle(&mut rand::rng());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, status: InstanceStatus) -> InstanceRecord {
        let mut r = InstanceRecord::new("APP", id);
        r.status = status;
        r
    }

    #[test]
    fn add_instance_replaces_by_id() {
        let mut app = Application::new("app");
        app.add_instance(record("i-1", InstanceStatus::Starting));
        app.add_instance(record("i-1", InstanceStatus::Up));
        assert_eq!(app.len(), 1);
        assert_eq!(app.get_by_id("i-1").unwrap().status, InstanceStatus::Up);
    }

    #[test]
    fn remove_absent_instance_is_noop() {
        let mut app = Application::new("app");
        app.add_instance(record("i-1", InstanceStatus::Up));
        assert!(!app.remove_instance("i-2"));
        assert_eq!(app.len(), 1);
    }

    #[test]
    fn get_by_vip_matches_only_the_requested_address() {
        let mut app = Application::new("app");
        let mut a = record("i-1", InstanceStatus::Up);
        a.vip_address = Some("svc.vip".to_string());
        let mut b = record("i-2", InstanceStatus::Up);
        b.vip_address = Some("other.vip".to_string());
        app.add_instance(a);
        app.add_instance(b);
        // 没有vip地址的实例不参与匹配
        app.add_instance(record("i-3", InstanceStatus::Up));

        let matched = app.get_by_vip("svc.vip");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].instance_id, "i-1");
        assert!(app.get_by_vip("missing.vip").is_empty());
    }

    #[test]
    fn shuffle_filters_non_up_instances() {
        let mut app = Application::new("app");
        app.add_instance(record("i-1", InstanceStatus::Up));
        app.add_instance(record("i-2", InstanceStatus::Down));
        app.add_instance(record("i-3", InstanceStatus::Starting));
        app.shuffle_instances(true);
        assert_eq!(app.len(), 1);
        assert_eq!(app.instances()[0].instance_id, "i-1");
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::application::Application;
use super::instance::InstanceRecord;

/// version的初始哨兵值，表示从未拉取过注册表
pub const VERSION_NOT_FETCHED: i64 = -1;

/// 某一时刻的注册表快照：按应用名分组的实例集合，
/// 带服务端版本号和一致性hash码
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Applications {
    version: i64,
    apps_hash_code: String,
    applications: Vec<Application>,
}

impl Default for Applications {
    fn default() -> Self {
        Self {
            version: VERSION_NOT_FETCHED,
            apps_hash_code: String::new(),
            applications: Vec::new(),
        }
    }
}

impl Applications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    pub fn apps_hash_code(&self) -> &str {
        &self.apps_hash_code
    }

    pub fn set_apps_hash_code(&mut self, hash: String) {
        self.apps_hash_code = hash;
    }

    pub fn registered_applications(&self) -> &[Application] {
        &self.applications
    }

    pub fn get_application(&self, app_name: &str) -> Option<&Application> {
        let upper = app_name.to_uppercase();
        self.applications.iter().find(|a| a.name == upper)
    }

    pub fn get_application_mut(&mut self, app_name: &str) -> Option<&mut Application> {
        let upper = app_name.to_uppercase();
        self.applications.iter_mut().find(|a| a.name == upper)
    }

    pub fn add_application(&mut self, app: Application) {
        self.applications.retain(|a| a.name != app.name);
        self.applications.push(app);
    }

    /// 获取应用，不存在时创建空应用
    pub fn get_or_create_application(&mut self, app_name: &str) -> &mut Application {
        let upper = app_name.to_uppercase();
        let pos = match self.applications.iter().position(|a| a.name == upper) {
            Some(pos) => pos,
            None => {
                self.applications.push(Application::new(upper));
                self.applications.len() - 1
            }
        };
        &mut self.applications[pos]
    }

    pub fn remove_application(&mut self, app_name: &str) -> bool {
        let upper = app_name.to_uppercase();
        let before = self.applications.len();
        self.applications.retain(|a| a.name != upper);
        self.applications.len() != before
    }

    pub fn total_instances(&self) -> usize {
        self.applications.iter().map(Application::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
    }

    pub fn iter_instances(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.applications.iter().flat_map(|a| a.instances().iter())
    }

    /// 统计各状态的实例数量，结果按状态名字典序排列
    pub fn populate_instance_count_map(&self, counts: &mut BTreeMap<&'static str, usize>) {
        for instance in self.iter_instances() {
            *counts.entry(instance.status.name()).or_insert(0) += 1;
        }
    }

    /// 根据状态计数生成一致性hash码，如 "DOWN_1_UP_5_"。
    /// 对(appName, id, status)多重集相同的快照，结果与插入顺序无关。
    pub fn reconcile_hash_code(&self) -> String {
        let mut counts = BTreeMap::new();
        self.populate_instance_count_map(&mut counts);
        Self::hash_code_for(&counts)
    }

    pub fn hash_code_for(counts: &BTreeMap<&'static str, usize>) -> String {
        let mut hash = String::new();
        for (status, count) in counts {
            hash.push_str(status);
            hash.push('_');
            hash.push_str(&count.to_string());
            hash.push('_');
        }
        hash
    }

    /// 全量替换或增量合并后的整理：过滤、打乱、清掉空应用
    pub fn shuffle_instances(&mut self, filter_only_up: bool) {
        for app in &mut self.applications {
            app.shuffle_instances(filter_only_up);
        }
        self.applications.retain(|a| !a.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::instance::InstanceStatus;

    fn record(app: &str, id: &str, status: InstanceStatus) -> InstanceRecord {
        let mut r = InstanceRecord::new(app, id);
        r.status = status;
        r
    }

    fn snapshot(records: Vec<InstanceRecord>) -> Applications {
        let mut apps = Applications::new();
        for r in records {
            apps.get_or_create_application(&r.app_name.clone()).add_instance(r);
        }
        apps
    }

    #[test]
    fn hash_code_counts_statuses_in_lexical_order() {
        let apps = snapshot(vec![
            record("a", "1", InstanceStatus::Up),
            record("a", "2", InstanceStatus::Up),
            record("b", "3", InstanceStatus::Down),
        ]);
        assert_eq!(apps.reconcile_hash_code(), "DOWN_1_UP_2_");
    }

    #[test]
    fn hash_code_is_stable_and_order_independent() {
        let forward = snapshot(vec![
            record("a", "1", InstanceStatus::Up),
            record("b", "2", InstanceStatus::Down),
        ]);
        let reversed = snapshot(vec![
            record("b", "2", InstanceStatus::Down),
            record("a", "1", InstanceStatus::Up),
        ]);
        assert_eq!(forward.reconcile_hash_code(), forward.reconcile_hash_code());
        assert_eq!(forward.reconcile_hash_code(), reversed.reconcile_hash_code());
    }

    #[test]
    fn application_lookup_is_case_insensitive() {
        let apps = snapshot(vec![record("my-app", "1", InstanceStatus::Up)]);
        assert!(apps.get_application("MY-APP").is_some());
        assert!(apps.get_application("my-app").is_some());
    }
}

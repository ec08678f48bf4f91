use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ClientConfig;
use crate::events::{EventListeners, RegistryEvent};
use crate::model::{
    ActionType, Applications, InstanceStatus, LocalInstance, VERSION_NOT_FETCHED, now_millis,
};
use crate::supervisor::TimedSupervisorTask;

use super::backup::BackupRegistry;
use super::error::ClientError;
use super::transport::{RegistryTransport, StatusCode};

/// 注册中心客户端引擎：负责本实例的注册与续约，
/// 并通过增量拉取+全量兜底维护一份本地注册表快照。
/// 快照以原子引用替换发布，读取方永远看到完整一致的版本。
pub struct RegistryClient {
    config: ClientConfig,
    transport: Arc<dyn RegistryTransport>,
    backup: Option<Arc<dyn BackupRegistry>>,
    local_instance: Arc<LocalInstance>,
    listeners: Arc<EventListeners>,

    // 本区快照，读路径无锁
    local_apps: ArcSwap<Applications>,
    // 远端区域快照，按区域名分区
    remote_region_apps: DashMap<String, Applications>,
    // 快照替换的单调代数，慢的并发拉取CAS失败后直接丢弃
    fetch_generation: AtomicU64,
    // 增量合并串行化；拿不到锁的周期放弃本次增量
    delta_merge_lock: tokio::sync::Mutex<()>,
    // 刷新后在快照里观察到的本实例远端状态
    last_remote_status: std::sync::Mutex<InstanceStatus>,

    tracker: TaskTracker,
    cancel: CancellationToken,
    shutdown: AtomicBool,
    last_successful_fetch: AtomicU64,
    last_successful_heartbeat: AtomicU64,
}

impl RegistryClient {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn RegistryTransport>,
        backup: Option<Arc<dyn BackupRegistry>>,
        local_instance: Arc<LocalInstance>,
    ) -> Self {
        Self {
            config,
            transport,
            backup,
            local_instance,
            listeners: Arc::new(EventListeners::new()),
            local_apps: ArcSwap::from_pointee(Applications::new()),
            remote_region_apps: DashMap::new(),
            fetch_generation: AtomicU64::new(0),
            delta_merge_lock: tokio::sync::Mutex::new(()),
            last_remote_status: std::sync::Mutex::new(InstanceStatus::Unknown),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            shutdown: AtomicBool::new(false),
            last_successful_fetch: AtomicU64::new(0),
            last_successful_heartbeat: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn local_instance(&self) -> &Arc<LocalInstance> {
        &self.local_instance
    }

    pub fn listeners(&self) -> &Arc<EventListeners> {
        &self.listeners
    }

    /// 当前本区快照
    pub fn applications(&self) -> Arc<Applications> {
        self.local_apps.load_full()
    }

    /// 某个远端区域的快照拷贝
    pub fn remote_region_applications(&self, region: &str) -> Option<Applications> {
        self.remote_region_apps.get(region).map(|e| e.value().clone())
    }

    /// 在刷新后的快照中观察到的本实例状态
    pub fn instance_remote_status(&self) -> InstanceStatus {
        *self.last_remote_status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_successful_fetch_timestamp(&self) -> u64 {
        self.last_successful_fetch.load(Ordering::SeqCst)
    }

    pub fn last_successful_heartbeat_timestamp(&self) -> u64 {
        self.last_successful_heartbeat.load(Ordering::SeqCst)
    }

    /// 把当前实例记录注册到一台服务端。
    /// 失败只上报给调用方，由调用方的调度周期决定重试。
    pub async fn register(&self) -> Result<bool, ClientError> {
        let record = self.local_instance.snapshot();
        tracing::info!(
            app_name = %record.app_name,
            instance_id = %record.instance_id,
            "Registering instance"
        );
        let status = self.transport.register(&record).await?;
        if status != StatusCode::NoContent {
            tracing::warn!(
                app_name = %record.app_name,
                status = ?status,
                "Registration was not accepted"
            );
        }
        Ok(status == StatusCode::NoContent)
    }

    /// 发送一次心跳。服务端没有对应租约时视为强制重新注册：
    /// 置脏后调用register()，并按其结果返回。
    pub async fn renew(&self) -> bool {
        let app_name = self.local_instance.app_name();
        let instance_id = self.local_instance.instance_id();
        let record = self.local_instance.snapshot();

        match self.transport.renew(&app_name, &instance_id, Some(&record)).await {
            Ok((StatusCode::NotFound, _)) => {
                tracing::info!(
                    app_name = %app_name,
                    instance_id = %instance_id,
                    "Lease not found on server, re-registering"
                );
                let timestamp = self.local_instance.set_dirty();
                match self.register().await {
                    Ok(true) => {
                        self.local_instance.unset_dirty(timestamp);
                        // 重新注册成功等同于一次成功续约
                        self.last_successful_heartbeat.store(now_millis(), Ordering::SeqCst);
                        true
                    }
                    Ok(false) => false,
                    Err(e) => {
                        tracing::warn!(error = %e, "Re-registration after NOT_FOUND failed");
                        false
                    }
                }
            }
            Ok((StatusCode::Ok, _)) => {
                self.last_successful_heartbeat.store(now_millis(), Ordering::SeqCst);
                true
            }
            Ok((status, _)) => {
                tracing::warn!(
                    app_name = %app_name,
                    status = ?status,
                    "Heartbeat was rejected"
                );
                false
            }
            Err(e) => {
                tracing::error!(app_name = %app_name, error = %e, "Unable to send heartbeat");
                false
            }
        }
    }

    /// 主动下线，尽力而为
    pub async fn unregister(&self) {
        let app_name = self.local_instance.app_name();
        let instance_id = self.local_instance.instance_id();
        match self.transport.cancel(&app_name, &instance_id).await {
            Ok(status) => {
                tracing::info!(app_name = %app_name, status = ?status, "Deregistered instance");
            }
            Err(e) => {
                tracing::error!(app_name = %app_name, error = %e, "Deregistration failed");
            }
        }
    }

    /// 刷新本地注册表快照，按条件选择全量或增量。
    /// 任何异常都保持旧快照不动并返回false，调用方可转向备用注册表。
    pub async fn fetch_registry(&self, force_full: bool) -> bool {
        let fetch_result: Result<(), ClientError> = async {
            let applications = self.applications();
            if self.config.disable_delta
                || self.config.single_vip_address.is_some()
                || force_full
                || applications.is_empty()
                || applications.version() == VERSION_NOT_FETCHED
            {
                tracing::info!(
                    disable_delta = self.config.disable_delta,
                    single_vip = self.config.single_vip_address.is_some(),
                    force_full,
                    empty = applications.is_empty(),
                    first_fetch = applications.version() == VERSION_NOT_FETCHED,
                    "Performing full registry fetch"
                );
                self.get_and_store_full_registry().await?;
            } else {
                self.get_and_update_delta().await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = fetch_result {
            tracing::error!(error = %e, "Unable to refresh the registry cache");
            return false;
        }

        self.last_successful_fetch.store(now_millis(), Ordering::SeqCst);

        // 先发布缓存刷新事件，再基于新快照更新本实例的远端状态观察
        self.listeners.publish(&RegistryEvent::CacheRefreshed);
        self.update_instance_remote_status();
        true
    }

    /// 全量拉取并替换本地快照，由代数CAS保证慢的并发拉取不会覆盖新快照
    async fn get_and_store_full_registry(&self) -> Result<(), ClientError> {
        let current_generation = self.fetch_generation.load(Ordering::SeqCst);

        let (status, apps) = match self.config.single_vip_address.as_deref() {
            Some(vip) => {
                self.transport.get_vip(vip, &self.config.fetch_remote_regions).await?
            }
            None => {
                self.transport
                    .get_applications(&self.config.fetch_remote_regions)
                    .await?
            }
        };

        if status != StatusCode::Ok {
            return Err(ClientError::UnexpectedStatus(status));
        }
        let apps = apps.ok_or(ClientError::EmptyResponse)?;

        if self
            .fetch_generation
            .compare_exchange(
                current_generation,
                current_generation + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            let stored = self.store_snapshot(apps);
            tracing::debug!(
                apps_hash = %stored,
                "Stored full registry snapshot"
            );
        } else {
            tracing::warn!("Not updating applications as another fetch already advanced the generation");
        }
        Ok(())
    }

    /// 增量拉取并合并。无可用增量时退回全量；
    /// 合并后hash与服务端不一致（或开启diff日志）时，再做一次全量对账。
    async fn get_and_update_delta(&self) -> Result<(), ClientError> {
        let current_generation = self.fetch_generation.load(Ordering::SeqCst);

        let (status, delta) = self
            .transport
            .get_delta(&self.config.fetch_remote_regions)
            .await?;
        let delta = if status == StatusCode::Ok { delta } else { None };

        let Some(delta) = delta else {
            tracing::warn!("The server does not allow a delta revision to be applied, fetching full registry");
            return self.get_and_store_full_registry().await;
        };

        if self
            .fetch_generation
            .compare_exchange(
                current_generation,
                current_generation + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            tracing::warn!("Not applying delta as another fetch already advanced the generation");
            return Ok(());
        }

        // 拿不到合并锁说明有重叠的拉取周期，放弃本次增量，
        // 留下的空hash会触发下面的全量对账
        let mut reconcile_hash = String::new();
        if let Ok(_guard) = self.delta_merge_lock.try_lock() {
            reconcile_hash = self.update_delta(&delta);
        } else {
            tracing::warn!("Cannot acquire the delta merge lock, abandoning this delta");
        }

        if reconcile_hash != delta.apps_hash_code() || self.config.log_delta_diff {
            self.reconcile_and_log_difference(&delta, &reconcile_hash).await?;
        }
        Ok(())
    }

    /// 把增量条目合并进本地/远端区域快照，返回合并后的一致性hash。
    /// 快照克隆后整体替换，读取方不会看到合并了一半的状态。
    fn update_delta(&self, delta: &Applications) -> String {
        let mut local = (*self.applications()).clone();
        let mut delta_count = 0usize;

        for app in delta.registered_applications() {
            for instance in app.instances() {
                delta_count += 1;
                let target_region = instance
                    .region
                    .as_deref()
                    .filter(|r| self.config.is_remote_region(r))
                    .map(str::to_string);

                match target_region {
                    Some(region) => {
                        let mut entry = self
                            .remote_region_apps
                            .entry(region)
                            .or_insert_with(Applications::new);
                        Self::apply_delta_instance(entry.value_mut(), instance);
                    }
                    None => {
                        Self::apply_delta_instance(&mut local, instance);
                    }
                }
            }
        }
        tracing::debug!(delta_count, "Merged delta entries into the local snapshot");

        local.set_version(delta.version());
        local.shuffle_instances(self.config.filter_only_up_instances);
        for mut entry in self.remote_region_apps.iter_mut() {
            entry.value_mut().set_version(delta.version());
            entry.value_mut().shuffle_instances(self.config.filter_only_up_instances);
        }

        let hash = self.reconcile_hash_code(&local);
        local.set_apps_hash_code(hash.clone());
        self.local_apps.store(Arc::new(local));
        hash
    }

    fn apply_delta_instance(target: &mut Applications, instance: &crate::model::InstanceRecord) {
        let mut record = instance.clone();
        let action = record.action_type.take();
        match action {
            Some(ActionType::Added) | Some(ActionType::Modified) => {
                target
                    .get_or_create_application(&record.app_name)
                    .add_instance(record);
            }
            Some(ActionType::Deleted) => {
                if let Some(app) = target.get_application_mut(&record.app_name) {
                    app.remove_instance(&record.instance_id);
                    if app.is_empty() {
                        let name = app.name.clone();
                        target.remove_application(&name);
                    }
                }
            }
            None => {
                tracing::warn!(
                    app_name = %record.app_name,
                    instance_id = %record.instance_id,
                    "Delta entry without an action type, ignoring"
                );
            }
        }
    }

    /// hash不一致时的对账：再做一次全量拉取并整体替换
    async fn reconcile_and_log_difference(
        &self,
        delta: &Applications,
        local_hash: &str,
    ) -> Result<(), ClientError> {
        tracing::debug!(
            client_hash = %local_hash,
            server_hash = %delta.apps_hash_code(),
            "Reconcile hash codes do not match, fetching the full registry"
        );

        let current_generation = self.fetch_generation.load(Ordering::SeqCst);

        let (status, server_apps) = match self.config.single_vip_address.as_deref() {
            Some(vip) => {
                self.transport.get_vip(vip, &self.config.fetch_remote_regions).await?
            }
            None => {
                self.transport
                    .get_applications(&self.config.fetch_remote_regions)
                    .await?
            }
        };

        if status != StatusCode::Ok {
            return Err(ClientError::UnexpectedStatus(status));
        }
        let Some(mut server_apps) = server_apps else {
            tracing::warn!("Cannot fetch the full registry from the server, reconciliation failure");
            return Ok(());
        };

        if self
            .fetch_generation
            .compare_exchange(
                current_generation,
                current_generation + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            server_apps.set_version(delta.version());
            let stored = self.store_snapshot(server_apps);
            tracing::debug!(
                client_hash = %stored,
                server_hash = %delta.apps_hash_code(),
                "Reconcile hash codes after complete sync up"
            );
        } else {
            tracing::warn!("Not reconciling as another fetch already advanced the generation");
        }
        Ok(())
    }

    /// 过滤/打乱后计算并写入hash，整体替换本地快照
    fn store_snapshot(&self, mut apps: Applications) -> String {
        apps.shuffle_instances(self.config.filter_only_up_instances);
        let hash = self.reconcile_hash_code(&apps);
        apps.set_apps_hash_code(hash.clone());
        self.local_apps.store(Arc::new(apps));
        hash
    }

    /// 一致性hash覆盖本区快照及正在拉取的远端区域快照
    fn reconcile_hash_code(&self, local: &Applications) -> String {
        let mut counts = std::collections::BTreeMap::new();
        local.populate_instance_count_map(&mut counts);
        if !self.config.fetch_remote_regions.is_empty() {
            for entry in self.remote_region_apps.iter() {
                entry.value().populate_instance_count_map(&mut counts);
            }
        }
        Applications::hash_code_for(&counts)
    }

    /// 在刚刷新的快照里查找本实例，状态变化时发布事件
    fn update_instance_remote_status(&self) {
        let app_name = self.local_instance.app_name();
        let instance_id = self.local_instance.instance_id();

        let apps = self.applications();
        let current = apps
            .get_application(&app_name)
            .and_then(|a| a.get_by_id(&instance_id))
            .map(|r| r.status)
            .unwrap_or(InstanceStatus::Unknown);

        let mut last = self.last_remote_status.lock().unwrap_or_else(|e| e.into_inner());
        if *last != current {
            let previous = *last;
            *last = current;
            drop(last);
            tracing::info!(
                app_name = %app_name,
                previous = %previous,
                current = %current,
                "Observed remote status change for this instance"
            );
            self.listeners.publish(&RegistryEvent::RemoteStatusChanged { previous, current });
        }
    }

    /// 仅在启动时主传输完全拉不到快照的情况下使用的兜底
    pub async fn fetch_registry_from_backup(&self) -> bool {
        let Some(backup) = &self.backup else {
            tracing::warn!("No backup registry configured and no registry server reachable");
            return false;
        };
        match backup.fetch_registry(&self.config.fetch_remote_regions).await {
            Some(apps) => {
                let hash = self.store_snapshot(apps);
                tracing::info!(apps_hash = %hash, "Fetched registry from the backup source");
                self.listeners.publish(&RegistryEvent::CacheRefreshed);
                self.update_instance_remote_status();
                true
            }
            None => {
                tracing::warn!("Backup registry produced no snapshot");
                false
            }
        }
    }

    /// 启动：先做一次全量拉取（失败转备用来源），
    /// 再把心跳和缓存刷新循环挂到自调节调度器上。
    pub async fn start(self: &Arc<Self>) {
        if !self.fetch_registry(true).await {
            self.fetch_registry_from_backup().await;
        }

        let fetch_task = Arc::new(TimedSupervisorTask::new(
            "cache-refresh",
            self.config.registry_fetch_interval(),
            self.config.cache_refresh_backoff_bound,
        ));
        let client = self.clone();
        fetch_task.spawn(&self.tracker, self.cancel.clone(), move || {
            let client = client.clone();
            async move {
                client.fetch_registry(false).await;
            }
        });

        let heartbeat_task = Arc::new(TimedSupervisorTask::new(
            "heartbeat",
            self.config.renewal_interval(),
            self.config.heartbeat_backoff_bound,
        ));
        let client = self.clone();
        heartbeat_task.spawn(&self.tracker, self.cancel.clone(), move || {
            let client = client.clone();
            async move {
                client.renew().await;
            }
        });
    }

    /// 幂等关闭：先尽力下线，再停调度循环；
    /// 进行中的网络调用自然结束或超时
    pub async fn shutdown(&self) {
        if self
            .shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tracing::info!("Shutting down registry client");

        self.local_instance.set_status(InstanceStatus::Down);
        if self.config.unregister_on_shutdown {
            self.unregister().await;
        }

        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Registry client shut down");
    }
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("app_name", &self.local_instance.app_name())
            .field("generation", &self.fetch_generation.load(Ordering::SeqCst))
            .finish()
    }
}

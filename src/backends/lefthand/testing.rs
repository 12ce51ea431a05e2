//! In-memory LeftHand array for driver tests
//!
//! Behaves like a small management group and records every call so tests
//! can assert exact call sequences.

use super::LeftHandDriver;
use super::client::{
    BackendSnapshot, BackendVolume, ChapCredentials, Cluster, LeftHandApi, LeftHandClientRef,
    LeftHandConnector, LeftHandEndpoint, RemoteSnapshotSchedule, Server, VirtualIp,
};
use crate::backends::http::{ClientError, ClientResult};
use crate::config::{LeftHandConfig, ReplicationTargetConfig};
use crate::domain::model::{Connector, Volume, VolumeType};
use crate::domain::ports::{BackendOptions, OptionValue, VolumeDriver};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One recorded client call
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Login(String),
    Logout,
    GetApiVersion,
    GetClusterByName(String),
    GetCluster(u64),
    GetIpFromCluster(String),
    CreateVolume {
        name: String,
        cluster_id: u64,
        size: u64,
        options: BackendOptions,
    },
    GetVolume(u64, String),
    GetVolumeByName(String),
    GetVolumes(String),
    ModifyVolume(u64, BackendOptions),
    DeleteVolume(u64),
    CloneVolume(String, u64),
    CreateSnapshot {
        name: String,
        volume_id: u64,
        options: BackendOptions,
    },
    GetSnapshotByName(String),
    GetSnapshotParentVolume(String),
    ModifySnapshot(u64, BackendOptions),
    DeleteSnapshot(u64),
    CloneSnapshot(String, u64),
    GetServerByName(String),
    CreateServer {
        name: String,
        iqn: String,
        chap: Option<ChapCredentials>,
    },
    DeleteServer(u64),
    FindServerVolumes(String),
    AddServerAccess(u64, u64),
    RemoveServerAccess(u64, u64),
    ScheduleExists(String),
    CreateSchedule(RemoteSnapshotSchedule),
    StartSchedule(String),
    StopSchedule(String),
    DeleteSchedule(String),
}

impl Call {
    fn is_session(&self) -> bool {
        matches!(self, Call::Login(_) | Call::Logout)
    }
}

/// Injected failure
#[derive(Debug, Clone)]
pub enum Failure {
    NotFound,
    Server(String),
}

impl Failure {
    fn to_error(&self) -> ClientError {
        match self {
            Failure::NotFound => ClientError::NotFound {
                message: "resource not found".into(),
            },
            Failure::Server(message) => ClientError::Server {
                status: 500,
                message: message.clone(),
            },
        }
    }
}

struct FailurePlan {
    failure: Failure,
    skip: usize,
    once: bool,
}

/// Shorthand for an option map
pub fn opts(pairs: &[(&str, OptionValue)]) -> BackendOptions {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[derive(Default)]
pub struct FakeLeftHand {
    calls: Mutex<Vec<Call>>,
    pub api_version: Mutex<String>,
    pub clusters: Mutex<BTreeMap<String, Cluster>>,
    pub volumes: Mutex<BTreeMap<String, BackendVolume>>,
    /// Snapshot by name, with the name of its parent volume
    pub snapshots: Mutex<BTreeMap<String, (BackendSnapshot, String)>>,
    pub servers: Mutex<BTreeMap<String, Server>>,
    pub server_volumes: Mutex<BTreeMap<String, Vec<BackendVolume>>>,
    pub schedules: Mutex<BTreeSet<String>>,
    failures: Mutex<BTreeMap<&'static str, FailurePlan>>,
    next_id: AtomicU64,
}

impl FakeLeftHand {
    /// Array with API version 1.2 and cluster `name` (id, vip)
    pub fn new(cluster_name: &str, cluster_id: u64, vip: &str) -> Arc<Self> {
        let fake = Self {
            next_id: AtomicU64::new(100),
            ..Default::default()
        };
        *fake.api_version.lock() = "1.2".to_string();
        fake.add_cluster(cluster_name, cluster_id, vip);
        Arc::new(fake)
    }

    pub fn add_cluster(&self, name: &str, id: u64, vip: &str) {
        self.clusters.lock().insert(
            name.to_string(),
            Cluster {
                id,
                name: name.to_string(),
                virtual_ip_addresses: vec![VirtualIp {
                    ipv4_address: vip.to_string(),
                }],
                space_total: 500 * crate::domain::GIB,
                space_available: 250 * crate::domain::GIB,
            },
        );
    }

    pub fn add_volume(&self, name: &str, id: u64, size: u64) -> BackendVolume {
        let volume = BackendVolume {
            id,
            name: name.to_string(),
            size,
            cluster_name: self.clusters.lock().keys().next().cloned(),
            iscsi_iqn: Some(iqn_for(id, name)),
            ..Default::default()
        };
        self.volumes.lock().insert(name.to_string(), volume.clone());
        volume
    }

    /// Current backend volumes ordered by name
    pub fn volumes(&self) -> Vec<BackendVolume> {
        self.volumes.lock().values().cloned().collect()
    }

    pub fn update_volume(&self, name: &str, f: impl FnOnce(&mut BackendVolume)) {
        if let Some(volume) = self.volumes.lock().get_mut(name) {
            f(volume);
        }
    }

    pub fn add_snapshot(&self, name: &str, id: u64, parent: &str) {
        let snapshot = BackendSnapshot {
            id,
            name: name.to_string(),
            size: crate::domain::GIB,
            volume: None,
        };
        self.snapshots
            .lock()
            .insert(name.to_string(), (snapshot, parent.to_string()));
    }

    pub fn add_server(&self, server: Server) {
        self.servers.lock().insert(server.name.clone(), server);
    }

    /// Make operation `op` fail until cleared
    pub fn fail(&self, op: &'static str, failure: Failure) {
        self.failures.lock().insert(
            op,
            FailurePlan {
                failure,
                skip: 0,
                once: false,
            },
        );
    }

    /// Let `skip` calls of `op` succeed, fail the next one, then recover
    pub fn fail_once_after(&self, op: &'static str, skip: usize, failure: Failure) {
        self.failures.lock().insert(
            op,
            FailurePlan {
                failure,
                skip,
                once: true,
            },
        );
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// All recorded calls
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Recorded calls without login/logout
    pub fn resource_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|c| !c.is_session()).collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: Call, op: &'static str) -> ClientResult<()> {
        self.calls.lock().push(call);
        let mut failures = self.failures.lock();
        let Some(plan) = failures.get_mut(op) else {
            return Ok(());
        };
        if plan.skip > 0 {
            plan.skip -= 1;
            return Ok(());
        }
        let err = plan.failure.to_error();
        if plan.once {
            failures.remove(op);
        }
        Err(err)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn not_found(what: &str) -> ClientError {
        ClientError::NotFound {
            message: format!("{} not found", what),
        }
    }

    fn volume_by_id(&self, id: u64) -> ClientResult<BackendVolume> {
        self.volumes
            .lock()
            .values()
            .find(|v| v.id == id)
            .cloned()
            .ok_or_else(|| Self::not_found(&format!("volume {}", id)))
    }

    fn new_volume(&self, name: &str, size: u64) -> BackendVolume {
        let id = self.next_id();
        self.add_volume(name, id, size)
    }
}

/// IQN the fake assigns to a volume
pub fn iqn_for(id: u64, name: &str) -> String {
    format!("iqn.2003-10.com.lefthandnetworks:group01:{}:{}", id, name)
}

#[async_trait]
impl LeftHandApi for FakeLeftHand {
    async fn login(&self, username: &str, _password: &str) -> ClientResult<()> {
        self.record(Call::Login(username.to_string()), "login")
    }

    async fn logout(&self) -> ClientResult<()> {
        self.record(Call::Logout, "logout")
    }

    async fn get_api_version(&self) -> ClientResult<String> {
        self.record(Call::GetApiVersion, "get_api_version")?;
        Ok(self.api_version.lock().clone())
    }

    async fn get_cluster_by_name(&self, name: &str) -> ClientResult<Cluster> {
        self.record(Call::GetClusterByName(name.to_string()), "get_cluster_by_name")?;
        self.clusters
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Self::not_found(name))
    }

    async fn get_cluster(&self, id: u64) -> ClientResult<Cluster> {
        self.record(Call::GetCluster(id), "get_cluster")?;
        self.clusters
            .lock()
            .values()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| Self::not_found(&format!("cluster {}", id)))
    }

    async fn get_ip_from_cluster(&self, cluster_name: &str) -> ClientResult<String> {
        self.record(Call::GetIpFromCluster(cluster_name.to_string()), "get_ip_from_cluster")?;
        self.clusters
            .lock()
            .get(cluster_name)
            .and_then(|c| c.vip().map(str::to_string))
            .ok_or_else(|| Self::not_found(cluster_name))
    }

    async fn create_volume(
        &self,
        name: &str,
        cluster_id: u64,
        size_bytes: u64,
        options: &BackendOptions,
    ) -> ClientResult<BackendVolume> {
        self.record(
            Call::CreateVolume {
                name: name.to_string(),
                cluster_id,
                size: size_bytes,
                options: options.clone(),
            },
            "create_volume",
        )?;
        Ok(self.new_volume(name, size_bytes))
    }

    async fn get_volume(&self, id: u64, fields: &str) -> ClientResult<BackendVolume> {
        self.record(Call::GetVolume(id, fields.to_string()), "get_volume")?;
        self.volume_by_id(id)
    }

    async fn get_volume_by_name(&self, name: &str) -> ClientResult<BackendVolume> {
        self.record(Call::GetVolumeByName(name.to_string()), "get_volume_by_name")?;
        self.volumes
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Self::not_found(name))
    }

    async fn get_volumes(&self, cluster_name: &str) -> ClientResult<Vec<BackendVolume>> {
        self.record(Call::GetVolumes(cluster_name.to_string()), "get_volumes")?;
        Ok(self.volumes.lock().values().cloned().collect())
    }

    async fn modify_volume(&self, id: u64, options: &BackendOptions) -> ClientResult<()> {
        self.record(Call::ModifyVolume(id, options.clone()), "modify_volume")?;
        let mut volumes = self.volumes.lock();
        let name = volumes
            .values()
            .find(|v| v.id == id)
            .map(|v| v.name.clone())
            .ok_or_else(|| Self::not_found(&format!("volume {}", id)))?;
        let Some(mut volume) = volumes.remove(&name) else {
            return Err(Self::not_found(&name));
        };
        if let Some(OptionValue::Str(new_name)) = options.get("name") {
            volume.name = new_name.clone();
        }
        if let Some(OptionValue::Int(size)) = options.get("size") {
            volume.size = *size as u64;
        }
        if let Some(OptionValue::Str(cluster)) = options.get("clusterName") {
            volume.cluster_name = Some(cluster.clone());
        }
        volumes.insert(volume.name.clone(), volume);
        Ok(())
    }

    async fn delete_volume(&self, id: u64) -> ClientResult<()> {
        self.record(Call::DeleteVolume(id), "delete_volume")?;
        self.volumes.lock().retain(|_, v| v.id != id);
        Ok(())
    }

    async fn clone_volume(&self, name: &str, source_id: u64) -> ClientResult<BackendVolume> {
        self.record(Call::CloneVolume(name.to_string(), source_id), "clone_volume")?;
        let source = self.volume_by_id(source_id)?;
        Ok(self.new_volume(name, source.size))
    }

    async fn create_snapshot(
        &self,
        name: &str,
        volume_id: u64,
        options: &BackendOptions,
    ) -> ClientResult<BackendSnapshot> {
        self.record(
            Call::CreateSnapshot {
                name: name.to_string(),
                volume_id,
                options: options.clone(),
            },
            "create_snapshot",
        )?;
        let parent = self.volume_by_id(volume_id)?;
        let id = self.next_id();
        self.add_snapshot(name, id, &parent.name);
        Ok(self.snapshots.lock()[name].0.clone())
    }

    async fn get_snapshot_by_name(&self, name: &str) -> ClientResult<BackendSnapshot> {
        self.record(Call::GetSnapshotByName(name.to_string()), "get_snapshot_by_name")?;
        self.snapshots
            .lock()
            .get(name)
            .map(|(s, _)| s.clone())
            .ok_or_else(|| Self::not_found(name))
    }

    async fn get_snapshot_parent_volume(&self, snapshot_name: &str) -> ClientResult<BackendVolume> {
        self.record(
            Call::GetSnapshotParentVolume(snapshot_name.to_string()),
            "get_snapshot_parent_volume",
        )?;
        let parent = self
            .snapshots
            .lock()
            .get(snapshot_name)
            .map(|(_, parent)| parent.clone())
            .ok_or_else(|| Self::not_found(snapshot_name))?;
        Ok(self.volumes.lock().get(&parent).cloned().unwrap_or(BackendVolume {
            name: parent,
            ..Default::default()
        }))
    }

    async fn modify_snapshot(&self, id: u64, options: &BackendOptions) -> ClientResult<()> {
        self.record(Call::ModifySnapshot(id, options.clone()), "modify_snapshot")?;
        let mut snapshots = self.snapshots.lock();
        let name = snapshots
            .iter()
            .find(|(_, (s, _))| s.id == id)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| Self::not_found(&format!("snapshot {}", id)))?;
        if let (Some(OptionValue::Str(new_name)), Some((mut snapshot, parent))) =
            (options.get("name"), snapshots.remove(&name))
        {
            snapshot.name = new_name.clone();
            snapshots.insert(new_name.clone(), (snapshot, parent));
        }
        Ok(())
    }

    async fn delete_snapshot(&self, id: u64) -> ClientResult<()> {
        self.record(Call::DeleteSnapshot(id), "delete_snapshot")?;
        self.snapshots.lock().retain(|_, (s, _)| s.id != id);
        Ok(())
    }

    async fn clone_snapshot(&self, name: &str, snapshot_id: u64) -> ClientResult<BackendVolume> {
        self.record(Call::CloneSnapshot(name.to_string(), snapshot_id), "clone_snapshot")?;
        let size = self
            .snapshots
            .lock()
            .values()
            .find(|(s, _)| s.id == snapshot_id)
            .map(|(s, _)| s.size)
            .ok_or_else(|| Self::not_found(&format!("snapshot {}", snapshot_id)))?;
        Ok(self.new_volume(name, size))
    }

    async fn get_server_by_name(&self, name: &str) -> ClientResult<Server> {
        self.record(Call::GetServerByName(name.to_string()), "get_server_by_name")?;
        self.servers
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Self::not_found(name))
    }

    async fn create_server(
        &self,
        name: &str,
        iqn: &str,
        chap: Option<&ChapCredentials>,
    ) -> ClientResult<Server> {
        self.record(
            Call::CreateServer {
                name: name.to_string(),
                iqn: iqn.to_string(),
                chap: chap.cloned(),
            },
            "create_server",
        )?;
        let server = Server {
            id: 0,
            name: name.to_string(),
            chap_authentication_required: chap.is_some(),
            chap_name: chap.map(|c| c.name.clone()),
            chap_target_secret: chap.map(|c| c.secret.clone()),
        };
        self.add_server(server.clone());
        Ok(server)
    }

    async fn delete_server(&self, id: u64) -> ClientResult<()> {
        self.record(Call::DeleteServer(id), "delete_server")?;
        self.servers.lock().retain(|_, s| s.id != id);
        Ok(())
    }

    async fn find_server_volumes(&self, server_name: &str) -> ClientResult<Vec<BackendVolume>> {
        self.record(Call::FindServerVolumes(server_name.to_string()), "find_server_volumes")?;
        Ok(self
            .server_volumes
            .lock()
            .get(server_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_server_access(&self, volume_id: u64, server_id: u64) -> ClientResult<()> {
        self.record(Call::AddServerAccess(volume_id, server_id), "add_server_access")
    }

    async fn remove_server_access(&self, volume_id: u64, server_id: u64) -> ClientResult<()> {
        self.record(Call::RemoveServerAccess(volume_id, server_id), "remove_server_access")
    }

    async fn does_remote_snapshot_schedule_exist(&self, name: &str) -> ClientResult<bool> {
        self.record(Call::ScheduleExists(name.to_string()), "schedule_exists")?;
        Ok(self.schedules.lock().contains(name))
    }

    async fn create_remote_snapshot_schedule(
        &self,
        schedule: &RemoteSnapshotSchedule,
    ) -> ClientResult<()> {
        self.record(Call::CreateSchedule(schedule.clone()), "create_schedule")?;
        let mut schedules = self.schedules.lock();
        schedules.insert(format!("{}_Pri", schedule.schedule_name));
        schedules.insert(format!("{}_Rmt", schedule.schedule_name));
        Ok(())
    }

    async fn start_remote_snapshot_schedule(&self, name: &str) -> ClientResult<()> {
        self.record(Call::StartSchedule(name.to_string()), "start_schedule")
    }

    async fn stop_remote_snapshot_schedule(&self, name: &str) -> ClientResult<()> {
        self.record(Call::StopSchedule(name.to_string()), "stop_schedule")
    }

    async fn delete_remote_snapshot_schedule(&self, name: &str) -> ClientResult<()> {
        self.record(Call::DeleteSchedule(name.to_string()), "delete_schedule")?;
        self.schedules.lock().retain(|s| !s.starts_with(name));
        Ok(())
    }
}

/// Hands out fakes keyed by API URL
#[derive(Default)]
pub struct FakeConnector {
    arrays: Mutex<BTreeMap<String, Arc<FakeLeftHand>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_array(self, api_url: &str, array: Arc<FakeLeftHand>) -> Self {
        self.arrays.lock().insert(api_url.to_string(), array);
        self
    }
}

impl LeftHandConnector for FakeConnector {
    fn connect(&self, endpoint: &LeftHandEndpoint) -> ClientResult<LeftHandClientRef> {
        let array = self
            .arrays
            .lock()
            .get(&endpoint.api_url)
            .cloned()
            .ok_or_else(|| ClientError::Unexpected(format!("no array at {}", endpoint.api_url)))?;
        Ok(array as LeftHandClientRef)
    }
}

// =============================================================================
// Driver Fixtures
// =============================================================================

pub const API_URL: &str = "http://fake.foo:8080/lhos";
pub const API_URL2: &str = "http://fake2.foo2:8080/lhos";
pub const CLUSTER_NAME: &str = "CloudCluster1";
pub const TARGET_CLUSTER_NAME: &str = "CloudCluster2";
pub const GOODNESS_FUNCTION: &str = "capabilities.capacity_utilization < 0.6? 100 : 25";
pub const FILTER_FUNCTION: &str = "capabilities.total_volumes < 400 && capabilities.capacity_utilization < 0.8";
pub const FAILOVER_HOST: &str = "fakefailover@foo#destfakepool";
pub const INITIATOR: &str = "iqn.1993-08.org.debian:01:222";

pub fn test_config() -> LeftHandConfig {
    LeftHandConfig {
        api_url: API_URL.into(),
        username: "foo1".into(),
        password: "bar2".into(),
        cluster_name: CLUSTER_NAME.into(),
        goodness_function: Some(GOODNESS_FUNCTION.into()),
        filter_function: Some(FILTER_FUNCTION.into()),
        reserved_percentage: 25,
        ..Default::default()
    }
}

pub fn replicated_config() -> LeftHandConfig {
    LeftHandConfig {
        replication_targets: vec![ReplicationTargetConfig {
            target_device_id: "target".into(),
            managed_backend_name: Some(FAILOVER_HOST.into()),
            api_url: API_URL2.into(),
            username: "foo1".into(),
            password: "bar2".into(),
            cluster_name: TARGET_CLUSTER_NAME.into(),
            ssh_port: 16022,
            ssh_conn_timeout_secs: 30,
            san_private_key: None,
        }],
        ..test_config()
    }
}

/// Driver wired to a primary array and a target array, set up and with the
/// setup calls cleared
pub async fn setup_driver(
    config: LeftHandConfig,
) -> (LeftHandDriver, Arc<FakeLeftHand>, Arc<FakeLeftHand>) {
    let primary = FakeLeftHand::new(CLUSTER_NAME, 1, "10.0.1.6");
    let target = FakeLeftHand::new(TARGET_CLUSTER_NAME, 6, "10.0.1.7");
    let connector = FakeConnector::new()
        .with_array(API_URL, primary.clone())
        .with_array(API_URL2, target.clone());

    let driver = LeftHandDriver::new(config, Arc::new(connector)).unwrap();
    driver.do_setup().await.unwrap();
    primary.clear_calls();
    target.clear_calls();
    (driver, primary, target)
}

/// Host volume named like the backend volume it maps to
pub fn volume(name: &str, id: &str, size_gb: u64) -> Volume {
    Volume {
        name: name.to_string(),
        display_name: Some("Foo Volume".to_string()),
        ..Volume::new(id, size_gb)
    }
}

pub fn replicated(volume: Volume) -> Volume {
    volume.with_type(VolumeType::new(
        "replicated",
        [("replication_enabled", "<is> True")],
    ))
}

pub fn connector() -> Connector {
    Connector {
        ip: "10.0.0.2".into(),
        initiator: INITIATOR.into(),
        host: "fakehost".into(),
    }
}

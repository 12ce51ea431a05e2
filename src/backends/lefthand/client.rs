//! LeftHand Client Port
//!
//! Resource operations the LeftHand driver needs from the array. The REST
//! adapter in [`super::rest`] implements them over `/lhos`; remote snapshot
//! schedules go through the CLIQ shell in [`super::cliq`].

use crate::backends::http::ClientResult;
use crate::config::{LeftHandConfig, ReplicationTargetConfig};
use crate::domain::ports::BackendOptions;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Backend Resources
// =============================================================================

/// Virtual IP entry of a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualIp {
    #[serde(rename = "ipV4Address")]
    pub ipv4_address: String,
}

/// Storage cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "virtualIPAddresses", default)]
    pub virtual_ip_addresses: Vec<VirtualIp>,
    #[serde(default)]
    pub space_total: u64,
    #[serde(default)]
    pub space_available: u64,
}

impl Cluster {
    /// First virtual IP of the cluster
    pub fn vip(&self) -> Option<&str> {
        self.virtual_ip_addresses
            .first()
            .map(|v| v.ipv4_address.as_str())
    }
}

/// Link to another resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(default)]
    pub uri: String,
}

/// Active iSCSI session on a volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiSession {
    #[serde(default)]
    pub server: ResourceRef,
}

/// Snapshot collection embedded in a volume when requested via `fields`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotCollection {
    #[serde(default)]
    pub resource: Option<Value>,
}

/// Volume as reported by the array
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendVolume {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    /// Size in bytes
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub iscsi_iqn: Option<String>,
    #[serde(default)]
    pub iscsi_sessions: Option<Vec<IscsiSession>>,
    #[serde(default)]
    pub snapshots: Option<SnapshotCollection>,
}

impl BackendVolume {
    /// Whether `server_id` already has a session on this volume
    pub fn has_session_for(&self, server_id: u64) -> bool {
        let suffix = format!("/servers/{}", server_id);
        self.iscsi_sessions
            .iter()
            .flatten()
            .any(|s| s.server.uri.ends_with(&suffix))
    }

    pub fn has_sessions(&self) -> bool {
        self.iscsi_sessions
            .as_ref()
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    /// Whether the volume has snapshots (only populated by `getVolume` with
    /// snapshot fields)
    pub fn has_snapshots(&self) -> bool {
        self.snapshots
            .as_ref()
            .and_then(|s| s.resource.as_ref())
            .map(|r| !r.is_null())
            .unwrap_or(false)
    }
}

/// Snapshot as reported by the array
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSnapshot {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    /// Size in bytes
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub volume: Option<ResourceRef>,
}

/// iSCSI server (initiator host) registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub chap_authentication_required: bool,
    #[serde(default)]
    pub chap_name: Option<String>,
    #[serde(default)]
    pub chap_target_secret: Option<String>,
}

/// CHAP credentials for a new server registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapCredentials {
    pub name: String,
    pub secret: String,
}

/// Remote snapshot schedule replicating a volume to another cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSnapshotSchedule {
    pub volume_name: String,
    pub schedule_name: String,
    pub period_secs: u64,
    /// `YYYY-MM-DDTHH:MM:SSZ`
    pub start_time: String,
    pub retention_count: u32,
    pub source_cluster: String,
    pub remote_retention_count: u32,
    pub remote_volume_name: String,
    pub remote_ip: String,
    pub remote_username: String,
    pub remote_password: String,
}

// =============================================================================
// Client Port
// =============================================================================

/// Resource operations offered by a LeftHand management group.
///
/// Each instance carries at most one session: `login` starts it and
/// `logout` ends it.
#[async_trait]
pub trait LeftHandApi: Send + Sync {
    // Session
    async fn login(&self, username: &str, password: &str) -> ClientResult<()>;
    async fn logout(&self) -> ClientResult<()>;
    async fn get_api_version(&self) -> ClientResult<String>;

    // Clusters
    async fn get_cluster_by_name(&self, name: &str) -> ClientResult<Cluster>;
    async fn get_cluster(&self, id: u64) -> ClientResult<Cluster>;
    async fn get_ip_from_cluster(&self, cluster_name: &str) -> ClientResult<String>;

    // Volumes
    async fn create_volume(
        &self,
        name: &str,
        cluster_id: u64,
        size_bytes: u64,
        options: &BackendOptions,
    ) -> ClientResult<BackendVolume>;
    async fn get_volume(&self, id: u64, fields: &str) -> ClientResult<BackendVolume>;
    async fn get_volume_by_name(&self, name: &str) -> ClientResult<BackendVolume>;
    async fn get_volumes(&self, cluster_name: &str) -> ClientResult<Vec<BackendVolume>>;
    async fn modify_volume(&self, id: u64, options: &BackendOptions) -> ClientResult<()>;
    async fn delete_volume(&self, id: u64) -> ClientResult<()>;
    async fn clone_volume(&self, name: &str, source_id: u64) -> ClientResult<BackendVolume>;

    // Snapshots
    async fn create_snapshot(
        &self,
        name: &str,
        volume_id: u64,
        options: &BackendOptions,
    ) -> ClientResult<BackendSnapshot>;
    async fn get_snapshot_by_name(&self, name: &str) -> ClientResult<BackendSnapshot>;
    async fn get_snapshot_parent_volume(&self, snapshot_name: &str) -> ClientResult<BackendVolume>;
    async fn modify_snapshot(&self, id: u64, options: &BackendOptions) -> ClientResult<()>;
    async fn delete_snapshot(&self, id: u64) -> ClientResult<()>;
    async fn clone_snapshot(&self, name: &str, snapshot_id: u64) -> ClientResult<BackendVolume>;

    // Servers
    async fn get_server_by_name(&self, name: &str) -> ClientResult<Server>;
    async fn create_server(
        &self,
        name: &str,
        iqn: &str,
        chap: Option<&ChapCredentials>,
    ) -> ClientResult<Server>;
    async fn delete_server(&self, id: u64) -> ClientResult<()>;
    async fn find_server_volumes(&self, server_name: &str) -> ClientResult<Vec<BackendVolume>>;
    async fn add_server_access(&self, volume_id: u64, server_id: u64) -> ClientResult<()>;
    async fn remove_server_access(&self, volume_id: u64, server_id: u64) -> ClientResult<()>;

    // Remote snapshot schedules
    async fn does_remote_snapshot_schedule_exist(&self, name: &str) -> ClientResult<bool>;
    async fn create_remote_snapshot_schedule(
        &self,
        schedule: &RemoteSnapshotSchedule,
    ) -> ClientResult<()>;
    async fn start_remote_snapshot_schedule(&self, name: &str) -> ClientResult<()>;
    async fn stop_remote_snapshot_schedule(&self, name: &str) -> ClientResult<()>;
    async fn delete_remote_snapshot_schedule(&self, name: &str) -> ClientResult<()>;
}

pub type LeftHandClientRef = Arc<dyn LeftHandApi>;

// =============================================================================
// Endpoints
// =============================================================================

/// SSH access to the array's command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub private_key: Option<PathBuf>,
    pub conn_timeout: Duration,
}

/// Everything needed to open a session against one management group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeftHandEndpoint {
    pub api_url: String,
    pub username: String,
    pub password: String,
    pub cluster_name: String,
    pub ssh: SshSettings,
}

impl LeftHandEndpoint {
    /// Endpoint of the primary array
    pub fn primary(config: &LeftHandConfig) -> crate::Result<Self> {
        Ok(Self {
            api_url: config.api_url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            cluster_name: config.cluster_name.clone(),
            ssh: SshSettings {
                host: config.ssh_host()?,
                port: config.ssh_port,
                username: config.username.clone(),
                private_key: config.san_private_key.clone(),
                conn_timeout: Duration::from_secs(config.ssh_conn_timeout_secs),
            },
        })
    }

    /// Endpoint of a replication target
    pub fn target(target: &ReplicationTargetConfig) -> crate::Result<Self> {
        Ok(Self {
            api_url: target.api_url.clone(),
            username: target.username.clone(),
            password: target.password.clone(),
            cluster_name: target.cluster_name.clone(),
            ssh: SshSettings {
                host: crate::config::host_from_url(&target.api_url)?,
                port: target.ssh_port,
                username: target.username.clone(),
                private_key: target.san_private_key.clone(),
                conn_timeout: Duration::from_secs(target.ssh_conn_timeout_secs),
            },
        })
    }
}

/// Builds a fresh client for one session against an endpoint
pub trait LeftHandConnector: Send + Sync {
    fn connect(&self, endpoint: &LeftHandEndpoint) -> ClientResult<LeftHandClientRef>;
}

pub type LeftHandConnectorRef = Arc<dyn LeftHandConnector>;

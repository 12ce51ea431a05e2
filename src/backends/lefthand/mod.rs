//! LeftHand iSCSI Driver
//!
//! Implements the full [`VolumeDriver`] contract against a LeftHand
//! management group. Every operation opens its own session (login, calls,
//! logout); a failed logout is only logged.

pub mod client;
pub mod cliq;
pub mod rest;
pub mod specs;

mod lifecycle;
mod replication;

#[cfg(test)]
pub(crate) mod testing;

pub use client::*;
pub use rest::{LeftHandRestClient, RestConnector};
pub use specs::LeftHandSpecMapper;

use crate::backends::http::{ClientError, ReqwestTransport, TransportConfig};
use crate::config::LeftHandConfig;
use crate::domain::model::{
    Connector, ConnectionInfo, ExistingRef, HostInfo, MigratedVolumeUpdate, MigrationOutcome,
    ModelUpdate, ReplicationTargets, Snapshot, Volume, VolumeStats, VolumeType, GIB,
};
use crate::domain::ports::{DriverCapabilities, VolumeDriver};
use crate::error::{Error, Result};
use async_trait::async_trait;
use cliq::ProcessCommandRunner;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Backend family name
pub const BACKEND_NAME: &str = "lefthand";

/// Prefix of the location descriptor advertised in stats
pub const DRIVER_LOCATION_PREFIX: &str = "LeftHandISCSIDriver";

/// Oldest management API release the driver works with
pub const MIN_API_VERSION: (u32, u32) = (1, 1);

// =============================================================================
// Cluster Info
// =============================================================================

/// Resolved identity of a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub id: u64,
    pub name: String,
    pub vip: String,
}

impl ClusterInfo {
    fn from_cluster(name: &str, cluster: &Cluster) -> Result<Self> {
        let vip = cluster.vip().ok_or_else(|| {
            Error::backend(
                BACKEND_NAME,
                "get_cluster_by_name",
                format!("cluster {} has no virtual IP", name),
            )
        })?;
        Ok(Self {
            id: cluster.id,
            name: name.to_string(),
            vip: vip.to_string(),
        })
    }

    /// `LeftHandISCSIDriver:<cluster>:<vip>`
    pub fn location_info(&self) -> String {
        format!("{}:{}:{}", DRIVER_LOCATION_PREFIX, self.name, self.vip)
    }
}

/// Convert an adapter failure into a driver error
pub(crate) fn api_error(operation: &str, err: ClientError) -> Error {
    error!("LeftHand {} failed: {}", operation, err);
    Error::backend(BACKEND_NAME, operation, err.message())
}

/// Parse `major.minor[.patch]` and compare against the minimum
pub(crate) fn check_api_version(version: &str) -> Result<()> {
    let mut parts = version.trim().split('.').map(|p| p.parse::<u32>());
    let parsed = match (parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(minor))) => (major, minor),
        (Some(Ok(major)), None) => (major, 0),
        _ => {
            return Err(Error::InvalidConfiguration(format!(
                "Unrecognized LeftHand API version: {}",
                version
            )))
        }
    };

    if parsed < MIN_API_VERSION {
        return Err(Error::InvalidConfiguration(format!(
            "LeftHand API version {} is not supported, minimum is {}.{}",
            version, MIN_API_VERSION.0, MIN_API_VERSION.1
        )));
    }
    Ok(())
}

// =============================================================================
// Driver
// =============================================================================

/// Volume driver for LeftHand iSCSI arrays
pub struct LeftHandDriver {
    config: LeftHandConfig,
    primary: LeftHandEndpoint,
    connector: LeftHandConnectorRef,
    mapper: LeftHandSpecMapper,
    cluster: RwLock<Option<ClusterInfo>>,
    /// Target cluster by `target_device_id`
    target_clusters: RwLock<BTreeMap<String, ClusterInfo>>,
    api_version: RwLock<Option<String>>,
    stats: RwLock<Option<VolumeStats>>,
}

impl LeftHandDriver {
    /// Create a new LeftHand driver using `connector` to reach the arrays
    pub fn new(config: LeftHandConfig, connector: LeftHandConnectorRef) -> Result<Self> {
        let primary = LeftHandEndpoint::primary(&config)?;
        Ok(Self {
            config,
            primary,
            connector,
            mapper: LeftHandSpecMapper::new(),
            cluster: RwLock::new(None),
            target_clusters: RwLock::new(BTreeMap::new()),
            api_version: RwLock::new(None),
            stats: RwLock::new(None),
        })
    }

    /// Create a driver talking REST over reqwest and CLIQ over the system ssh
    pub fn from_config(config: LeftHandConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(&TransportConfig {
            timeout: config.request_timeout(),
            verify_tls: config.verify_tls,
            client_identity_pem: None,
        })
        .map_err(|e| Error::InvalidConfiguration(format!("HTTP client: {}", e)))?;

        let connector = RestConnector::new(
            Arc::new(transport),
            Arc::new(ProcessCommandRunner),
            config.ssh_bin.clone(),
        );
        Self::new(config, Arc::new(connector))
    }

    pub fn config(&self) -> &LeftHandConfig {
        &self.config
    }

    /// Run `op` inside a session against `endpoint`
    pub(crate) async fn with_session<T, F, Fut>(&self, endpoint: &LeftHandEndpoint, op: F) -> Result<T>
    where
        F: FnOnce(LeftHandClientRef) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let client = self
            .connector
            .connect(endpoint)
            .map_err(|e| api_error("connect", e))?;
        client
            .login(&endpoint.username, &endpoint.password)
            .await
            .map_err(|e| api_error("login", e))?;

        let result = op(client.clone()).await;

        if let Err(e) = client.logout().await {
            warn!("Failed to log out of {}: {}", endpoint.api_url, e);
        }
        result
    }

    /// Primary cluster, resolved on first use
    pub(crate) async fn cluster_info(&self, client: &dyn LeftHandApi) -> Result<ClusterInfo> {
        if let Some(cluster) = self.cluster.read().clone() {
            return Ok(cluster);
        }

        let name = &self.config.cluster_name;
        let cluster = client
            .get_cluster_by_name(name)
            .await
            .map_err(|e| api_error("get_cluster_by_name", e))?;
        let info = ClusterInfo::from_cluster(name, &cluster)?;
        *self.cluster.write() = Some(info.clone());
        Ok(info)
    }

    /// Cluster of a replication target, resolved on first use
    pub(crate) async fn target_cluster_info(
        &self,
        target_device_id: &str,
        cluster_name: &str,
        client: &dyn LeftHandApi,
    ) -> Result<ClusterInfo> {
        if let Some(cluster) = self.target_clusters.read().get(target_device_id).cloned() {
            return Ok(cluster);
        }

        let cluster = client
            .get_cluster_by_name(cluster_name)
            .await
            .map_err(|e| api_error("get_cluster_by_name", e))?;
        let info = ClusterInfo::from_cluster(cluster_name, &cluster)?;
        self.target_clusters
            .write()
            .insert(target_device_id.to_string(), info.clone());
        Ok(info)
    }

    async fn setup_in(&self, client: &dyn LeftHandApi) -> Result<()> {
        let version = client
            .get_api_version()
            .await
            .map_err(|e| api_error("get_api_version", e))?;
        check_api_version(&version)?;
        debug!("LeftHand API version {}", version);

        *self.cluster.write() = None;
        let cluster = self.cluster_info(client).await?;
        *self.api_version.write() = Some(version);

        info!(
            "LeftHand cluster {} resolved (id {}, vip {})",
            cluster.name, cluster.id, cluster.vip
        );
        Ok(())
    }

    async fn setup_target(&self, target_device_id: &str) -> Result<()> {
        let target = self
            .config
            .replication_target(target_device_id)
            .ok_or_else(|| Error::InvalidConfiguration(format!("unknown target {}", target_device_id)))?;
        let endpoint = LeftHandEndpoint::target(target)?;

        self.target_clusters.write().remove(target_device_id);
        let cluster = self
            .with_session(&endpoint, |client| async move {
                self.target_cluster_info(target_device_id, &target.cluster_name, client.as_ref())
                    .await
            })
            .await?;

        info!(
            "Replication target {} uses cluster {} (id {})",
            target_device_id, cluster.name, cluster.id
        );
        Ok(())
    }

    async fn stats_in(&self, client: &dyn LeftHandApi) -> Result<VolumeStats> {
        let cluster_info = self.cluster_info(client).await?;
        let cluster = client
            .get_cluster(cluster_info.id)
            .await
            .map_err(|e| api_error("get_cluster", e))?;
        let volumes = client
            .get_volumes(&cluster_info.name)
            .await
            .map_err(|e| api_error("get_volumes", e))?;

        let gib = GIB as f64;
        let total = cluster.space_total as f64;
        let available = cluster.space_available as f64;
        let provisioned: u64 = volumes.iter().map(|v| v.size).sum();
        let utilization = if cluster.space_total > 0 {
            (total - available) / total * 100.0
        } else {
            0.0
        };

        Ok(VolumeStats {
            volume_backend_name: self
                .config
                .volume_backend_name
                .clone()
                .unwrap_or_else(|| DRIVER_LOCATION_PREFIX.to_string()),
            vendor_name: "Hewlett Packard Enterprise".to_string(),
            driver_version: crate::VERSION.to_string(),
            storage_protocol: "iSCSI".to_string(),
            total_capacity_gb: total / gib,
            free_capacity_gb: available / gib,
            reserved_percentage: self.config.reserved_percentage,
            thin_provisioning_support: true,
            thick_provisioning_support: true,
            consistencygroup_support: true,
            replication_enabled: !self.config.replication_targets.is_empty(),
            replication_count: self.config.replication_targets.len(),
            location_info: Some(cluster_info.location_info()),
            provisioned_capacity_gb: Some(provisioned as f64 / gib),
            capacity_utilization: Some(utilization),
            total_volumes: Some(volumes.len() as u64),
            goodness_function: self.config.goodness_function.clone(),
            filter_function: self.config.filter_function.clone(),
            updated_at: Some(chrono::Utc::now()),
        })
    }
}

// =============================================================================
// VolumeDriver Implementation
// =============================================================================

#[async_trait]
impl VolumeDriver for LeftHandDriver {
    fn backend_name(&self) -> &str {
        BACKEND_NAME
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            replication: true,
            manage_existing: true,
            migration: true,
            retype: true,
            consistency_groups: true,
        }
    }

    async fn do_setup(&self) -> Result<()> {
        self.config.validate()?;

        self.with_session(&self.primary, |client| async move {
            self.setup_in(client.as_ref()).await
        })
        .await?;

        for target in &self.config.replication_targets {
            if let Err(e) = self.setup_target(&target.target_device_id).await {
                warn!(
                    "Replication target {} is unreachable: {}",
                    target.target_device_id, e
                );
            }
        }
        Ok(())
    }

    async fn check_for_setup_error(&self) -> Result<()> {
        self.config.validate()?;
        match self.api_version.read().as_deref() {
            Some(version) => check_api_version(version),
            None => Err(Error::InvalidConfiguration(
                "LeftHand backend has not been set up".into(),
            )),
        }
    }

    async fn create_volume(&self, volume: &Volume) -> Result<ModelUpdate> {
        self.with_session(&self.primary, |client| async move {
            self.create_volume_in(client.as_ref(), volume).await
        })
        .await
    }

    async fn delete_volume(&self, volume: &Volume) -> Result<()> {
        let replicated = volume.is_replicated() && !self.config.replication_targets.is_empty();
        if replicated {
            self.delete_replication_schedule(volume).await;
        }

        // Replicas go only once the primary is gone
        self.with_session(&self.primary, |client| async move {
            self.delete_volume_in(client.as_ref(), volume).await
        })
        .await?;

        if replicated {
            self.delete_replicas(volume).await;
        }
        Ok(())
    }

    async fn extend_volume(&self, volume: &Volume, new_size_gb: u64) -> Result<()> {
        self.with_session(&self.primary, |client| async move {
            self.extend_volume_in(client.as_ref(), volume, new_size_gb).await
        })
        .await
    }

    async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.with_session(&self.primary, |client| async move {
            self.create_snapshot_in(client.as_ref(), snapshot).await
        })
        .await
    }

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.with_session(&self.primary, |client| async move {
            self.delete_snapshot_in(client.as_ref(), snapshot).await
        })
        .await
    }

    async fn create_volume_from_snapshot(
        &self,
        volume: &Volume,
        snapshot: &Snapshot,
    ) -> Result<ModelUpdate> {
        self.with_session(&self.primary, |client| async move {
            self.create_from_snapshot_in(client.as_ref(), volume, snapshot)
                .await
        })
        .await
    }

    async fn create_cloned_volume(&self, volume: &Volume, source: &Volume) -> Result<ModelUpdate> {
        self.with_session(&self.primary, |client| async move {
            self.clone_volume_in(client.as_ref(), volume, source).await
        })
        .await
    }

    async fn initialize_connection(
        &self,
        volume: &Volume,
        connector: &Connector,
    ) -> Result<ConnectionInfo> {
        self.with_session(&self.primary, |client| async move {
            self.initialize_connection_in(client.as_ref(), volume, connector)
                .await
        })
        .await
    }

    async fn terminate_connection(&self, volume: &Volume, connector: &Connector) -> Result<()> {
        self.with_session(&self.primary, |client| async move {
            self.terminate_connection_in(client.as_ref(), volume, connector)
                .await
        })
        .await
    }

    async fn get_volume_stats(&self, refresh: bool) -> Result<VolumeStats> {
        if !refresh {
            if let Some(stats) = self.stats.read().clone() {
                return Ok(stats);
            }
        }

        let stats = self
            .with_session(&self.primary, |client| async move {
                self.stats_in(client.as_ref()).await
            })
            .await?;
        *self.stats.write() = Some(stats.clone());
        Ok(stats)
    }

    async fn retype(&self, volume: &Volume, new_type: &VolumeType, host: &HostInfo) -> Result<bool> {
        debug!("Retyping {} to {} on {}", volume.name, new_type.name, host.host);
        self.with_session(&self.primary, |client| async move {
            self.retype_in(client.as_ref(), volume, new_type).await
        })
        .await
    }

    async fn migrate_volume(&self, volume: &Volume, host: &HostInfo) -> Result<MigrationOutcome> {
        self.migrate_volume_checked(volume, host).await
    }

    async fn update_migrated_volume(
        &self,
        volume: &Volume,
        new_volume: &Volume,
        original_status: &str,
    ) -> Result<MigratedVolumeUpdate> {
        self.update_migrated_volume_in(volume, new_volume, original_status)
            .await
    }

    async fn manage_existing(&self, volume: &Volume, existing: &ExistingRef) -> Result<ModelUpdate> {
        let source_name = lifecycle::existing_ref_name(existing)?;
        self.with_session(&self.primary, |client| async move {
            self.manage_existing_in(client.as_ref(), volume, &source_name)
                .await
        })
        .await
    }

    async fn manage_existing_get_size(&self, volume: &Volume, existing: &ExistingRef) -> Result<u64> {
        let _ = volume;
        let source_name = lifecycle::unmanaged_ref_name(existing, "volume-")?;
        self.with_session(&self.primary, |client| async move {
            let backend = client
                .get_volume_by_name(&source_name)
                .await
                .map_err(|e| lifecycle::lookup_error("manage_existing_get_size", &source_name, e))?;
            Ok(lifecycle::size_in_gib(backend.size))
        })
        .await
    }

    async fn manage_existing_snapshot(
        &self,
        snapshot: &Snapshot,
        existing: &ExistingRef,
    ) -> Result<ModelUpdate> {
        lifecycle::ensure_not_failed_over(&snapshot.volume, Error::InvalidInput)?;
        let source_name = lifecycle::existing_ref_name(existing)?;
        self.with_session(&self.primary, |client| async move {
            self.manage_existing_snapshot_in(client.as_ref(), snapshot, &source_name)
                .await
        })
        .await
    }

    async fn manage_existing_snapshot_get_size(
        &self,
        snapshot: &Snapshot,
        existing: &ExistingRef,
    ) -> Result<u64> {
        let _ = snapshot;
        let source_name = lifecycle::unmanaged_ref_name(existing, "snapshot-")?;
        self.with_session(&self.primary, |client| async move {
            let backend = client.get_snapshot_by_name(&source_name).await.map_err(|e| {
                lifecycle::lookup_error("manage_existing_snapshot_get_size", &source_name, e)
            })?;
            Ok(lifecycle::size_in_gib(backend.size))
        })
        .await
    }

    async fn unmanage(&self, volume: &Volume) -> Result<()> {
        self.with_session(&self.primary, |client| async move {
            self.unmanage_in(client.as_ref(), volume).await
        })
        .await
    }

    async fn unmanage_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        lifecycle::ensure_not_failed_over(&snapshot.volume, |reason| Error::SnapshotBusy {
            snapshot: snapshot.name.clone(),
            reason,
        })?;
        self.with_session(&self.primary, |client| async move {
            self.unmanage_snapshot_in(client.as_ref(), snapshot).await
        })
        .await
    }

    async fn replication_enable(&self, volume: &Volume) -> Result<ModelUpdate> {
        self.with_session(&self.primary, |client| async move {
            self.enable_replication_in(client.as_ref(), volume).await
        })
        .await
    }

    async fn replication_disable(&self, volume: &Volume) -> Result<ModelUpdate> {
        Ok(self.disable_replication(volume).await)
    }

    async fn replication_failover(&self, volume: &Volume, target_device_id: &str) -> Result<ModelUpdate> {
        self.failover(volume, target_device_id).await
    }

    async fn list_replication_targets(&self, volume: &Volume) -> Result<ReplicationTargets> {
        Ok(self.replication_targets(volume))
    }
}

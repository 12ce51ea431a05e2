//! Datera iSCSI Driver
//!
//! Core lifecycle only. Replication, manage/unmanage, retype and migration
//! fall through to the [`VolumeDriver`] defaults and report `NotSupported`.

pub mod client;

pub use client::{DateraApi, DateraClientRef, DateraRestClient};

use crate::backends::http::{ClientError, ReqwestTransport, TransportConfig};
use crate::config::DateraConfig;
use crate::domain::model::{
    Connector, ConnectionInfo, ModelUpdate, ProviderLocation, Snapshot, Volume, VolumeStats, GIB,
};
use crate::domain::ports::{DriverCapabilities, VolumeDriver};
use crate::error::{Error, Result};
use async_trait::async_trait;
use client::{volume_path, AppInstance};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Backend family name
pub const BACKEND_NAME: &str = "datera";

fn api_error(operation: &str, err: ClientError) -> Error {
    error!("Datera {} failed: {}", operation, err);
    Error::backend(BACKEND_NAME, operation, err.message())
}

/// Volume driver for Datera clusters
pub struct DateraDriver {
    config: DateraConfig,
    client: DateraClientRef,
    stats: RwLock<Option<VolumeStats>>,
}

impl DateraDriver {
    pub fn new(config: DateraConfig, client: DateraClientRef) -> Self {
        Self {
            config,
            client,
            stats: RwLock::new(None),
        }
    }

    /// Create a driver talking REST over reqwest
    pub fn from_config(config: DateraConfig) -> Result<Self> {
        config.validate()?;

        let client_identity_pem = match (&config.client_cert, &config.client_cert_key) {
            (Some(cert), Some(key)) => {
                let mut pem = std::fs::read(cert)?;
                pem.push(b'\n');
                pem.extend(std::fs::read(key)?);
                Some(pem)
            }
            _ => None,
        };

        let transport = ReqwestTransport::new(&TransportConfig {
            timeout: config.request_timeout(),
            verify_tls: config.verify_tls,
            client_identity_pem,
        })
        .map_err(|e| Error::InvalidConfiguration(format!("HTTP client: {}", e)))?;

        let client = DateraRestClient::new(
            Arc::new(transport),
            config.base_url(),
            config.san_login.clone(),
            config.san_password.clone(),
        );
        Ok(Self::new(config, Arc::new(client)))
    }

    /// Take the app instance offline; a missing instance is not an error
    async fn detach(&self, volume_id: &str) -> Result<()> {
        match self.client.set_admin_state(volume_id, false, true).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                info!("Volume {} not found on the Datera cluster, continuing detach", volume_id);
                Ok(())
            }
            Err(e) => Err(api_error("detach", e)),
        }
    }

    /// Provider location of an app instance that reports iSCSI access
    fn export_location(instance: &AppInstance) -> Option<ProviderLocation> {
        let access = instance.access()?;
        let ip = access.ips.first()?;
        if access.iqn.is_empty() {
            return None;
        }
        // Datera exposes one portal per storage instance
        Some(ProviderLocation::new(ip.clone(), 1, access.iqn.clone(), 0))
    }

    /// Record update carrying the export of a new volume, when the cluster
    /// already reports one
    async fn export_update(&self, volume_id: &str) -> ModelUpdate {
        match self.client.get_app_instance(volume_id).await {
            Ok(instance) => match Self::export_location(&instance) {
                Some(location) => ModelUpdate::with_location(&location),
                None => {
                    debug!("Datera volume {} has no iSCSI access yet", volume_id);
                    ModelUpdate::default()
                }
            },
            Err(e) => {
                warn!("Could not read export of Datera volume {}: {}", volume_id, e);
                ModelUpdate::default()
            }
        }
    }

    /// Timestamp of the snapshot with `uuid` on the volume's app instance
    async fn find_snapshot(&self, volume_id: &str, uuid: &str) -> Result<Option<String>> {
        let snapshots = match self.client.list_snapshots(volume_id).await {
            Ok(snapshots) => snapshots,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(api_error("list_snapshots", e)),
        };
        Ok(snapshots
            .into_iter()
            .find(|(_, snap)| snap.uuid == uuid)
            .map(|(timestamp, _)| timestamp))
    }

    async fn refresh_stats(&self) -> Result<VolumeStats> {
        debug!("Updating Datera cluster stats");
        let system = self
            .client
            .get_system()
            .await
            .map_err(|e| api_error("get_system", e))?;
        if system.uuid.is_none() {
            error!("Datera system report carries no cluster uuid");
        }

        let gib = GIB as f64;
        Ok(VolumeStats {
            volume_backend_name: self
                .config
                .volume_backend_name
                .clone()
                .unwrap_or_else(|| "Datera".to_string()),
            vendor_name: "Datera".to_string(),
            driver_version: crate::VERSION.to_string(),
            storage_protocol: "iSCSI".to_string(),
            total_capacity_gb: system.total_capacity as f64 / gib,
            free_capacity_gb: system.available_capacity as f64 / gib,
            reserved_percentage: 0,
            thin_provisioning_support: true,
            thick_provisioning_support: false,
            consistencygroup_support: false,
            replication_enabled: false,
            replication_count: 0,
            location_info: None,
            provisioned_capacity_gb: None,
            capacity_utilization: None,
            total_volumes: None,
            goodness_function: None,
            filter_function: None,
            updated_at: Some(chrono::Utc::now()),
        })
    }
}

#[async_trait]
impl VolumeDriver for DateraDriver {
    fn backend_name(&self) -> &str {
        BACKEND_NAME
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::default()
    }

    async fn do_setup(&self) -> Result<()> {
        self.config.validate()?;
        debug!("Getting Datera auth token");
        self.client.login().await.map_err(|e| {
            error!("Logging into the Datera cluster failed, check san_login and san_password");
            api_error("login", e)
        })
    }

    async fn check_for_setup_error(&self) -> Result<()> {
        self.config.validate()
    }

    async fn create_volume(&self, volume: &Volume) -> Result<ModelUpdate> {
        self.client
            .create_app_instance(&volume.id, volume.size_gb, self.config.num_replicas)
            .await
            .map_err(|e| api_error("create_volume", e))?;
        info!("Created Datera volume {} ({} GiB)", volume.id, volume.size_gb);
        Ok(self.export_update(&volume.id).await)
    }

    async fn delete_volume(&self, volume: &Volume) -> Result<()> {
        self.detach(&volume.id).await?;
        match self.client.delete_app_instance(&volume.id).await {
            Ok(()) => {
                info!("Deleted Datera volume {}", volume.id);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!("Volume {} not found on the Datera cluster, continuing delete", volume.id);
                Ok(())
            }
            Err(e) => Err(api_error("delete_volume", e)),
        }
    }

    async fn extend_volume(&self, volume: &Volume, new_size_gb: u64) -> Result<()> {
        let instance = self
            .client
            .get_app_instance(&volume.id)
            .await
            .map_err(|e| api_error("extend_volume", e))?;

        let reonline = instance.is_online();
        if reonline {
            self.detach(&volume.id).await?;
        }

        self.client
            .resize_volume(&volume.id, new_size_gb)
            .await
            .map_err(|e| api_error("extend_volume", e))?;

        if reonline {
            self.client
                .set_admin_state(&volume.id, true, false)
                .await
                .map_err(|e| api_error("extend_volume", e))?;
        }
        info!("Extended Datera volume {} to {} GiB", volume.id, new_size_gb);
        Ok(())
    }

    async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.client
            .create_snapshot(&snapshot.volume.id, &snapshot.id)
            .await
            .map_err(|e| api_error("create_snapshot", e))?;
        info!("Created Datera snapshot {} of {}", snapshot.id, snapshot.volume.id);
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let Some(timestamp) = self.find_snapshot(&snapshot.volume.id, &snapshot.id).await? else {
            info!("Snapshot {} not found on the Datera cluster, continuing delete", snapshot.id);
            return Ok(());
        };

        match self
            .client
            .delete_snapshot(&snapshot.volume.id, &timestamp)
            .await
        {
            Ok(()) => {
                info!("Deleted Datera snapshot {}", snapshot.id);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(api_error("delete_snapshot", e)),
        }
    }

    async fn create_volume_from_snapshot(
        &self,
        volume: &Volume,
        snapshot: &Snapshot,
    ) -> Result<ModelUpdate> {
        let timestamp = self
            .find_snapshot(&snapshot.volume.id, &snapshot.id)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: "snapshot".into(),
                name: snapshot.id.clone(),
            })?;

        let source = format!("{}/snapshots/{}", volume_path(&snapshot.volume.id), timestamp);
        self.client
            .clone_app_instance(&volume.id, &source)
            .await
            .map_err(|e| api_error("create_volume_from_snapshot", e))?;
        info!("Created Datera volume {} from snapshot {}", volume.id, snapshot.id);
        Ok(self.export_update(&volume.id).await)
    }

    async fn create_cloned_volume(&self, volume: &Volume, source: &Volume) -> Result<ModelUpdate> {
        self.client
            .clone_app_instance(&volume.id, &volume_path(&source.id))
            .await
            .map_err(|e| api_error("create_cloned_volume", e))?;
        info!("Cloned Datera volume {} from {}", volume.id, source.id);
        Ok(self.export_update(&volume.id).await)
    }

    async fn initialize_connection(
        &self,
        volume: &Volume,
        connector: &Connector,
    ) -> Result<ConnectionInfo> {
        let instance = self
            .client
            .set_admin_state(&volume.id, true, false)
            .await
            .map_err(|e| api_error("initialize_connection", e))?;

        let location = Self::export_location(&instance).ok_or_else(|| {
            Error::backend(
                BACKEND_NAME,
                "initialize_connection",
                format!("app instance {} reports no iSCSI access", volume.id),
            )
        })?;
        info!("Datera volume {} exported to {}", volume.id, connector.host);
        Ok(ConnectionInfo::iscsi(volume, &location))
    }

    async fn terminate_connection(&self, volume: &Volume, connector: &Connector) -> Result<()> {
        debug!("Detaching Datera volume {} from {}", volume.id, connector.host);
        self.detach(&volume.id).await
    }

    async fn get_volume_stats(&self, refresh: bool) -> Result<VolumeStats> {
        let cached = self.stats.read().clone();
        if let (false, Some(stats)) = (refresh, &cached) {
            return Ok(stats.clone());
        }

        match self.refresh_stats().await {
            Ok(stats) => {
                *self.stats.write() = Some(stats.clone());
                Ok(stats)
            }
            Err(e) => {
                error!("Failed to get updated stats from the Datera cluster");
                cached.ok_or(e)
            }
        }
    }
}

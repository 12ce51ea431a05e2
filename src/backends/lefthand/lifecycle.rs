//! Volume and snapshot lifecycle against a LeftHand management group
//!
//! The `*_in` methods run inside a session opened by the caller.

use super::client::{BackendVolume, ChapCredentials, LeftHandApi};
use super::specs::{ADAPTIVE_OPTIMIZATION, CLUSTER_NAME, THIN_PROVISIONED};
use super::{api_error, ClusterInfo, LeftHandDriver, BACKEND_NAME, DRIVER_LOCATION_PREFIX};
use crate::backends::http::ClientError;
use crate::domain::model::{
    Connector, ConnectionInfo, ExistingRef, HostInfo, MigratedVolumeUpdate, MigrationOutcome,
    ModelUpdate, ProviderLocation, ReplicationStatus, Snapshot, Volume, VolumeType, GIB,
};
use crate::domain::ports::{BackendOptions, ExtraSpecMapper, OptionValue};
use crate::error::{Error, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, error, info, warn};

const CLONE_POINT_MESSAGE: &str = "cannot be deleted because it is a clone point";
const SNAPSHOT_FIELDS: &str = "fields=snapshots,snapshots[resource[members[name]]]";
const CHAP_SECRET_LEN: usize = 16;

/// `source-name` of a manage reference
pub(crate) fn existing_ref_name(existing: &ExistingRef) -> Result<String> {
    existing
        .source_name
        .clone()
        .ok_or_else(|| Error::ManageExistingInvalidReference {
            reference: format!("{:?}", existing),
            reason: "Reference must contain source-name".into(),
        })
}

/// `source-name` of a resource that is not yet managed (`prefix` not taken)
pub(crate) fn unmanaged_ref_name(existing: &ExistingRef, managed_prefix: &str) -> Result<String> {
    let name = existing_ref_name(existing)?;
    if name.starts_with(managed_prefix) {
        return Err(Error::ManageExistingInvalidReference {
            reference: name,
            reason: format!(
                "Reference must be the name of an unmanaged resource, not {}*",
                managed_prefix
            ),
        });
    }
    Ok(name)
}

/// Lookup failure of a resource named by the user
pub(crate) fn lookup_error(operation: &str, name: &str, err: ClientError) -> Error {
    if err.is_not_found() {
        return Error::InvalidInput(format!("'{}' does not exist on the array", name));
    }
    api_error(operation, err)
}

/// Bytes to GiB, rounded up
pub(crate) fn size_in_gib(bytes: u64) -> u64 {
    bytes.div_ceil(GIB)
}

pub(crate) fn ensure_not_failed_over(
    volume: &Volume,
    make_error: impl FnOnce(String) -> Error,
) -> Result<()> {
    if volume.replication_status == ReplicationStatus::FailedOver {
        return Err(make_error(format!(
            "volume {} is failed over to a replication target",
            volume.id
        )));
    }
    Ok(())
}

pub(crate) fn generate_chap_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CHAP_SECRET_LEN)
        .map(char::from)
        .collect()
}

fn rename_option(name: &str) -> BackendOptions {
    BackendOptions::from([("name".to_string(), OptionValue::Str(name.to_string()))])
}

fn size_option(size_gb: u64) -> BackendOptions {
    BackendOptions::from([("size".to_string(), OptionValue::Int((size_gb * GIB) as i64))])
}

/// `LeftHandISCSIDriver:<cluster>:<vip>` to (cluster, vip)
fn parse_location_info(info: &str) -> Option<(&str, &str)> {
    let mut parts = info.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(DRIVER_LOCATION_PREFIX), Some(cluster), Some(vip))
            if !cluster.is_empty() && !vip.is_empty() =>
        {
            Some((cluster, vip))
        }
        _ => None,
    }
}

pub(super) fn backend_location(cluster: &ClusterInfo, backend: &BackendVolume) -> Result<ProviderLocation> {
    let iqn = backend.iscsi_iqn.as_deref().ok_or_else(|| {
        Error::backend(
            BACKEND_NAME,
            "get_volume",
            format!("volume {} reports no iSCSI IQN", backend.name),
        )
    })?;
    Ok(ProviderLocation::new(cluster.vip.clone(), cluster.id, iqn, 0))
}

impl LeftHandDriver {
    fn create_options(&self, volume: &Volume) -> BackendOptions {
        let mut options = self.mapper.map(&volume.extra_specs());
        options
            .entry(THIN_PROVISIONED.to_string())
            .or_insert(OptionValue::Bool(self.config.default_thin_provisioning));
        if options.get(ADAPTIVE_OPTIMIZATION) == Some(&OptionValue::Bool(true)) {
            options.remove(ADAPTIVE_OPTIMIZATION);
        }
        options
    }

    /// Enable replication on a freshly provisioned volume when its type asks
    async fn finish_provisioning(
        &self,
        client: &dyn LeftHandApi,
        volume: &Volume,
        mut update: ModelUpdate,
    ) -> Result<ModelUpdate> {
        if volume.is_replicated() && !self.config.replication_targets.is_empty() {
            let replication = self.enable_replication_in(client, volume).await?;
            update.replication_status = replication.replication_status;
            update.replication_driver_data = replication.replication_driver_data;
        }
        Ok(update)
    }

    /// Grow a new volume to the requested size
    async fn grow_to(
        &self,
        client: &dyn LeftHandApi,
        backend: &BackendVolume,
        size_gb: u64,
    ) -> Result<()> {
        debug!("Extending {} to {} GiB", backend.name, size_gb);
        client
            .modify_volume(backend.id, &size_option(size_gb))
            .await
            .map_err(|e| api_error("modify_volume", e))
    }

    pub(crate) async fn create_volume_in(
        &self,
        client: &dyn LeftHandApi,
        volume: &Volume,
    ) -> Result<ModelUpdate> {
        let cluster = self.cluster_info(client).await?;
        let mut options = self.create_options(volume);
        options.insert(CLUSTER_NAME.to_string(), OptionValue::Str(cluster.name.clone()));

        let backend = client
            .create_volume(&volume.name, cluster.id, volume.size_gb * GIB, &options)
            .await
            .map_err(|e| api_error("create_volume", e))?;
        info!("Created volume {} ({} GiB)", volume.name, volume.size_gb);

        let location = backend_location(&cluster, &backend)?;
        self.finish_provisioning(client, volume, ModelUpdate::with_location(&location))
            .await
    }

    pub(crate) async fn delete_volume_in(
        &self,
        client: &dyn LeftHandApi,
        volume: &Volume,
    ) -> Result<()> {
        let backend = match client.get_volume_by_name(&volume.name).await {
            Ok(backend) => backend,
            Err(e) if e.is_not_found() => {
                warn!("Volume {} not found on the array, nothing to delete", volume.name);
                return Ok(());
            }
            Err(e) => return Err(api_error("delete_volume", e)),
        };

        client
            .delete_volume(backend.id)
            .await
            .map_err(|e| api_error("delete_volume", e))?;
        info!("Deleted volume {}", volume.name);
        Ok(())
    }

    pub(crate) async fn extend_volume_in(
        &self,
        client: &dyn LeftHandApi,
        volume: &Volume,
        new_size_gb: u64,
    ) -> Result<()> {
        let backend = client
            .get_volume_by_name(&volume.name)
            .await
            .map_err(|e| api_error("extend_volume", e))?;
        self.grow_to(client, &backend, new_size_gb).await?;
        info!("Extended volume {} to {} GiB", volume.name, new_size_gb);
        Ok(())
    }

    pub(crate) async fn create_snapshot_in(
        &self,
        client: &dyn LeftHandApi,
        snapshot: &Snapshot,
    ) -> Result<()> {
        let parent = client
            .get_volume_by_name(&snapshot.volume.name)
            .await
            .map_err(|e| api_error("create_snapshot", e))?;

        let options = BackendOptions::from([("inheritAccess".to_string(), OptionValue::Bool(true))]);
        client
            .create_snapshot(&snapshot.name, parent.id, &options)
            .await
            .map_err(|e| api_error("create_snapshot", e))?;
        info!("Created snapshot {} of {}", snapshot.name, parent.name);
        Ok(())
    }

    pub(crate) async fn delete_snapshot_in(
        &self,
        client: &dyn LeftHandApi,
        snapshot: &Snapshot,
    ) -> Result<()> {
        let busy_or_api = |err: ClientError| {
            if err.message().contains(CLONE_POINT_MESSAGE) {
                warn!("Snapshot {} is a clone point", snapshot.name);
                return Error::SnapshotBusy {
                    snapshot: snapshot.name.clone(),
                    reason: err.message(),
                };
            }
            api_error("delete_snapshot", err)
        };

        let backend = match client.get_snapshot_by_name(&snapshot.name).await {
            Ok(backend) => backend,
            Err(e) if e.is_not_found() => {
                warn!("Snapshot {} not found on the array, nothing to delete", snapshot.name);
                return Ok(());
            }
            Err(e) => return Err(busy_or_api(e)),
        };

        match client.delete_snapshot(backend.id).await {
            Ok(()) => {
                info!("Deleted snapshot {}", snapshot.name);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(busy_or_api(e)),
        }
    }

    pub(crate) async fn create_from_snapshot_in(
        &self,
        client: &dyn LeftHandApi,
        volume: &Volume,
        snapshot: &Snapshot,
    ) -> Result<ModelUpdate> {
        let cluster = self.cluster_info(client).await?;
        let source = client
            .get_snapshot_by_name(&snapshot.name)
            .await
            .map_err(|e| api_error("create_volume_from_snapshot", e))?;
        let backend = client
            .clone_snapshot(&volume.name, source.id)
            .await
            .map_err(|e| api_error("create_volume_from_snapshot", e))?;
        info!("Created volume {} from snapshot {}", volume.name, snapshot.name);

        if volume.size_gb > snapshot.volume.size_gb {
            self.grow_to(client, &backend, volume.size_gb).await?;
        }

        let location = backend_location(&cluster, &backend)?;
        self.finish_provisioning(client, volume, ModelUpdate::with_location(&location))
            .await
    }

    pub(crate) async fn clone_volume_in(
        &self,
        client: &dyn LeftHandApi,
        volume: &Volume,
        source: &Volume,
    ) -> Result<ModelUpdate> {
        let cluster = self.cluster_info(client).await?;
        let source_backend = client
            .get_volume_by_name(&source.name)
            .await
            .map_err(|e| api_error("create_cloned_volume", e))?;
        let backend = client
            .clone_volume(&volume.name, source_backend.id)
            .await
            .map_err(|e| api_error("create_cloned_volume", e))?;
        info!("Cloned volume {} from {}", volume.name, source.name);

        if volume.size_gb > source.size_gb {
            self.grow_to(client, &backend, volume.size_gb).await?;
        }

        let location = backend_location(&cluster, &backend)?;
        self.finish_provisioning(client, volume, ModelUpdate::with_location(&location))
            .await
    }

    pub(crate) async fn initialize_connection_in(
        &self,
        client: &dyn LeftHandApi,
        volume: &Volume,
        connector: &Connector,
    ) -> Result<ConnectionInfo> {
        let server = match client.get_server_by_name(&connector.host).await {
            Ok(server) => server,
            Err(e) if e.is_not_found() => {
                let chap = self.config.iscsi_chap_enabled.then(|| ChapCredentials {
                    name: connector.initiator.clone(),
                    secret: generate_chap_secret(),
                });
                let server = client
                    .create_server(&connector.host, &connector.initiator, chap.as_ref())
                    .await
                    .map_err(|e| api_error("create_server", e))?;
                info!("Created server {} for {}", connector.host, connector.initiator);
                server
            }
            Err(e) => return Err(api_error("get_server_by_name", e)),
        };

        let backend = client
            .get_volume_by_name(&volume.name)
            .await
            .map_err(|e| api_error("initialize_connection", e))?;

        if backend.has_session_for(server.id) {
            debug!("Server {} already has a session on {}", server.name, volume.name);
        } else {
            client
                .add_server_access(backend.id, server.id)
                .await
                .map_err(|e| api_error("add_server_access", e))?;
        }

        let location = match volume
            .provider_location
            .as_deref()
            .map(str::parse::<ProviderLocation>)
        {
            Some(Ok(location)) => location,
            _ => {
                let cluster = self.cluster_info(client).await?;
                backend_location(&cluster, &backend)?
            }
        };

        let mut info = ConnectionInfo::iscsi(volume, &location);
        if server.chap_authentication_required {
            info.data.auth_method = Some("CHAP".to_string());
            info.data.auth_username = server.chap_name.clone();
            info.data.auth_password = server.chap_target_secret.clone();
        }
        info!("Volume {} exported to {}", volume.name, connector.host);
        Ok(info)
    }

    pub(crate) async fn terminate_connection_in(
        &self,
        client: &dyn LeftHandApi,
        volume: &Volume,
        connector: &Connector,
    ) -> Result<()> {
        let backend = client
            .get_volume_by_name(&volume.name)
            .await
            .map_err(|e| api_error("terminate_connection", e))?;
        let server = client
            .get_server_by_name(&connector.host)
            .await
            .map_err(|e| api_error("terminate_connection", e))?;
        let server_volumes = client
            .find_server_volumes(&server.name)
            .await
            .map_err(|e| api_error("find_server_volumes", e))?;

        client
            .remove_server_access(backend.id, server.id)
            .await
            .map_err(|e| api_error("remove_server_access", e))?;
        info!("Volume {} unexported from {}", volume.name, connector.host);

        let others = server_volumes.iter().filter(|v| v.id != backend.id).count();
        if others == 0 {
            client
                .delete_server(server.id)
                .await
                .map_err(|e| api_error("delete_server", e))?;
            info!("Deleted server {} with no remaining volumes", server.name);
        }
        Ok(())
    }

    pub(crate) async fn retype_in(
        &self,
        client: &dyn LeftHandApi,
        volume: &Volume,
        new_type: &VolumeType,
    ) -> Result<bool> {
        let backend = client
            .get_volume_by_name(&volume.name)
            .await
            .map_err(|e| api_error("retype", e))?;

        let old = self.mapper.map(&volume.extra_specs());
        let delta: BackendOptions = self
            .mapper
            .map(&new_type.extra_specs)
            .into_iter()
            .filter(|(key, value)| old.get(key) != Some(value))
            .collect();

        if delta.is_empty() {
            debug!("Retype of {} to {} changes nothing", volume.name, new_type.name);
            return Ok(true);
        }

        client
            .modify_volume(backend.id, &delta)
            .await
            .map_err(|e| api_error("retype", e))?;
        info!("Retyped volume {} to {}", volume.name, new_type.name);
        Ok(true)
    }

    pub(crate) async fn migrate_volume_checked(
        &self,
        volume: &Volume,
        host: &HostInfo,
    ) -> Result<MigrationOutcome> {
        let Some((cluster_name, vip)) = host.location_info().and_then(parse_location_info) else {
            debug!("Host {} advertises no LeftHand location, not migrating", host.host);
            return Ok(MigrationOutcome::not_migrated());
        };

        self.with_session(&self.primary, |client| async move {
            self.migrate_in(client.as_ref(), volume, cluster_name, vip)
                .await
        })
        .await
    }

    async fn migrate_in(
        &self,
        client: &dyn LeftHandApi,
        volume: &Volume,
        cluster_name: &str,
        vip: &str,
    ) -> Result<MigrationOutcome> {
        let cluster = match client.get_cluster_by_name(cluster_name).await {
            Ok(cluster) => cluster,
            Err(e) => {
                warn!("Cannot migrate {}: cluster {} lookup failed: {}", volume.name, cluster_name, e);
                return Ok(MigrationOutcome::not_migrated());
            }
        };
        if cluster.vip() != Some(vip) {
            info!(
                "Cannot migrate {}: cluster {} is not reachable at {}",
                volume.name, cluster_name, vip
            );
            return Ok(MigrationOutcome::not_migrated());
        }

        let backend = match client.get_volume_by_name(&volume.name).await {
            Ok(backend) => backend,
            Err(e) => {
                warn!("Cannot migrate {}: {}", volume.name, e);
                return Ok(MigrationOutcome::not_migrated());
            }
        };
        if backend.has_sessions() {
            info!("Cannot migrate {}: volume is attached", volume.name);
            return Ok(MigrationOutcome::not_migrated());
        }

        let detail = match client.get_volume(backend.id, SNAPSHOT_FIELDS).await {
            Ok(detail) => detail,
            Err(e) => {
                warn!("Cannot migrate {}: {}", volume.name, e);
                return Ok(MigrationOutcome::not_migrated());
            }
        };
        if detail.has_snapshots() {
            info!("Cannot migrate {}: volume has snapshots", volume.name);
            return Ok(MigrationOutcome::not_migrated());
        }

        let options =
            BackendOptions::from([(CLUSTER_NAME.to_string(), OptionValue::Str(cluster_name.to_string()))]);
        client
            .modify_volume(backend.id, &options)
            .await
            .map_err(|e| api_error("migrate_volume", e))?;
        info!("Migrated volume {} to cluster {}", volume.name, cluster_name);

        Ok(MigrationOutcome {
            migrated: true,
            update: None,
        })
    }

    pub(crate) async fn update_migrated_volume_in(
        &self,
        volume: &Volume,
        new_volume: &Volume,
        original_status: &str,
    ) -> Result<MigratedVolumeUpdate> {
        if original_status == "available" {
            let renamed = self
                .with_session(&self.primary, |client| async move {
                    let backend = client
                        .get_volume_by_name(&new_volume.name)
                        .await
                        .map_err(|e| api_error("update_migrated_volume", e))?;
                    client
                        .modify_volume(backend.id, &rename_option(&volume.name))
                        .await
                        .map_err(|e| api_error("update_migrated_volume", e))
                })
                .await;

            match renamed {
                Ok(()) => {
                    info!("Renamed migrated volume {} to {}", new_volume.name, volume.name);
                    return Ok(MigratedVolumeUpdate::default());
                }
                Err(e) => warn!(
                    "Keeping migrated volume name {}: rename failed: {}",
                    new_volume.name, e
                ),
            }
        }

        Ok(MigratedVolumeUpdate {
            name_id: Some(new_volume.name_id.clone().unwrap_or_else(|| new_volume.id.clone())),
            provider_location: new_volume.provider_location.clone(),
        })
    }

    pub(crate) async fn manage_existing_in(
        &self,
        client: &dyn LeftHandApi,
        volume: &Volume,
        source_name: &str,
    ) -> Result<ModelUpdate> {
        let backend = client
            .get_volume_by_name(source_name)
            .await
            .map_err(|e| lookup_error("manage_existing", source_name, e))?;

        if let (Some(type_id), None) = (&volume.volume_type_id, &volume.volume_type) {
            return Err(Error::ManageExistingTypeMismatch {
                reason: format!("volume type {} could not be resolved", type_id),
            });
        }

        let managed_name = format!("volume-{}", volume.id);
        client
            .modify_volume(backend.id, &rename_option(&managed_name))
            .await
            .map_err(|e| api_error("manage_existing", e))?;
        info!("Volume {} is now managed as {}", source_name, managed_name);

        if let Some(new_type) = &volume.volume_type {
            let renamed = Volume {
                name: managed_name.clone(),
                volume_type_id: None,
                volume_type: None,
                ..volume.clone()
            };
            if let Err(e) = self.retype_in(client, &renamed, new_type).await {
                warn!("Retype of managed volume {} failed, restoring {}", managed_name, source_name);
                if let Err(rollback) = client
                    .modify_volume(backend.id, &rename_option(source_name))
                    .await
                {
                    error!("Failed to restore name {}: {}", source_name, rollback);
                }
                return Err(e);
            }
        }

        Ok(ModelUpdate {
            display_name: volume.display_name.clone(),
            ..Default::default()
        })
    }

    pub(crate) async fn manage_existing_snapshot_in(
        &self,
        client: &dyn LeftHandApi,
        snapshot: &Snapshot,
        source_name: &str,
    ) -> Result<ModelUpdate> {
        let backend = client
            .get_snapshot_by_name(source_name)
            .await
            .map_err(|e| lookup_error("manage_existing_snapshot", source_name, e))?;
        let parent = client
            .get_snapshot_parent_volume(source_name)
            .await
            .map_err(|e| api_error("manage_existing_snapshot", e))?;

        if parent.name != snapshot.volume.name {
            return Err(Error::InvalidInput(format!(
                "snapshot {} belongs to {}, not to {}",
                source_name, parent.name, snapshot.volume.name
            )));
        }

        let managed_name = format!("snapshot-{}", snapshot.id);
        client
            .modify_snapshot(backend.id, &rename_option(&managed_name))
            .await
            .map_err(|e| api_error("manage_existing_snapshot", e))?;
        info!("Snapshot {} is now managed as {}", source_name, managed_name);

        Ok(ModelUpdate {
            display_name: snapshot.display_name.clone(),
            ..Default::default()
        })
    }

    pub(crate) async fn unmanage_in(&self, client: &dyn LeftHandApi, volume: &Volume) -> Result<()> {
        let backend = client
            .get_volume_by_name(&volume.name)
            .await
            .map_err(|e| api_error("unmanage", e))?;
        let name = format!("unm-{}", volume.id);
        client
            .modify_volume(backend.id, &rename_option(&name))
            .await
            .map_err(|e| api_error("unmanage", e))?;
        info!("Volume {} unmanaged as {}", volume.name, name);
        Ok(())
    }

    pub(crate) async fn unmanage_snapshot_in(
        &self,
        client: &dyn LeftHandApi,
        snapshot: &Snapshot,
    ) -> Result<()> {
        let backend = client
            .get_snapshot_by_name(&snapshot.name)
            .await
            .map_err(|e| api_error("unmanage_snapshot", e))?;
        let name = format!("ums-{}", snapshot.id);
        client
            .modify_snapshot(backend.id, &rename_option(&name))
            .await
            .map_err(|e| api_error("unmanage_snapshot", e))?;
        info!("Snapshot {} unmanaged as {}", snapshot.name, name);
        Ok(())
    }
}

//! Remote-snapshot replication between LeftHand management groups
//!
//! A replicated volume `<name>` owns the schedule `<name>_SCHED`, whose
//! primary half is `<name>_SCHED_Pri`.

use super::client::{LeftHandApi, LeftHandEndpoint, RemoteSnapshotSchedule};
use super::lifecycle::backend_location;
use super::{api_error, LeftHandDriver, BACKEND_NAME};
use crate::config::ReplicationTargetConfig;
use crate::domain::model::{
    ModelUpdate, ReplicationDriverData, ReplicationStatus, ReplicationTargetRef,
    ReplicationTargets, Volume,
};
use crate::error::{Error, Result};
use tracing::{info, warn};

fn schedule_name(volume_name: &str) -> String {
    format!("{}_SCHED", volume_name)
}

fn primary_schedule_name(volume_name: &str) -> String {
    format!("{}_SCHED_Pri", volume_name)
}

impl LeftHandDriver {
    fn default_target(&self, operation: &str) -> Result<&ReplicationTargetConfig> {
        self.config.replication_targets.first().ok_or_else(|| {
            Error::backend(BACKEND_NAME, operation, "no replication target is configured")
        })
    }

    /// Start the volume's schedule, creating it when missing
    pub(crate) async fn enable_replication_in(
        &self,
        client: &dyn LeftHandApi,
        volume: &Volume,
    ) -> Result<ModelUpdate> {
        let target = self.default_target("replication_enable")?;
        let primary_half = primary_schedule_name(&volume.name);

        let exists = client
            .does_remote_snapshot_schedule_exist(&primary_half)
            .await
            .map_err(|e| api_error("replication_enable", e))?;

        if exists {
            client
                .start_remote_snapshot_schedule(&primary_half)
                .await
                .map_err(|e| api_error("replication_enable", e))?;
            info!("Restarted replication schedule {}", primary_half);
        } else {
            let endpoint = LeftHandEndpoint::target(target)?;
            let remote_ip = self
                .with_session(&endpoint, |remote| async move {
                    remote
                        .get_ip_from_cluster(&target.cluster_name)
                        .await
                        .map_err(|e| api_error("get_ip_from_cluster", e))
                })
                .await?;

            let settings = &self.config.replication_schedule;
            let schedule = RemoteSnapshotSchedule {
                volume_name: volume.name.clone(),
                schedule_name: schedule_name(&volume.name),
                period_secs: settings.period_secs,
                start_time: settings.start_time_str(),
                retention_count: settings.retention_count,
                source_cluster: self.config.cluster_name.clone(),
                remote_retention_count: settings.remote_retention_count,
                remote_volume_name: volume.name.clone(),
                remote_ip,
                remote_username: target.username.clone(),
                remote_password: target.password.clone(),
            };
            client
                .create_remote_snapshot_schedule(&schedule)
                .await
                .map_err(|e| api_error("replication_enable", e))?;
            info!(
                "Created replication schedule {} to {}",
                schedule.schedule_name, target.target_device_id
            );
        }

        Ok(ModelUpdate {
            replication_status: Some(ReplicationStatus::Enabled),
            replication_driver_data: Some(ReplicationDriverData::new(&self.config.api_url).encode()),
            ..Default::default()
        })
    }

    /// Remove the replication schedule; a failure is only logged
    pub(crate) async fn delete_replication_schedule(&self, volume: &Volume) {
        let schedule = schedule_name(&volume.name);
        let schedule = &schedule;
        let removed = self
            .with_session(&self.primary, |client| async move {
                client
                    .delete_remote_snapshot_schedule(schedule)
                    .await
                    .map_err(|e| api_error("delete_remote_snapshot_schedule", e))
            })
            .await;
        if let Err(e) = removed {
            warn!("Could not delete replication schedule {}: {}", schedule, e);
        }
    }

    /// Remove the replica on every target; failures are only logged
    pub(crate) async fn delete_replicas(&self, volume: &Volume) {
        for target in &self.config.replication_targets {
            let endpoint = match LeftHandEndpoint::target(target) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!("Skipping replica on {}: {}", target.target_device_id, e);
                    continue;
                }
            };

            let deleted = self
                .with_session(&endpoint, |client| async move {
                    match client.get_volume_by_name(&volume.name).await {
                        Ok(replica) => client
                            .delete_volume(replica.id)
                            .await
                            .map_err(|e| api_error("delete_volume", e)),
                        Err(e) if e.is_not_found() => Ok(()),
                        Err(e) => Err(api_error("get_volume_by_name", e)),
                    }
                })
                .await;
            match deleted {
                Ok(()) => info!("Deleted replica of {} on {}", volume.name, target.target_device_id),
                Err(e) => warn!(
                    "Could not delete replica of {} on {}: {}",
                    volume.name, target.target_device_id, e
                ),
            }
        }
    }

    /// Stop the primary schedule; a failure becomes `disable_failed`
    pub(crate) async fn disable_replication(&self, volume: &Volume) -> ModelUpdate {
        let primary_half = primary_schedule_name(&volume.name);
        let primary_half = &primary_half;

        let stopped = self
            .with_session(&self.primary, |client| async move {
                client
                    .stop_remote_snapshot_schedule(primary_half)
                    .await
                    .map_err(|e| api_error("replication_disable", e))
            })
            .await;

        match stopped {
            Ok(()) => {
                info!("Stopped replication schedule {}", primary_half);
                ModelUpdate::with_replication_status(ReplicationStatus::Disabled)
            }
            Err(e) => {
                warn!("Disabling replication of {} failed: {}", volume.name, e);
                ModelUpdate::with_replication_status(ReplicationStatus::DisableFailed)
            }
        }
    }

    /// Point the volume at its replica on `target_device_id`
    pub(crate) async fn failover(&self, volume: &Volume, target_device_id: &str) -> Result<ModelUpdate> {
        let target = self
            .config
            .replication_target(target_device_id)
            .ok_or_else(|| {
                Error::backend(
                    BACKEND_NAME,
                    "replication_failover",
                    format!("unknown replication target {}", target_device_id),
                )
            })?;
        let endpoint = LeftHandEndpoint::target(target)?;

        let primary_half = primary_schedule_name(&volume.name);
        let primary_half = &primary_half;
        let stopped = self
            .with_session(&self.primary, |client| async move {
                client
                    .stop_remote_snapshot_schedule(primary_half)
                    .await
                    .map_err(|e| api_error("stop_remote_snapshot_schedule", e))
            })
            .await;
        if let Err(e) = stopped {
            warn!("Primary unreachable while failing over {}: {}", volume.name, e);
        }

        let location = self
            .with_session(&endpoint, |client| async move {
                let cluster = self
                    .target_cluster_info(target_device_id, &target.cluster_name, client.as_ref())
                    .await?;
                let replica = client
                    .get_volume_by_name(&volume.name)
                    .await
                    .map_err(|e| api_error("replication_failover", e))?;
                backend_location(&cluster, &replica)
            })
            .await?;

        info!("Volume {} failed over to {}", volume.name, target_device_id);
        Ok(ModelUpdate {
            provider_location: Some(location.to_string()),
            replication_status: Some(ReplicationStatus::FailedOver),
            replication_driver_data: Some(ReplicationDriverData::new(&target.api_url).encode()),
            host: target.managed_backend_name.clone(),
            display_name: None,
        })
    }

    pub(crate) fn replication_targets(&self, volume: &Volume) -> ReplicationTargets {
        ReplicationTargets {
            volume_id: volume.id.clone(),
            targets: self
                .config
                .replication_targets
                .iter()
                .map(|t| ReplicationTargetRef {
                    target_device_id: t.target_device_id.clone(),
                })
                .collect(),
        }
    }
}

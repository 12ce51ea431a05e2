//! Consistency Group Coordinator
//!
//! Backends have no group primitive, so membership is tracked here and group
//! operations fan out to the per-volume driver calls. Records follow a
//! two-phase lifecycle: a transient status while member operations run, then
//! a terminal status that reflects every member's outcome.

use crate::domain::model::{CgSnapshot, ConsistencyGroup, GroupStatus, MemberStatus, Snapshot, Volume};
use crate::domain::ports::VolumeDriverRef;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Outcome of deleting a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDeletion {
    pub group: ConsistencyGroup,
    pub volumes: Vec<MemberStatus>,
}

/// Outcome of creating or deleting a group snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgSnapshotOutcome {
    pub cgsnapshot: CgSnapshot,
    pub snapshots: Vec<MemberStatus>,
}

/// Terminal status from the member results
fn aggregate(members: &[MemberStatus], success: GroupStatus, failure: GroupStatus) -> GroupStatus {
    if members.iter().all(|m| m.status == success) {
        success
    } else {
        failure
    }
}

pub struct ConsistencyGroupCoordinator {
    driver: VolumeDriverRef,
    groups: RwLock<BTreeMap<String, ConsistencyGroup>>,
    cgsnapshots: RwLock<BTreeMap<String, CgSnapshot>>,
}

impl ConsistencyGroupCoordinator {
    pub fn new(driver: VolumeDriverRef) -> Self {
        Self {
            driver,
            groups: RwLock::new(BTreeMap::new()),
            cgsnapshots: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn get_group(&self, id: &str) -> Result<ConsistencyGroup> {
        self.groups
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "consistency group".into(),
                name: id.to_string(),
            })
    }

    pub async fn get_cgsnapshot(&self, id: &str) -> Result<CgSnapshot> {
        self.cgsnapshots
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "cgsnapshot".into(),
                name: id.to_string(),
            })
    }

    async fn set_group_status(&self, id: &str, status: GroupStatus) -> Result<ConsistencyGroup> {
        let mut groups = self.groups.write().await;
        let group = groups.get_mut(id).ok_or_else(|| Error::NotFound {
            kind: "consistency group".into(),
            name: id.to_string(),
        })?;
        group.status = status;
        Ok(group.clone())
    }

    async fn set_cgsnapshot_status(&self, id: &str, status: GroupStatus) -> Result<CgSnapshot> {
        let mut cgsnapshots = self.cgsnapshots.write().await;
        let cgsnapshot = cgsnapshots.get_mut(id).ok_or_else(|| Error::NotFound {
            kind: "cgsnapshot".into(),
            name: id.to_string(),
        })?;
        cgsnapshot.status = status;
        Ok(cgsnapshot.clone())
    }

    /// Register an empty group; it is available immediately
    pub async fn create_group(&self, id: &str, name: Option<String>) -> Result<ConsistencyGroup> {
        let mut groups = self.groups.write().await;
        if groups.contains_key(id) {
            return Err(Error::InvalidInput(format!(
                "consistency group {} already exists",
                id
            )));
        }

        let group = ConsistencyGroup {
            id: id.to_string(),
            name,
            status: GroupStatus::Available,
            volume_ids: Vec::new(),
        };
        groups.insert(id.to_string(), group.clone());
        info!("Created consistency group {} on {}", id, self.driver.backend_name());
        Ok(group)
    }

    /// Add and remove members; the backend is not called
    pub async fn update_group(
        &self,
        id: &str,
        add_volume_ids: &[String],
        remove_volume_ids: &[String],
    ) -> Result<ConsistencyGroup> {
        let mut groups = self.groups.write().await;
        let group = groups.get_mut(id).ok_or_else(|| Error::NotFound {
            kind: "consistency group".into(),
            name: id.to_string(),
        })?;
        if group.status != GroupStatus::Available {
            return Err(Error::InvalidInput(format!(
                "consistency group {} is {}",
                id, group.status
            )));
        }

        for volume_id in add_volume_ids {
            if !group.volume_ids.contains(volume_id) {
                group.volume_ids.push(volume_id.clone());
            }
        }
        group.volume_ids.retain(|v| !remove_volume_ids.contains(v));

        debug!("Consistency group {} members: {:?}", id, group.volume_ids);
        Ok(group.clone())
    }

    /// Delete every member volume, then settle the group status
    pub async fn delete_group(&self, id: &str, volumes: &[Volume]) -> Result<GroupDeletion> {
        let group = self.get_group(id).await?;
        if let Some(stranger) = volumes.iter().find(|v| !group.volume_ids.contains(&v.id)) {
            return Err(Error::InvalidInput(format!(
                "volume {} is not a member of consistency group {}",
                stranger.id, id
            )));
        }

        self.set_group_status(id, GroupStatus::Deleting).await?;

        let mut members = Vec::with_capacity(volumes.len());
        for volume in volumes {
            let status = match self.driver.delete_volume(volume).await {
                Ok(()) => GroupStatus::Deleted,
                Err(e) => {
                    warn!("Deleting volume {} of group {} failed: {}", volume.id, id, e);
                    GroupStatus::ErrorDeleting
                }
            };
            members.push(MemberStatus {
                id: volume.id.clone(),
                status,
            });
        }

        let status = aggregate(&members, GroupStatus::Deleted, GroupStatus::ErrorDeleting);
        let group = self.set_group_status(id, status).await?;
        info!("Consistency group {} is {}", id, status);

        Ok(GroupDeletion {
            group,
            volumes: members,
        })
    }

    /// Snapshot every member volume of a group
    pub async fn create_cgsnapshot(
        &self,
        id: &str,
        group_id: &str,
        snapshots: &[Snapshot],
    ) -> Result<CgSnapshotOutcome> {
        let group = self.get_group(group_id).await?;
        if let Some(stranger) = snapshots
            .iter()
            .find(|s| !group.volume_ids.contains(&s.volume.id))
        {
            return Err(Error::InvalidInput(format!(
                "volume {} is not a member of consistency group {}",
                stranger.volume.id, group_id
            )));
        }

        {
            let mut cgsnapshots = self.cgsnapshots.write().await;
            if cgsnapshots.contains_key(id) {
                return Err(Error::InvalidInput(format!("cgsnapshot {} already exists", id)));
            }
            cgsnapshots.insert(
                id.to_string(),
                CgSnapshot {
                    id: id.to_string(),
                    consistency_group_id: group_id.to_string(),
                    status: GroupStatus::Creating,
                    snapshot_ids: snapshots.iter().map(|s| s.id.clone()).collect(),
                },
            );
        }

        let mut members = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let status = match self.driver.create_snapshot(snapshot).await {
                Ok(()) => GroupStatus::Available,
                Err(e) => {
                    warn!("Snapshot {} of cgsnapshot {} failed: {}", snapshot.id, id, e);
                    GroupStatus::Error
                }
            };
            members.push(MemberStatus {
                id: snapshot.id.clone(),
                status,
            });
        }

        let status = aggregate(&members, GroupStatus::Available, GroupStatus::Error);
        let cgsnapshot = self.set_cgsnapshot_status(id, status).await?;
        info!("Cgsnapshot {} of group {} is {}", id, group_id, status);

        Ok(CgSnapshotOutcome {
            cgsnapshot,
            snapshots: members,
        })
    }

    /// Delete every snapshot of a group snapshot
    pub async fn delete_cgsnapshot(&self, id: &str, snapshots: &[Snapshot]) -> Result<CgSnapshotOutcome> {
        let record = self.get_cgsnapshot(id).await?;
        if let Some(stranger) = snapshots.iter().find(|s| !record.snapshot_ids.contains(&s.id)) {
            return Err(Error::InvalidInput(format!(
                "snapshot {} does not belong to cgsnapshot {}",
                stranger.id, id
            )));
        }

        self.set_cgsnapshot_status(id, GroupStatus::Deleting).await?;

        let mut members = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let status = match self.driver.delete_snapshot(snapshot).await {
                Ok(()) => GroupStatus::Deleted,
                Err(e) => {
                    warn!("Deleting snapshot {} of cgsnapshot {} failed: {}", snapshot.id, id, e);
                    GroupStatus::ErrorDeleting
                }
            };
            members.push(MemberStatus {
                id: snapshot.id.clone(),
                status,
            });
        }

        let status = aggregate(&members, GroupStatus::Deleted, GroupStatus::ErrorDeleting);
        let cgsnapshot = self.set_cgsnapshot_status(id, status).await?;
        info!("Cgsnapshot {} is {}", id, status);

        Ok(CgSnapshotOutcome {
            cgsnapshot,
            snapshots: members,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{Connector, ConnectionInfo, ModelUpdate, ProviderLocation, VolumeStats};
    use crate::domain::ports::{DriverCapabilities, VolumeDriver};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    /// Driver that records per-member calls and fails for chosen ids
    #[derive(Default)]
    struct RecordingDriver {
        failing: BTreeSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl RecordingDriver {
        fn failing(ids: &[&str]) -> Self {
            Self {
                failing: ids.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        fn record(&self, op: &str, id: &str) -> Result<()> {
            self.calls.lock().push(format!("{} {}", op, id));
            if self.failing.contains(id) {
                return Err(Error::backend("fake", op, "injected failure"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl VolumeDriver for RecordingDriver {
        fn backend_name(&self) -> &str {
            "fake"
        }

        fn capabilities(&self) -> DriverCapabilities {
            DriverCapabilities {
                consistency_groups: true,
                ..Default::default()
            }
        }

        async fn do_setup(&self) -> Result<()> {
            Ok(())
        }

        async fn check_for_setup_error(&self) -> Result<()> {
            Ok(())
        }

        async fn create_volume(&self, volume: &Volume) -> Result<ModelUpdate> {
            self.record("create_volume", &volume.id)?;
            Ok(ModelUpdate::default())
        }

        async fn delete_volume(&self, volume: &Volume) -> Result<()> {
            self.record("delete_volume", &volume.id)
        }

        async fn extend_volume(&self, volume: &Volume, _new_size_gb: u64) -> Result<()> {
            self.record("extend_volume", &volume.id)
        }

        async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
            self.record("create_snapshot", &snapshot.id)
        }

        async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
            self.record("delete_snapshot", &snapshot.id)
        }

        async fn create_volume_from_snapshot(
            &self,
            volume: &Volume,
            _snapshot: &Snapshot,
        ) -> Result<ModelUpdate> {
            self.record("create_volume_from_snapshot", &volume.id)?;
            Ok(ModelUpdate::default())
        }

        async fn create_cloned_volume(&self, volume: &Volume, _source: &Volume) -> Result<ModelUpdate> {
            self.record("create_cloned_volume", &volume.id)?;
            Ok(ModelUpdate::default())
        }

        async fn initialize_connection(
            &self,
            volume: &Volume,
            _connector: &Connector,
        ) -> Result<ConnectionInfo> {
            self.record("initialize_connection", &volume.id)?;
            let location = ProviderLocation::new("10.0.0.1", 1, "iqn.fake", 0);
            Ok(ConnectionInfo::iscsi(volume, &location))
        }

        async fn terminate_connection(&self, volume: &Volume, _connector: &Connector) -> Result<()> {
            self.record("terminate_connection", &volume.id)
        }

        async fn get_volume_stats(&self, _refresh: bool) -> Result<VolumeStats> {
            Ok(VolumeStats::default())
        }
    }

    fn coordinator(driver: RecordingDriver) -> (ConsistencyGroupCoordinator, Arc<RecordingDriver>) {
        let driver = Arc::new(driver);
        (ConsistencyGroupCoordinator::new(driver.clone()), driver)
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    async fn group_with(coordinator: &ConsistencyGroupCoordinator, members: &[&str]) {
        coordinator.create_group("cg-1", Some("group".into())).await.unwrap();
        coordinator.update_group("cg-1", &ids(members), &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_group_is_available() {
        let (coordinator, driver) = coordinator(RecordingDriver::default());

        let group = coordinator.create_group("cg-1", None).await.unwrap();
        assert_eq!(group.status, GroupStatus::Available);
        assert!(group.volume_ids.is_empty());
        assert!(driver.calls.lock().is_empty());

        assert_matches!(
            coordinator.create_group("cg-1", None).await,
            Err(Error::InvalidInput(_))
        );
    }

    #[tokio::test]
    async fn test_update_group_membership() {
        let (coordinator, driver) = coordinator(RecordingDriver::default());
        group_with(&coordinator, &["v1", "v2"]).await;

        let group = coordinator
            .update_group("cg-1", &ids(&["v2", "v3"]), &ids(&["v1"]))
            .await
            .unwrap();
        assert_eq!(group.volume_ids, ids(&["v2", "v3"]));
        assert!(driver.calls.lock().is_empty());

        assert_matches!(
            coordinator.update_group("missing", &[], &[]).await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_delete_group() {
        let (coordinator, driver) = coordinator(RecordingDriver::default());
        group_with(&coordinator, &["v1", "v2"]).await;

        let deletion = coordinator
            .delete_group("cg-1", &[Volume::new("v1", 1), Volume::new("v2", 1)])
            .await
            .unwrap();

        assert_eq!(deletion.group.status, GroupStatus::Deleted);
        assert!(deletion.volumes.iter().all(|m| m.status == GroupStatus::Deleted));
        assert_eq!(
            *driver.calls.lock(),
            vec!["delete_volume v1".to_string(), "delete_volume v2".to_string()]
        );
        assert_eq!(
            coordinator.get_group("cg-1").await.unwrap().status,
            GroupStatus::Deleted
        );
    }

    #[tokio::test]
    async fn test_delete_group_member_failure() {
        let (coordinator, _) = coordinator(RecordingDriver::failing(&["v2"]));
        group_with(&coordinator, &["v1", "v2"]).await;

        let deletion = coordinator
            .delete_group("cg-1", &[Volume::new("v1", 1), Volume::new("v2", 1)])
            .await
            .unwrap();

        assert_eq!(deletion.group.status, GroupStatus::ErrorDeleting);
        assert_eq!(
            deletion.volumes,
            vec![
                MemberStatus {
                    id: "v1".into(),
                    status: GroupStatus::Deleted
                },
                MemberStatus {
                    id: "v2".into(),
                    status: GroupStatus::ErrorDeleting
                },
            ]
        );

        // No further membership changes once the group left `available`
        assert_matches!(
            coordinator.update_group("cg-1", &ids(&["v3"]), &[]).await,
            Err(Error::InvalidInput(_))
        );
    }

    #[tokio::test]
    async fn test_delete_group_rejects_strangers() {
        let (coordinator, driver) = coordinator(RecordingDriver::default());
        group_with(&coordinator, &["v1"]).await;

        assert_matches!(
            coordinator.delete_group("cg-1", &[Volume::new("v9", 1)]).await,
            Err(Error::InvalidInput(_))
        );
        assert!(driver.calls.lock().is_empty());
        assert_eq!(
            coordinator.get_group("cg-1").await.unwrap().status,
            GroupStatus::Available
        );
    }

    #[tokio::test]
    async fn test_cgsnapshot_lifecycle() {
        let (coordinator, driver) = coordinator(RecordingDriver::default());
        group_with(&coordinator, &["v1", "v2"]).await;

        let snapshots = vec![
            Snapshot::new("s1", Volume::new("v1", 1)),
            Snapshot::new("s2", Volume::new("v2", 1)),
        ];
        let created = coordinator
            .create_cgsnapshot("cgs-1", "cg-1", &snapshots)
            .await
            .unwrap();
        assert_eq!(created.cgsnapshot.status, GroupStatus::Available);
        assert_eq!(created.cgsnapshot.snapshot_ids, ids(&["s1", "s2"]));
        assert!(created.snapshots.iter().all(|m| m.status == GroupStatus::Available));

        let deleted = coordinator.delete_cgsnapshot("cgs-1", &snapshots).await.unwrap();
        assert_eq!(deleted.cgsnapshot.status, GroupStatus::Deleted);

        assert_eq!(
            *driver.calls.lock(),
            vec![
                "create_snapshot s1".to_string(),
                "create_snapshot s2".to_string(),
                "delete_snapshot s1".to_string(),
                "delete_snapshot s2".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_cgsnapshot_member_failures() {
        let (coordinator, _) = coordinator(RecordingDriver::failing(&["s2"]));
        group_with(&coordinator, &["v1", "v2"]).await;

        let snapshots = vec![
            Snapshot::new("s1", Volume::new("v1", 1)),
            Snapshot::new("s2", Volume::new("v2", 1)),
        ];
        let created = coordinator
            .create_cgsnapshot("cgs-1", "cg-1", &snapshots)
            .await
            .unwrap();
        assert_eq!(created.cgsnapshot.status, GroupStatus::Error);
        assert_eq!(created.snapshots[0].status, GroupStatus::Available);
        assert_eq!(created.snapshots[1].status, GroupStatus::Error);

        let deleted = coordinator.delete_cgsnapshot("cgs-1", &snapshots).await.unwrap();
        assert_eq!(deleted.cgsnapshot.status, GroupStatus::ErrorDeleting);
        assert_eq!(deleted.snapshots[1].status, GroupStatus::ErrorDeleting);
    }

    #[tokio::test]
    async fn test_cgsnapshot_requires_group_members() {
        let (coordinator, _) = coordinator(RecordingDriver::default());

        let snapshots = vec![Snapshot::new("s1", Volume::new("v1", 1))];
        assert_matches!(
            coordinator.create_cgsnapshot("cgs-1", "cg-1", &snapshots).await,
            Err(Error::NotFound { .. })
        );

        group_with(&coordinator, &["v2"]).await;
        assert_matches!(
            coordinator.create_cgsnapshot("cgs-1", "cg-1", &snapshots).await,
            Err(Error::InvalidInput(_))
        );
        assert_matches!(
            coordinator.delete_cgsnapshot("cgs-1", &snapshots).await,
            Err(Error::NotFound { .. })
        );
    }
}

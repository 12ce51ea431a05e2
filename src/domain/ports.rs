//! Domain Ports - Core trait definitions for the volume driver
//!
//! These traits define the boundaries between the host orchestrator, the
//! driver logic and the backend families. Backends implement these traits to
//! provide concrete functionality.

use crate::domain::model::{
    Connector, ConnectionInfo, ExistingRef, HostInfo, MigratedVolumeUpdate, MigrationOutcome,
    ModelUpdate, ReplicationTargets, Snapshot, Volume, VolumeStats, VolumeType,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Backend Options
// =============================================================================

/// Value of a backend-specific option produced from extra specs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{}", b),
            OptionValue::Int(i) => write!(f, "{}", i),
            OptionValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_string())
    }
}

/// Backend option flags keyed by the backend's own option name
pub type BackendOptions = BTreeMap<String, OptionValue>;

// =============================================================================
// Extra Spec Mapper Port
// =============================================================================

/// Translates volume-type extra specs into backend option flags.
///
/// Mapping never fails: keys outside the backend's prefixes are ignored, and
/// invalid values for recognized keys are dropped individually.
pub trait ExtraSpecMapper: Send + Sync {
    /// Prefixes (including the trailing `:`) this backend consumes, in
    /// order of precedence
    fn prefixes(&self) -> &[&'static str];

    /// Restrict `extra_specs` to recognized keys, with prefixes stripped.
    ///
    /// When the same key appears under several prefixes, the earliest prefix
    /// in [`ExtraSpecMapper::prefixes`] wins.
    fn filter(&self, extra_specs: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut filtered = BTreeMap::new();
        for prefix in self.prefixes().iter().rev() {
            for (key, value) in extra_specs {
                if let Some(short) = key.strip_prefix(prefix) {
                    filtered.insert(short.to_string(), value.clone());
                }
            }
        }
        filtered
    }

    /// Map extra specs into backend options
    fn map(&self, extra_specs: &BTreeMap<String, String>) -> BackendOptions;
}

// =============================================================================
// Driver Capabilities
// =============================================================================

/// Optional parts of the driver contract a backend family implements
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverCapabilities {
    pub replication: bool,
    pub manage_existing: bool,
    pub migration: bool,
    pub retype: bool,
    pub consistency_groups: bool,
}

// =============================================================================
// Volume Driver Port
// =============================================================================

/// Contract a block-storage backend driver satisfies towards the host.
///
/// Operations outside a backend's [`DriverCapabilities`] keep the default
/// implementation, which reports [`Error::NotSupported`].
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    /// Get backend family name
    fn backend_name(&self) -> &str;

    /// Optional operations supported by this backend
    fn capabilities(&self) -> DriverCapabilities;

    /// Connect to the backend and resolve configuration-dependent state
    async fn do_setup(&self) -> Result<()>;

    /// Verify the configuration is usable
    async fn check_for_setup_error(&self) -> Result<()>;

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    async fn create_volume(&self, volume: &Volume) -> Result<ModelUpdate>;

    async fn delete_volume(&self, volume: &Volume) -> Result<()>;

    async fn extend_volume(&self, volume: &Volume, new_size_gb: u64) -> Result<()>;

    async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    async fn create_volume_from_snapshot(
        &self,
        volume: &Volume,
        snapshot: &Snapshot,
    ) -> Result<ModelUpdate>;

    async fn create_cloned_volume(&self, volume: &Volume, source: &Volume) -> Result<ModelUpdate>;

    async fn initialize_connection(
        &self,
        volume: &Volume,
        connector: &Connector,
    ) -> Result<ConnectionInfo>;

    async fn terminate_connection(&self, volume: &Volume, connector: &Connector) -> Result<()>;

    async fn get_volume_stats(&self, refresh: bool) -> Result<VolumeStats>;

    // -------------------------------------------------------------------------
    // Type changes and migration
    // -------------------------------------------------------------------------

    /// Returns `true` when the backend applied the new type in place
    async fn retype(&self, volume: &Volume, new_type: &VolumeType, host: &HostInfo) -> Result<bool> {
        let _ = (volume, new_type, host);
        Ok(false)
    }

    async fn migrate_volume(&self, volume: &Volume, host: &HostInfo) -> Result<MigrationOutcome> {
        let _ = (volume, host);
        Ok(MigrationOutcome::not_migrated())
    }

    async fn update_migrated_volume(
        &self,
        volume: &Volume,
        new_volume: &Volume,
        original_status: &str,
    ) -> Result<MigratedVolumeUpdate> {
        let _ = (volume, original_status);
        Ok(MigratedVolumeUpdate {
            name_id: Some(new_volume.name_id.clone().unwrap_or_else(|| new_volume.id.clone())),
            provider_location: new_volume.provider_location.clone(),
        })
    }

    // -------------------------------------------------------------------------
    // Manage / unmanage
    // -------------------------------------------------------------------------

    async fn manage_existing(&self, volume: &Volume, existing: &ExistingRef) -> Result<ModelUpdate> {
        let _ = (volume, existing);
        Err(Error::not_supported(self.backend_name(), "manage_existing"))
    }

    async fn manage_existing_get_size(&self, volume: &Volume, existing: &ExistingRef) -> Result<u64> {
        let _ = (volume, existing);
        Err(Error::not_supported(self.backend_name(), "manage_existing_get_size"))
    }

    async fn manage_existing_snapshot(
        &self,
        snapshot: &Snapshot,
        existing: &ExistingRef,
    ) -> Result<ModelUpdate> {
        let _ = (snapshot, existing);
        Err(Error::not_supported(self.backend_name(), "manage_existing_snapshot"))
    }

    async fn manage_existing_snapshot_get_size(
        &self,
        snapshot: &Snapshot,
        existing: &ExistingRef,
    ) -> Result<u64> {
        let _ = (snapshot, existing);
        Err(Error::not_supported(self.backend_name(), "manage_existing_snapshot_get_size"))
    }

    async fn unmanage(&self, volume: &Volume) -> Result<()> {
        let _ = volume;
        Err(Error::not_supported(self.backend_name(), "unmanage"))
    }

    async fn unmanage_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let _ = snapshot;
        Err(Error::not_supported(self.backend_name(), "unmanage_snapshot"))
    }

    // -------------------------------------------------------------------------
    // Replication
    // -------------------------------------------------------------------------

    async fn replication_enable(&self, volume: &Volume) -> Result<ModelUpdate> {
        let _ = volume;
        Err(Error::not_supported(self.backend_name(), "replication_enable"))
    }

    /// Best effort: failures are reported as `disable_failed`, never raised
    async fn replication_disable(&self, volume: &Volume) -> Result<ModelUpdate> {
        let _ = volume;
        Err(Error::not_supported(self.backend_name(), "replication_disable"))
    }

    async fn replication_failover(&self, volume: &Volume, target_device_id: &str) -> Result<ModelUpdate> {
        let _ = (volume, target_device_id);
        Err(Error::not_supported(self.backend_name(), "replication_failover"))
    }

    async fn list_replication_targets(&self, volume: &Volume) -> Result<ReplicationTargets> {
        let _ = volume;
        Err(Error::not_supported(self.backend_name(), "list_replication_targets"))
    }
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type VolumeDriverRef = Arc<dyn VolumeDriver>;
pub type ExtraSpecMapperRef = Arc<dyn ExtraSpecMapper>;

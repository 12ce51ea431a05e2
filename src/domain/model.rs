//! Domain Model - Host-side descriptors and normalized results
//!
//! These are the values exchanged between the host orchestrator and a
//! [`VolumeDriver`](super::ports::VolumeDriver). Backends never return their
//! raw payloads; they translate into the result types defined here.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Bytes per GiB
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Default iSCSI port
pub const ISCSI_PORT: u16 = 3260;

/// Extra spec requesting replication for a volume type
pub const REPLICATION_ENABLED_KEY: &str = "replication_enabled";

// =============================================================================
// Replication Status
// =============================================================================

/// Replication state of a volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicationStatus {
    #[default]
    #[serde(rename = "disabled")]
    Disabled,
    #[serde(rename = "enabled")]
    Enabled,
    #[serde(rename = "enabling")]
    Enabling,
    #[serde(rename = "disabling")]
    Disabling,
    #[serde(rename = "failing-over")]
    FailingOver,
    #[serde(rename = "failed-over")]
    FailedOver,
    #[serde(rename = "error")]
    Error,
    /// Disabling replication was attempted and did not succeed
    #[serde(rename = "disable_failed")]
    DisableFailed,
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationStatus::Disabled => write!(f, "disabled"),
            ReplicationStatus::Enabled => write!(f, "enabled"),
            ReplicationStatus::Enabling => write!(f, "enabling"),
            ReplicationStatus::Disabling => write!(f, "disabling"),
            ReplicationStatus::FailingOver => write!(f, "failing-over"),
            ReplicationStatus::FailedOver => write!(f, "failed-over"),
            ReplicationStatus::Error => write!(f, "error"),
            ReplicationStatus::DisableFailed => write!(f, "disable_failed"),
        }
    }
}

// =============================================================================
// Volume Types
// =============================================================================

/// Volume type with its extra specs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeType {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
}

impl VolumeType {
    /// Create a volume type from key/value pairs
    pub fn new<K, V>(name: &str, specs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            id: name.to_string(),
            name: name.to_string(),
            extra_specs: specs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Whether the type asks for replication (`replication_enabled = "<is> True"`)
    pub fn is_replicated(&self) -> bool {
        self.extra_specs
            .get(REPLICATION_ENABLED_KEY)
            .map(|v| v.trim() == "<is> True")
            .unwrap_or(false)
    }
}

// =============================================================================
// Volume / Snapshot Descriptors
// =============================================================================

/// Logical volume descriptor handed over by the host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    /// Host-side identifier
    pub id: String,
    /// Backend name of the volume
    pub name: String,
    pub display_name: Option<String>,
    /// Size in GiB
    pub size_gb: u64,
    pub provider_location: Option<String>,
    pub volume_type_id: Option<String>,
    /// Resolved volume type, when the host could resolve `volume_type_id`
    pub volume_type: Option<VolumeType>,
    #[serde(default)]
    pub replication_status: ReplicationStatus,
    pub replication_driver_data: Option<String>,
    /// Host the volume record lives on
    pub host: Option<String>,
    /// Backing identifier after a host-assisted migration
    pub name_id: Option<String>,
}

impl Volume {
    /// Create a volume descriptor using the managed naming convention
    pub fn new(id: impl Into<String>, size_gb: u64) -> Self {
        let id = id.into();
        Self {
            name: format!("volume-{}", id),
            id,
            size_gb,
            ..Default::default()
        }
    }

    /// Attach a resolved volume type
    pub fn with_type(mut self, volume_type: VolumeType) -> Self {
        self.volume_type_id = Some(volume_type.id.clone());
        self.volume_type = Some(volume_type);
        self
    }

    /// Extra specs of the volume type (empty when untyped)
    pub fn extra_specs(&self) -> BTreeMap<String, String> {
        self.volume_type
            .as_ref()
            .map(|t| t.extra_specs.clone())
            .unwrap_or_default()
    }

    /// Whether the volume's type asks for replication
    pub fn is_replicated(&self) -> bool {
        self.volume_type
            .as_ref()
            .map(VolumeType::is_replicated)
            .unwrap_or(false)
    }
}

/// Snapshot descriptor handed over by the host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    /// Backend name of the snapshot
    pub name: String,
    pub display_name: Option<String>,
    /// Parent volume
    pub volume: Volume,
}

impl Snapshot {
    /// Create a snapshot descriptor using the managed naming convention
    pub fn new(id: impl Into<String>, volume: Volume) -> Self {
        let id = id.into();
        Self {
            name: format!("snapshot-{}", id),
            id,
            display_name: None,
            volume,
        }
    }
}

/// Initiator-side description of the host attaching a volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    pub ip: String,
    /// Initiator IQN
    pub initiator: String,
    /// Host name, used as the backend server name
    pub host: String,
}

/// Destination host for a migration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub host: String,
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
}

impl HostInfo {
    /// Location descriptor advertised by the destination backend
    pub fn location_info(&self) -> Option<&str> {
        self.capabilities.get("location_info").map(String::as_str)
    }
}

/// Reference to a resource that exists on the backend but not on the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingRef {
    #[serde(rename = "source-name")]
    pub source_name: Option<String>,
}

impl ExistingRef {
    pub fn source_name(name: impl Into<String>) -> Self {
        Self {
            source_name: Some(name.into()),
        }
    }
}

// =============================================================================
// Provider Location
// =============================================================================

/// How a consumer connects to a provisioned volume.
///
/// Rendered as `"<vip>:3260,<tpgt> <iqn> <lun>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderLocation {
    /// Portal address (without port)
    pub address: String,
    pub port: u16,
    /// Target portal group tag
    pub tpgt: u64,
    pub iqn: String,
    pub lun: u32,
}

impl ProviderLocation {
    pub fn new(address: impl Into<String>, tpgt: u64, iqn: impl Into<String>, lun: u32) -> Self {
        Self {
            address: address.into(),
            port: ISCSI_PORT,
            tpgt,
            iqn: iqn.into(),
            lun,
        }
    }

    /// `address:port` pair
    pub fn portal(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for ProviderLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{},{} {} {}",
            self.address, self.port, self.tpgt, self.iqn, self.lun
        )
    }
}

impl FromStr for ProviderLocation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("Malformed provider location: {}", s));

        let mut parts = s.split_whitespace();
        let (portal, iqn, lun) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(portal), Some(iqn), Some(lun), None) => (portal, iqn, lun),
            _ => return Err(invalid()),
        };

        let (portal, tpgt) = portal.split_once(',').ok_or_else(invalid)?;
        let (address, port) = portal.rsplit_once(':').ok_or_else(invalid)?;

        Ok(Self {
            address: address.to_string(),
            port: port.parse().map_err(|_| invalid())?,
            tpgt: tpgt.parse().map_err(|_| invalid())?,
            iqn: iqn.to_string(),
            lun: lun.parse().map_err(|_| invalid())?,
        })
    }
}

// =============================================================================
// Normalized Results
// =============================================================================

/// Fields of the host's volume/snapshot record to update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication_status: Option<ReplicationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication_driver_data: Option<String>,
    /// Host the record must be moved to (managed failover targets)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl ModelUpdate {
    pub fn with_location(location: &ProviderLocation) -> Self {
        Self {
            provider_location: Some(location.to_string()),
            ..Default::default()
        }
    }

    pub fn with_replication_status(status: ReplicationStatus) -> Self {
        Self {
            replication_status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Replication driver data: where the volume's active copy lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationDriverData {
    pub location: String,
}

impl ReplicationDriverData {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
        }
    }

    /// Serialize to the opaque string stored by the host
    pub fn encode(&self) -> String {
        serde_json::json!({ "location": self.location }).to_string()
    }

    /// Parse the opaque string stored by the host
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Connection properties returned by `initialize_connection`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub driver_volume_type: String,
    pub data: IscsiProperties,
}

/// iSCSI target properties
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IscsiProperties {
    pub target_discovered: bool,
    pub target_portal: String,
    pub target_iqn: String,
    pub target_lun: u32,
    pub volume_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_password: Option<String>,
}

impl ConnectionInfo {
    /// Build iSCSI connection info for a volume at `location`
    pub fn iscsi(volume: &Volume, location: &ProviderLocation) -> Self {
        Self {
            driver_volume_type: "iscsi".to_string(),
            data: IscsiProperties {
                target_discovered: false,
                target_portal: location.portal(),
                target_iqn: location.iqn.clone(),
                target_lun: location.lun,
                volume_id: volume.id.clone(),
                ..Default::default()
            },
        }
    }
}

/// Outcome of a backend-assisted migration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationOutcome {
    pub migrated: bool,
    pub update: Option<ModelUpdate>,
}

impl MigrationOutcome {
    pub fn not_migrated() -> Self {
        Self::default()
    }
}

/// Record fields after the host migrated a volume by copying it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigratedVolumeUpdate {
    pub name_id: Option<String>,
    pub provider_location: Option<String>,
}

/// Replication targets visible to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTargets {
    pub volume_id: String,
    pub targets: Vec<ReplicationTargetRef>,
}

/// Public identity of a configured replication target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTargetRef {
    pub target_device_id: String,
}

/// Capacity and capability report of a backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub volume_backend_name: String,
    pub vendor_name: String,
    pub driver_version: String,
    pub storage_protocol: String,
    pub total_capacity_gb: f64,
    pub free_capacity_gb: f64,
    pub reserved_percentage: u32,
    pub thin_provisioning_support: bool,
    pub thick_provisioning_support: bool,
    pub consistencygroup_support: bool,
    pub replication_enabled: bool,
    pub replication_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioned_capacity_gb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity_utilization: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_volumes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goodness_function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_function: Option<String>,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

// =============================================================================
// Consistency Groups
// =============================================================================

/// Status of a consistency group or group snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Creating,
    Available,
    Deleting,
    Deleted,
    Error,
    ErrorDeleting,
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupStatus::Creating => write!(f, "creating"),
            GroupStatus::Available => write!(f, "available"),
            GroupStatus::Deleting => write!(f, "deleting"),
            GroupStatus::Deleted => write!(f, "deleted"),
            GroupStatus::Error => write!(f, "error"),
            GroupStatus::ErrorDeleting => write!(f, "error_deleting"),
        }
    }
}

/// Per-member status entry returned by group operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub id: String,
    pub status: GroupStatus,
}

/// Consistency group record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyGroup {
    pub id: String,
    pub name: Option<String>,
    pub status: GroupStatus,
    pub volume_ids: Vec<String>,
}

/// Group snapshot record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgSnapshot {
    pub id: String,
    pub consistency_group_id: String,
    pub status: GroupStatus,
    pub snapshot_ids: Vec<String>,
}

//! SAN Volume Driver - block storage driver core
//!
//! Driver logic a host orchestrator calls to provision block volumes on SAN
//! arrays: volume and snapshot lifecycle, iSCSI export, retype and migration,
//! manage/unmanage of existing volumes, consistency groups and replication
//! with failover.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Host orchestrator                             │
//! └──────────────────────────────┬──────────────────────────────────────┘
//!                                │ VolumeDriver port
//! ┌──────────────────────────────┴──────────────────────────────────────┐
//! │   Consistency Group Coordinator        │   BackendFactory            │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                          Backend drivers                             │
//! │  ┌───────────────────────────────┐  ┌─────────────────────────────┐  │
//! │  │  LeftHand                     │  │  Datera                     │  │
//! │  │  lifecycle / replication      │  │  app instances              │  │
//! │  │  extra spec mapping           │  │                             │  │
//! │  └──────────────┬────────────────┘  └──────────────┬──────────────┘  │
//! │                 │ LeftHandApi                      │ DateraApi       │
//! ├─────────────────┴──────────────────────────────────┴─────────────────┤
//! │          REST over HttpTransport (reqwest)  │  CLIQ over ssh          │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`backends`]: Backend drivers, their API clients and the HTTP transport
//! - [`controlplane`]: Consistency group coordination
//! - [`config`]: Backend configuration
//! - [`domain`]: Host-facing model and port traits
//! - [`error`]: Error types and handling

pub mod backends;
pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use backends::{BackendFactory, DateraDriver, LeftHandDriver};

pub use config::{DateraConfig, DriverConfig, LeftHandConfig};

pub use controlplane::{CgSnapshotOutcome, ConsistencyGroupCoordinator, GroupDeletion};

pub use domain::ports::{
    BackendOptions, DriverCapabilities, ExtraSpecMapper, OptionValue, VolumeDriver,
    VolumeDriverRef,
};

pub use error::{Error, ErrorAction, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

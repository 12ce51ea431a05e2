//! Driver configuration
//!
//! Configuration is loaded once from a YAML file and handed to the backend
//! at construction. Nothing reads configuration from ambient state.

use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Top-level Configuration
// =============================================================================

/// Configuration of one backend, tagged by `driver`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum DriverConfig {
    Lefthand(LeftHandConfig),
    Datera(DateraConfig),
}

impl DriverConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: DriverConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self {
            DriverConfig::Lefthand(config) => config.validate(),
            DriverConfig::Datera(config) => config.validate(),
        }
    }
}

// =============================================================================
// LeftHand
// =============================================================================

/// Configuration for the LeftHand iSCSI backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeftHandConfig {
    /// Management REST endpoint, e.g. `https://10.10.0.141:8081/lhos`
    pub api_url: String,
    pub username: String,
    pub password: String,
    /// Cluster that hosts the volumes
    pub cluster_name: String,
    /// Require CHAP on server registrations
    pub iscsi_chap_enabled: bool,
    /// SSH port of the command line interface
    pub ssh_port: u16,
    pub ssh_conn_timeout_secs: u64,
    pub san_private_key: Option<PathBuf>,
    /// SSH client executable
    pub ssh_bin: String,
    pub volume_backend_name: Option<String>,
    pub reserved_percentage: u32,
    pub goodness_function: Option<String>,
    pub filter_function: Option<String>,
    /// Provisioning applied when a volume type does not choose one
    pub default_thin_provisioning: bool,
    pub request_timeout_secs: u64,
    pub verify_tls: bool,
    /// Remote snapshot schedule used for replication
    pub replication_schedule: ReplicationScheduleConfig,
    pub replication_targets: Vec<ReplicationTargetConfig>,
}

impl Default for LeftHandConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            username: String::new(),
            password: String::new(),
            cluster_name: String::new(),
            iscsi_chap_enabled: false,
            ssh_port: 16022,
            ssh_conn_timeout_secs: 30,
            san_private_key: None,
            ssh_bin: "ssh".to_string(),
            volume_backend_name: None,
            reserved_percentage: 0,
            goodness_function: None,
            filter_function: None,
            default_thin_provisioning: true,
            request_timeout_secs: 60,
            verify_tls: false,
            replication_schedule: ReplicationScheduleConfig::default(),
            replication_targets: Vec::new(),
        }
    }
}

impl LeftHandConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        require("api_url", &self.api_url)?;
        require("username", &self.username)?;
        require("cluster_name", &self.cluster_name)?;
        host_from_url(&self.api_url)?;

        if self.replication_targets.len() > 1 {
            return Err(Error::InvalidConfiguration(format!(
                "only one replication target is supported, got {}",
                self.replication_targets.len()
            )));
        }
        for target in &self.replication_targets {
            target.validate()?;
        }

        self.replication_schedule.validate()
    }

    /// Address of the array's SSH interface
    pub fn ssh_host(&self) -> Result<String> {
        host_from_url(&self.api_url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Look up a replication target by id
    pub fn replication_target(&self, target_device_id: &str) -> Option<&ReplicationTargetConfig> {
        self.replication_targets
            .iter()
            .find(|t| t.target_device_id == target_device_id)
    }
}

/// Secondary LeftHand backend receiving replicated volumes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationTargetConfig {
    pub target_device_id: String,
    /// Host the volume records move to after failover
    #[serde(default)]
    pub managed_backend_name: Option<String>,
    pub api_url: String,
    pub username: String,
    pub password: String,
    pub cluster_name: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_ssh_conn_timeout")]
    pub ssh_conn_timeout_secs: u64,
    #[serde(default)]
    pub san_private_key: Option<PathBuf>,
}

impl ReplicationTargetConfig {
    pub fn validate(&self) -> Result<()> {
        require("target_device_id", &self.target_device_id)?;
        require("replication target api_url", &self.api_url)?;
        require("replication target username", &self.username)?;
        require("replication target cluster_name", &self.cluster_name)?;
        host_from_url(&self.api_url).map(|_| ())
    }
}

fn default_ssh_port() -> u16 {
    16022
}

fn default_ssh_conn_timeout() -> u64 {
    30
}

/// Parameters of the remote snapshot schedule backing replication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationScheduleConfig {
    /// Seconds between remote snapshots
    pub period_secs: u64,
    pub start_time: DateTime<Utc>,
    /// Snapshots kept on the primary
    pub retention_count: u32,
    /// Snapshots kept on the target
    pub remote_retention_count: u32,
}

impl Default for ReplicationScheduleConfig {
    fn default() -> Self {
        Self {
            period_secs: 1800,
            start_time: Utc.timestamp_opt(0, 0).single().unwrap_or_default(),
            retention_count: 5,
            remote_retention_count: 5,
        }
    }
}

impl ReplicationScheduleConfig {
    /// Minimum period the array accepts
    pub const MIN_PERIOD_SECS: u64 = 1800;
    /// Maximum snapshots retained on either side
    pub const MAX_RETENTION: u32 = 50;

    pub fn validate(&self) -> Result<()> {
        if self.period_secs < Self::MIN_PERIOD_SECS {
            return Err(Error::InvalidConfiguration(format!(
                "replication period must be at least {} seconds, got {}",
                Self::MIN_PERIOD_SECS,
                self.period_secs
            )));
        }
        for (name, count) in [
            ("retention_count", self.retention_count),
            ("remote_retention_count", self.remote_retention_count),
        ] {
            if count == 0 || count > Self::MAX_RETENTION {
                return Err(Error::InvalidConfiguration(format!(
                    "replication {} must be between 1 and {}, got {}",
                    name,
                    Self::MAX_RETENTION,
                    count
                )));
            }
        }
        Ok(())
    }

    /// Start time in the array's expected form (`1970-01-01T00:00:00Z`)
    pub fn start_time_str(&self) -> String {
        self.start_time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }
}

// =============================================================================
// Datera
// =============================================================================

/// Configuration for the Datera backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DateraConfig {
    /// Management address of the cluster
    pub san_ip: String,
    pub san_login: String,
    pub san_password: String,
    pub api_port: u16,
    pub api_version: String,
    /// Replicas created for each volume
    pub num_replicas: u32,
    /// Client certificate; switches the API to https
    pub client_cert: Option<PathBuf>,
    pub client_cert_key: Option<PathBuf>,
    pub volume_backend_name: Option<String>,
    pub request_timeout_secs: u64,
    pub verify_tls: bool,
}

impl Default for DateraConfig {
    fn default() -> Self {
        Self {
            san_ip: String::new(),
            san_login: String::new(),
            san_password: String::new(),
            api_port: 7717,
            api_version: "2".to_string(),
            num_replicas: 3,
            client_cert: None,
            client_cert_key: None,
            volume_backend_name: None,
            request_timeout_secs: 60,
            verify_tls: false,
        }
    }
}

impl DateraConfig {
    pub fn validate(&self) -> Result<()> {
        require("san_ip", &self.san_ip)?;
        require("san_login", &self.san_login)?;
        require("api_version", &self.api_version)?;
        if self.num_replicas == 0 {
            return Err(Error::InvalidConfiguration(
                "num_replicas must be at least 1".into(),
            ));
        }
        if self.client_cert.is_some() != self.client_cert_key.is_some() {
            return Err(Error::InvalidConfiguration(
                "client_cert and client_cert_key must be set together".into(),
            ));
        }
        Ok(())
    }

    /// Base URL of the versioned API
    pub fn base_url(&self) -> String {
        let protocol = if self.client_cert.is_some() { "https" } else { "http" };
        format!(
            "{}://{}:{}/v{}",
            protocol, self.san_ip, self.api_port, self.api_version
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn require(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidConfiguration(format!("{} must be set", name)));
    }
    Ok(())
}

/// Host part of an `http[s]://host[:port]/path` URL
pub fn host_from_url(url: &str) -> Result<String> {
    let invalid = || Error::InvalidConfiguration(format!("Invalid API URL: {}", url));

    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(invalid)?;
    let authority = rest.split('/').next().unwrap_or_default();
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };

    if host.is_empty() {
        return Err(invalid());
    }
    Ok(host.to_string())
}

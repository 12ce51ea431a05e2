//! Storage Backend Drivers
//!
//! Provides drivers for the supported backend families:
//! - LeftHand: iSCSI SAN with REST management and a CLIQ side channel
//! - Datera: app-instance REST API

pub mod datera;
pub mod http;
pub mod lefthand;

pub use datera::DateraDriver;
pub use lefthand::LeftHandDriver;

use crate::config::DriverConfig;
use crate::domain::ports::VolumeDriverRef;
use crate::error::Result;
use std::sync::Arc;
use tracing::info;

/// Factory for creating volume drivers
pub struct BackendFactory;

impl BackendFactory {
    /// Create the driver selected by `config`
    pub fn create(config: DriverConfig) -> Result<VolumeDriverRef> {
        config.validate()?;

        let driver: VolumeDriverRef = match config {
            DriverConfig::Lefthand(config) => Arc::new(LeftHandDriver::from_config(config)?),
            DriverConfig::Datera(config) => Arc::new(DateraDriver::from_config(config)?),
        };
        info!("Created {} volume driver", driver.backend_name());
        Ok(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use tokio_test::assert_ok;

    #[test]
    fn test_create_lefthand() {
        let config = DriverConfig::from_yaml_str(
            "driver: lefthand\napi_url: https://10.0.0.5:8081/lhos\nusername: admin\npassword: secret\ncluster_name: cl1\n",
        )
        .unwrap();

        let driver = assert_ok!(BackendFactory::create(config));
        assert_eq!(driver.backend_name(), lefthand::BACKEND_NAME);
        assert!(driver.capabilities().replication);
    }

    #[test]
    fn test_create_datera() {
        let config = DriverConfig::from_yaml_str(
            "driver: datera\nsan_ip: 10.0.0.9\nsan_login: admin\nsan_password: secret\n",
        )
        .unwrap();

        let driver = assert_ok!(BackendFactory::create(config));
        assert_eq!(driver.backend_name(), datera::BACKEND_NAME);
        assert!(!driver.capabilities().replication);
    }

    #[test]
    fn test_create_rejects_invalid_config() {
        let config = DriverConfig::Datera(Default::default());
        assert_matches!(
            BackendFactory::create(config).err(),
            Some(Error::InvalidConfiguration(_))
        );
    }
}

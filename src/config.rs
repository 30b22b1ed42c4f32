use std::marker::PhantomData;
use std::sync::Arc;

use crate::{
    error::IoTHubError,
    token::{parse_connection_string, DeviceKeyTokenSource, SasTokenSource, TokenSource},
};

/// How a device proves its identity to the hub
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Symmetric device key, base64 encoded. Tokens are signed on demand
    DeviceKey(String),
    /// Pre-generated shared access signature
    SasToken(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::DeviceKey(_) => f.write_str("DeviceKey(..)"),
            Credential::SasToken(_) => f.write_str("SasToken(..)"),
        }
    }
}

/// Identity of one device bound to a shared transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    device_id: String,
    credential: Credential,
}

impl DeviceConfig {
    /// Get a builder for a device configuration
    pub fn builder() -> DeviceConfigBuilder<DeviceConfigBuilderUninitializedDeviceId> {
        DeviceConfigBuilder::default()
    }

    /// Configuration and hub hostname from a device connection string
    pub fn from_connection_string(connection_string: impl AsRef<str>) -> crate::Result<(String, Self)> {
        let (hostname, device_id, key) = parse_connection_string(connection_string)?;
        let config = Self::builder().device_id(device_id).device_key(key).build()?;
        Ok((hostname, config))
    }

    /// The registered device id
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    ///
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub(crate) fn token_source(&self, hostname: &str) -> crate::Result<Arc<dyn TokenSource>> {
        Ok(match &self.credential {
            Credential::DeviceKey(key) => {
                Arc::new(DeviceKeyTokenSource::new(hostname, &self.device_id, key)?)
            }
            Credential::SasToken(sas) => Arc::new(SasTokenSource::new(sas.clone())),
        })
    }
}

/// The builder has no fields set and requires the device id
#[derive(Debug)]
pub struct DeviceConfigBuilderUninitializedDeviceId;
/// The builder has the device id and requires a credential
#[derive(Debug)]
pub struct DeviceConfigBuilderInitializedDeviceId;
/// The builder has all fields required to be built
#[derive(Debug)]
pub struct DeviceConfigBuilderInitializedCredential;

/// Builder object for a device configuration
#[derive(Debug)]
pub struct DeviceConfigBuilder<T> {
    device_id: Option<String>,
    credential: Option<Credential>,
    _phantom: PhantomData<T>,
}

impl Default for DeviceConfigBuilder<DeviceConfigBuilderUninitializedDeviceId> {
    fn default() -> Self {
        Self {
            device_id: None,
            credential: None,
            _phantom: Default::default(),
        }
    }
}

impl DeviceConfigBuilder<DeviceConfigBuilderUninitializedDeviceId> {
    /// Set the device id as registered in the hub
    pub fn device_id(
        self,
        device_id: impl ToString,
    ) -> DeviceConfigBuilder<DeviceConfigBuilderInitializedDeviceId> {
        DeviceConfigBuilder {
            device_id: Some(device_id.to_string()),
            credential: None,
            _phantom: Default::default(),
        }
    }
}

impl DeviceConfigBuilder<DeviceConfigBuilderInitializedDeviceId> {
    /// Authenticate with the device's symmetric key
    pub fn device_key(
        self,
        key: impl ToString,
    ) -> DeviceConfigBuilder<DeviceConfigBuilderInitializedCredential> {
        self.credential(Credential::DeviceKey(key.to_string()))
    }

    /// Authenticate with a pre-generated shared access signature
    pub fn sas_token(
        self,
        sas: impl ToString,
    ) -> DeviceConfigBuilder<DeviceConfigBuilderInitializedCredential> {
        self.credential(Credential::SasToken(sas.to_string()))
    }

    fn credential(
        self,
        credential: Credential,
    ) -> DeviceConfigBuilder<DeviceConfigBuilderInitializedCredential> {
        DeviceConfigBuilder {
            device_id: self.device_id,
            credential: Some(credential),
            _phantom: Default::default(),
        }
    }
}

impl DeviceConfigBuilder<DeviceConfigBuilderInitializedCredential> {
    /// Build the device configuration
    pub fn build(self) -> crate::Result<DeviceConfig> {
        let device_id = match self.device_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => return Err(IoTHubError::InvalidConfig("device_id must not be empty".into())),
        };

        let credential = match self.credential {
            Some(Credential::DeviceKey(key)) if key.is_empty() => {
                return Err(IoTHubError::InvalidConfig("device key must not be empty".into()))
            }
            Some(Credential::SasToken(sas)) if sas.is_empty() => {
                return Err(IoTHubError::InvalidConfig("sas token must not be empty".into()))
            }
            Some(credential) => credential,
            None => return Err(IoTHubError::InvalidConfig("credential must be initialized".into())),
        };

        Ok(DeviceConfig {
            device_id,
            credential,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_device_key() {
        let config = DeviceConfig::builder()
            .device_id("device1")
            .device_key("c2VjcmV0")
            .build()
            .unwrap();
        assert_eq!(config.device_id(), "device1");
        assert_eq!(config.credential(), &Credential::DeviceKey("c2VjcmV0".into()));
    }

    #[test]
    fn empty_device_id_is_rejected() {
        let err = DeviceConfig::builder()
            .device_id("  ")
            .sas_token("SharedAccessSignature sr=a&sig=b&se=1")
            .build()
            .unwrap_err();
        assert!(matches!(err, IoTHubError::InvalidConfig(_)));
    }

    #[test]
    fn from_connection_string() {
        let (hostname, config) = DeviceConfig::from_connection_string(
            "HostName=hub.azure-devices.net;DeviceId=device2;SharedAccessKey=c2VjcmV0",
        )
        .unwrap();
        assert_eq!(hostname, "hub.azure-devices.net");
        assert_eq!(config.device_id(), "device2");
    }

    #[test]
    fn debug_hides_secret() {
        let config = DeviceConfig::builder()
            .device_id("device1")
            .device_key("c2VjcmV0")
            .build()
            .unwrap();
        assert!(!format!("{:?}", config).contains("c2VjcmV0"));
    }

    #[test]
    fn bad_key_fails_token_source() {
        let config = DeviceConfig::builder()
            .device_id("device1")
            .device_key("***")
            .build()
            .unwrap();
        assert!(config.token_source("hub.azure-devices.net").is_err());
    }
}

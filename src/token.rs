use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac, NewMac};
use sha2::Sha256;

use crate::error::IoTHubError;

const DEVICEID_KEY: &str = "DeviceId";
const HOSTNAME_KEY: &str = "HostName";
const SHAREDACCESSKEY_KEY: &str = "SharedAccessKey";

const FRAGMENT: &percent_encoding::AsciiSet = &percent_encoding::CONTROLS.add(b'/');

/// Source of shared access signatures used to authenticate a device
pub trait TokenSource: std::fmt::Debug + Send + Sync {
    /// Produce a token valid until `expiry`
    fn get(&self, expiry: &DateTime<Utc>) -> String;
}

/// Token source handing out a pre-generated shared access signature
#[derive(Debug, Clone)]
pub struct SasTokenSource {
    sas: String,
}

impl SasTokenSource {
    /// Wrap an existing `SharedAccessSignature sr=...` string
    pub fn new(sas: impl Into<String>) -> Self {
        SasTokenSource { sas: sas.into() }
    }
}

impl TokenSource for SasTokenSource {
    fn get(&self, _: &DateTime<Utc>) -> String {
        self.sas.clone()
    }
}

/// Token source signing tokens with the device's symmetric key
#[derive(Clone)]
pub struct DeviceKeyTokenSource {
    hostname: String,
    device_id: String,
    key: Vec<u8>,
}

impl std::fmt::Debug for DeviceKeyTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKeyTokenSource")
            .field("hostname", &self.hostname)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl DeviceKeyTokenSource {
    /// Create a token source for `device_id` on the hub at `hostname`
    ///
    /// Fails if `key` is not base64.
    pub fn new(hostname: &str, device_id: &str, key: &str) -> crate::Result<Self> {
        let key = base64::decode(key)?;
        Ok(DeviceKeyTokenSource {
            hostname: hostname.to_string(),
            device_id: device_id.to_string(),
            key,
        })
    }
}

impl TokenSource for DeviceKeyTokenSource {
    fn get(&self, expiry: &DateTime<Utc>) -> String {
        let sas = generate_sas(
            &self.hostname,
            &self.device_id,
            &self.key,
            expiry.timestamp(),
        );

        trace!("Using device key token: {}", sas);

        sas
    }
}

pub(crate) fn generate_sas(hostname: &str, device_id: &str, key: &[u8], expiry: i64) -> String {
    let resource_uri = format!("{}/devices/{}", hostname, device_id);
    let resource_uri = percent_encoding::utf8_percent_encode(&resource_uri, FRAGMENT);
    let to_sign = format!("{}\n{}", resource_uri, expiry);

    format!(
        "SharedAccessSignature sr={}&{}&se={}",
        resource_uri,
        generate_token(key, &to_sign),
        expiry
    )
}

fn generate_token(key: &[u8], message: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match Hmac::<Sha256>::new_varkey(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac key of any length is valid"),
    };
    mac.update(message.as_bytes());
    let signature = base64::encode(mac.finalize().into_bytes());

    form_urlencoded::Serializer::new(String::new())
        .append_pair("sig", &signature)
        .finish()
}

/// Split a device connection string into hostname, device id and shared access key
///
/// ```
/// use iothub_shared_transport::parse_connection_string;
///
/// let (hostname, device_id, key) = parse_connection_string(
///     "HostName=myhub.azure-devices.net;DeviceId=dev1;SharedAccessKey=c2VjcmV0",
/// ).unwrap();
/// assert_eq!(hostname, "myhub.azure-devices.net");
/// assert_eq!(device_id, "dev1");
/// assert_eq!(key, "c2VjcmV0");
/// ```
pub fn parse_connection_string(
    connection_string: impl AsRef<str>,
) -> crate::Result<(String, String, String)> {
    let mut key = None;
    let mut device_id = None;
    let mut hostname = None;

    for part in connection_string.as_ref().split(';') {
        let mut kv = part.splitn(2, '=');
        let (name, value) = match (kv.next(), kv.next()) {
            (Some(name), Some(value)) => (name.trim(), value.trim()),
            _ => continue,
        };
        match name {
            SHAREDACCESSKEY_KEY => key = Some(value.to_string()),
            DEVICEID_KEY => device_id = Some(value.to_string()),
            HOSTNAME_KEY => hostname = Some(value.to_string()),
            _ => (), // Ignore extraneous component in the connection string
        }
    }

    let missing = |name: &str| IoTHubError::InvalidConfig(format!("connection string has no {}", name));
    Ok((
        hostname.ok_or_else(|| missing(HOSTNAME_KEY))?,
        device_id.ok_or_else(|| missing(DEVICEID_KEY))?,
        key.ok_or_else(|| missing(SHAREDACCESSKEY_KEY))?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const KEY: &str = "O+H9VTcdJP0Tqkl7bh4nVG0OJNrAataMpuWB54D0VEc=";

    #[test]
    fn device_key_signature() {
        let key = base64::decode(KEY).unwrap();
        assert_eq!(
            generate_sas("myiothub.azure-devices.net", "FirstDevice", &key, 1_587_123_309),
            "SharedAccessSignature sr=myiothub.azure-devices.net%2Fdevices%2FFirstDevice&sig=vn0%2BgyIUKgaBhEU0ypyOhJ0gPK5fSY1TKdvcJ1HxhnQ%3D&se=1587123309"
        );
    }

    #[test]
    fn token_source_uses_expiry() {
        let source = DeviceKeyTokenSource::new("myiothub.azure-devices.net", "FirstDevice", KEY)
            .unwrap();
        let expiry = Utc.timestamp(1_587_123_309, 0);
        assert!(source.get(&expiry).ends_with("&se=1587123309"));
    }

    #[test]
    fn rejects_non_base64_key() {
        let err = DeviceKeyTokenSource::new("hub", "dev", "not base64!").unwrap_err();
        assert!(matches!(err, IoTHubError::InvalidDeviceKey(_)));
    }

    #[test]
    fn sas_token_source_is_passthrough() {
        let source = SasTokenSource::new("SharedAccessSignature sr=x&sig=y&se=1");
        assert_eq!(source.get(&Utc::now()), "SharedAccessSignature sr=x&sig=y&se=1");
    }

    #[test]
    fn connection_string_keeps_padding() {
        let (hostname, device_id, key) = parse_connection_string(format!(
            "HostName=myiothub.azure-devices.net;DeviceId=FirstDevice;SharedAccessKey={};GatewayHostName=edge",
            KEY
        ))
        .unwrap();
        assert_eq!(hostname, "myiothub.azure-devices.net");
        assert_eq!(device_id, "FirstDevice");
        assert_eq!(key, KEY);
    }

    #[test]
    fn connection_string_missing_key() {
        let err = parse_connection_string("HostName=h;DeviceId=d").unwrap_err();
        assert!(err.to_string().contains(SHAREDACCESSKEY_KEY));
    }
}

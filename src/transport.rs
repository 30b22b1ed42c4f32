use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hyper::client::HttpConnector;
use hyper::{Body, Client};
use hyper_tls::HttpsConnector;
use serde::Deserialize;
use tokio_native_tls::TlsConnector;

use crate::error::IoTHubError;
use crate::message::{Disposition, Message};

pub(crate) type HttpsClient = Client<HttpsConnector<HttpConnector>>;

/// Callback invoked for every cloud to device message
pub type MessageHandler = Arc<dyn Fn(&Message) -> Disposition + Send + Sync>;

/// Wire protocol a shared transport speaks to the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum Protocol {
    /// HTTPS requests; cloud to device messages are polled
    Http,
    /// MQTT over TLS
    Mqtt,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Http => "HTTP",
            Protocol::Mqtt => "MQTT",
        })
    }
}

impl FromStr for Protocol {
    type Err = IoTHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(Protocol::Http),
            "mqtt" => Ok(Protocol::Mqtt),
            other => Err(IoTHubError::InvalidConfig(format!(
                "unsupported protocol {}",
                other
            ))),
        }
    }
}

impl TryFrom<String> for Protocol {
    type Error = IoTHubError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Tunables shared by every device bound to a transport
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Validity of each generated shared access signature
    pub token_lifetime: Duration,
    /// Interval between cloud to device polls over HTTP
    pub http_polling_interval: Duration,
    /// Upper bound for a device to cloud event to be acknowledged
    pub message_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            token_lifetime: Duration::from_secs(60 * 60),
            http_polling_interval: Duration::from_secs(25),
            message_timeout: Duration::from_secs(30),
        }
    }
}

impl TransportOptions {
    fn validate(&self) -> crate::Result<()> {
        if self.http_polling_interval.is_zero() {
            return Err(IoTHubError::InvalidConfig(
                "http_polling_interval must be greater than zero".into(),
            ));
        }
        if self.message_timeout.is_zero() {
            return Err(IoTHubError::InvalidConfig(
                "message_timeout must be greater than zero".into(),
            ));
        }
        token_expiry(self.token_lifetime).map(|_| ())
    }
}

#[derive(Debug, Clone)]
pub(crate) enum SharedConnection {
    Http(HttpsClient),
    Mqtt(TlsConnector),
}

#[derive(Debug)]
struct SharedInner {
    protocol: Protocol,
    hostname: String,
    options: TransportOptions,
    connection: SharedConnection,
    devices: Mutex<BTreeSet<String>>,
}

/// Protocol handle that any number of device clients can be bound to
///
/// The handle is cheap to clone. Resources are released once the last clone
/// and the last device client bound to it are dropped.
///
/// ```no_run
/// use iothub_shared_transport::{Protocol, SharedTransport};
///
/// let transport = SharedTransport::create(Protocol::Http, "myhub", "azure-devices.net").unwrap();
/// assert_eq!(transport.hostname(), "myhub.azure-devices.net");
/// ```
#[derive(Debug, Clone)]
pub struct SharedTransport {
    inner: Arc<SharedInner>,
}

impl SharedTransport {
    /// Create a transport for the hub `{hub_name}.{hub_suffix}` with default options
    pub fn create(protocol: Protocol, hub_name: &str, hub_suffix: &str) -> crate::Result<Self> {
        Self::with_options(protocol, hub_name, hub_suffix, TransportOptions::default())
    }

    /// Create a transport with explicit options
    pub fn with_options(
        protocol: Protocol,
        hub_name: &str,
        hub_suffix: &str,
        options: TransportOptions,
    ) -> crate::Result<Self> {
        let hub_name = hub_name.trim();
        let hub_suffix = hub_suffix.trim().trim_start_matches('.');
        if hub_name.is_empty() || hub_suffix.is_empty() {
            return Err(IoTHubError::InvalidConfig(
                "hub name and hub suffix are required".into(),
            ));
        }
        options.validate()?;
        let hostname = format!("{}.{}", hub_name, hub_suffix);

        let tls = TlsConnector::from(
            native_tls::TlsConnector::builder()
                .min_protocol_version(Some(native_tls::Protocol::Tlsv12))
                .build()?,
        );

        let connection = match protocol {
            Protocol::Http => {
                let mut http = HttpConnector::new();
                http.enforce_http(false);
                let https = HttpsConnector::from((http, tls));
                SharedConnection::Http(Client::builder().build::<_, Body>(https))
            }
            Protocol::Mqtt => SharedConnection::Mqtt(tls),
        };

        debug!("Created {} transport for {}", protocol, hostname);

        Ok(Self {
            inner: Arc::new(SharedInner {
                protocol,
                hostname,
                options,
                connection,
                devices: Mutex::new(BTreeSet::new()),
            }),
        })
    }

    ///
    pub fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    /// Fully qualified hub hostname
    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    ///
    pub fn options(&self) -> &TransportOptions {
        &self.inner.options
    }

    /// Ids of the devices currently bound, sorted
    pub fn registered_devices(&self) -> Vec<String> {
        self.devices().iter().cloned().collect()
    }

    pub(crate) fn connection(&self) -> &SharedConnection {
        &self.inner.connection
    }

    pub(crate) fn register(&self, device_id: &str) -> crate::Result<Registration> {
        if !self.devices().insert(device_id.to_string()) {
            return Err(IoTHubError::DuplicateDevice(device_id.to_string()));
        }
        trace!("Registered {} on {} transport", device_id, self.inner.protocol);
        Ok(Registration {
            transport: self.clone(),
            device_id: device_id.to_string(),
        })
    }

    fn devices(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        // The set stays consistent even if a holder panicked
        self.inner
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Binding of a device id to a shared transport, released on drop
#[derive(Debug)]
pub(crate) struct Registration {
    transport: SharedTransport,
    device_id: String,
}

impl Registration {
    pub(crate) fn transport(&self) -> &SharedTransport {
        &self.transport
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.transport.devices().remove(&self.device_id);
        trace!("Unregistered {}", self.device_id);
    }
}

/// Expiry for a token generated now
pub(crate) fn token_expiry(lifetime: Duration) -> crate::Result<DateTime<Utc>> {
    chrono::Duration::from_std(lifetime)
        .ok()
        .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
        .ok_or_else(|| {
            IoTHubError::InvalidConfig(format!("token_lifetime {:?} is out of range", lifetime))
        })
}

/// Per-device protocol implementation
#[async_trait]
pub(crate) trait Transport {
    /// Deliver a device to cloud event
    async fn send_event(&mut self, message: Message) -> crate::Result<()>;
    /// Start dispatching cloud to device messages to `handler`. Later calls are no-ops
    async fn start_receiving(&mut self, handler: MessageHandler) -> crate::Result<()>;
    /// Stop background work and disconnect
    async fn close(&mut self) -> crate::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_names() {
        assert_eq!(Protocol::Http.to_string(), "HTTP");
        assert_eq!(Protocol::Mqtt.to_string(), "MQTT");
        assert_eq!("mqtt".parse::<Protocol>().unwrap(), Protocol::Mqtt);
        assert_eq!("HTTP".parse::<Protocol>().unwrap(), Protocol::Http);
        assert!("amqp".parse::<Protocol>().is_err());
    }

    #[test]
    fn protocol_deserializes_from_string() {
        let protocols: Vec<Protocol> = serde_json::from_str(r#"["http", "Mqtt"]"#).unwrap();
        assert_eq!(protocols, vec![Protocol::Http, Protocol::Mqtt]);
    }

    #[tokio::test]
    async fn hostname_is_name_and_suffix() {
        let transport =
            SharedTransport::create(Protocol::Http, "myhub", ".azure-devices.net").unwrap();
        assert_eq!(transport.hostname(), "myhub.azure-devices.net");
        assert_eq!(transport.protocol(), Protocol::Http);
    }

    #[test]
    fn empty_hub_name_is_rejected() {
        let err = SharedTransport::create(Protocol::Mqtt, "", "azure-devices.net").unwrap_err();
        assert!(matches!(err, IoTHubError::InvalidConfig(_)));
    }

    #[test]
    fn zero_durations_are_rejected() {
        let options = TransportOptions {
            http_polling_interval: Duration::ZERO,
            ..TransportOptions::default()
        };
        let err = SharedTransport::with_options(Protocol::Http, "myhub", "azure-devices.net", options)
            .unwrap_err();
        assert!(matches!(err, IoTHubError::InvalidConfig(msg) if msg.contains("http_polling_interval")));

        let options = TransportOptions {
            message_timeout: Duration::ZERO,
            ..TransportOptions::default()
        };
        let err = SharedTransport::with_options(Protocol::Mqtt, "myhub", "azure-devices.net", options)
            .unwrap_err();
        assert!(matches!(err, IoTHubError::InvalidConfig(msg) if msg.contains("message_timeout")));
    }

    #[test]
    fn token_lifetime_out_of_range() {
        assert!(matches!(
            token_expiry(Duration::from_secs(u64::MAX / 2)),
            Err(IoTHubError::InvalidConfig(_))
        ));

        let options = TransportOptions {
            token_lifetime: Duration::from_secs(u64::MAX),
            ..TransportOptions::default()
        };
        assert!(
            SharedTransport::with_options(Protocol::Mqtt, "myhub", "azure-devices.net", options)
                .is_err()
        );
    }

    #[test]
    fn token_expiry_adds_lifetime() {
        let before = Utc::now();
        let expiry = token_expiry(Duration::from_secs(3600)).unwrap();
        assert!(expiry >= before + chrono::Duration::seconds(3600));
        assert!(expiry <= Utc::now() + chrono::Duration::seconds(3600));
    }

    #[tokio::test]
    async fn registration_is_exclusive_until_dropped() {
        let transport =
            SharedTransport::create(Protocol::Mqtt, "myhub", "azure-devices.net").unwrap();

        let first = transport.register("device1").unwrap();
        let _second = transport.register("device2").unwrap();
        assert!(matches!(
            transport.register("device1"),
            Err(IoTHubError::DuplicateDevice(id)) if id == "device1"
        ));
        assert_eq!(transport.registered_devices(), vec!["device1", "device2"]);

        drop(first);
        assert_eq!(transport.registered_devices(), vec!["device2"]);
        assert!(transport.register("device1").is_ok());
    }
}

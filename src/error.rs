use thiserror::Error;

/// Errors raised by the shared transport and the device clients bound to it
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IoTHubError {
    /// Socket level failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    /// TLS handshake or configuration failure
    #[error("TLS error: {0}")]
    TlsError(#[from] native_tls::Error),
    /// HTTP client failure
    #[error("HTTP error: {0}")]
    HttpError(#[from] hyper::Error),
    /// An HTTP request could not be constructed
    #[error("Invalid HTTP request: {0}")]
    HttpRequestError(#[from] hyper::http::Error),
    /// The hub answered with a status the operation does not accept
    #[error("IoT Hub responded with status {0}")]
    UnexpectedStatus(hyper::StatusCode),
    /// MQTT packet encoding, decoding or topic failure
    #[error("MQTT error: {0}")]
    MqttError(String),
    /// The hub refused the MQTT connection
    #[error("Connection refused by IoT Hub: {0}")]
    ConnectionRefused(String),
    /// The device key is not valid base64
    #[error("Invalid device key: {0}")]
    InvalidDeviceKey(#[from] base64::DecodeError),
    /// Configuration values are missing or malformed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// The device id is already bound to the shared transport
    #[error("Device {0} is already registered on this transport")]
    DuplicateDevice(String),
    /// The operation did not complete within the message timeout
    #[error("Timed out waiting for IoT Hub")]
    Timeout,
    /// The client was closed before the operation completed
    #[error("Device client has been closed")]
    Closed,
    /// Payload serialization failure
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub(crate) fn mqtt_error<E: std::fmt::Debug>(err: E) -> IoTHubError {
    IoTHubError::MqttError(format!("{:?}", err))
}

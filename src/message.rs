use std::collections::HashMap;
use std::fmt;

use crate::error::IoTHubError;

pub(crate) const MESSAGE_ID: &str = "$.mid";
pub(crate) const CORRELATION_ID: &str = "$.cid";
pub(crate) const CONTENT_TYPE: &str = "$.ct";
pub(crate) const CONTENT_ENCODING: &str = "$.ce";

/// How the body of a message was created and should be read back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Arbitrary bytes
    Binary,
    /// UTF-8 text
    Text,
}

impl ContentKind {
    /// Guess the kind of a received body from its content type, falling back to UTF-8 validity
    pub(crate) fn infer(content_type: Option<&str>, body: &[u8]) -> Self {
        match content_type {
            Some(ct) if ct.starts_with("text/") || ct.contains("json") => ContentKind::Text,
            Some(_) => ContentKind::Binary,
            None if std::str::from_utf8(body).is_ok() => ContentKind::Text,
            None => ContentKind::Binary,
        }
    }
}

/// Message exchanged with the IoT Hub in either direction
#[derive(Debug, Clone)]
pub struct Message {
    body: Vec<u8>,
    kind: ContentKind,
    pub(crate) properties: HashMap<String, String>,
    pub(crate) system_properties: HashMap<String, String>,
}

impl Message {
    /// Create a text message
    pub fn from_string(body: impl Into<String>) -> Self {
        Self::with_kind(body.into().into_bytes(), ContentKind::Text)
    }

    /// Create a binary message
    pub fn from_bytes(body: impl Into<Vec<u8>>) -> Self {
        Self::with_kind(body.into(), ContentKind::Binary)
    }

    pub(crate) fn with_kind(body: Vec<u8>, kind: ContentKind) -> Self {
        Self {
            body,
            kind,
            properties: HashMap::new(),
            system_properties: HashMap::new(),
        }
    }

    /// Get a builder instance for building up a message
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Whether the body is text or bytes
    pub fn content_kind(&self) -> ContentKind {
        self.kind
    }

    /// Raw body
    pub fn as_bytes(&self) -> &[u8] {
        &self.body
    }

    /// Body as text. `None` for binary messages or bodies that are not UTF-8
    pub fn as_str(&self) -> Option<&str> {
        match self.kind {
            ContentKind::Text => std::str::from_utf8(&self.body).ok(),
            ContentKind::Binary => None,
        }
    }

    /// Consume the message, returning the body
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    ///
    pub fn message_id(&self) -> Option<&str> {
        self.system_property(MESSAGE_ID)
    }

    ///
    pub fn correlation_id(&self) -> Option<&str> {
        self.system_property(CORRELATION_ID)
    }

    ///
    pub fn content_type(&self) -> Option<&str> {
        self.system_property(CONTENT_TYPE)
    }

    ///
    pub fn content_encoding(&self) -> Option<&str> {
        self.system_property(CONTENT_ENCODING)
    }

    fn system_property(&self, wire_id: &str) -> Option<&str> {
        self.system_properties.get(wire_id).map(String::as_str)
    }

    /// Look up an application property
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Set an application property, replacing any previous value
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// All application properties
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }
}

/// Builder for constructing Message instances
#[derive(Debug, Default)]
pub struct MessageBuilder {
    body: Option<(Vec<u8>, ContentKind)>,
    properties: HashMap<String, String>,
    system_properties: HashMap<String, String>,
}

impl MessageBuilder {
    /// Set a binary message body
    pub fn set_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some((body, ContentKind::Binary));
        self
    }

    /// Set a text message body
    pub fn set_text(mut self, body: impl Into<String>) -> Self {
        self.body = Some((body.into().into_bytes(), ContentKind::Text));
        self
    }

    /// Set the identifier for this message
    pub fn set_message_id(self, message_id: impl Into<String>) -> Self {
        self.set_system_property(MESSAGE_ID, message_id.into())
    }

    /// Set the correlation identifier for this message
    pub fn set_correlation_id(self, correlation_id: impl Into<String>) -> Self {
        self.set_system_property(CORRELATION_ID, correlation_id.into())
    }

    /// Set the content-type for this message, such as `text/plain`.
    /// To allow routing query on the message body, this value should be set to `application/json`
    pub fn set_content_type(self, content_type: impl Into<String>) -> Self {
        self.set_system_property(CONTENT_TYPE, content_type.into())
    }

    /// Set the content-encoding for this message.
    /// If the content-type is set to `application/json`, allowed values are `UTF-8`, `UTF-16`, `UTF-32`.
    pub fn set_content_encoding(self, content_encoding: impl Into<String>) -> Self {
        self.set_system_property(CONTENT_ENCODING, content_encoding.into())
    }

    fn set_system_property(mut self, wire_id: &str, value: String) -> Self {
        self.system_properties.insert(wire_id.to_owned(), value);
        self
    }

    /// Add a message property
    pub fn add_message_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Build into a message instance. A message without a body is empty binary
    pub fn build(self) -> Message {
        let (body, kind) = self.body.unwrap_or((Vec::new(), ContentKind::Binary));
        Message {
            body,
            kind,
            properties: self.properties,
            system_properties: self.system_properties,
        }
    }
}

/// Verdict a receive handler returns for a cloud to device message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The message was processed and is removed from the device queue
    Accepted,
    /// The message is dead-lettered
    Rejected,
    /// The message goes back to the device queue for redelivery
    Abandoned,
}

/// Outcome reported for a device to cloud event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationResult {
    /// The hub acknowledged the event
    Ok,
    /// The client was closed before the event went out
    BecauseDestroy,
    /// No acknowledgement within the message timeout
    MessageTimeout,
    /// Any other failure
    Error,
}

impl fmt::Display for ConfirmationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfirmationResult::Ok => "IOTHUB_CLIENT_CONFIRMATION_OK",
            ConfirmationResult::BecauseDestroy => "IOTHUB_CLIENT_CONFIRMATION_BECAUSE_DESTROY",
            ConfirmationResult::MessageTimeout => "IOTHUB_CLIENT_CONFIRMATION_MESSAGE_TIMEOUT",
            ConfirmationResult::Error => "IOTHUB_CLIENT_CONFIRMATION_ERROR",
        })
    }
}

impl From<&crate::Result<()>> for ConfirmationResult {
    fn from(outcome: &crate::Result<()>) -> Self {
        match outcome {
            Ok(()) => ConfirmationResult::Ok,
            Err(IoTHubError::Timeout) => ConfirmationResult::MessageTimeout,
            Err(IoTHubError::Closed) => ConfirmationResult::BecauseDestroy,
            Err(_) => ConfirmationResult::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setting_content_type() {
        let msg = Message::builder()
            .set_content_type("application/json")
            .set_body(vec![])
            .build();

        assert_eq!(msg.system_properties[CONTENT_TYPE], "application/json");
        assert_eq!(msg.content_type(), Some("application/json"));
    }

    #[test]
    fn test_setting_content_encoding() {
        let msg = Message::builder()
            .set_content_type("application/json")
            .set_content_encoding("UTF-8")
            .set_body(vec![])
            .build();

        assert_eq!(msg.system_properties[CONTENT_ENCODING], "UTF-8");
    }

    #[test]
    fn ids_are_absent_until_set() {
        let msg = Message::from_string("hello");
        assert_eq!(msg.message_id(), None);
        assert_eq!(msg.correlation_id(), None);

        let msg = Message::builder()
            .set_text("hello")
            .set_message_id("m1")
            .set_correlation_id("c1")
            .build();
        assert_eq!(msg.message_id(), Some("m1"));
        assert_eq!(msg.correlation_id(), Some("c1"));
    }

    #[test]
    fn text_and_binary_bodies() {
        let text = Message::from_string("quit");
        assert_eq!(text.content_kind(), ContentKind::Text);
        assert_eq!(text.as_str(), Some("quit"));

        let binary = Message::from_bytes(vec![0x71, 0x75]);
        assert_eq!(binary.content_kind(), ContentKind::Binary);
        assert_eq!(binary.as_str(), None);
        assert_eq!(binary.as_bytes(), b"qu");
    }

    #[test]
    fn set_property_overwrites() {
        let mut msg = Message::from_string("{}");
        msg.set_property("temperatureAlert", "false");
        msg.set_property("temperatureAlert", "true");
        assert_eq!(msg.property("temperatureAlert"), Some("true"));
        assert_eq!(msg.properties().len(), 1);
    }

    #[test]
    fn confirmation_from_outcome() {
        assert_eq!(ConfirmationResult::from(&Ok(())), ConfirmationResult::Ok);
        assert_eq!(
            ConfirmationResult::from(&Err(IoTHubError::Timeout)),
            ConfirmationResult::MessageTimeout
        );
        assert_eq!(
            ConfirmationResult::from(&Err(IoTHubError::Closed)),
            ConfirmationResult::BecauseDestroy
        );
        assert_eq!(
            ConfirmationResult::from(&Err(IoTHubError::MqttError("x".into()))),
            ConfirmationResult::Error
        );
        assert_eq!(
            ConfirmationResult::Ok.to_string(),
            "IOTHUB_CLIENT_CONFIRMATION_OK"
        );
    }
}

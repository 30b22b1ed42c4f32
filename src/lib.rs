//! Azure IoT Hub device clients sharing one protocol transport
//!
//! A [`SharedTransport`] is created once per protocol and hub. Any number of
//! [`DeviceClient`]s can then be bound to it, each authenticating as its own
//! device while reusing the transport's connection resources: the pooled HTTPS
//! client for [`Protocol::Http`], the TLS configuration for [`Protocol::Mqtt`].
//!
//! ## Feature flags
//!
//! - `c2d-messages`: Enables cloud to device messaging (default)
//!
//! # Examples
//!
//! ```no_run
//! use iothub_shared_transport::{
//!     DeviceClient, DeviceConfig, Disposition, Message, Protocol, SharedTransport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> iothub_shared_transport::Result<()> {
//!     let transport = SharedTransport::create(Protocol::Http, "iothubname", "azure-devices.net")?;
//!
//!     let config = DeviceConfig::builder()
//!         .device_id("MyDeviceId")
//!         .device_key("TheAccessKey")
//!         .build()?;
//!     let mut client = DeviceClient::create_with_transport(&transport, config).await?;
//!
//!     client
//!         .set_message_handler(|msg: &Message| {
//!             println!("Received {:?}", msg.as_str());
//!             Disposition::Accepted
//!         })
//!         .await?;
//!
//!     let result = client.send_event_confirmed(Message::from_string("hello")).await;
//!     println!("Confirmation: {}", result);
//!
//!     client.close().await
//! }
//! ```

#![warn(missing_debug_implementations, rust_2018_idioms, missing_docs)]

#[macro_use]
extern crate log;

/// SDK package version
pub const SDK_VERSION: &str = std::env!("CARGO_PKG_VERSION");

/// Device clients bound to a shared transport
pub mod client;
/// Device identity configuration
pub mod config;
/// Errors
pub mod error;
pub(crate) mod http_transport;
/// Message types for communicating with the IoT Hub
pub mod message;
pub(crate) mod mqtt_transport;
pub mod telemetry;
/// Shared access signature generation
pub mod token;
/// Shared transport and protocol selection
pub mod transport;

pub use client::DeviceClient;
pub use config::{Credential, DeviceConfig};
pub use error::IoTHubError;
pub use message::{ConfirmationResult, ContentKind, Disposition, Message, MessageBuilder};
pub use telemetry::WeatherEvent;
pub use token::{parse_connection_string, DeviceKeyTokenSource, SasTokenSource, TokenSource};
pub use transport::{MessageHandler, Protocol, SharedTransport, TransportOptions};

/// Result type for every fallible operation of the crate
pub type Result<T> = std::result::Result<T, IoTHubError>;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::DeviceConfig;
use crate::error::IoTHubError;
use crate::http_transport::HttpTransport;
use crate::message::{ConfirmationResult, Disposition, Message};
use crate::mqtt_transport::MqttTransport;
use crate::transport::{
    MessageHandler, Protocol, Registration, SharedConnection, SharedTransport, Transport,
};

#[derive(Debug)]
enum ClientTransport {
    Http(HttpTransport),
    Mqtt(MqttTransport),
}

impl ClientTransport {
    fn get_mut(&mut self) -> &mut (dyn Transport + Send) {
        match self {
            ClientTransport::Http(transport) => transport,
            ClientTransport::Mqtt(transport) => transport,
        }
    }
}

type HandlerSlot = Arc<RwLock<Option<MessageHandler>>>;

/// Handler forwarding to whatever is in `slot` at delivery time
///
/// Messages arriving while the slot is empty are abandoned so the hub redelivers them.
pub(crate) fn dispatch_to_slot(slot: HandlerSlot) -> MessageHandler {
    Arc::new(move |message: &Message| {
        let handler = slot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match handler {
            Some(handler) => handler(message),
            None => Disposition::Abandoned,
        }
    })
}

/// Client for one device bound to a [`SharedTransport`]
pub struct DeviceClient {
    device_id: String,
    protocol: Protocol,
    message_timeout: Duration,
    transport: ClientTransport,
    handler: HandlerSlot,
    receiving: bool,
    registration: Option<Registration>,
}

impl std::fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClient")
            .field("device_id", &self.device_id)
            .field("protocol", &self.protocol)
            .field("transport", &self.transport)
            .field("receiving", &self.receiving)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl DeviceClient {
    /// Create a device client sharing the protocol connection of `transport`
    ///
    /// # Arguments
    ///
    /// * `transport` - The shared transport the device is bound to
    /// * `config` - The identity of the device
    ///
    /// A device id can only be bound to a transport once at a time.
    ///
    /// # Example
    /// ```no_run
    /// use iothub_shared_transport::{DeviceClient, DeviceConfig, Protocol, SharedTransport};
    ///
    /// #[tokio::main]
    /// async fn main() -> iothub_shared_transport::Result<()> {
    ///     let transport = SharedTransport::create(Protocol::Mqtt, "myhub", "azure-devices.net")?;
    ///     let config = DeviceConfig::builder()
    ///         .device_id("device1")
    ///         .device_key("TheAccessKey")
    ///         .build()?;
    ///
    ///     let mut client = DeviceClient::create_with_transport(&transport, config).await?;
    ///     client.close().await
    /// }
    /// ```
    pub async fn create_with_transport(
        transport: &SharedTransport,
        config: DeviceConfig,
    ) -> crate::Result<DeviceClient> {
        let registration = transport.register(config.device_id())?;
        let token_source = config.token_source(transport.hostname())?;
        let options = transport.options();

        let client_transport = match registration.transport().connection() {
            SharedConnection::Http(client) => ClientTransport::Http(HttpTransport::new(
                client.clone(),
                transport.hostname(),
                config.device_id(),
                token_source,
                options.clone(),
            )),
            SharedConnection::Mqtt(tls) => ClientTransport::Mqtt(
                MqttTransport::connect(
                    tls,
                    transport.hostname(),
                    config.device_id(),
                    token_source,
                    options,
                )
                .await?,
            ),
        };

        info!(
            "Created client for {} over {}",
            config.device_id(),
            transport.protocol()
        );

        Ok(Self {
            device_id: config.device_id().to_string(),
            protocol: transport.protocol(),
            message_timeout: options.message_timeout,
            transport: client_transport,
            handler: Arc::new(RwLock::new(None)),
            receiving: false,
            registration: Some(registration),
        })
    }

    ///
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    ///
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Whether [`DeviceClient::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.registration.is_none()
    }

    /// Send a device to cloud event, waiting at most the transport's message timeout
    pub async fn send_event(&mut self, message: Message) -> crate::Result<()> {
        if self.is_closed() {
            return Err(IoTHubError::Closed);
        }

        tokio::time::timeout(
            self.message_timeout,
            self.transport.get_mut().send_event(message),
        )
        .await
        .map_err(|_| IoTHubError::Timeout)?
    }

    /// Send a device to cloud event and report the outcome as a confirmation result
    pub async fn send_event_confirmed(&mut self, message: Message) -> ConfirmationResult {
        let outcome = self.send_event(message).await;
        if let Err(err) = &outcome {
            warn!("Sending event for {} failed: {}", self.device_id, err);
        }
        ConfirmationResult::from(&outcome)
    }

    /// Invoke `handler` for every cloud to device message, replacing any previous handler
    ///
    /// The returned disposition settles the message with the hub.
    #[cfg(feature = "c2d-messages")]
    pub async fn set_message_handler<F>(&mut self, handler: F) -> crate::Result<()>
    where
        F: Fn(&Message) -> Disposition + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(IoTHubError::Closed);
        }

        *self
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(handler));

        if !self.receiving {
            let dispatch = dispatch_to_slot(self.handler.clone());
            self.transport.get_mut().start_receiving(dispatch).await?;
            self.receiving = true;
        }

        Ok(())
    }

    /// Stop receiving, disconnect and release the device id on the shared transport
    pub async fn close(&mut self) -> crate::Result<()> {
        let Some(registration) = self.registration.take() else {
            return Ok(());
        };

        let result = self.transport.get_mut().close().await;
        drop(registration);
        info!("Closed client for {}", self.device_id);

        result
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mqtt::control::variable_header::ConnectReturnCode;
use mqtt::packet::*;
use mqtt::Encodable;
use mqtt::TopicName;
#[cfg(feature = "c2d-messages")]
use mqtt::{QualityOfService, TopicFilter};
use tokio::io::AsyncWriteExt;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_native_tls::{TlsConnector, TlsStream};

use crate::error::{mqtt_error, IoTHubError};
use crate::message::Message;
#[cfg(feature = "c2d-messages")]
use crate::message::{ContentKind, Disposition, CONTENT_TYPE};
use crate::token::TokenSource;
use crate::transport::{token_expiry, MessageHandler, Transport, TransportOptions};

const MQTT_PORT: u16 = 8883;
const KEEP_ALIVE: u16 = 10;
const API_VERSION: &str = "api-version=2021-04-12";

type WriteSocket = Arc<Mutex<WriteHalf<TlsStream<TcpStream>>>>;
type ReadSocket = Arc<Mutex<ReadHalf<TlsStream<TcpStream>>>>;

#[cfg(feature = "c2d-messages")]
fn device_bound_messages_topic_filter(device_id: &str) -> String {
    format!("devices/{}/messages/devicebound/#", device_id)
}
#[cfg(feature = "c2d-messages")]
fn device_bound_messages_topic_prefix(device_id: &str) -> String {
    format!("devices/{}/messages/devicebound/", device_id)
}
fn cloud_bound_messages_topic(device_id: &str) -> String {
    format!("devices/{}/messages/events/", device_id)
}

async fn tls_connect(
    tls: &TlsConnector,
    hostname: &str,
) -> crate::Result<TlsStream<TcpStream>> {
    let socket = TcpStream::connect((hostname, MQTT_PORT)).await?;

    trace!("Connected to tcp socket {:?}", socket);

    let socket = tls.connect(hostname, socket).await?;

    trace!("Connected tls context {:?}", tls);

    Ok(socket)
}

async fn mqtt_connect(
    tls: &TlsConnector,
    hostname: &str,
    device_id: &str,
    password: String,
) -> crate::Result<TlsStream<TcpStream>> {
    let mut socket = tls_connect(tls, hostname).await?;

    let mut conn = ConnectPacket::new(device_id);
    conn.set_client_identifier(device_id);
    conn.set_clean_session(false);
    conn.set_keep_alive(KEEP_ALIVE);
    conn.set_user_name(Some(format!("{}/{}/?{}", hostname, device_id, API_VERSION)));
    conn.set_password(Some(password));

    let mut buf = Vec::new();
    conn.encode(&mut buf).map_err(mqtt_error)?;
    socket.write_all(&buf[..]).await?;

    let packet = VariablePacket::parse(&mut socket).await;

    trace!("PACKET {:?}", packet);
    match packet {
        Ok(VariablePacket::ConnackPacket(connack)) => {
            if connack.connect_return_code() != ConnectReturnCode::ConnectionAccepted {
                Err(IoTHubError::ConnectionRefused(format!(
                    "{:?}",
                    connack.connect_return_code()
                )))
            } else {
                Ok(())
            }
        }
        Ok(pck) => Err(IoTHubError::MqttError(format!(
            "Unexpected packet received after connect {:?}",
            pck
        ))),
        Err(err) => Err(mqtt_error(err)),
    }?;

    Ok(socket)
}

async fn write_buf(socket: &WriteSocket, buf: &[u8]) -> crate::Result<()> {
    socket.lock().await.write_all(buf).await.map_err(|e| e.into())
}

async fn ping(socket: &WriteSocket) -> crate::Result<()> {
    trace!("Sending PINGREQ to broker");

    let mut buf = Vec::new();
    PingreqPacket::new().encode(&mut buf).map_err(mqtt_error)?;
    write_buf(socket, &buf).await
}

/// Device transport holding one MQTT connection to the hub
#[derive(Debug)]
pub(crate) struct MqttTransport {
    write_socket: WriteSocket,
    read_socket: ReadSocket,
    d2c_topic: TopicName,
    device_id: String,
    keep_alive_task: Option<JoinHandle<()>>,
    receive_task: Option<JoinHandle<()>>,
}

impl MqttTransport {
    pub(crate) async fn connect(
        tls: &TlsConnector,
        hostname: &str,
        device_id: &str,
        token_source: Arc<dyn TokenSource>,
        options: &TransportOptions,
    ) -> crate::Result<MqttTransport> {
        let expiry = token_expiry(options.token_lifetime)?;
        trace!("Generating token that will expire at {}", expiry);
        let token = token_source.get(&expiry);

        let socket = mqtt_connect(tls, hostname, device_id, token).await?;
        info!("Connected {} to {} over MQTT", device_id, hostname);

        let (read_socket, write_socket) = tokio::io::split(socket);
        let write_socket = Arc::new(Mutex::new(write_socket));

        let keep_alive_task = tokio::spawn(keep_alive(write_socket.clone()));

        Ok(Self {
            write_socket,
            read_socket: Arc::new(Mutex::new(read_socket)),
            d2c_topic: TopicName::new(cloud_bound_messages_topic(device_id))
                .map_err(mqtt_error)?,
            device_id: device_id.to_string(),
            keep_alive_task: Some(keep_alive_task),
            receive_task: None,
        })
    }

    #[cfg(feature = "c2d-messages")]
    async fn subscribe(&self) -> crate::Result<()> {
        let topics = vec![(
            TopicFilter::new(device_bound_messages_topic_filter(&self.device_id))
                .map_err(mqtt_error)?,
            QualityOfService::Level0,
        )];

        trace!("Subscribing to {:?}", topics);

        let mut buf = Vec::new();
        SubscribePacket::new(10, topics)
            .encode(&mut buf)
            .map_err(mqtt_error)?;
        write_buf(&self.write_socket, &buf).await
    }

    #[cfg(feature = "c2d-messages")]
    async fn unsubscribe(&self) -> crate::Result<()> {
        let topics = vec![TopicFilter::new(device_bound_messages_topic_filter(&self.device_id))
            .map_err(mqtt_error)?];

        trace!("Unsubscribing to {:?}", topics);

        let mut buf = Vec::new();
        UnsubscribePacket::new(11, topics)
            .encode(&mut buf)
            .map_err(mqtt_error)?;
        write_buf(&self.write_socket, &buf).await
    }

    fn stop_tasks(&mut self) {
        for task in [self.keep_alive_task.take(), self.receive_task.take()] {
            if let Some(task) = task {
                task.abort();
            }
        }
    }
}

async fn keep_alive(socket: WriteSocket) {
    let mut interval = tokio::time::interval(Duration::from_secs(u64::from(KEEP_ALIVE) / 2));
    // First tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        if let Err(err) = ping(&socket).await {
            warn!("Keep alive stopped: {}", err);
            break;
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn send_event(&mut self, message: Message) -> crate::Result<()> {
        let full_topic = build_topic_name(&self.d2c_topic, &message)?;
        trace!("Sending message {:?} to topic {:?}", message, full_topic);
        let publish_packet = PublishPacket::new(
            full_topic,
            QoSWithPacketIdentifier::Level0,
            message.into_body(),
        );
        let mut buf = Vec::new();
        publish_packet.encode(&mut buf).map_err(mqtt_error)?;

        write_buf(&self.write_socket, &buf).await
    }

    #[cfg(feature = "c2d-messages")]
    async fn start_receiving(&mut self, handler: MessageHandler) -> crate::Result<()> {
        if self.receive_task.is_some() {
            return Ok(());
        }
        self.subscribe().await?;

        let read_socket = self.read_socket.clone();
        let rx_topic_prefix = device_bound_messages_topic_prefix(&self.device_id);
        let device_id = self.device_id.clone();

        self.receive_task = Some(tokio::spawn(async move {
            let mut socket = read_socket.lock().await;
            loop {
                let packet = match VariablePacket::parse(&mut *socket).await {
                    Ok(pk) => pk,
                    Err(err) => {
                        error!("Error in receiving packet for {}: {}", device_id, err);
                        break;
                    }
                };

                trace!("Received PACKET {:?}", packet);
                match packet {
                    VariablePacket::PingrespPacket(..) => {
                        trace!("Receiving PINGRESP from broker ..");
                    }
                    VariablePacket::SubackPacket(ref ack) => {
                        debug!("Subscribed {}: {:?}", device_id, ack);
                    }
                    VariablePacket::PublishPacket(ref publ) => {
                        if !publ.topic_name().starts_with(&rx_topic_prefix) {
                            trace!("Ignoring publish on {}", publ.topic_name());
                            continue;
                        }
                        let message = match c2d_message_from_publish(
                            &rx_topic_prefix,
                            publ.topic_name(),
                            publ.payload_ref()[..].to_vec(),
                        ) {
                            Ok(message) => message,
                            Err(err) => {
                                warn!("Dropping malformed message for {}: {}", device_id, err);
                                continue;
                            }
                        };

                        let disposition = handler(&message);
                        if disposition != Disposition::Accepted {
                            // QoS 0 deliveries are settled as soon as they arrive
                            warn!(
                                "Disposition {:?} for {} cannot be reported over MQTT",
                                disposition, device_id
                            );
                        }
                    }
                    _ => {}
                }
            }
        }));

        Ok(())
    }

    #[cfg(not(feature = "c2d-messages"))]
    async fn start_receiving(&mut self, _handler: MessageHandler) -> crate::Result<()> {
        Err(IoTHubError::InvalidConfig(
            "cloud to device messages are disabled".into(),
        ))
    }

    async fn close(&mut self) -> crate::Result<()> {
        #[cfg(feature = "c2d-messages")]
        if self.receive_task.is_some() {
            // If the connection is lost there is nothing to unsubscribe from
            if let Err(err) = self.unsubscribe().await {
                debug!("Unsubscribing {} failed: {}", self.device_id, err);
            }
        }
        self.stop_tasks();

        let mut buf = Vec::new();
        DisconnectPacket::new()
            .encode(&mut buf)
            .map_err(mqtt_error)?;
        let mut socket = self.write_socket.lock().await;
        socket.write_all(&buf).await?;
        socket.shutdown().await?;

        debug!("Disconnected {}", self.device_id);
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

/// Parse a device bound publish whose topic carries url-encoded properties
#[cfg(feature = "c2d-messages")]
fn c2d_message_from_publish(
    prefix: &str,
    topic: &str,
    payload: Vec<u8>,
) -> crate::Result<Message> {
    let properties = topic.trim_start_matches(prefix);
    let property_tuples = serde_urlencoded::from_str::<Vec<(String, String)>>(properties)
        .map_err(|e| IoTHubError::MqttError(format!("invalid topic properties: {}", e)))?;

    let content_type = property_tuples
        .iter()
        .find(|(key, _)| key == CONTENT_TYPE)
        .map(|(_, value)| value.as_str());
    let kind = ContentKind::infer(content_type, &payload);
    let mut message = Message::with_kind(payload, kind);

    for (key, value) in property_tuples {
        if key.starts_with("$.") {
            message.system_properties.insert(key, value);
        } else {
            message.properties.insert(key, value);
        }
    }

    Ok(message)
}

fn build_topic_name(base_topic: &TopicName, message: &Message) -> crate::Result<TopicName> {
    let capacity = message.system_properties.len() + message.properties.len();
    let mut props = std::collections::HashMap::with_capacity(capacity);
    props.extend(message.system_properties.iter());
    props.extend(message.properties.iter());

    // if we reuse the base_topic string as the target for the serializer,
    // we end up with an extra ampersand before the key/value pairs
    let encoded = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(props.iter())
        .finish();
    TopicName::new(format!("{}{}", base_topic.to_string(), encoded)).map_err(mqtt_error)
}

use std::sync::Arc;

use async_trait::async_trait;
use hyper::{header, Body, HeaderMap, Method, Request, Response, StatusCode};
use tokio::task::JoinHandle;

use crate::error::IoTHubError;
use crate::message::{
    ContentKind, Disposition, Message, CONTENT_ENCODING, CONTENT_TYPE, CORRELATION_ID, MESSAGE_ID,
};
use crate::token::TokenSource;
use crate::transport::{token_expiry, HttpsClient, MessageHandler, Transport, TransportOptions};

const API_VERSION: &str = "api-version=2020-09-30";
const APP_PROPERTY_PREFIX: &str = "iothub-app-";
const MESSAGE_ID_HEADER: &str = "iothub-messageid";
const CORRELATION_ID_HEADER: &str = "iothub-correlationid";
const CONTENT_TYPE_HEADER: &str = "iothub-contenttype";
const CONTENT_ENCODING_HEADER: &str = "iothub-contentencoding";

pub(crate) fn events_uri(hostname: &str, device_id: &str) -> String {
    format!(
        "https://{}/devices/{}/messages/events?{}",
        hostname, device_id, API_VERSION
    )
}

pub(crate) fn device_bound_uri(hostname: &str, device_id: &str) -> String {
    format!(
        "https://{}/devices/{}/messages/deviceBound?{}",
        hostname, device_id, API_VERSION
    )
}

/// Build the request that delivers `message` as a device to cloud event
pub(crate) fn event_request(
    hostname: &str,
    device_id: &str,
    sas: &str,
    message: &Message,
) -> crate::Result<Request<Body>> {
    let body_type = match message.content_kind() {
        ContentKind::Text => "text/plain; charset=utf-8",
        ContentKind::Binary => "application/octet-stream",
    };

    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(events_uri(hostname, device_id))
        .header(header::CONTENT_TYPE, body_type)
        .header(header::AUTHORIZATION, sas);

    let system_headers = [
        (MESSAGE_ID_HEADER, message.message_id()),
        (CORRELATION_ID_HEADER, message.correlation_id()),
        (CONTENT_TYPE_HEADER, message.content_type()),
        (CONTENT_ENCODING_HEADER, message.content_encoding()),
    ];
    for (name, value) in system_headers.iter() {
        if let Some(value) = value {
            builder = builder.header(*name, *value);
        }
    }

    for (key, value) in message.properties() {
        builder = builder.header(format!("{}{}", APP_PROPERTY_PREFIX, key), value.as_str());
    }

    Ok(builder.body(Body::from(message.as_bytes().to_vec()))?)
}

/// Build the request that settles a received message
pub(crate) fn completion_request(
    hostname: &str,
    device_id: &str,
    lock_token: &str,
    disposition: Disposition,
    sas: &str,
) -> crate::Result<Request<Body>> {
    let base = format!(
        "https://{}/devices/{}/messages/deviceBound/{}",
        hostname, device_id, lock_token
    );
    let (method, uri) = match disposition {
        Disposition::Accepted => (Method::DELETE, format!("{}?{}", base, API_VERSION)),
        Disposition::Rejected => (Method::DELETE, format!("{}?reject&{}", base, API_VERSION)),
        Disposition::Abandoned => (Method::POST, format!("{}/abandon?{}", base, API_VERSION)),
    };

    Ok(Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, sas)
        .body(Body::empty())?)
}

/// Turn a device bound response into a message and its lock token
pub(crate) fn c2d_message_from_parts(headers: &HeaderMap, body: Vec<u8>) -> (Message, Option<String>) {
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let content_type = header_str(CONTENT_TYPE_HEADER).or_else(|| header_str("content-type"));
    let kind = ContentKind::infer(content_type, &body);

    let mut message = Message::with_kind(body, kind);
    for (name, value) in headers {
        let value = match value.to_str() {
            Ok(value) => value.to_string(),
            Err(_) => continue,
        };
        match name.as_str() {
            MESSAGE_ID_HEADER => {
                message.system_properties.insert(MESSAGE_ID.to_string(), value);
            }
            CORRELATION_ID_HEADER => {
                message
                    .system_properties
                    .insert(CORRELATION_ID.to_string(), value);
            }
            CONTENT_TYPE_HEADER => {
                message.system_properties.insert(CONTENT_TYPE.to_string(), value);
            }
            CONTENT_ENCODING_HEADER => {
                message
                    .system_properties
                    .insert(CONTENT_ENCODING.to_string(), value);
            }
            other if other.starts_with(APP_PROPERTY_PREFIX) => {
                message.set_property(&other[APP_PROPERTY_PREFIX.len()..], value);
            }
            _ => {}
        }
    }

    let lock_token = header_str(header::ETAG.as_str()).map(|etag| etag.trim_matches('"').to_string());

    (message, lock_token)
}

fn ensure_success(res: &Response<Body>) -> crate::Result<()> {
    if res.status().is_success() {
        Ok(())
    } else {
        Err(IoTHubError::UnexpectedStatus(res.status()))
    }
}

/// Device transport issuing HTTPS requests over the shared connection pool
#[derive(Debug)]
pub(crate) struct HttpTransport {
    client: HttpsClient,
    hostname: String,
    device_id: String,
    token_source: Arc<dyn TokenSource>,
    options: TransportOptions,
    receive_task: Option<JoinHandle<()>>,
}

impl HttpTransport {
    pub(crate) fn new(
        client: HttpsClient,
        hostname: &str,
        device_id: &str,
        token_source: Arc<dyn TokenSource>,
        options: TransportOptions,
    ) -> Self {
        Self {
            client,
            hostname: hostname.to_string(),
            device_id: device_id.to_string(),
            token_source,
            options,
            receive_task: None,
        }
    }

    fn sas(&self) -> crate::Result<String> {
        Ok(self
            .token_source
            .get(&token_expiry(self.options.token_lifetime)?))
    }

    fn poller(&self, handler: MessageHandler) -> C2dPoller {
        C2dPoller {
            client: self.client.clone(),
            hostname: self.hostname.clone(),
            device_id: self.device_id.clone(),
            token_source: self.token_source.clone(),
            options: self.options.clone(),
            handler,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_event(&mut self, message: Message) -> crate::Result<()> {
        let req = event_request(&self.hostname, &self.device_id, &self.sas()?, &message)?;
        trace!("Sending event for {}: {:?}", self.device_id, req);

        let res = self.client.request(req).await?;
        debug!("Event response for {}: {}", self.device_id, res.status());

        ensure_success(&res)
    }

    async fn start_receiving(&mut self, handler: MessageHandler) -> crate::Result<()> {
        if self.receive_task.is_some() {
            return Ok(());
        }

        let poller = self.poller(handler);
        self.receive_task = Some(tokio::spawn(poller.run()));

        Ok(())
    }

    async fn close(&mut self) -> crate::Result<()> {
        if let Some(task) = self.receive_task.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.receive_task.take() {
            task.abort();
        }
    }
}

struct C2dPoller {
    client: HttpsClient,
    hostname: String,
    device_id: String,
    token_source: Arc<dyn TokenSource>,
    options: TransportOptions,
    handler: MessageHandler,
}

impl C2dPoller {
    async fn run(self) {
        let mut interval = tokio::time::interval(self.options.http_polling_interval);
        loop {
            interval.tick().await;
            if let Err(err) = self.drain().await {
                warn!("Polling messages for {} failed: {}", self.device_id, err);
            }
        }
    }

    /// Receive until the device queue is empty
    async fn drain(&self) -> crate::Result<()> {
        while self.receive_one().await? {}
        Ok(())
    }

    async fn receive_one(&self) -> crate::Result<bool> {
        let sas = self
            .token_source
            .get(&token_expiry(self.options.token_lifetime)?);
        let req = Request::builder()
            .method(Method::GET)
            .uri(device_bound_uri(&self.hostname, &self.device_id))
            .header(header::AUTHORIZATION, sas.as_str())
            .body(Body::empty())?;

        let res = self.client.request(req).await?;
        if res.status() == StatusCode::NO_CONTENT {
            return Ok(false);
        }
        ensure_success(&res)?;

        let (parts, body) = res.into_parts();
        let body = hyper::body::to_bytes(body).await?;
        let (message, lock_token) = c2d_message_from_parts(&parts.headers, body.to_vec());
        trace!("Received message for {}: {:?}", self.device_id, message);

        let disposition = (self.handler)(&message);

        match lock_token {
            Some(lock_token) => {
                let req = completion_request(
                    &self.hostname,
                    &self.device_id,
                    &lock_token,
                    disposition,
                    &sas,
                )?;
                let res = self.client.request(req).await?;
                ensure_success(&res)?;
                debug!("Settled message {} as {:?}", lock_token, disposition);
            }
            None => warn!("Message without lock token for {} cannot be settled", self.device_id),
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::SasTokenSource;
    use crate::transport::{Protocol, SharedConnection, SharedTransport};
    use hyper::header::HeaderValue;
    use std::time::Duration;

    fn transport(device_id: &str) -> HttpTransport {
        let options = TransportOptions {
            http_polling_interval: Duration::from_secs(3600),
            ..TransportOptions::default()
        };
        let shared =
            SharedTransport::with_options(Protocol::Http, "myhub", "azure-devices.net", options)
                .unwrap();
        let client = match shared.connection() {
            SharedConnection::Http(client) => client.clone(),
            SharedConnection::Mqtt(_) => unreachable!(),
        };
        HttpTransport::new(
            client,
            shared.hostname(),
            device_id,
            Arc::new(SasTokenSource::new("SharedAccessSignature sr=a&sig=b&se=1")),
            shared.options().clone(),
        )
    }

    #[tokio::test]
    async fn second_start_keeps_first_poller() {
        let mut http = transport("device1");
        let first: MessageHandler = Arc::new(|_: &Message| Disposition::Accepted);
        let second: MessageHandler = Arc::new(|_: &Message| Disposition::Rejected);

        http.start_receiving(first.clone()).await.unwrap();
        http.start_receiving(second.clone()).await.unwrap();

        // The running poller owns a clone of the first handler only
        assert_eq!(Arc::strong_count(&first), 2);
        assert_eq!(Arc::strong_count(&second), 1);

        http.close().await.unwrap();
        assert!(http.receive_task.is_none());
    }

    #[test]
    fn event_request_carries_properties() {
        let mut message = Message::builder()
            .set_text(r#"{"deviceId":"device1"}"#)
            .set_message_id("42")
            .build();
        message.set_property("temperatureAlert", "true");

        let req = event_request("hub.azure-devices.net", "device1", "SharedAccessSignature x", &message)
            .unwrap();

        assert_eq!(req.method(), Method::POST);
        assert_eq!(
            req.uri().to_string(),
            "https://hub.azure-devices.net/devices/device1/messages/events?api-version=2020-09-30"
        );
        assert_eq!(req.headers()[header::AUTHORIZATION], "SharedAccessSignature x");
        assert_eq!(req.headers()["iothub-messageid"], "42");
        assert_eq!(req.headers()["iothub-app-temperaturealert"], "true");
        assert!(req.headers().get("iothub-correlationid").is_none());
    }

    #[test]
    fn completion_request_per_disposition() {
        let uri = |d| {
            let req = completion_request("h", "d", "lock", d, "sas").unwrap();
            (req.method().clone(), req.uri().to_string())
        };

        assert_eq!(
            uri(Disposition::Accepted),
            (Method::DELETE, "https://h/devices/d/messages/deviceBound/lock?api-version=2020-09-30".to_string())
        );
        assert_eq!(
            uri(Disposition::Rejected),
            (Method::DELETE, "https://h/devices/d/messages/deviceBound/lock?reject&api-version=2020-09-30".to_string())
        );
        assert_eq!(
            uri(Disposition::Abandoned),
            (Method::POST, "https://h/devices/d/messages/deviceBound/lock/abandon?api-version=2020-09-30".to_string())
        );
    }

    #[test]
    fn device_bound_response_becomes_message() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ETAG, HeaderValue::from_static("\"5a7c\""));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert("iothub-messageid", HeaderValue::from_static("m-1"));
        headers.insert("iothub-app-property_key", HeaderValue::from_static("value"));

        let (message, lock_token) = c2d_message_from_parts(&headers, b"quit".to_vec());

        assert_eq!(lock_token.as_deref(), Some("5a7c"));
        assert_eq!(message.content_kind(), ContentKind::Text);
        assert_eq!(message.as_str(), Some("quit"));
        assert_eq!(message.message_id(), Some("m-1"));
        assert_eq!(message.correlation_id(), None);
        assert_eq!(message.property("property_key"), Some("value"));
        assert_eq!(message.content_type(), None);
    }

    #[test]
    fn device_bound_content_headers_are_kept() {
        let mut headers = HeaderMap::new();
        headers.insert("iothub-contenttype", HeaderValue::from_static("application/json"));
        headers.insert("iothub-contentencoding", HeaderValue::from_static("utf-8"));

        let (message, _) = c2d_message_from_parts(&headers, br#"{"cmd":"quit"}"#.to_vec());

        assert_eq!(message.content_kind(), ContentKind::Text);
        assert_eq!(message.content_type(), Some("application/json"));
        assert_eq!(message.content_encoding(), Some("utf-8"));
        assert!(message.properties().is_empty());
    }

    #[test]
    fn octet_stream_is_binary() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        let (message, lock_token) = c2d_message_from_parts(&headers, vec![0xff, 0x00]);
        assert_eq!(message.content_kind(), ContentKind::Binary);
        assert!(lock_token.is_none());
    }
}

//! Bind several devices to one shared transport per protocol, send simulated
//! weather telemetry and print the cloud to device messages they receive.
//!
//! Fill in `demos/config.toml` or set `IOTHUB_HUB_NAME`, `IOTHUB_HUB_SUFFIX`.

#[macro_use]
extern crate log;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use iothub_shared_transport::{
    ContentKind, DeviceClient, DeviceConfig, Disposition, Message, Protocol, SharedTransport,
    TransportOptions, WeatherEvent,
};
use serde::Deserialize;

const MESSAGE_COUNT: usize = 5;
const DOWORK_LOOP_NUM: usize = 3;
const PROPERTY_KEY: &str = "property_key";

#[derive(Debug, Deserialize)]
struct DeviceSettings {
    device_id: String,
    device_key: String,
}

#[derive(Debug, Deserialize)]
struct SampleConfig {
    hub_name: String,
    hub_suffix: String,
    protocols: Vec<Protocol>,
    #[serde(default = "default_polling_secs")]
    http_polling_secs: u64,
    devices: Vec<DeviceSettings>,
}

fn default_polling_secs() -> u64 {
    1
}

impl SampleConfig {
    fn load() -> Result<Self, config::ConfigError> {
        let mut cfg = config::Config::default();
        cfg.merge(config::File::with_name("demos/config"))?;
        cfg.merge(config::Environment::with_prefix("IOTHUB"))?;
        cfg.try_into()
    }
}

fn receive_message(message: &Message, counter: &AtomicUsize, running: &AtomicBool) -> Disposition {
    let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
    let message_id = message.message_id().unwrap_or("<null>");
    let correlation_id = message.correlation_id().unwrap_or("<null>");

    let body = String::from_utf8_lossy(message.as_bytes());
    let kind = match message.content_kind() {
        ContentKind::Binary => "BINARY",
        ContentKind::Text => "STRING",
    };
    println!(
        "Received Message [{}]\n Message ID: {}\n Correlation ID: {}\n {} Data: <<<{}>>> & Size={}",
        count,
        message_id,
        correlation_id,
        kind,
        body,
        message.as_bytes().len()
    );

    if let Some(value) = message.property(PROPERTY_KEY) {
        println!("\nMessage Properties:");
        println!("\tKey: {} Value: {}", PROPERTY_KEY, value);
    }

    if message.as_bytes() == b"quit" {
        running.store(false, Ordering::SeqCst);
    }

    Disposition::Accepted
}

async fn create_clients(
    transport: &SharedTransport,
    settings: &SampleConfig,
    running: &Arc<AtomicBool>,
) -> Vec<DeviceClient> {
    let mut clients = Vec::with_capacity(settings.devices.len());

    for device in &settings.devices {
        let config = match DeviceConfig::builder()
            .device_id(&device.device_id)
            .device_key(&device.device_key)
            .build()
        {
            Ok(config) => config,
            Err(err) => {
                println!("ERROR: invalid configuration for {}: {}", device.device_id, err);
                continue;
            }
        };

        let mut client = match DeviceClient::create_with_transport(transport, config).await {
            Ok(client) => client,
            Err(err) => {
                println!("ERROR: client for {} could not be created: {}", device.device_id, err);
                continue;
            }
        };

        let counter = Arc::new(AtomicUsize::new(0));
        let running = running.clone();
        if let Err(err) = client
            .set_message_handler(move |message: &Message| {
                receive_message(message, &counter, &running)
            })
            .await
        {
            warn!("Not receiving messages for {}: {}", device.device_id, err);
        }

        clients.push(client);
    }

    clients
}

async fn run_protocol(protocol: Protocol, settings: &SampleConfig, running: Arc<AtomicBool>) {
    let options = TransportOptions {
        http_polling_interval: Duration::from_secs(settings.http_polling_secs),
        ..TransportOptions::default()
    };
    let transport =
        match SharedTransport::with_options(protocol, &settings.hub_name, &settings.hub_suffix, options) {
            Ok(transport) => transport,
            Err(err) => {
                println!("Failed to creating the protocol handle: {}", err);
                return;
            }
        };

    let mut clients = create_clients(&transport, settings, &running).await;
    info!("Bound devices {:?}", transport.registered_devices());

    let mut rng = rand::thread_rng();
    for _ in 0..MESSAGE_COUNT {
        for client in clients.iter_mut() {
            let message = match WeatherEvent::simulate(client.device_id(), &mut rng).into_message() {
                Ok(message) => message,
                Err(err) => {
                    error!("Could not build event: {}", err);
                    continue;
                }
            };
            let result = client.send_event_confirmed(message).await;
            println!(
                "Confirmation message received from device {} with result = {}",
                client.device_id(),
                result
            );
        }
    }

    for _ in 0..DOWORK_LOOP_NUM {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    for result in futures::future::join_all(clients.iter_mut().map(|client| client.close())).await {
        if let Err(err) = result {
            warn!("Closing client failed: {}", err);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = SampleConfig::load()?;
    let running = Arc::new(AtomicBool::new(true));

    for protocol in &settings.protocols {
        println!("> Creating client for {}...", protocol);
        run_protocol(*protocol, &settings, running.clone()).await;
        println!();
    }

    Ok(())
}

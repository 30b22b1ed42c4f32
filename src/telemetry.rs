//! Simulated weather station events

use rand::Rng;
use serde::Serialize;

use crate::message::Message;

/// Property flagging readings above [`ALERT_TEMPERATURE`]
pub const TEMPERATURE_ALERT_PROPERTY: &str = "temperatureAlert";
/// Temperature above which a reading raises an alert
pub const ALERT_TEMPERATURE: f64 = 28.0;

const AVG_WIND_SPEED: f64 = 10.0;
const MIN_TEMPERATURE: f64 = 20.0;
const MIN_HUMIDITY: f64 = 60.0;

/// One reading sent as a device to cloud event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherEvent {
    /// Reporting device
    pub device_id: String,
    /// Wind speed in km/h
    pub wind_speed: f64,
    /// Degrees celsius
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: f64,
}

impl WeatherEvent {
    /// Random reading for `device_id`
    pub fn simulate<R: Rng + ?Sized>(device_id: &str, rng: &mut R) -> Self {
        Self {
            device_id: device_id.to_string(),
            wind_speed: AVG_WIND_SPEED + f64::from(rng.gen_range(2..=5u8)),
            temperature: MIN_TEMPERATURE + f64::from(rng.gen_range(0..10u8)),
            humidity: MIN_HUMIDITY + f64::from(rng.gen_range(0..20u8)),
        }
    }

    /// Whether the temperature exceeds [`ALERT_TEMPERATURE`]
    pub fn temperature_alert(&self) -> bool {
        self.temperature > ALERT_TEMPERATURE
    }

    /// JSON text message carrying the alert flag as an application property
    pub fn into_message(self) -> crate::Result<Message> {
        let alert = self.temperature_alert();
        let mut message = Message::from_string(serde_json::to_string(&self)?);
        message.set_property(TEMPERATURE_ALERT_PROPERTY, alert.to_string());
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ContentKind;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn event(temperature: f64) -> WeatherEvent {
        WeatherEvent {
            device_id: "device1".into(),
            wind_speed: 12.0,
            temperature,
            humidity: 65.0,
        }
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(event(21.0)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "deviceId": "device1",
                "windSpeed": 12.0,
                "temperature": 21.0,
                "humidity": 65.0,
            })
        );
    }

    #[test]
    fn alert_only_above_threshold() {
        assert!(!event(28.0).temperature_alert());
        assert!(event(29.0).temperature_alert());
    }

    #[test]
    fn message_carries_alert_property() {
        let message = event(29.0).into_message().unwrap();
        assert_eq!(message.content_kind(), ContentKind::Text);
        assert_eq!(message.property(TEMPERATURE_ALERT_PROPERTY), Some("true"));
        assert!(message.as_str().unwrap().contains("\"deviceId\":\"device1\""));

        let message = event(20.0).into_message().unwrap();
        assert_eq!(message.property(TEMPERATURE_ALERT_PROPERTY), Some("false"));
    }

    #[test]
    fn simulated_readings_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let reading = WeatherEvent::simulate("device2", &mut rng);
            assert!((12.0..=15.0).contains(&reading.wind_speed));
            assert!((20.0..=29.0).contains(&reading.temperature));
            assert!((60.0..=79.0).contains(&reading.humidity));
            assert_eq!(reading.device_id, "device2");
        }
    }
}

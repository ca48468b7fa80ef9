pub mod telemetry;

// MODULES
pub mod error;
pub mod http;
pub mod locations;
pub mod reports;
pub mod session;

use chrono::{DateTime, Utc};

/// Last-known decoded sensor state, overwritten in place on every message
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TelemetryReading {
    /// Most recent temperature in Celsius, if any structured message carried one
    pub temperature: Option<f64>,
    /// Most recent relative humidity percentage
    pub humidity: Option<f64>,
    /// Topic of the last message received on any subscription
    pub last_topic: String,
    /// Raw payload of the last message, surfaced even when decoding failed
    pub last_payload: String,
    /// Arrival time of the last message
    pub received_at: Option<DateTime<Utc>>,
}

/// Broker connection lifecycle as observed by consumers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Desired on/off state for a controllable device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    On,
    Off,
}

impl DeviceState {
    /// Wire representation, always uppercase
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::On => "ON",
            DeviceState::Off => "OFF",
        }
    }
}

/// A single fire-and-forget device command
#[derive(Clone, Debug)]
pub struct DeviceCommand {
    pub topic: String,
    pub state: DeviceState,
}

/// the topic carrying the tank fill level
pub const TANK_LEVEL_TOPIC: &str = "tanque/nivel";

/// the topic carrying raw ultrasonic distance readings, in cm
pub const ULTRASONIC_TOPIC: &str = "sensor/agua/ultrasonico";

/// the command/ack topic for the light
pub const LIGHT_TOPIC: &str = "sensor/bombillo";

/// the command/ack topic for the fan
pub const FAN_TOPIC: &str = "sensor/ventilador";

/// Maps an ultrasonic distance reading to a 0-100% tank fill level.
///
/// Pure consumer-side math, independent of the channel that produced the
/// distance. Out-of-range distances clamp rather than error.
pub fn fill_percent(distance_cm: f64, tank_height_cm: f64) -> f64 {
    (distance_cm / tank_height_cm * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_percent_clamps_both_ends() {
        assert_eq!(fill_percent(50.0, 100.0), 50.0);
        assert_eq!(fill_percent(250.0, 100.0), 100.0);
        assert_eq!(fill_percent(-3.0, 100.0), 0.0);
    }

    #[test]
    fn device_state_is_uppercase_on_the_wire() {
        assert_eq!(DeviceState::On.as_str(), "ON");
        assert_eq!(DeviceState::Off.as_str(), "OFF");
    }
}

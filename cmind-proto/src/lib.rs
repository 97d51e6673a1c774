//! Shared protocol definitions for the city-minder system: the sensor
//! reading data model, the tagged request/response message set exchanged
//! with the field gateway, and the length-prefixed frame codec that carries
//! them on a TCP socket.
//!
//! This crate owns no sockets. The broker layer (`cmind-broker`) opens
//! connections and drives the codec; device simulators and test harnesses
//! use the same types from the gateway side.

mod frame;
mod message;

pub use frame::{
    encode_frame, read_frame, write_end_of_stream, write_frame, Frame, FrameError, MAX_FRAME_LEN,
};
pub use message::{
    decode_request, decode_response, encode_request, encode_response, Request, Response, WireError,
};

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Identifies one device across every message source. Readings carrying the
/// same id always describe the same physical device.
pub type DeviceId = String;

/// Human-readable name of a monitored city zone (e.g. "Cocó").
pub type Location = String;

/// Device category as reported by the gateway. Categories this build does
/// not know about decode to [`DeviceKind::Unknown`] so that newer gateways
/// keep working against older clients.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceKind {
    Temperature,
    Humidity,
    Alarm,
    Semaphore,
    LampPost,
    #[default]
    Unknown,
}

impl DeviceKind {
    fn from_wire(name: &str) -> Self {
        match name {
            "TEMPERATURE" => DeviceKind::Temperature,
            "HUMIDITY" => DeviceKind::Humidity,
            "ALARM" => DeviceKind::Alarm,
            "SEMAPHORE" => DeviceKind::Semaphore,
            "LAMP_POST" => DeviceKind::LampPost,
            _ => DeviceKind::Unknown,
        }
    }
}

// Derived deserialization would reject category names added after this
// build shipped; unknown names must fall through to Unknown instead.
impl<'de> Deserialize<'de> for DeviceKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(DeviceKind::from_wire(&name))
    }
}

/// One reading from one device. Identity is `sensor_id`; `value` and
/// `timestamp` are the mutable parts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub sensor_id: DeviceId,
    pub sensor_type: DeviceKind,
    pub value: f64,
    pub unit: String,
    pub location: Location,
    /// Seconds since the unix epoch. A value of 0 means the device did not
    /// stamp the reading and the receiver should stamp receipt time instead.
    pub timestamp: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SensorReading {
    /// An alarm device reporting exactly 1.0 is an active alarm.
    pub fn is_active_alarm(&self) -> bool {
        self.sensor_type == DeviceKind::Alarm && self.value == 1.0
    }
}

/// Command strings understood by the actuator devices. The wire field is a
/// free string; these are the values the deployed semaphores and lamp posts
/// react to.
pub mod commands {
    pub const SEMAPHORE_CLOSE: &str = "vermelho";
    pub const SEMAPHORE_OPEN: &str = "verde";
    pub const LAMP_ON: &str = "on";
    pub const LAMP_OFF: &str = "off";
}

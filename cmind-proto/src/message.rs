//! Tagged request/response message model.
//!
//! Requests flow client to gateway only; one request opens an exchange.
//! Responses flow back framed by the codec in `frame`. Response kinds this
//! build does not recognize decode to [`Response::Unrecognized`] instead of
//! failing, so schema drift between gateway and client versions degrades to
//! a logged skip rather than a dead connection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::SensorReading;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("malformed message")]
    MalformedMessage(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", content = "body")]
pub enum Request {
    /// Ask for a snapshot of every device the gateway knows about.
    ListDevices,
    /// Subscribe to live readings for one location. The gateway answers
    /// with an unbounded run of [`Response::Reading`] frames terminated by
    /// end-of-stream or connection loss.
    StreamLocation { location: String },
    /// Ask one device to produce a fresh reading right now.
    OnDemandRead { device_id: String },
    /// Dispatch an actuator command (see [`crate::commands`]).
    Command { target_id: String, command: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", content = "body")]
pub enum Response {
    DeviceList { readings: Vec<SensorReading> },
    Reading { reading: SensorReading },
    CommandAck { message: String },
    #[serde(other)]
    Unrecognized,
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(request)?)
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_response(response: &Response) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(response)?)
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}

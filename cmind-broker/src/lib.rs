//! The `cmind-broker` crate is the gateway access layer of the city-minder
//! system. It owns every socket the client opens toward the field gateway
//! and reduces what arrives on them to one consistent per-device view.
//!
//! Three independent loops feed that view:
//! 1. A device directory poll, re-listing every known device on a fixed
//!    cadence and replacing the previous directory wholesale.
//! 2. A location stream subscription, holding one long-lived connection for
//!    the currently selected location and reconnecting with a fixed backoff
//!    whenever the gateway ends the stream or the transport fails.
//! 3. One-shot tasks fired per user action (on-demand reads and actuator
//!    commands), each opening its own connection for a single exchange.
//!
//! All three report into a single broker task, the only writer of the
//! [`DeviceStateStore`]. Subscribed clients receive a fresh [`DisplayState`]
//! snapshot after every mutation; the [`BrokerHandle`] actor is the whole
//! client surface (subscription, selection, one-shot actions, snapshot
//! pull).
//!
//! # Examples
//! ```no_run
//! #[actix::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handle = cmind_broker::broker(
//!         "127.0.0.1:6789".parse()?,
//!         "Cocó".to_string(),
//!         tokio::time::Duration::from_secs(cmind_broker::DEFAULT_DIRECTORY_POLL_SECS),
//!         tokio::time::Duration::from_secs(cmind_broker::DEFAULT_STREAM_BACKOFF_SECS),
//!     )
//!     .await?;
//!
//!     let (view_tx, mut view_rx) = tokio::sync::mpsc::unbounded_channel();
//!     handle
//!         .send(cmind_broker::ClientSubscribe {
//!             id: 0,
//!             view_sink: view_tx,
//!         })
//!         .await??;
//!
//!     while let Some(view) = view_rx.recv().await {
//!         log::info!("{}", view.status);
//!     }
//!     Ok(())
//! }
//! ```

mod broker;
mod conn;
mod poll;
mod store;

pub(crate) use conn::GatewayConnection;
pub(crate) use poll::{DirectoryLoop, GatewayEvent, StreamLoop};

pub use broker::{
    broker, BrokerError, BrokerHandle, ClientSubscribe, ClientUnsubscribe, GetView,
    RequestOnDemandRead, SelectDevice, SelectLocation, SendCommand,
};
pub use conn::TransportFailure;
pub use store::{DeviceDetail, DeviceStateStore, DisplayState, ReadingSource, SensorSlot};

/// [`ClientId`] is used when subscribing to broker view snapshots
pub type ClientId = u32;

/// Cadence of the device directory poll
pub const DEFAULT_DIRECTORY_POLL_SECS: u64 = 10;

/// Delay before reopening a location stream after it ends or fails
pub const DEFAULT_STREAM_BACKOFF_SECS: u64 = 5;

// Overall bound on a one-shot gateway exchange; the gateway itself gives a
// commanded device this long to produce fresh data
pub(crate) const CALL_TIMEOUT_SECS: u64 = 15;

//! Headless city-minder daemon: connects to the field gateway, keeps the
//! device view fresh via the broker's polling loops, and logs every view
//! snapshot. A rendering front end would consume the same snapshots.

use thiserror::Error;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::Duration;

use cmind_broker::{broker, BrokerError, ClientSubscribe, DisplayState, SensorSlot};

mod config;
use config::Config;

#[derive(Error, Debug)]
enum CityMinderError {
    #[error("Config Error: {0}")]
    Config(String),
    #[error("Broker Error")]
    Broker(#[from] BrokerError),
    #[error("Actor mailbox Error")]
    Mailbox(#[from] actix::MailboxError),
}

#[actix::main]
async fn main() -> Result<(), CityMinderError> {
    env_logger::init();

    let config = Config::from_env().map_err(CityMinderError::Config)?;
    log::info!(
        "Connecting to gateway at {:} for location {:}",
        config.gateway_addr,
        config.location
    );

    let handle = broker(
        config.gateway_addr,
        config.location.clone(),
        Duration::from_secs(config.directory_poll_secs),
        Duration::from_secs(config.stream_backoff_secs),
    )
    .await?;

    let (view_tx, mut view_rx) = unbounded_channel();
    handle
        .send(ClientSubscribe {
            id: 0,
            view_sink: view_tx,
        })
        .await??;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down");
                break;
            }
            Some(view) = view_rx.recv() => log_view(&view),
            else => break,
        }
    }

    Ok(())
}

fn slot_text(slot: &Option<SensorSlot>) -> String {
    slot.as_ref()
        .map(|s| format!("{:.1} {}", s.value, s.unit))
        .unwrap_or_else(|| "--".to_string())
}

fn log_view(view: &DisplayState) {
    log::info!(
        "[{:}] temperature {:} | humidity {:} | {:} devices | {:}",
        view.location,
        slot_text(&view.temperature),
        slot_text(&view.humidity),
        view.devices.len(),
        view.status
    );
    if !view.active_alarms.is_empty() {
        log::warn!("Active alarms in: {:}", view.active_alarms.join(", "));
    }
}

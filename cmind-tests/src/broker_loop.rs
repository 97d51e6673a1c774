//! Drives the broker against the mock gateway end to end: subscribe, watch
//! the loops fill the view, then exercise selection, an on-demand read, an
//! actuator command, and a location switch.

use tokio::time::{sleep, sleep_until, Duration, Instant};

use cmind_broker::{
    broker, ClientSubscribe, RequestOnDemandRead, SelectDevice, SelectLocation, SendCommand,
};
use cmind_proto::commands;
use cmind_tests::MockGateway;

#[actix::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let gateway = MockGateway::start("127.0.0.1:0".parse()?).await?;
    log::info!("Mock gateway on {:}", gateway.addr());

    let handle = broker(
        gateway.addr(),
        "Cocó".to_string(),
        Duration::from_secs(2),
        Duration::from_secs(2),
    )
    .await
    .map_err(|e| {
        log::error!("Error creating broker & handle {e:}");
        e
    })?;

    let (view_tx, mut view_rx) = tokio::sync::mpsc::unbounded_channel();
    handle
        .send(ClientSubscribe {
            id: 0,
            view_sink: view_tx,
        })
        .await??;

    let driver = handle.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(3)).await;
        driver
            .send(SelectDevice {
                device_id: Some("sem-coco-1".to_string()),
            })
            .await
            .ok();
        driver
            .send(RequestOnDemandRead {
                device_id: "sem-coco-1".to_string(),
            })
            .await
            .ok();

        sleep(Duration::from_secs(2)).await;
        driver
            .send(SendCommand {
                device_id: "sem-coco-1".to_string(),
                command: commands::SEMAPHORE_CLOSE.to_string(),
            })
            .await
            .ok();

        sleep(Duration::from_secs(2)).await;
        driver
            .send(SelectLocation {
                location: "Aldeota".to_string(),
            })
            .await
            .ok();
    });

    let run_until = Instant::now() + Duration::from_secs(15);
    loop {
        tokio::select! {
            _ = sleep_until(run_until) => break,
            Some(view) = view_rx.recv() => {
                log::info!(
                    "[{:}] temp {:?} | selected {:?} | alarms {:?} | {:}",
                    view.location,
                    view.temperature.as_ref().map(|t| t.value),
                    view.selected.as_ref().map(|d| d.reading.sensor_id.clone()),
                    view.active_alarms,
                    view.status
                );
            }
            else => break,
        }
    }

    log::info!("Broker loop test finished");
    Ok(())
}

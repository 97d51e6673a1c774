//! The background loops that keep gateway data fresh.
//!
//! Each loop owns its spawned task and aborts it on drop, so replacing a
//! [`StreamLoop`] (location reselect) or dropping the broker tears down the
//! in-flight connection as well, not just future attempts. Failures are
//! converted to [`GatewayEvent`]s for the broker; no retry here beyond each
//! loop's own fixed cadence.

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Duration;

use cmind_proto::{DeviceId, Location, Request, Response, SensorReading};

use crate::GatewayConnection;

/// Everything the loops and one-shot tasks report back to the broker task.
#[derive(Debug)]
pub(crate) enum GatewayEvent {
    /// Fresh wholesale device directory.
    Directory(Vec<SensorReading>),
    /// Directory poll failed; stale directory state must be cleared.
    DirectoryFailure(String),
    /// One reading delivered by the location stream.
    Streamed(SensorReading),
    /// The location stream connection ended in an error.
    StreamFailure(String),
    /// Result of an on-demand read.
    OnDemand(SensorReading),
    /// Transient feedback for a one-shot action against one device.
    ActionStatus { device_id: DeviceId, message: String },
}

/// Fixed-interval wholesale refresh of the device directory.
pub(crate) struct DirectoryLoop {
    handle: tokio::task::JoinHandle<()>,
}

impl DirectoryLoop {
    pub(crate) fn spawn(
        conn: GatewayConnection,
        events: UnboundedSender<GatewayEvent>,
        poll_interval: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = events.closed() => break,
                    _ = tick.tick() => {}
                }

                let event = match conn.call_once(&Request::ListDevices).await {
                    Ok(Some(Response::DeviceList { readings })) => {
                        GatewayEvent::Directory(readings)
                    }
                    // An empty frame means the gateway has no devices yet.
                    Ok(None) => GatewayEvent::Directory(Vec::new()),
                    Ok(Some(other)) => {
                        log::warn!("unexpected directory response {other:?}");
                        GatewayEvent::DirectoryFailure("unexpected gateway response".to_string())
                    }
                    Err(e) => {
                        log::warn!("device directory poll failed: {e:}");
                        GatewayEvent::DirectoryFailure(e.to_string())
                    }
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            log::warn!("Directory poll task exiting");
        });
        Self { handle }
    }
}

impl Drop for DirectoryLoop {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Long-lived location stream subscription with fixed-backoff reconnect.
/// Exactly one of these runs at a time; the broker drops the old loop
/// before spawning one for a newly selected location.
pub(crate) struct StreamLoop {
    location: Location,
    handle: tokio::task::JoinHandle<()>,
}

impl StreamLoop {
    pub(crate) fn spawn(
        conn: GatewayConnection,
        location: Location,
        readings: UnboundedSender<SensorReading>,
        events: UnboundedSender<GatewayEvent>,
        backoff: Duration,
    ) -> Self {
        let loc = location.clone();
        let handle = tokio::spawn(async move {
            loop {
                if readings.is_closed() {
                    break;
                }
                match conn.stream_location(&loc, &readings).await {
                    Ok(()) => {
                        log::info!("location stream for {loc:} ended, reconnecting");
                    }
                    Err(e) => {
                        log::warn!("location stream for {loc:} failed: {e:}");
                        if events
                            .send(GatewayEvent::StreamFailure(e.to_string()))
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                tokio::select! {
                    _ = readings.closed() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            log::warn!("Location stream task for {loc:} exiting");
        });
        Self { location, handle }
    }

    pub(crate) fn location(&self) -> &str {
        &self.location
    }
}

impl Drop for StreamLoop {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmind_proto::{
        encode_response, read_frame, write_end_of_stream, write_frame, DeviceKind,
    };
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::unbounded_channel;

    fn reading(id: &str, kind: DeviceKind, value: f64) -> SensorReading {
        SensorReading {
            sensor_id: id.to_string(),
            sensor_type: kind,
            value,
            unit: String::new(),
            location: "Cocó".to_string(),
            timestamp: 1000,
            metadata: HashMap::new(),
        }
    }

    /// Gateway that answers every connection with a canned device list.
    async fn directory_gateway(directory: Vec<SensorReading>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let directory = directory.clone();
                tokio::spawn(async move {
                    read_frame(&mut socket).await.ok();
                    let response = Response::DeviceList {
                        readings: directory,
                    };
                    write_frame(&mut socket, &encode_response(&response).unwrap())
                        .await
                        .ok();
                });
            }
        });
        addr
    }

    /// Gateway that ends every location stream immediately, counting the
    /// connections it has served.
    async fn end_of_stream_gateway(connects: Arc<AtomicUsize>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                connects.fetch_add(1, Ordering::SeqCst);
                read_frame(&mut socket).await.ok();
                write_end_of_stream(&mut socket).await.ok();
            }
        });
        addr
    }

    #[tokio::test]
    async fn directory_loop_emits_wholesale_lists() {
        let directory = vec![reading("sem-1", DeviceKind::Semaphore, 0.0)];
        let addr = directory_gateway(directory.clone()).await;

        let (events, mut events_rx) = unbounded_channel();
        let _loop = DirectoryLoop::spawn(
            GatewayConnection::new(addr),
            events,
            Duration::from_millis(20),
        );

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            GatewayEvent::Directory(readings) => assert_eq!(readings, directory),
            other => panic!("expected a directory event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn directory_loop_reports_failure_when_gateway_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (events, mut events_rx) = unbounded_channel();
        let _loop = DirectoryLoop::spawn(
            GatewayConnection::new(addr),
            events,
            Duration::from_millis(20),
        );

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, GatewayEvent::DirectoryFailure(_)));
    }

    #[tokio::test]
    async fn stream_loop_reconnects_after_end_of_stream() {
        let connects = Arc::new(AtomicUsize::new(0));
        let addr = end_of_stream_gateway(connects.clone()).await;

        let (readings, _readings_rx) = unbounded_channel();
        let (events, _events_rx) = unbounded_channel();
        let _loop = StreamLoop::spawn(
            GatewayConnection::new(addr),
            "Cocó".to_string(),
            readings,
            events,
            Duration::from_millis(20),
        );

        // Each reconnect costs one backoff interval; expect several within
        // the window.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(connects.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn dropping_the_stream_loop_stops_reconnecting() {
        let connects = Arc::new(AtomicUsize::new(0));
        let addr = end_of_stream_gateway(connects.clone()).await;

        let (readings, _readings_rx) = unbounded_channel();
        let (events, _events_rx) = unbounded_channel();
        let stream_loop = StreamLoop::spawn(
            GatewayConnection::new(addr),
            "Cocó".to_string(),
            readings,
            events,
            Duration::from_millis(20),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(stream_loop);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let settled = connects.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(connects.load(Ordering::SeqCst), settled);
    }
}

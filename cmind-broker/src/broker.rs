//! The broker task and its client-facing actor handle.
//!
//! The broker owns the [`DeviceStateStore`] and is its only writer. The
//! directory and stream loops, plus any spawned one-shot tasks, report
//! [`GatewayEvent`]s into one queue; the broker applies each to the store
//! and fans a fresh [`DisplayState`] snapshot out to every subscriber.
//! [`BrokerHandle`] is a minimal actor exposing subscription, selection,
//! one-shot actions, and a snapshot pull.

use actix::{prelude::*, Actor, Addr};
use futures::prelude::*;
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;

use cmind_proto::{DeviceId, Location, Request, Response, SensorReading};

use crate::{
    ClientId, DeviceStateStore, DirectoryLoop, DisplayState, GatewayConnection, GatewayEvent,
    StreamLoop,
};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("ActorError")]
    ActorError,
}

pub struct Broker {
    store: DeviceStateStore,
    conn: GatewayConnection,
    stream_backoff: Duration,
    events: UnboundedSender<GatewayEvent>,
    events_rx: UnboundedReceiver<GatewayEvent>,
    readings: UnboundedSender<SensorReading>,
    api_rx: UnboundedReceiver<ClientApi>,
    subscribers: HashMap<ClientId, UnboundedSender<DisplayState>>,
    _intake: tokio::task::JoinHandle<()>,
    _directory: DirectoryLoop,
    stream: Option<StreamLoop>,
}

/// The [`BrokerHandle`] provides clients a minimal handle exposing only the
/// client API of the [`Broker`]: view subscription, selection changes, and
/// the two one-shot actions.
pub struct BrokerHandle(UnboundedSender<ClientApi>);

pub enum ClientApi {
    Subscribe {
        id: ClientId,
        view_sink: UnboundedSender<DisplayState>,
    },
    Unsubscribe {
        id: ClientId,
    },
    SelectLocation {
        location: Location,
    },
    SelectDevice {
        device_id: Option<DeviceId>,
    },
    OnDemandRead {
        device_id: DeviceId,
    },
    SendCommand {
        device_id: DeviceId,
        command: String,
    },
    GetView {
        reply: oneshot::Sender<DisplayState>,
    },
}

/// Public API for instantiating a [`Broker`] against the gateway at
/// `gateway_addr`, streaming `location` from the start. Returns the
/// [`Addr`] of a started [`BrokerHandle`] actor.
pub async fn broker(
    gateway_addr: SocketAddr,
    location: Location,
    directory_poll: Duration,
    stream_backoff: Duration,
) -> Result<Addr<BrokerHandle>, BrokerError> {
    let (mut broker, handle) = Broker::new(gateway_addr, location, directory_poll, stream_backoff);

    tokio::spawn(async move {
        broker.event_loop().await;
        log::warn!("Broker exiting event loop");
    });

    Ok(handle.start())
}

impl Broker {
    fn new(
        gateway_addr: SocketAddr,
        location: Location,
        directory_poll: Duration,
        stream_backoff: Duration,
    ) -> (Self, BrokerHandle) {
        let conn = GatewayConnection::new(gateway_addr);
        let (events, events_rx) = unbounded_channel();
        let (readings, readings_rx) = unbounded_channel();
        let (api, api_rx) = unbounded_channel();

        // Streamed readings take a dedicated channel out of the stream loop
        // so that replacing the loop never reorders events already queued;
        // this task folds them into the one event queue the broker drains.
        let events_tx = events.clone();
        let mut reading_stream = UnboundedReceiverStream::new(readings_rx);
        let _intake = tokio::spawn(async move {
            loop {
                let next_reading = reading_stream.next().fuse();
                tokio::select! {
                    _ = events_tx.closed() => break,
                    Some(reading) = next_reading => {
                        events_tx.send(GatewayEvent::Streamed(reading)).ok();
                    }
                }
            }
        });

        let store = DeviceStateStore::new(location.clone());
        let _directory = DirectoryLoop::spawn(conn, events.clone(), directory_poll);
        let stream = Some(StreamLoop::spawn(
            conn,
            location,
            readings.clone(),
            events.clone(),
            stream_backoff,
        ));

        (
            Self {
                store,
                conn,
                stream_backoff,
                events,
                events_rx,
                readings,
                api_rx,
                subscribers: HashMap::new(),
                _intake,
                _directory,
                stream,
            },
            BrokerHandle(api),
        )
    }

    async fn event_loop(&mut self) {
        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    self.on_gateway_event(event);
                    self.publish();
                }
                Some(api) = self.api_rx.recv() => {
                    if self.on_client_api(api) {
                        self.publish();
                    }
                }
                else => break,
            }
        }
    }

    fn on_gateway_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::Directory(readings) => self.store.apply_directory(readings),
            GatewayEvent::DirectoryFailure(message) => self.store.directory_failure(&message),
            GatewayEvent::Streamed(reading) => self.store.apply_streamed(reading),
            GatewayEvent::StreamFailure(message) => self.store.stream_failure(&message),
            GatewayEvent::OnDemand(reading) => self.store.apply_on_demand(reading),
            GatewayEvent::ActionStatus { device_id, message } => {
                self.store.action_status(&device_id, &message)
            }
        }
    }

    /// Returns true when the store changed and subscribers need a fresh
    /// snapshot.
    fn on_client_api(&mut self, api: ClientApi) -> bool {
        match api {
            ClientApi::Subscribe { id, view_sink } => {
                // New subscribers get the current state up front.
                view_sink.send(self.store.view()).ok();
                self.subscribers.insert(id, view_sink);
                log::debug!("Subscribed client ID {id:}");
                false
            }
            ClientApi::Unsubscribe { id } => {
                if self.subscribers.remove(&id).is_none() {
                    log::warn!("Removing non-existent subscriber ID");
                } else {
                    log::debug!("Unsubscribed client ID {id:}");
                }
                false
            }
            ClientApi::SelectLocation { location } => {
                let unchanged = self
                    .stream
                    .as_ref()
                    .map(|s| s.location() == location)
                    .unwrap_or(false);
                if unchanged {
                    return false;
                }
                // Drop first: the old loop's in-flight connection must be
                // gone before a loop for the new location exists.
                self.stream = None;
                self.store.select_location(location.clone());
                self.stream = Some(StreamLoop::spawn(
                    self.conn,
                    location,
                    self.readings.clone(),
                    self.events.clone(),
                    self.stream_backoff,
                ));
                true
            }
            ClientApi::SelectDevice { device_id } => {
                self.store.select_device(device_id);
                true
            }
            ClientApi::OnDemandRead { device_id } => {
                self.store.action_status(&device_id, "requesting reading...");
                self.spawn_on_demand(device_id);
                true
            }
            ClientApi::SendCommand { device_id, command } => {
                self.store
                    .action_status(&device_id, &format!("sending '{command}'..."));
                self.spawn_command(device_id, command);
                true
            }
            ClientApi::GetView { reply } => {
                reply.send(self.store.view()).ok();
                false
            }
        }
    }

    fn publish(&mut self) {
        let view = self.store.view();
        self.subscribers.iter().for_each(|(key, sink)| {
            sink.send(view.clone())
                .map_err(|e| {
                    log::error!(
                        "Failure to send view to client \
                        receiver {e:} for client ID {key:}"
                    );
                })
                .ok();
        });
    }

    fn spawn_on_demand(&self, device_id: DeviceId) {
        let conn = self.conn;
        let events = self.events.clone();
        tokio::spawn(async move {
            let request = Request::OnDemandRead {
                device_id: device_id.clone(),
            };
            let event = match conn.call_once(&request).await {
                Ok(Some(Response::Reading { reading })) => GatewayEvent::OnDemand(reading),
                Ok(None) => GatewayEvent::ActionStatus {
                    device_id,
                    message: "device returned no data".to_string(),
                },
                Ok(Some(other)) => {
                    log::warn!("unexpected on-demand response {other:?}");
                    GatewayEvent::ActionStatus {
                        device_id,
                        message: "unexpected gateway response".to_string(),
                    }
                }
                Err(e) => GatewayEvent::ActionStatus {
                    device_id,
                    message: format!("read failed: {e:}"),
                },
            };
            events.send(event).ok();
        });
    }

    fn spawn_command(&self, device_id: DeviceId, command: String) {
        let conn = self.conn;
        let events = self.events.clone();
        tokio::spawn(async move {
            let request = Request::Command {
                target_id: device_id.clone(),
                command: command.clone(),
            };
            let event = match conn.call_once(&request).await {
                Ok(Some(Response::CommandAck { message })) => {
                    GatewayEvent::ActionStatus { device_id, message }
                }
                Ok(None) => GatewayEvent::ActionStatus {
                    device_id,
                    message: format!("command '{command}' not acknowledged"),
                },
                Ok(Some(other)) => {
                    log::warn!("unexpected command response {other:?}");
                    GatewayEvent::ActionStatus {
                        device_id,
                        message: "unexpected gateway response".to_string(),
                    }
                }
                Err(e) => GatewayEvent::ActionStatus {
                    device_id,
                    message: format!("command '{command}' failed: {e:}"),
                },
            };
            events.send(event).ok();
        });
    }
}

impl Actor for BrokerHandle {
    type Context = Context<Self>;
}

#[derive(Message)]
#[rtype(result = "ClientSubscribeResponse")]
pub struct ClientSubscribe {
    pub id: ClientId,
    pub view_sink: UnboundedSender<DisplayState>,
}
type ClientSubscribeResponse = Result<(), BrokerError>;

impl Handler<ClientSubscribe> for BrokerHandle {
    type Result = ClientSubscribeResponse;

    fn handle(&mut self, msg: ClientSubscribe, _ctx: &mut Self::Context) -> Self::Result {
        self.0
            .send(ClientApi::Subscribe {
                id: msg.id,
                view_sink: msg.view_sink,
            })
            .map_err(|e| {
                log::error!("Error sending sub to broker {e:}");
                BrokerError::ActorError
            })?;
        Ok(())
    }
}

#[derive(Message)]
#[rtype(result = "ClientUnsubscribeResponse")]
pub struct ClientUnsubscribe {
    pub id: ClientId,
}
type ClientUnsubscribeResponse = Result<(), BrokerError>;

impl Handler<ClientUnsubscribe> for BrokerHandle {
    type Result = ClientUnsubscribeResponse;

    fn handle(&mut self, msg: ClientUnsubscribe, _ctx: &mut Self::Context) -> Self::Result {
        self.0
            .send(ClientApi::Unsubscribe { id: msg.id })
            .map_err(|e| {
                log::error!("Error sending unsub to broker {e:}");
                BrokerError::ActorError
            })?;
        Ok(())
    }
}

/// Switch the live stream subscription to another location. The previous
/// location's loop and its in-flight connection are torn down first.
#[derive(Message)]
#[rtype(result = "SelectLocationResponse")]
pub struct SelectLocation {
    pub location: Location,
}
type SelectLocationResponse = Result<(), BrokerError>;

impl Handler<SelectLocation> for BrokerHandle {
    type Result = SelectLocationResponse;

    fn handle(&mut self, msg: SelectLocation, _ctx: &mut Self::Context) -> Self::Result {
        self.0
            .send(ClientApi::SelectLocation {
                location: msg.location,
            })
            .map_err(|e| {
                log::error!("Error sending location select to broker {e:}");
                BrokerError::ActorError
            })?;
        Ok(())
    }
}

#[derive(Message)]
#[rtype(result = "SelectDeviceResponse")]
pub struct SelectDevice {
    pub device_id: Option<DeviceId>,
}
type SelectDeviceResponse = Result<(), BrokerError>;

impl Handler<SelectDevice> for BrokerHandle {
    type Result = SelectDeviceResponse;

    fn handle(&mut self, msg: SelectDevice, _ctx: &mut Self::Context) -> Self::Result {
        self.0
            .send(ClientApi::SelectDevice {
                device_id: msg.device_id,
            })
            .map_err(|e| {
                log::error!("Error sending device select to broker {e:}");
                BrokerError::ActorError
            })?;
        Ok(())
    }
}

/// Ask the selected device for a fresh reading; fire-and-forget from the
/// caller's perspective, the result lands in the next view snapshots.
#[derive(Message)]
#[rtype(result = "RequestOnDemandReadResponse")]
pub struct RequestOnDemandRead {
    pub device_id: DeviceId,
}
type RequestOnDemandReadResponse = Result<(), BrokerError>;

impl Handler<RequestOnDemandRead> for BrokerHandle {
    type Result = RequestOnDemandReadResponse;

    fn handle(&mut self, msg: RequestOnDemandRead, _ctx: &mut Self::Context) -> Self::Result {
        self.0
            .send(ClientApi::OnDemandRead {
                device_id: msg.device_id,
            })
            .map_err(|e| {
                log::error!("Error sending on-demand read to broker {e:}");
                BrokerError::ActorError
            })?;
        Ok(())
    }
}

/// Dispatch an actuator command; concurrent commands are not serialized,
/// the gateway applies them last-write-wins.
#[derive(Message)]
#[rtype(result = "SendCommandResponse")]
pub struct SendCommand {
    pub device_id: DeviceId,
    pub command: String,
}
type SendCommandResponse = Result<(), BrokerError>;

impl Handler<SendCommand> for BrokerHandle {
    type Result = SendCommandResponse;

    fn handle(&mut self, msg: SendCommand, _ctx: &mut Self::Context) -> Self::Result {
        self.0
            .send(ClientApi::SendCommand {
                device_id: msg.device_id,
                command: msg.command,
            })
            .map_err(|e| {
                log::error!("Error sending command dispatch to broker {e:}");
                BrokerError::ActorError
            })?;
        Ok(())
    }
}

/// Pull one consistent snapshot without subscribing.
#[derive(Message)]
#[rtype(result = "GetViewResponse")]
pub struct GetView;
type GetViewResponse = Result<DisplayState, BrokerError>;

impl Handler<GetView> for BrokerHandle {
    type Result = ResponseFuture<GetViewResponse>;

    fn handle(&mut self, _msg: GetView, _ctx: &mut Self::Context) -> Self::Result {
        let (reply, rx) = oneshot::channel();
        let sent = self.0.send(ClientApi::GetView { reply });
        Box::pin(async move {
            sent.map_err(|_| BrokerError::ActorError)?;
            rx.await.map_err(|_| BrokerError::ActorError)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmind_proto::{
        commands, decode_request, encode_response, read_frame, write_end_of_stream, write_frame,
        DeviceKind, Frame,
    };
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn reading(id: &str, kind: DeviceKind, value: f64, location: &str) -> SensorReading {
        SensorReading {
            sensor_id: id.to_string(),
            sensor_type: kind,
            value,
            unit: "C".to_string(),
            location: location.to_string(),
            timestamp: 1000,
            metadata: HashMap::new(),
        }
    }

    struct Script {
        directory: Vec<SensorReading>,
        stream: Vec<SensorReading>,
        on_demand: HashMap<String, SensorReading>,
    }

    /// Gateway answering every request kind from a canned script. Stream
    /// subscriptions send their readings once and then stay open.
    async fn scripted_gateway(script: Script) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let script = Arc::new(script);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let script = script.clone();
                tokio::spawn(async move {
                    let Ok(Frame::Payload(bytes)) = read_frame(&mut socket).await else {
                        return;
                    };
                    let Ok(request) = decode_request(&bytes) else {
                        return;
                    };
                    match request {
                        Request::ListDevices => {
                            let response = Response::DeviceList {
                                readings: script.directory.clone(),
                            };
                            write_frame(&mut socket, &encode_response(&response).unwrap())
                                .await
                                .ok();
                        }
                        Request::StreamLocation { location } => {
                            for r in script.stream.iter().filter(|r| r.location == location) {
                                let response = Response::Reading { reading: r.clone() };
                                write_frame(&mut socket, &encode_response(&response).unwrap())
                                    .await
                                    .ok();
                            }
                            // Keep the subscription open.
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                        }
                        Request::OnDemandRead { device_id } => {
                            match script.on_demand.get(&device_id) {
                                Some(r) => {
                                    let response = Response::Reading { reading: r.clone() };
                                    write_frame(
                                        &mut socket,
                                        &encode_response(&response).unwrap(),
                                    )
                                    .await
                                    .ok();
                                }
                                None => {
                                    write_end_of_stream(&mut socket).await.ok();
                                }
                            }
                        }
                        Request::Command { target_id, command } => {
                            let response = Response::CommandAck {
                                message: format!("command '{command}' accepted for {target_id}"),
                            };
                            write_frame(&mut socket, &encode_response(&response).unwrap())
                                .await
                                .ok();
                        }
                    }
                });
            }
        });
        addr
    }

    async fn view_where<F>(
        views: &mut UnboundedReceiver<DisplayState>,
        mut predicate: F,
    ) -> DisplayState
    where
        F: FnMut(&DisplayState) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            loop {
                let view = views.recv().await.expect("view channel closed");
                if predicate(&view) {
                    return view;
                }
            }
        })
        .await
        .expect("timed out waiting for a matching view")
    }

    fn coco_script() -> Script {
        let mut on_demand = HashMap::new();
        let mut fresh = reading("sem-1", DeviceKind::Semaphore, 1.0, "Cocó");
        fresh.timestamp = 2000;
        on_demand.insert("sem-1".to_string(), fresh);

        Script {
            directory: vec![reading("sem-1", DeviceKind::Semaphore, 0.0, "Cocó")],
            stream: vec![reading("temp-coco-1", DeviceKind::Temperature, 28.5, "Cocó")],
            on_demand,
        }
    }

    #[tokio::test]
    async fn merges_directory_stream_and_on_demand_sources() {
        let addr = scripted_gateway(coco_script()).await;
        let (mut broker, handle) = Broker::new(
            addr,
            "Cocó".to_string(),
            Duration::from_millis(25),
            Duration::from_millis(25),
        );
        tokio::spawn(async move { broker.event_loop().await });

        let (view_tx, mut view_rx) = unbounded_channel();
        handle
            .0
            .send(ClientApi::Subscribe {
                id: 0,
                view_sink: view_tx,
            })
            .unwrap();

        // Both background loops land their data.
        let view = view_where(&mut view_rx, |v| {
            v.temperature.is_some() && !v.devices.is_empty()
        })
        .await;
        let slot = view.temperature.unwrap();
        assert_eq!(slot.value, 28.5);
        assert_eq!(slot.unit, "C");
        assert_eq!(slot.timestamp, 1000);

        // Directory value shows for the selected device.
        handle
            .0
            .send(ClientApi::SelectDevice {
                device_id: Some("sem-1".to_string()),
            })
            .unwrap();
        let view = view_where(&mut view_rx, |v| v.selected.is_some()).await;
        let detail = view.selected.unwrap();
        assert!(!detail.on_demand);
        assert_eq!(detail.reading.value, 0.0);

        // An on-demand read overrides sem-1 only; temperature is untouched.
        handle
            .0
            .send(ClientApi::OnDemandRead {
                device_id: "sem-1".to_string(),
            })
            .unwrap();
        let view = view_where(&mut view_rx, |v| {
            v.selected.as_ref().map(|d| d.on_demand).unwrap_or(false)
        })
        .await;
        assert_eq!(view.selected.unwrap().reading.value, 1.0);
        assert_eq!(view.temperature.unwrap().value, 28.5);

        // Reselecting drops the override and falls back to directory data.
        handle
            .0
            .send(ClientApi::SelectDevice { device_id: None })
            .unwrap();
        handle
            .0
            .send(ClientApi::SelectDevice {
                device_id: Some("sem-1".to_string()),
            })
            .unwrap();
        let view = view_where(&mut view_rx, |v| {
            v.selected.as_ref().map(|d| !d.on_demand).unwrap_or(false)
        })
        .await;
        assert_eq!(view.selected.unwrap().reading.value, 0.0);
    }

    #[tokio::test]
    async fn command_ack_reaches_the_status_line() {
        let addr = scripted_gateway(coco_script()).await;
        let (mut broker, handle) = Broker::new(
            addr,
            "Cocó".to_string(),
            Duration::from_millis(25),
            Duration::from_millis(25),
        );
        tokio::spawn(async move { broker.event_loop().await });

        let (view_tx, mut view_rx) = unbounded_channel();
        handle
            .0
            .send(ClientApi::Subscribe {
                id: 0,
                view_sink: view_tx,
            })
            .unwrap();

        handle
            .0
            .send(ClientApi::SendCommand {
                device_id: "sem-1".to_string(),
                command: commands::SEMAPHORE_CLOSE.to_string(),
            })
            .unwrap();

        let view = view_where(&mut view_rx, |v| v.status.contains("accepted")).await;
        assert!(view.status.contains("vermelho"));
        assert!(view.status.contains("sem-1"));
    }

    #[actix::test]
    async fn handle_actor_round_trip() {
        let addr = scripted_gateway(coco_script()).await;
        let handle = broker(
            addr,
            "Cocó".to_string(),
            Duration::from_millis(25),
            Duration::from_millis(25),
        )
        .await
        .unwrap();

        let (view_tx, mut view_rx) = unbounded_channel();
        handle
            .send(ClientSubscribe {
                id: 0,
                view_sink: view_tx,
            })
            .await
            .unwrap()
            .unwrap();

        // Subscribing yields the current state immediately.
        let first = timeout(Duration::from_secs(2), view_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.location, "Cocó");

        let view = handle.send(GetView).await.unwrap().unwrap();
        assert_eq!(view.location, "Cocó");

        handle
            .send(SelectLocation {
                location: "Aldeota".to_string(),
            })
            .await
            .unwrap()
            .unwrap();
        let view = view_where(&mut view_rx, |v| v.location == "Aldeota").await;
        assert!(view.temperature.is_none());

        handle
            .send(ClientUnsubscribe { id: 0 })
            .await
            .unwrap()
            .unwrap();
    }
}

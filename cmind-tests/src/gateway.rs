//! Scripted mock of the field gateway process.
//!
//! Speaks the real wire protocol over real sockets: one request frame per
//! connection, one response for the one-shot kinds, a periodic run of
//! readings for a location subscription. Sensor values drift a little on
//! every poll so that view updates are visible downstream.

use chrono::Local;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::Duration;

use cmind_proto::{
    commands, decode_request, encode_response, read_frame, write_end_of_stream, write_frame,
    DeviceKind, Frame, Request, Response, SensorReading,
};

const STREAM_INTERVAL_SECS: u64 = 1;

pub struct MockGateway {
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

fn device(id: &str, kind: DeviceKind, value: f64, unit: &str, location: &str) -> SensorReading {
    SensorReading {
        sensor_id: id.to_string(),
        sensor_type: kind,
        value,
        unit: unit.to_string(),
        location: location.to_string(),
        timestamp: Local::now().timestamp(),
        metadata: HashMap::new(),
    }
}

struct Simulation {
    devices: Vec<SensorReading>,
}

impl Simulation {
    fn new() -> Self {
        Self {
            devices: vec![
                device("temp-coco-1", DeviceKind::Temperature, 28.5, "C", "Cocó"),
                device("hum-coco-1", DeviceKind::Humidity, 62.0, "%", "Cocó"),
                device("sem-coco-1", DeviceKind::Semaphore, 0.0, "", "Cocó"),
                device("temp-aldeota-1", DeviceKind::Temperature, 29.1, "C", "Aldeota"),
                device("hum-aldeota-1", DeviceKind::Humidity, 58.0, "%", "Aldeota"),
                device("lamp-aldeota-1", DeviceKind::LampPost, 0.0, "", "Aldeota"),
                device("temp-iracema-1", DeviceKind::Temperature, 27.8, "C", "Iracema"),
                device("hum-iracema-1", DeviceKind::Humidity, 70.0, "%", "Iracema"),
                device("alarm-iracema-1", DeviceKind::Alarm, 1.0, "", "Iracema"),
            ],
        }
    }

    fn drift(&mut self) {
        let mut rng = rand::thread_rng();
        let now = Local::now().timestamp();
        for d in &mut self.devices {
            match d.sensor_type {
                DeviceKind::Temperature => d.value += rng.gen_range(-0.3..0.3),
                DeviceKind::Humidity => {
                    d.value = (d.value + rng.gen_range(-1.0..1.0)).clamp(0.0, 100.0)
                }
                _ => continue,
            }
            d.timestamp = now;
        }
    }

    fn directory(&self) -> Vec<SensorReading> {
        self.devices.clone()
    }

    fn location_readings(&self, location: &str) -> Vec<SensorReading> {
        self.devices
            .iter()
            .filter(|d| d.location == location)
            .cloned()
            .collect()
    }

    fn on_demand(&mut self, device_id: &str) -> Option<SensorReading> {
        let now = Local::now().timestamp();
        self.devices
            .iter_mut()
            .find(|d| d.sensor_id == device_id)
            .map(|d| {
                d.timestamp = now;
                d.clone()
            })
    }

    fn apply_command(&mut self, target_id: &str, command: &str) -> String {
        let Some(d) = self.devices.iter_mut().find(|d| d.sensor_id == target_id) else {
            return format!("unknown device {target_id}");
        };
        let value = match command {
            commands::SEMAPHORE_CLOSE | commands::LAMP_ON => Some(1.0),
            commands::SEMAPHORE_OPEN | commands::LAMP_OFF => Some(0.0),
            _ => None,
        };
        match value {
            Some(value) => {
                d.value = value;
                d.timestamp = Local::now().timestamp();
                format!("command '{command}' applied to {target_id}")
            }
            None => format!("command '{command}' not understood by {target_id}"),
        }
    }
}

impl MockGateway {
    pub async fn start(bind: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let sim = Arc::new(Mutex::new(Simulation::new()));

        let handle = tokio::spawn(async move {
            loop {
                let Ok((socket, peer)) = listener.accept().await else {
                    break;
                };
                log::debug!("gateway connection from {peer:}");
                let sim = sim.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(socket, sim).await {
                        log::debug!("gateway connection ended: {e:}");
                    }
                });
            }
        });

        Ok(Self { addr, handle })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    mut socket: TcpStream,
    sim: Arc<Mutex<Simulation>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Frame::Payload(bytes) = read_frame(&mut socket).await? else {
        return Ok(());
    };

    match decode_request(&bytes)? {
        Request::ListDevices => {
            let readings = {
                let mut sim = sim.lock().await;
                sim.drift();
                sim.directory()
            };
            let response = Response::DeviceList { readings };
            write_frame(&mut socket, &encode_response(&response)?).await?;
        }
        Request::OnDemandRead { device_id } => {
            let reading = sim.lock().await.on_demand(&device_id);
            match reading {
                Some(reading) => {
                    let response = Response::Reading { reading };
                    write_frame(&mut socket, &encode_response(&response)?).await?;
                }
                None => write_end_of_stream(&mut socket).await?,
            }
        }
        Request::Command { target_id, command } => {
            let message = sim.lock().await.apply_command(&target_id, &command);
            let response = Response::CommandAck { message };
            write_frame(&mut socket, &encode_response(&response)?).await?;
        }
        Request::StreamLocation { location } => loop {
            let readings = {
                let mut sim = sim.lock().await;
                sim.drift();
                sim.location_readings(&location)
            };
            for reading in readings {
                let response = Response::Reading { reading };
                write_frame(&mut socket, &encode_response(&response)?).await?;
            }
            tokio::time::sleep(Duration::from_secs(STREAM_INTERVAL_SECS)).await;
        },
    }

    Ok(())
}

//! One socket, one request, framed responses until a terminator.
//!
//! Every exchange with the gateway goes through [`GatewayConnection`]:
//! connect, write a single encoded request frame, then read either exactly
//! one response (one-shot kinds) or responses until end-of-stream (location
//! subscription). The socket is owned by the call and dropped on every exit
//! path. Nothing here retries; connect, framing, decode, and timeout
//! failures all surface as a single [`TransportFailure`] for the polling
//! layer to handle.

use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{timeout, Duration};

use cmind_proto::{
    decode_response, encode_request, read_frame, write_frame, Frame, FrameError, Request, Response,
    SensorReading, WireError,
};

use crate::CALL_TIMEOUT_SECS;

#[derive(Error, Debug)]
pub enum TransportFailure {
    #[error("gateway connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("decode error: {0}")]
    Decode(#[from] WireError),
    #[error("gateway call timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct GatewayConnection {
    addr: SocketAddr,
}

impl GatewayConnection {
    pub(crate) fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Synchronous request/reply exchange over a fresh connection. Returns
    /// `None` when the gateway answers with an empty frame, its way of
    /// saying it has nothing for us.
    pub(crate) async fn call_once(
        &self,
        request: &Request,
    ) -> Result<Option<Response>, TransportFailure> {
        let addr = self.addr;
        let exchange = async move {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(TransportFailure::Connect)?;
            write_frame(&mut stream, &encode_request(request)?).await?;

            match read_frame(&mut stream).await? {
                Frame::EndOfStream => Ok(None),
                Frame::Payload(bytes) => Ok(Some(decode_response(&bytes)?)),
            }
        };
        timeout(Duration::from_secs(CALL_TIMEOUT_SECS), exchange).await?
    }

    /// Subscribe to one location and push every streamed reading into
    /// `sink` in gateway order. Returns `Ok` on a clean end-of-stream (or
    /// when the receiving side has gone away) and `Err` on transport or
    /// decode failure; either way the connection is closed before
    /// returning.
    pub(crate) async fn stream_location(
        &self,
        location: &str,
        sink: &UnboundedSender<SensorReading>,
    ) -> Result<(), TransportFailure> {
        let mut stream = timeout(
            Duration::from_secs(CALL_TIMEOUT_SECS),
            TcpStream::connect(self.addr),
        )
        .await?
        .map_err(TransportFailure::Connect)?;

        let request = Request::StreamLocation {
            location: location.to_string(),
        };
        write_frame(&mut stream, &encode_request(&request)?).await?;

        loop {
            match read_frame(&mut stream).await? {
                Frame::EndOfStream => return Ok(()),
                Frame::Payload(bytes) => match decode_response(&bytes)? {
                    Response::Reading { reading } => {
                        if sink.send(reading).is_err() {
                            return Ok(());
                        }
                    }
                    other => {
                        log::warn!("ignoring unexpected response on location stream: {other:?}");
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmind_proto::{decode_request, encode_response, write_end_of_stream, DeviceKind};
    use std::collections::HashMap;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::unbounded_channel;

    fn reading(id: &str, value: f64) -> SensorReading {
        SensorReading {
            sensor_id: id.to_string(),
            sensor_type: DeviceKind::Temperature,
            value,
            unit: "C".to_string(),
            location: "Cocó".to_string(),
            timestamp: 1000,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn call_once_exchanges_one_request_for_one_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let Frame::Payload(bytes) = read_frame(&mut socket).await.unwrap() else {
                panic!("expected a request frame");
            };
            assert_eq!(decode_request(&bytes).unwrap(), Request::ListDevices);

            let response = Response::DeviceList {
                readings: vec![reading("temp-1", 25.0)],
            };
            write_frame(&mut socket, &encode_response(&response).unwrap())
                .await
                .unwrap();
        });

        let conn = GatewayConnection::new(addr);
        let response = conn.call_once(&Request::ListDevices).await.unwrap();
        assert_eq!(
            response,
            Some(Response::DeviceList {
                readings: vec![reading("temp-1", 25.0)],
            })
        );
    }

    #[tokio::test]
    async fn call_once_maps_empty_frame_to_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_frame(&mut socket).await.unwrap();
            write_end_of_stream(&mut socket).await.unwrap();
        });

        let conn = GatewayConnection::new(addr);
        let response = conn
            .call_once(&Request::OnDemandRead {
                device_id: "sem-1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(response, None);
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_failure() {
        // Bind then drop to get a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = GatewayConnection::new(addr);
        let err = conn.call_once(&Request::ListDevices).await.unwrap_err();
        assert!(matches!(err, TransportFailure::Connect(_)));
    }

    #[tokio::test]
    async fn stream_location_delivers_in_order_until_end_of_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let Frame::Payload(bytes) = read_frame(&mut socket).await.unwrap() else {
                panic!("expected a request frame");
            };
            assert_eq!(
                decode_request(&bytes).unwrap(),
                Request::StreamLocation {
                    location: "Cocó".to_string(),
                }
            );

            for value in [1.0, 2.0, 3.0] {
                let response = Response::Reading {
                    reading: reading("temp-1", value),
                };
                write_frame(&mut socket, &encode_response(&response).unwrap())
                    .await
                    .unwrap();
            }
            write_end_of_stream(&mut socket).await.unwrap();
        });

        let conn = GatewayConnection::new(addr);
        let (sink, mut delivered) = unbounded_channel();
        conn.stream_location("Cocó", &sink).await.unwrap();

        let mut values = Vec::new();
        while let Ok(r) = delivered.try_recv() {
            values.push(r.value);
        }
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn stream_location_reports_malformed_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_frame(&mut socket).await.unwrap();
            write_frame(&mut socket, b"not json at all").await.unwrap();
        });

        let conn = GatewayConnection::new(addr);
        let (sink, _delivered) = unbounded_channel();
        let err = conn.stream_location("Cocó", &sink).await.unwrap_err();
        assert!(matches!(err, TransportFailure::Decode(_)));
    }
}

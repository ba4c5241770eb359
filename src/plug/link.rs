use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::codec::{self, HEADER_LEN};
use super::{Endpoint, PlugError, Result};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);

/// The single TCP connection to one plug.
///
/// The connection sits behind an async mutex so exactly one request/response
/// exchange is on the wire at a time. Nothing here retries: an exchange that
/// fails, or is dropped before it completes, closes the connection and the
/// caller decides when to [`connect`] again.
///
/// [`connect`]: DeviceLink::connect
pub struct DeviceLink {
    endpoint: Endpoint,
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    stream: Option<TcpStream>,
    completed: u64,
}

/// One complete reply body (still ciphered, without its size prefix).
#[derive(Debug)]
pub struct Response {
    /// Position of this reply among all replies read on the link, starting at 1.
    pub seq: u64,
    pub body: Vec<u8>,
}

impl DeviceLink {
    /// A link starts disconnected; call [`DeviceLink::connect`] before the first exchange.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            slot: Mutex::new(Slot::default()),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[cfg(test)]
    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.stream.is_some()
    }

    /// Drop any current connection and dial a fresh one. On failure the
    /// link is left disconnected.
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if let Some(mut old) = slot.stream.take() {
            if let Err(e) = old.shutdown().await {
                debug!("Failed to close connection to {}: {}", self.endpoint, e);
            }
        }

        let stream = dial(&self.endpoint).await?;
        slot.stream = Some(stream);
        Ok(())
    }

    /// Write one encoded frame and read back one response.
    pub async fn exchange(&self, frame: &[u8]) -> Result<Response> {
        let mut slot = self.slot.lock().await;
        // The stream stays out of the slot until the reply is fully read, so
        // a half-read stream is never handed to the next exchange.
        let mut stream = slot.stream.take().ok_or_else(|| PlugError::NotConnected {
            endpoint: self.endpoint.clone(),
        })?;

        let body = self.round_trip(&mut stream, frame).await?;
        slot.stream = Some(stream);
        slot.completed += 1;
        Ok(Response {
            seq: slot.completed,
            body,
        })
    }

    async fn round_trip(&self, stream: &mut TcpStream, frame: &[u8]) -> Result<Vec<u8>> {
        stream
            .write_all(frame)
            .await
            .map_err(|source| self.transport("write request", source))?;

        let mut header = [0u8; HEADER_LEN];
        stream
            .read_exact(&mut header)
            .await
            .map_err(|source| self.transport("read response length", source))?;

        let len = codec::body_len(header);
        if len == 0 {
            return Err(PlugError::EmptyResponse {
                endpoint: self.endpoint.clone(),
            });
        }

        let mut body = vec![0u8; len];
        stream
            .read_exact(&mut body)
            .await
            .map_err(|source| self.transport("read response body", source))?;
        Ok(body)
    }

    fn transport(&self, stage: &'static str, source: std::io::Error) -> PlugError {
        PlugError::Transport {
            endpoint: self.endpoint.clone(),
            stage,
            source,
        }
    }
}

async fn dial(endpoint: &Endpoint) -> Result<TcpStream> {
    let stream = tokio::time::timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((endpoint.host(), endpoint.port())),
    )
    .await
    .map_err(|_| PlugError::ConnectTimeout {
        endpoint: endpoint.clone(),
        timeout_secs: CONNECT_TIMEOUT.as_secs(),
    })?
    .map_err(|source| PlugError::Connect {
        endpoint: endpoint.clone(),
        source,
    })?;

    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_PERIOD)
        .with_interval(KEEPALIVE_PERIOD);
    SockRef::from(&stream)
        .set_tcp_keepalive(&keepalive)
        .map_err(|source| PlugError::Keepalive {
            endpoint: endpoint.clone(),
            source,
        })?;

    debug!("Connected to {}", endpoint);
    Ok(stream)
}

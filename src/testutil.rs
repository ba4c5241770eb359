//! In-process stand-in for a plug, speaking the framed protocol over a real
//! loopback socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::plug::Endpoint;
use crate::plug::codec::{self, HEADER_LEN};

pub(crate) enum Reply {
    Json(Value),
    /// Same as `Json`, but written in two halves with a pause in between.
    SlowJson(Value),
    /// Arbitrary plaintext, ciphered and framed as-is.
    Plain(Vec<u8>),
    /// A frame declaring a zero-length body.
    Empty,
    /// A header promising more body than is sent, then hang up.
    Truncated,
    /// Close the connection without answering.
    Hangup,
}

type Handler = dyn Fn(usize, &Value) -> Reply + Send + Sync;

struct Shared {
    handler: Box<Handler>,
    requests: Mutex<Vec<Value>>,
    connections: AtomicUsize,
}

pub(crate) struct FakePlug {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl FakePlug {
    /// `handler` receives the 1-based request number (across all
    /// connections) and the decoded request.
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(usize, &Value) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
        });

        let accept_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_shared.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, Arc::clone(&accept_shared)));
            }
        });

        Self { addr, shared, task }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.addr.ip().to_string(), self.addr.port())
    }

    pub fn requests(&self) -> Vec<Value> {
        self.shared.requests.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }
}

impl Drop for FakePlug {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, shared: Arc<Shared>) {
    loop {
        let mut header = [0u8; HEADER_LEN];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let mut body = vec![0u8; codec::body_len(header)];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }
        let request: Value = serde_json::from_slice(&codec::decode(&body)).unwrap();

        let n = {
            let mut requests = shared.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };

        let written = match (shared.handler)(n, &request) {
            Reply::Json(value) => {
                stream
                    .write_all(&codec::encode(value.to_string().as_bytes()))
                    .await
            }
            Reply::SlowJson(value) => {
                let frame = codec::encode(value.to_string().as_bytes());
                let (head, tail) = frame.split_at(frame.len() / 2);
                let first = stream.write_all(head).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                first.and(stream.write_all(tail).await)
            }
            Reply::Plain(bytes) => stream.write_all(&codec::encode(&bytes)).await,
            Reply::Empty => stream.write_all(&[0u8; HEADER_LEN]).await,
            Reply::Truncated => {
                let _ = stream.write_all(&[0, 0, 0, 64, 1, 2, 3]).await;
                return;
            }
            Reply::Hangup => return,
        };
        if written.is_err() {
            return;
        }
    }
}

/// An endpoint nothing is listening on.
pub(crate) async fn refused_endpoint() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Endpoint::new(addr.ip().to_string(), addr.port())
}

/// A power strip with one outlet per entry of `states`, ids `{device_id}_{n}`.
pub(crate) fn strip_sysinfo(device_id: &str, alias: &str, states: &[u8]) -> Value {
    let children: Vec<Value> = states
        .iter()
        .enumerate()
        .map(|(n, state)| {
            json!({
                "id": format!("{device_id}_{n}"),
                "state": state,
                "alias": format!("Outlet {n}"),
                "on_time": 0,
                "next_action": {"type": -1}
            })
        })
        .collect();
    json!({
        "system": {"get_sysinfo": {
            "sw_ver": "1.0.2 Build 200915 Rel.085940",
            "hw_ver": "1.0",
            "model": "HS300(US)",
            "deviceId": device_id,
            "alias": alias,
            "child_num": states.len(),
            "children": children,
            "err_code": 0
        }}
    })
}

pub(crate) fn realtime(power_mw: u64) -> Value {
    json!({"emeter": {"get_realtime": {
        "voltage_mv": 120_500, "current_ma": 80, "power_mw": power_mw, "total_wh": 3, "err_code": 0
    }}})
}

pub(crate) fn is_sysinfo(request: &Value) -> bool {
    request.pointer("/system/get_sysinfo").is_some()
}

pub(crate) fn is_realtime(request: &Value) -> bool {
    request.pointer("/emeter/get_realtime").is_some()
}

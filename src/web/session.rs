use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::command::{self, ViewerCommand};
use crate::cache::TelemetryCache;

const COMMAND_QUEUE: usize = 10;

/// One connected viewer. Pushes the whole cache on connect, after every
/// successful command, and whenever `heartbeat` passes without a command.
pub async fn run(socket: WebSocket, cache: TelemetryCache, heartbeat: Duration) {
    let (mut sink, stream) = socket.split();
    if let Err(e) = push(&mut sink, &cache).await {
        warn!("Failed to send initial snapshot: {}", e);
        return;
    }

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ViewerCommand>(COMMAND_QUEUE);
    let reader = tokio::spawn(receive(stream, cmd_tx));

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    break;
                };
                let ViewerCommand::Toggle(toggle) = cmd else {
                    continue;
                };
                if let Err(e) = command::toggle(&cache, &toggle).await {
                    warn!("Toggle of {}/{} failed: {}", toggle.id, toggle.child_id, e);
                    continue;
                }
                if let Err(e) = push(&mut sink, &cache).await {
                    warn!("Failed to push snapshot: {}", e);
                    break;
                }
            }
            () = tokio::time::sleep(heartbeat) => {
                if let Err(e) = push(&mut sink, &cache).await {
                    warn!("Failed to push heartbeat snapshot: {}", e);
                    break;
                }
            }
        }
    }

    reader.abort();
    debug!("Viewer session ended");
}

/// Decode inbound frames and queue the ones worth acting on. Returns when
/// the viewer closes or the socket fails, which also closes the queue.
async fn receive(mut stream: SplitStream<WebSocket>, cmd_tx: mpsc::Sender<ViewerCommand>) {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                info!("Viewer closed the connection");
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("Error reading from viewer: {}", e);
                return;
            }
        };

        match ViewerCommand::parse(text.as_str()) {
            Ok(ViewerCommand::Ignored(kind)) => debug!("Ignoring viewer command {}", kind),
            Ok(cmd) => {
                if cmd_tx.send(cmd).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("Bad viewer message: {}", e),
        }
    }
}

async fn push(
    sink: &mut SplitSink<WebSocket, Message>,
    cache: &TelemetryCache,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let frame = cache.to_json().await?;
    sink.send(Message::Text(frame.into())).await?;
    Ok(())
}

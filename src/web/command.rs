use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::cache::TelemetryCache;
use crate::plug::PlugError;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("device {device} has no outlet {outlet}")]
    UnknownOutlet { device: String, outlet: String },

    #[error("bad params for {kind}: {source}")]
    BadParams {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Plug(#[from] PlugError),
}

/// Raw `{type, params}` frame as sent by the viewer.
#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    params: serde_json::Value,
}

/// A viewer request, decoded at the session boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerCommand {
    Toggle(Toggle),
    /// Any `type` this server does not act on.
    Ignored(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Toggle {
    pub id: String,
    #[serde(rename = "childId")]
    pub child_id: String,
}

impl ViewerCommand {
    /// Decode one text frame. Malformed JSON and bad parameters for a known
    /// type are errors; unknown types are not.
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let message: ClientMessage =
            serde_json::from_str(text).map_err(|source| CommandError::BadParams {
                kind: "message".into(),
                source,
            })?;

        if message.kind != "TOGGLE" {
            return Ok(ViewerCommand::Ignored(message.kind));
        }
        serde_json::from_value(message.params)
            .map(ViewerCommand::Toggle)
            .map_err(|source| CommandError::BadParams {
                kind: message.kind,
                source,
            })
    }
}

/// Flip one outlet and refresh its device's cache entry.
///
/// Both ids must be in the cache before anything is sent to the plug.
pub async fn toggle(cache: &TelemetryCache, cmd: &Toggle) -> Result<(), CommandError> {
    let (info, client) = cache
        .entry(&cmd.id)
        .await
        .ok_or_else(|| CommandError::UnknownDevice(cmd.id.clone()))?;
    let child = info
        .child(&cmd.child_id)
        .ok_or_else(|| CommandError::UnknownOutlet {
            device: cmd.id.clone(),
            outlet: cmd.child_id.clone(),
        })?;

    let on = !child.is_on();
    info!(
        "Switching {} ({}) on {} {}",
        child.alias,
        child.id,
        info.alias(),
        if on { "on" } else { "off" }
    );
    client.set_relay_state(Some(&child.id), on).await?;
    cache.refresh(&client).await?;
    Ok(())
}

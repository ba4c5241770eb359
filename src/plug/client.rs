use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::debug;

use super::codec::{self, HEADER_LEN};
use super::link::{DeviceLink, Response};
use super::{Endpoint, PlugError, PowerInfo, PowerReading, Result, SystemInfo};

/// Typed commands for one plug, layered on its [`DeviceLink`].
pub struct PlugClient {
    link: DeviceLink,
}

impl PlugClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            link: DeviceLink::new(endpoint),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.link.endpoint()
    }

    /// (Re)open the TCP connection. See [`DeviceLink::connect`].
    pub async fn connect(&self) -> Result<()> {
        self.link.connect().await
    }

    /// System info, together with the link sequence number of the reply it
    /// was decoded from. Higher numbers are newer.
    pub async fn system_info(&self) -> Result<(u64, SystemInfo)> {
        let reply = self.exchange(&json!({"system": {"get_sysinfo": {}}})).await?;
        let info: SystemInfo = serde_json::from_slice(&reply.body)?;
        let sysinfo = &info.system.get_sysinfo;
        check_err_code(sysinfo.err_code, None)?;
        if sysinfo.device_id.is_empty() {
            return Err(PlugError::Decode(serde::de::Error::missing_field("deviceId")));
        }
        Ok((reply.seq, info))
    }

    /// Realtime emeter reading. An empty `child_ids` meters the whole device.
    pub async fn realtime_power(&self, child_ids: &[&str]) -> Result<PowerReading> {
        let command = scoped(child_ids, json!({"emeter": {"get_realtime": {}}}));
        let info: PowerInfo = self.request(&command).await?;
        let reading = info.emeter.get_realtime;
        check_err_code(reading.err_code, reading.err_msg.as_deref())?;
        Ok(reading)
    }

    /// Switch one outlet, or the whole device when `child_id` is `None`.
    pub async fn set_relay_state(&self, child_id: Option<&str>, on: bool) -> Result<()> {
        let child_ids: Vec<&str> = child_id.into_iter().collect();
        let command = scoped(
            &child_ids,
            json!({"system": {"set_relay_state": {"state": u8::from(on)}}}),
        );
        let reply: RelayReply = self.request(&command).await?;
        let status = reply.system.set_relay_state;
        check_err_code(status.err_code, status.err_msg.as_deref())
    }

    /// Per-day energy totals for one month, returned as the raw JSON body.
    ///
    /// The decrypted reply to `get_daystat` carries four extra bytes ahead of
    /// the JSON document; they are skipped, never parsed.
    pub async fn daily_stats(&self, month: u32, year: i32) -> Result<Vec<u8>> {
        let command = json!({"emeter": {"get_daystat": {"month": month, "year": year}}});
        let plaintext = self.exchange(&command).await?.body;
        let Some(json) = plaintext.get(HEADER_LEN..) else {
            return Err(PlugError::Truncated {
                len: plaintext.len(),
            });
        };
        serde_json::from_slice::<serde::de::IgnoredAny>(json)?;
        Ok(json.to_vec())
    }

    async fn request<T: DeserializeOwned>(&self, command: &Value) -> Result<T> {
        let reply = self.exchange(command).await?;
        Ok(serde_json::from_slice(&reply.body)?)
    }

    /// Send `command` and return the deciphered reply.
    async fn exchange(&self, command: &Value) -> Result<Response> {
        let text = command.to_string();
        debug!("-> {}: {}", self.endpoint(), text);
        let reply = self.link.exchange(&codec::encode(text.as_bytes())).await?;
        Ok(Response {
            body: codec::decode(&reply.body),
            ..reply
        })
    }
}

/// Wrap `command` in a `context.child_ids` envelope when outlets are named.
fn scoped(child_ids: &[&str], command: Value) -> Value {
    if child_ids.is_empty() {
        return command;
    }
    let mut envelope = Map::new();
    envelope.insert("context".into(), json!({"child_ids": child_ids}));
    if let Value::Object(fields) = command {
        envelope.extend(fields);
    }
    Value::Object(envelope)
}

fn check_err_code(code: i64, message: Option<&str>) -> Result<()> {
    if code == 0 {
        return Ok(());
    }
    Err(PlugError::Device {
        code,
        message: message.unwrap_or("unknown error").to_string(),
    })
}

#[derive(Deserialize)]
struct RelayReply {
    system: RelaySystem,
}

#[derive(Deserialize)]
struct RelaySystem {
    set_relay_state: RelayStatus,
}

#[derive(Deserialize)]
struct RelayStatus {
    #[serde(default)]
    err_code: i64,
    #[serde(default)]
    err_msg: Option<String>,
}

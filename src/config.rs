use std::collections::HashSet;
use std::env;
use std::net::Ipv6Addr;
use std::time::Duration;

use crate::plug::{DEFAULT_PORT, Endpoint};

#[derive(Debug, Clone)]
pub struct Config {
    pub http: HttpConfig,
    pub poll: PollConfig,
    pub devices: Vec<Endpoint>,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub port: u16,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval_secs: u64,
}

fn env_required(key: &str) -> Result<String, String> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| format!("{key} environment variable is required"))
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let devices = parse_endpoints(&env_required("IP_ADDR")?)?;

        let config = Self {
            http: HttpConfig {
                port: env_or_default("PORT", 9091),
                heartbeat_interval_secs: env_or_default("HEARTBEAT_INTERVAL_SECS", 10),
            },
            poll: PollConfig {
                interval_secs: env_or_default("POLL_INTERVAL_SECS", 10),
            },
            devices,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.devices.is_empty() {
            return Err("IP_ADDR lists no devices".into());
        }
        if self.poll.interval_secs == 0 {
            return Err("POLL_INTERVAL_SECS must be > 0".into());
        }
        if self.http.heartbeat_interval_secs == 0 {
            return Err("HEARTBEAT_INTERVAL_SECS must be > 0".into());
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll.interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.http.heartbeat_interval_secs)
    }
}

/// Parse a comma-separated list of `host` or `host:port` entries.
/// Bare IPv6 addresses need brackets when a port is given: `[fe80::1]:9999`.
pub fn parse_endpoints(list: &str) -> Result<Vec<Endpoint>, String> {
    let mut seen = HashSet::new();
    let mut endpoints = Vec::new();

    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let endpoint = parse_endpoint(entry)?;
        if !seen.insert(endpoint.clone()) {
            return Err(format!("Device {endpoint} is listed more than once"));
        }
        endpoints.push(endpoint);
    }
    Ok(endpoints)
}

fn parse_endpoint(entry: &str) -> Result<Endpoint, String> {
    let parse_port = |port: &str| {
        port.parse::<u16>()
            .map_err(|e| format!("Device {entry} has invalid port: {e}"))
    };

    if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("Device {entry} is missing a closing ']'"))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(format!("Device {entry} has trailing characters")),
        };
        return Ok(Endpoint::new(host, port));
    }

    match entry.split_once(':') {
        // More than one colon: an unbracketed IPv6 address on the default port.
        Some((_, rest)) if rest.contains(':') => {
            if entry.parse::<Ipv6Addr>().is_err() {
                return Err(format!(
                    "Device {entry} is not a valid IPv6 address; separate devices with commas"
                ));
            }
            Ok(Endpoint::new(entry, DEFAULT_PORT))
        }
        Some((_, port)) if port.contains('.') => Err(format!(
            "Device {entry} has a host where its port should be; separate devices with commas"
        )),
        Some((host, port)) if !host.is_empty() => Ok(Endpoint::new(host, parse_port(port)?)),
        Some(_) => Err(format!("Device {entry} has an empty host")),
        None => Ok(Endpoint::new(entry, DEFAULT_PORT)),
    }
}

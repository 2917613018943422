//! Process configuration, read once from `GYMSCHED_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::ConflictRule;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherKind {
    Memory,
    Bus,
}

impl FromStr for PublisherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(PublisherKind::Memory),
            "bus" | "rabbitmq" => Ok(PublisherKind::Bus),
            other => Err(format!("unknown publisher {other}, expected memory or bus")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub kind: PublisherKind,
    /// Base URL of the broker management API.
    pub bus_url: String,
    /// URL-encoded virtual host (`%2F` is the default vhost).
    pub vhost: String,
    pub exchange: String,
    pub username: String,
    pub password: String,
    pub connect_timeout_ms: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub members_url: String,
    pub trainers_url: String,
    pub connect_timeout_ms: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub conflict_rule: ConflictRule,
    pub serialize_bookings: bool,
    pub remote: RemoteConfig,
    pub publisher: PublisherConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let remote_timeout_ms = parse(&lookup, "GYMSCHED_REMOTE_TIMEOUT_MS", 5_000)?;
        let remote_connect_timeout_ms = parse(&lookup, "GYMSCHED_REMOTE_CONNECT_TIMEOUT_MS", 2_000)?;

        Ok(Self {
            bind: get("GYMSCHED_BIND", "0.0.0.0"),
            port: parse(&lookup, "GYMSCHED_PORT", 8083)?,
            data_dir: PathBuf::from(get("GYMSCHED_DATA_DIR", "./data")),
            max_connections: parse(&lookup, "GYMSCHED_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse(&lookup, "GYMSCHED_COMPACT_THRESHOLD", 1000)?,
            metrics_port: match lookup("GYMSCHED_METRICS_PORT") {
                Some(v) => Some(parse_value("GYMSCHED_METRICS_PORT", v)?),
                None => None,
            },
            conflict_rule: parse(&lookup, "GYMSCHED_CONFLICT_RULE", ConflictRule::Containment)?,
            serialize_bookings: parse(&lookup, "GYMSCHED_SERIALIZE_BOOKINGS", false)?,
            remote: RemoteConfig {
                members_url: get("GYMSCHED_MEMBERS_URL", "http://members-service"),
                trainers_url: get("GYMSCHED_TRAINERS_URL", "http://trainers-service"),
                connect_timeout_ms: remote_connect_timeout_ms,
                timeout_ms: remote_timeout_ms,
            },
            publisher: PublisherConfig {
                kind: parse(&lookup, "GYMSCHED_PUBLISHER", PublisherKind::Memory)?,
                bus_url: get("GYMSCHED_BUS_URL", "http://localhost:15672"),
                vhost: get("GYMSCHED_BUS_VHOST", "%2F"),
                exchange: get("GYMSCHED_BUS_EXCHANGE", "schedule-exchange"),
                username: get("GYMSCHED_BUS_USER", "guest"),
                password: get("GYMSCHED_BUS_PASSWORD", "guest"),
                connect_timeout_ms: remote_connect_timeout_ms,
                timeout_ms: remote_timeout_ms,
            },
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("schedule.wal")
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) => parse_value(key, value),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value,
    })
}

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::Room;

/// Process configuration, read once from `BOOKINGS_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub session_lifetime: Duration,
    /// Marks the session cookie `Secure`.
    pub in_production: bool,
    pub metrics_port: Option<u16>,
    /// Rooms created at startup if they don't exist yet.
    pub rooms: Vec<Room>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value, reason } => {
                write!(f, "invalid {var}={value:?}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

const DEFAULT_ROOMS: &str = "1:General's Quarters,2:Major's Suite";

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = lookup("BOOKINGS_DATA_DIR").unwrap_or_else(|| "./data".into());
        let metrics_port = match lookup("BOOKINGS_METRICS_PORT") {
            Some(v) => Some(parse("BOOKINGS_METRICS_PORT", &v)?),
            None => None,
        };
        let lifetime_secs: u64 = parse_or(&lookup, "BOOKINGS_SESSION_LIFETIME_SECS", 24 * 60 * 60)?;
        let rooms = lookup("BOOKINGS_ROOMS").unwrap_or_else(|| DEFAULT_ROOMS.into());

        let config = Self {
            bind: lookup("BOOKINGS_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "BOOKINGS_PORT", 8080)?,
            data_dir: PathBuf::from(data_dir),
            max_connections: parse_or(&lookup, "BOOKINGS_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&lookup, "BOOKINGS_COMPACT_THRESHOLD", 1000)?,
            session_lifetime: Duration::from_secs(lifetime_secs),
            in_production: parse_or(&lookup, "BOOKINGS_IN_PRODUCTION", false)?,
            metrics_port,
            rooms: parse_rooms(&rooms)?,
        };
        if config.max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "BOOKINGS_MAX_CONNECTIONS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(config)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(var) {
        Some(value) => parse(var, &value),
        None => Ok(default),
    }
}

/// `id:name` pairs separated by commas, e.g. `1:General's Quarters,2:Major's Suite`.
fn parse_rooms(list: &str) -> Result<Vec<Room>, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        var: "BOOKINGS_ROOMS",
        value: list.to_string(),
        reason: reason.to_string(),
    };
    let mut rooms = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (id, name) = item
            .split_once(':')
            .ok_or_else(|| invalid("expected id:name"))?;
        let id = id
            .trim()
            .parse()
            .map_err(|_| invalid("room id is not an integer"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(invalid("room name is empty"));
        }
        if rooms.iter().any(|r: &Room| r.id == id) {
            return Err(invalid("duplicate room id"));
        }
        rooms.push(Room {
            id,
            name: name.to_string(),
        });
    }
    Ok(rooms)
}

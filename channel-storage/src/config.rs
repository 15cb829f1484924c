//! Configuration for the storage client and the store node.
//!
//! Both groups are read from one JSON document:
//!
//! ```json
//! {
//!     "payment_channel_storage_client": { "connection_timeout": "5s", ... },
//!     "payment_channel_storage_server": { "id": "storage-1", ... }
//! }
//! ```
//!
//! Every field has a default, so a partial document (or none at all) still
//! produces a usable single-member setup on localhost.

use std::{fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub payment_channel_storage_client: StorageClientConfig,
    pub payment_channel_storage_server: StorageNodeConfig,
}

impl StorageConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }
}

/// Settings consumed by [`crate::client::StorageClient::connect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageClientConfig {
    /// Upper bound for establishing a connection to one endpoint.
    #[serde(with = "duration_format")]
    pub connection_timeout: Duration,
    /// Upper bound for every request after the connection exists.
    #[serde(with = "duration_format")]
    pub request_timeout: Duration,
    /// Lease TTL of mutex sessions; a crashed holder loses its locks after this.
    #[serde(with = "duration_format")]
    pub session_ttl: Duration,
    /// Store endpoints, tried in order. `http://` prefixes are accepted.
    pub endpoints: Vec<String>,
}

impl Default for StorageClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(3),
            session_ttl: Duration::from_secs(60),
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
        }
    }
}

impl StorageClientConfig {
    /// Client config pointing at a single `host:port`.
    pub fn for_endpoint(addr: impl std::fmt::Display) -> Self {
        Self {
            endpoints: vec![format!("http://{addr}")],
            ..Self::default()
        }
    }
}

/// Settings consumed by [`crate::node::StoreNode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageNodeConfig {
    pub id: String,
    pub host: String,
    /// Port for client traffic; 0 binds an ephemeral port.
    pub client_port: u16,
    /// Port for member traffic; 0 binds an ephemeral port.
    pub peer_port: u16,
    /// Cluster bootstrap token shared by all members.
    pub token: String,
    /// Membership descriptor, `id=peerURL[,id=peerURL...]`.
    pub cluster: String,
    pub data_dir: PathBuf,
    /// When false the node is managed externally and `start` does nothing.
    pub enabled: bool,
}

impl Default for StorageNodeConfig {
    fn default() -> Self {
        Self {
            id: "storage-1".to_string(),
            host: "127.0.0.1".to_string(),
            client_port: 2379,
            peer_port: 2380,
            token: "unique-token".to_string(),
            cluster: "storage-1=http://127.0.0.1:2380".to_string(),
            data_dir: PathBuf::from("storage-data-dir-1.etcd"),
            enabled: true,
        }
    }
}

impl StorageNodeConfig {
    pub fn client_listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.client_port)
    }

    pub fn peer_listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.peer_port)
    }
}

/// Strips an optional `http://` or `https://` scheme and trailing slash,
/// leaving a `host:port` address suitable for `TcpStream::connect`.
pub fn endpoint_address(endpoint: &str) -> Result<String, ConfigError> {
    let trimmed = endpoint.trim();
    let without_scheme = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .unwrap_or(trimmed);
    let addr = without_scheme.trim_end_matches('/');

    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(addr.to_string())
        }
        _ => Err(ConfigError::InvalidEndpoint(endpoint.to_string())),
    }
}

/// Parses `"300ms"`, `"5s"`, `"1m30s"`, `"2h"`, `"1d"` or a bare number of
/// milliseconds.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidDuration {
        input: input.to_string(),
        reason,
    };

    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid("duration cannot be empty".to_string()));
    }
    if let Ok(millis) = trimmed.parse::<u64>() {
        return Ok(Duration::from_millis(millis));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = trimmed.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        let unit = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Duration::from_millis(1)
            }
            'm' => Duration::from_secs(60),
            's' => Duration::from_secs(1),
            'h' => Duration::from_secs(60 * 60),
            'd' => Duration::from_secs(24 * 60 * 60),
            other => return Err(invalid(format!("unexpected character '{other}'"))),
        };

        if digits.is_empty() {
            return Err(invalid(format!("missing number before '{c}'")));
        }
        let amount: u32 = digits
            .parse()
            .map_err(|_| invalid(format!("number '{digits}' is too large")))?;
        total = unit
            .checked_mul(amount)
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| invalid("duration overflows".to_string()))?;
        digits.clear();
    }

    if !digits.is_empty() {
        return Err(invalid(format!("number '{digits}' has no unit")));
    }

    Ok(total)
}

mod duration_format {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Millis(millis) => Ok(Duration::from_millis(millis)),
            RawDuration::Text(text) => super::parse_duration(&text).map_err(D::Error::custom),
        }
    }
}

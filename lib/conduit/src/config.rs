//! Endpoint configuration. Key material is carried base64-encoded so the
//! structures load straight from TOML files.

use crate::keys::{Identity, SignPublicKey, SignSecretKey};
use crate::outbound;
use crate::session::Settings;
use keel::encoding::base64;
use serde::{de, Deserializer};
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;

#[derive(Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Ed25519 secret key (seed and public halves, 64 bytes).
    #[serde(
        serialize_with = "base64::serialize",
        deserialize_with = "deserialize_b64_secret"
    )]
    pub signing_key: SignSecretKey,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default = "default_queue_size")]
    pub max_reliable_queue_size: usize,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// The server's Ed25519 public key, shared out of band.
    #[serde(
        serialize_with = "base64::serialize",
        deserialize_with = "deserialize_b64_public"
    )]
    pub server_public_key: SignPublicKey,
    #[serde(default = "default_queue_size")]
    pub max_reliable_queue_size: usize,
}

impl ServerConfig {
    pub fn new(port: u16, signing_key: SignSecretKey) -> ServerConfig {
        ServerConfig {
            port,
            bind_address: default_bind_address(),
            signing_key,
            session_timeout_ms: default_session_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            max_connections: None,
            max_reliable_queue_size: default_queue_size(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> ServerConfig {
        serdeconv::from_toml_file(path).expect("Error loading server configuration file")
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> ServerConfig {
        self.session_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> ServerConfig {
        self.heartbeat_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_max_connections(mut self, limit: usize) -> ServerConfig {
        self.max_connections = Some(limit);
        self
    }

    pub fn with_max_reliable_queue_size(mut self, size: usize) -> ServerConfig {
        self.max_reliable_queue_size = size;
        self
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// The server's signing identity; the public half is the last 32 bytes
    /// of the secret key.
    pub fn identity(&self) -> Identity {
        let mut public = [0u8; 32];
        public.copy_from_slice(&self.signing_key[32..]);

        Identity::from_secret(public, self.signing_key)
    }

    pub fn session_settings(&self) -> Settings {
        Settings {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            timeout: Duration::from_millis(self.session_timeout_ms),
            queue_capacity: self.max_reliable_queue_size,
            max_attempts: outbound::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, server_public_key: SignPublicKey) -> ClientConfig {
        ClientConfig {
            host: host.to_string(),
            port,
            server_public_key,
            max_reliable_queue_size: default_queue_size(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> ClientConfig {
        serdeconv::from_toml_file(path).expect("Error loading client configuration file")
    }

    pub fn with_max_reliable_queue_size(mut self, size: usize) -> ClientConfig {
        self.max_reliable_queue_size = size;
        self
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_session_timeout() -> u64 {
    DEFAULT_SESSION_TIMEOUT_MS
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_queue_size() -> usize {
    outbound::DEFAULT_CAPACITY
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_secs() * 1000 + u64::from(duration.subsec_millis())
}

fn deserialize_b64_secret<'de, D>(deserializer: D) -> Result<SignSecretKey, D::Error>
where
    D: Deserializer<'de>,
{
    let decoded = base64::deserialize(deserializer)?;

    if decoded.len() != 64 {
        return Err(de::Error::custom("signing key must decode to 64 bytes"));
    }

    let mut key = [0u8; 64];
    key.copy_from_slice(&decoded);
    Ok(key)
}

fn deserialize_b64_public<'de, D>(deserializer: D) -> Result<SignPublicKey, D::Error>
where
    D: Deserializer<'de>,
{
    let decoded = base64::deserialize(deserializer)?;

    if decoded.len() != 32 {
        return Err(de::Error::custom("public key must decode to 32 bytes"));
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&decoded);
    Ok(key)
}

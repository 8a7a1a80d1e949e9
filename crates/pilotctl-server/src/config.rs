use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use pilotctl_crypto::{KeySource, KeyStore};
use pilotctl_events::PublisherConfig;

/// Seconds a pilot token stays valid after it is issued.
pub const TOKEN_TTL_SECS: i64 = 300;

/// Service configuration.
#[derive(Clone)]
pub struct ServiceConfig {
    /// Address to bind the HTTP server to.
    pub bind_addr: SocketAddr,
    /// SQLite database path.
    pub db_path: String,
    /// How often pilots are told to ping.
    pub ping_interval: Duration,
    /// Where the signing and verification keys are looked up, in order.
    pub key_sources: Vec<KeySource>,
    /// Passphrase protecting the signing key file.
    pub sign_key_passphrase: Option<String>,
    /// Receiver list file. Searched for when unset.
    pub receivers_file: Option<PathBuf>,
    pub publisher: PublisherConfig,
    pub token_ttl_secs: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([127, 0, 0, 1], 8080).into(),
            db_path: "pilotctl.db".to_string(),
            ping_interval: Duration::from_secs(60),
            key_sources: KeyStore::default_sources(),
            sign_key_passphrase: None,
            receivers_file: None,
            publisher: PublisherConfig::default(),
            token_ttl_secs: TOKEN_TTL_SECS,
        }
    }
}

impl ServiceConfig {
    /// Key store over the configured sources.
    pub fn key_store(&self) -> KeyStore {
        let keys = KeyStore::new(self.key_sources.clone());
        match &self.sign_key_passphrase {
            Some(passphrase) => keys.with_passphrase(passphrase.as_str()),
            None => keys,
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("bind_addr", &self.bind_addr)
            .field("db_path", &self.db_path)
            .field("ping_interval", &self.ping_interval)
            .field("key_sources", &self.key_sources)
            .field(
                "sign_key_passphrase",
                &self.sign_key_passphrase.as_ref().map(|_| "<redacted>"),
            )
            .field("receivers_file", &self.receivers_file)
            .field("publisher", &self.publisher)
            .field("token_ttl_secs", &self.token_ttl_secs)
            .finish()
    }
}

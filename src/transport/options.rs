//! Connection and publish options
//!
//! Callers pass a sparse [`ConnectOptions`]; [`ConnectOptions::resolve`] merges it
//! over the defaults to produce the [`ResolvedOptions`] a transport consumes.

use super::QoS;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Prefix for generated client identifiers
pub const CLIENT_ID_PREFIX: &str = "playground_";
/// Default delay between transport reconnect attempts
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(3000);
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
/// Default capacity of the outgoing request queue
pub const DEFAULT_REQUEST_CAPACITY: usize = 10;

/// Username/password pair sent in the CONNECT packet
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Caller-supplied overrides; every `None` falls back to the default
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectOptions {
    pub client_id: Option<String>,
    pub credentials: Option<Credentials>,
    pub clean_session: Option<bool>,
    /// Zero disables transport-level reconnects
    pub reconnect_interval: Option<Duration>,
    pub keep_alive: Option<Duration>,
    /// PEM bundle used to verify the broker on `mqtts://` and `wss://`
    pub ca_file: Option<PathBuf>,
    pub request_capacity: Option<usize>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_credentials<U: Into<String>, P: Into<String>>(
        mut self,
        username: U,
        password: P,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = Some(clean);
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = Some(interval);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    pub fn with_ca_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn with_request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = Some(capacity);
        self
    }

    /// Merge over the defaults. A client id is generated when none is given.
    pub fn resolve(self) -> ResolvedOptions {
        ResolvedOptions {
            client_id: self
                .client_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(generate_client_id),
            credentials: self.credentials,
            clean_session: self.clean_session.unwrap_or(true),
            reconnect_interval: self
                .reconnect_interval
                .unwrap_or(DEFAULT_RECONNECT_INTERVAL),
            keep_alive: self.keep_alive.unwrap_or(DEFAULT_KEEP_ALIVE),
            ca_file: self.ca_file,
            request_capacity: self
                .request_capacity
                .filter(|capacity| *capacity > 0)
                .unwrap_or(DEFAULT_REQUEST_CAPACITY),
        }
    }
}

/// Fully populated options handed to a transport
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub clean_session: bool,
    pub reconnect_interval: Duration,
    pub keep_alive: Duration,
    pub ca_file: Option<PathBuf>,
    pub request_capacity: usize,
}

impl ResolvedOptions {
    pub fn reconnect_enabled(&self) -> bool {
        !self.reconnect_interval.is_zero()
    }
}

/// Per-message publish settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }
}

/// Random client id: prefix plus 8 hex characters
pub fn generate_client_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{CLIENT_ID_PREFIX}{}", &suffix[..8])
}

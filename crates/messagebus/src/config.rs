//! Bus configuration.
//!
//! Supplied once at construction. Environment overrides follow the
//! `MESSAGEBUS_*` variables; unparsable values are logged and ignored.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::domain::backoff::{Backoff, DEFAULT_JITTER_RATIO, DEFAULT_MAX_DELAY, DEFAULT_MULTIPLIER};
use crate::domain::topic::WORKSPACE_EXCHANGE;

/// Default AMQP port.
pub const DEFAULT_PORT: u16 = 5672;

/// Default AMQPS port.
pub const DEFAULT_TLS_PORT: u16 = 5671;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Broker hostname.
    pub host: String,
    /// Broker port. Unset means [`DEFAULT_TLS_PORT`] with TLS and
    /// [`DEFAULT_PORT`] without.
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    /// TLS is used when any trust or identity material is present.
    pub tls: TlsConfig,
    /// Exchange listeners bind to. Declared as a durable topic exchange on
    /// every freshly opened channel.
    pub exchange: String,
    /// Named durable queues asserted on every (re)connect.
    pub durable_queues: Vec<String>,
    /// Bounded retry loop of `connect()`.
    pub connect: ConnectOptions,
    /// Background reconnect backoff.
    pub reconnect: ReconnectPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        let connect = ConnectOptions::default();
        Self {
            host: "localhost".to_string(),
            port: None,
            username: String::new(),
            password: String::new(),
            tls: TlsConfig::default(),
            exchange: WORKSPACE_EXCHANGE.to_string(),
            durable_queues: Vec::new(),
            reconnect: ReconnectPolicy::starting_at(connect.retry_delay),
            connect,
        }
    }
}

impl BusConfig {
    /// Defaults overridden by `MESSAGEBUS_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by values from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(host) = lookup("MESSAGEBUS_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("MESSAGEBUS_PORT") {
            match port.parse() {
                Ok(p) => config.port = Some(p),
                Err(_) => warn!(value = %port, "MESSAGEBUS_PORT is not a valid port, ignoring"),
            }
        }
        if let Some(username) = lookup("MESSAGEBUS_USERNAME") {
            config.username = username;
        }
        if let Some(password) = lookup("MESSAGEBUS_PASSWORD") {
            config.password = password;
        }
        if let Some(exchange) = lookup("MESSAGEBUS_EXCHANGE") {
            config.exchange = exchange;
        }

        config.tls = TlsConfig {
            ca: lookup("MESSAGEBUS_CA").filter(|v| !v.is_empty()),
            cert: lookup("MESSAGEBUS_CERT").filter(|v| !v.is_empty()),
            key: lookup("MESSAGEBUS_KEY").filter(|v| !v.is_empty()),
            identity: lookup("MESSAGEBUS_PKCS12")
                .filter(|v| !v.is_empty())
                .map(|path| ClientIdentity {
                    pkcs12: PathBuf::from(path),
                    password: lookup("MESSAGEBUS_PKCS12_PASSWORD").unwrap_or_default(),
                }),
        };

        config
    }

    /// Check the configuration before connecting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.port == Some(0) {
            return Err(ConfigError::InvalidPort);
        }
        if self.exchange.is_empty() {
            return Err(ConfigError::EmptyExchange);
        }
        if self.tls.key.is_some() && self.tls.cert.is_none() {
            return Err(ConfigError::KeyWithoutCertificate);
        }
        if self.connect.retries == 0 {
            return Err(ConfigError::NoConnectAttempts);
        }
        self.reconnect.validate()
    }

    pub fn uses_tls(&self) -> bool {
        self.tls.is_configured()
    }

    /// Port to connect to, after applying the scheme default.
    pub fn port(&self) -> u16 {
        match self.port {
            Some(port) => port,
            None if self.uses_tls() => DEFAULT_TLS_PORT,
            None => DEFAULT_PORT,
        }
    }

    pub fn scheme(&self) -> &'static str {
        if self.uses_tls() {
            "amqps"
        } else {
            "amqp"
        }
    }

    /// Connection URL with the password masked. Credentials are never
    /// rendered into a URL.
    pub fn redacted_url(&self) -> String {
        format!(
            "{}://{}:****@{}:{}",
            self.scheme(),
            self.username,
            self.host,
            self.port()
        )
    }
}

/// TLS trust and client identity.
#[derive(Clone, Default)]
pub struct TlsConfig {
    /// PEM CA bundle trusted in addition to the system roots.
    pub ca: Option<String>,
    /// PEM client certificate. Only presented when packaged as
    /// [`ClientIdentity`].
    pub cert: Option<String>,
    pub key: Option<String>,
    /// Client certificate presented for mutual TLS.
    pub identity: Option<ClientIdentity>,
}

impl TlsConfig {
    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.cert.is_some() || self.identity.is_some()
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca", &self.ca.is_some())
            .field("cert", &self.cert.is_some())
            .field("key", &self.key.as_ref().map(|_| "****"))
            .field("identity", &self.identity)
            .finish()
    }
}

/// PKCS#12 archive holding the client certificate and its private key.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub pkcs12: PathBuf,
    pub password: String,
}

impl ClientIdentity {
    /// Read the DER-encoded archive.
    pub fn load(&self) -> Result<Vec<u8>, ConfigError> {
        std::fs::read(&self.pkcs12).map_err(|e| ConfigError::UnreadableIdentity {
            path: self.pkcs12.display().to_string(),
            reason: e.to_string(),
        })
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("pkcs12", &self.pkcs12)
            .field("password", &"****")
            .finish()
    }
}

/// Bounded retry loop of a single `connect()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Total attempts.
    pub retries: u32,
    /// Wait between failed attempts.
    pub retry_delay: Duration,
    /// Bound on opening the connection in one attempt.
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            retries: 10,
            retry_delay: Duration::from_millis(2000),
            connect_timeout: Duration::from_millis(3000),
        }
    }
}

/// Backoff of the background reconnect scheduler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    /// Jitter bound as a fraction of the current delay.
    pub jitter_ratio: f64,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::starting_at(ConnectOptions::default().retry_delay)
    }
}

impl ReconnectPolicy {
    pub fn starting_at(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier: DEFAULT_MULTIPLIER,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(ConfigError::InvalidMultiplier(self.multiplier));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::InvalidJitter(self.jitter_ratio));
        }
        Ok(())
    }

    /// Fresh backoff controller for this policy.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_delay, self.max_delay, self.multiplier)
            .with_jitter(self.jitter_ratio)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("broker host must not be empty")]
    EmptyHost,

    #[error("broker port must be non-zero")]
    InvalidPort,

    #[error("exchange name must not be empty")]
    EmptyExchange,

    #[error("TLS key configured without a client certificate (set MESSAGEBUS_CERT)")]
    KeyWithoutCertificate,

    #[error("cannot read client identity {path}: {reason}")]
    UnreadableIdentity { path: String, reason: String },

    #[error("connect retries must be at least 1")]
    NoConnectAttempts,

    #[error("reconnect multiplier must be >= 1.0, got {0}")]
    InvalidMultiplier(f64),

    #[error("reconnect jitter ratio must be within [0, 1], got {0}")]
    InvalidJitter(f64),
}

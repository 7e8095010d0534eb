//! Server configuration snapshot.
//!
//! [`ServerConfig`] is read once when a server is built and never mutated
//! by the running server. It is usually loaded from the engine plugin's
//! JSON config file:
//!
//! ```json
//! {
//!   "host": "localhost",
//!   "port": 8086,
//!   "ssl": { "cert_path": "cert.pem", "key_path": "key.pem" },
//!   "remotes": [{ "pattern": "^https?\\:\\/\\/localhost?(:[0-9]*)?" }, "https://example.org"],
//!   "private_key": "<64 hex chars>",
//!   "public_key": "<64 hex chars>"
//! }
//! ```
//!
//! Every field is optional. A missing key pair is replaced by a freshly
//! generated one that lives only in memory; this module never writes the
//! file back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::crypto::{CryptoError, KeyPair};

/// Host used when the config file does not name one.
pub const DEFAULT_HOST: &str = "localhost";

/// Port used when the config file does not name one.
pub const DEFAULT_PORT: u16 = 8086;

/// Origin pattern used when the config file lists no remotes.
pub const DEFAULT_ORIGIN_PATTERN: &str = r"^https?\:\/\/localhost?(:[0-9]*)?";

/// Environment variable overriding the bind host.
pub const HOST_ENV: &str = "ENGINE_SERVER_HOST";

/// Environment variable overriding the bind port.
pub const PORT_ENV: &str = "ENGINE_SERVER_PORT";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse JSON content.
    #[error("failed to parse config JSON: {source}")]
    Json {
        /// The underlying JSON parse error.
        #[from]
        source: serde_json::Error,
    },

    /// A remote origin pattern is not a valid regular expression.
    #[error("invalid origin pattern {pattern:?}: {source}")]
    Pattern {
        /// The offending pattern.
        pattern: String,
        /// The underlying regex error.
        source: Box<regex::Error>,
    },

    /// A configured key could not be decoded.
    #[error("invalid key: {0}")]
    Key(#[from] CryptoError),

    /// The configured public key does not belong to the private key.
    #[error("configured public key does not match the private key")]
    KeyMismatch,
}

/// An allowed value for a request's `Origin` header.
#[derive(Debug, Clone)]
pub enum OriginPattern {
    /// Origins matching a regular expression.
    Regex(Regex),
    /// One exact origin string.
    Exact(String),
}

impl OriginPattern {
    /// Compile a regular-expression pattern.
    pub fn regex(pattern: &str) -> Result<Self, ConfigError> {
        Regex::new(pattern)
            .map(Self::Regex)
            .map_err(|source| ConfigError::Pattern {
                pattern: pattern.to_owned(),
                source: Box::new(source),
            })
    }

    /// Allow exactly one origin.
    pub fn exact(origin: impl Into<String>) -> Self {
        Self::Exact(origin.into())
    }

    /// Whether `origin` is allowed by this pattern.
    pub fn matches(&self, origin: &str) -> bool {
        match self {
            Self::Regex(regex) => regex.is_match(origin),
            Self::Exact(exact) => exact == origin,
        }
    }
}

/// Paths to the PEM certificate chain and private key for TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// PEM file holding the certificate chain, leaf first.
    pub cert_path: PathBuf,
    /// PEM file holding the private key.
    pub key_path: PathBuf,
}

/// How requests prove they may talk to the server.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Each request carries the client's public key and a box sealed to
    /// the server; every message body is box-encrypted.
    Box,
    /// Each request carries a static shared secret; bodies are plain JSON.
    SharedSecret(String),
}

impl core::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Box => f.write_str("Box"),
            Self::SharedSecret(_) => f.write_str("SharedSecret(..)"),
        }
    }
}

/// Immutable identity and transport settings for one server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The host address to bind to.
    pub host: String,
    /// The TCP port to listen on. `0` picks an ephemeral port.
    pub port: u16,
    /// TLS material; `None` serves plain `ws://`.
    pub tls: Option<TlsConfig>,
    /// Allowed request origins.
    pub origins: Vec<OriginPattern>,
    /// Request authentication mode.
    pub auth: AuthMode,
    /// The server's long-term key pair.
    pub keys: Arc<KeyPair>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            tls: None,
            origins: vec![default_origin()],
            auth: AuthMode::Box,
            keys: Arc::new(KeyPair::generate()),
        }
    }
}

fn default_origin() -> OriginPattern {
    // The default pattern is a literal that always compiles; fall back to
    // the exact localhost origin rather than panic if it ever does not.
    OriginPattern::regex(DEFAULT_ORIGIN_PATTERN)
        .unwrap_or_else(|_err| OriginPattern::exact("http://localhost"))
}

/// On-disk shape of the config file.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    host: Option<String>,
    port: Option<u16>,
    ssl: Option<RawTls>,
    remotes: Option<Vec<RawRemote>>,
    private_key: Option<String>,
    public_key: Option<String>,
    secret_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTls {
    cert_path: PathBuf,
    key_path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRemote {
    Pattern { pattern: String },
    Exact(String),
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults. Relative TLS paths are resolved
    /// against the file's directory. Environment overrides are applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file exists but cannot be read,
    /// and any error [`ServerConfig::parse`] returns.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "config file not found, using defaults");
                RawConfig::default()
            }
            Err(e) => return Err(e.into()),
        };

        let mut config = Self::from_raw(raw)?;
        if let (Some(tls), Some(base)) = (config.tls.as_mut(), path.parent()) {
            tls.cert_path = base.join(&tls.cert_path);
            tls.key_path = base.join(&tls.key_path);
        }
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a JSON string and apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] for malformed JSON,
    /// [`ConfigError::Pattern`] for an invalid origin regex, and
    /// [`ConfigError::Key`] / [`ConfigError::KeyMismatch`] for bad keys.
    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        let mut config = Self::from_raw(serde_json::from_str(json)?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let keys = match raw.private_key.as_deref() {
            Some(private) => {
                let keys = KeyPair::from_private_hex(private)?;
                if let Some(public) = raw.public_key.as_deref()
                    && !public.trim().eq_ignore_ascii_case(&keys.public_key_hex())
                {
                    return Err(ConfigError::KeyMismatch);
                }
                keys
            }
            None => {
                debug!("no key pair configured, generating one");
                KeyPair::generate()
            }
        };

        let origins = match raw.remotes {
            Some(remotes) => remotes
                .into_iter()
                .map(|remote| match remote {
                    RawRemote::Pattern { pattern } => OriginPattern::regex(&pattern),
                    RawRemote::Exact(origin) => Ok(OriginPattern::Exact(origin)),
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => vec![default_origin()],
        };

        Ok(Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_owned()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            tls: raw.ssl.map(|ssl| TlsConfig {
                cert_path: ssl.cert_path,
                key_path: ssl.key_path,
            }),
            origins,
            auth: raw
                .secret_key
                .map_or(AuthMode::Box, AuthMode::SharedSecret),
            keys: Arc::new(keys),
        })
    }

    /// Override host and port from `ENGINE_SERVER_HOST` / `ENGINE_SERVER_PORT`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_with(|name| std::env::var(name).ok());
    }

    /// Override host and port from an arbitrary variable lookup.
    pub fn apply_env_overrides_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup(HOST_ENV) {
            self.host = host;
        }
        if let Some(port) = lookup(PORT_ENV) {
            match port.trim().parse() {
                Ok(port) => self.port = port,
                Err(e) => warn!(value = %port, error = %e, "ignoring invalid {PORT_ENV}"),
            }
        }
    }

    /// Replace the bind host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Replace the bind port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Replace the TLS material.
    #[must_use]
    pub fn with_tls(mut self, tls: Option<TlsConfig>) -> Self {
        self.tls = tls;
        self
    }

    /// Replace the allowed origins.
    #[must_use]
    pub fn with_origins(mut self, origins: Vec<OriginPattern>) -> Self {
        self.origins = origins;
        self
    }

    /// Replace the authentication mode.
    #[must_use]
    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    /// Replace the key pair.
    #[must_use]
    pub fn with_keys(mut self, keys: Arc<KeyPair>) -> Self {
        self.keys = keys;
        self
    }
}

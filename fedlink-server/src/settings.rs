//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment
//! variables. An example configuration file can be found in the `configs/`
//! directory located in the repository root.

use std::{
    env,
    fmt,
    path::{Path, PathBuf},
};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

/// Environment variable holding the admin username.
pub const ADMIN_USERNAME_VAR: &str = "FEDLINK_ADMIN_USERNAME";
/// Environment variable holding the admin password.
pub const ADMIN_PASSWORD_VAR: &str = "FEDLINK_ADMIN_PASSWORD";

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically
/// named settings field.
pub struct Settings {
    pub api: ApiSettings,
    #[validate]
    pub protocol: ProtocolSettings,
    pub registry: RegistrySettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fedlink").separator("__"))?;
        config.try_into()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[cfg_attr(
    feature = "tls",
    derive(Validate),
    validate(schema(function = "validate_api"))
)]
/// REST API settings.
///
/// Requires both `tls_certificate` and `tls_key` for TLS server
/// authentication if the `tls` feature is enabled.
pub struct ApiSettings {
    /// The address to which the REST API should be bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "0.0.0.0:8080"
    /// # or
    /// bind_address = "127.0.0.1:8080"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLINK_API__BIND_ADDRESS=127.0.0.1:8080
    /// ```
    pub bind_address: std::net::SocketAddr,

    #[cfg(feature = "tls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "tls")))]
    /// The path to the server certificate to enable TLS server
    /// authentication. If this is present, then `tls_key` must also be
    /// present.
    ///
    /// Requires the `tls` feature to be enabled.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// tls_certificate = path/to/tls/files/cert.pem
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLINK_API__TLS_CERTIFICATE=path/to/tls/files/certificate.pem
    /// ```
    pub tls_certificate: Option<PathBuf>,

    #[cfg(feature = "tls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "tls")))]
    /// The path to the server private key to enable TLS server
    /// authentication. If this is present, then `tls_certificate` must also
    /// be present.
    ///
    /// Requires the `tls` feature to be enabled.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// tls_key = path/to/tls/files/key.rsa
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLINK_API__TLS_KEY=path/to/tls/files/key.rsa
    /// ```
    pub tls_key: Option<PathBuf>,
}

#[cfg(feature = "tls")]
impl ApiSettings {
    /// Checks API settings.
    fn validate_api(&self) -> Result<(), ValidationError> {
        match (&self.tls_certificate, &self.tls_key) {
            (Some(_), Some(_)) | (None, None) => Ok(()),
            _ => Err(ValidationError::new("invalid tls settings")),
        }
    }
}

/// A wrapper for validate derive.
#[cfg(feature = "tls")]
fn validate_api(s: &ApiSettings) -> Result<(), ValidationError> {
    s.validate_api()
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_protocol"))]
/// Coordination protocol settings.
pub struct ProtocolSettings {
    /// Whether the server runs in safe mode. In safe mode only workers whose
    /// public keys were pre-loaded (via `key_list_file` or the admin API)
    /// can register; everything else is rejected. Outside safe mode
    /// authentication is disabled entirely and every registration is
    /// allocated a fresh unauthenticated identity.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [protocol]
    /// safe_mode = true
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLINK_PROTOCOL__SAFE_MODE=true
    /// ```
    pub safe_mode: bool,

    /// The path to a file listing the pre-authorized worker public keys, one
    /// hex encoded `Ed25519` key per line. Only valid in safe mode.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [protocol]
    /// key_list_file = "worker_public_keys.txt"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLINK_PROTOCOL__KEY_LIST_FILE=worker_public_keys.txt
    /// ```
    #[serde(default)]
    pub key_list_file: Option<PathBuf>,

    /// The interval in seconds between checks of a pending long-poll
    /// against the aggregation collaborator's current model version. Bounds
    /// the extra latency of artifact delivery.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [protocol]
    /// model_check_interval = 1
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLINK_PROTOCOL__MODEL_CHECK_INTERVAL=1
    /// ```
    #[serde(default = "default_model_check_interval")]
    #[validate(range(min = 1))]
    pub model_check_interval: u64,
}

fn default_model_check_interval() -> u64 {
    1
}

impl ProtocolSettings {
    /// Checks the protocol settings.
    fn validate_protocol(&self) -> Result<(), ValidationError> {
        // a key list without safe mode would silently authenticate nobody
        if !self.safe_mode && self.key_list_file.is_some() {
            return Err(ValidationError::new(
                "a key_list_file requires safe_mode to be enabled",
            ));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_protocol(s: &ProtocolSettings) -> Result<(), ValidationError> {
    s.validate_protocol()
}

#[derive(Debug, Deserialize, Clone)]
/// Identity registry settings.
pub struct RegistrySettings {
    /// The path of the embedded database holding the worker identities.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [registry]
    /// db_path = "workers_db"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLINK_REGISTRY__DB_PATH=workers_db
    /// ```
    pub db_path: PathBuf,

    /// Whether to reload the identities of the previous session from
    /// `db_path` at startup. When disabled the server starts from the key
    /// list alone.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [registry]
    /// load_last_session_workers = true
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLINK_REGISTRY__LOAD_LAST_SESSION_WORKERS=true
    /// ```
    #[serde(default)]
    pub load_last_session_workers: bool,
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLINK_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// Credentials guarding the admin control plane.
///
/// These are deliberately not part of the settings file: they are injected
/// out-of-band through the [`ADMIN_USERNAME_VAR`] and [`ADMIN_PASSWORD_VAR`]
/// environment variables. When either variable is unset every admin request
/// is rejected.
pub struct AdminSettings {
    pub username: String,
    pub password: String,
}

impl AdminSettings {
    /// Reads the admin credentials from the environment.
    pub fn from_env() -> Option<Self> {
        let username = env::var(ADMIN_USERNAME_VAR).ok()?;
        let password = env::var(ADMIN_PASSWORD_VAR).ok()?;
        Some(Self { username, password })
    }
}

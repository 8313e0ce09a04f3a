//! Messaging and observability configuration.

use crate::Error;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use ebrick_events_cursor::DEFAULT_POLL_TIMEOUT;
use humantime_serde::re::humantime::parse_duration;
use serde::{Deserialize, Serialize};

/// Prefix of environment variables overriding [`MessagingConfig`].
pub const ENV_PREFIX: &str = "MESSAGING_";

/// Environment variable overriding [`TracingConfig::enable`].
pub const TRACING_ENV: &str = "OBSERVABILITY_TRACING_ENABLE";

/// Application configuration read by [`crate::EventStreams::connect`].
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    /// Broker selection and connection parameters.
    pub messaging: MessagingConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Broker selection and connection parameters.
#[derive(Clone, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Whether messaging is enabled at all.
    pub enable: bool,

    /// Backend kind, `nats` or `redis`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Broker URL.
    pub url: String,

    /// Client name announced to the broker, where supported.
    pub client_name: Option<String>,

    /// User for authentication.
    pub username: Option<String>,

    /// Password for authentication.
    pub password: Option<String>,

    /// Group-cursor poll timeout, e.g. `"1s"`.
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            enable: false,
            kind: String::new(),
            url: String::new(),
            client_name: None,
            username: None,
            password: None,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl fmt::Debug for MessagingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingConfig")
            .field("enable", &self.enable)
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field("client_name", &self.client_name)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("poll_timeout", &self.poll_timeout)
            .finish()
    }
}

/// Observability settings.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Trace propagation.
    pub tracing: TracingConfig,
}

/// Trace propagation settings.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Whether trace context crosses the publish/consume boundary.
    pub enable: bool,
}

/// Supported broker backends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackendKind {
    /// NATS `JetStream`, a log-stream broker.
    Nats,

    /// Redis Streams, a group-cursor broker.
    Redis,
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nats" => Ok(Self::Nats),
            "redis" => Ok(Self::Redis),
            "" => Err(Error::Configuration(
                "messaging type is required".to_string(),
            )),
            other => Err(Error::Configuration(format!(
                "unsupported messaging type `{other}`"
            ))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nats => f.write_str("nats"),
            Self::Redis => f.write_str("redis"),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| Error::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml(&contents)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `Error::ParseConfig` if the text is not valid configuration.
    pub fn from_toml(contents: &str) -> Result<Self, Error> {
        Ok(toml::from_str(contents)?)
    }

    /// Applies `MESSAGING_*` and `OBSERVABILITY_TRACING_ENABLE` overrides
    /// from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if an override cannot be parsed.
    pub fn apply_env(self) -> Result<Self, Error> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides read through `lookup`, keyed by environment
    /// variable name.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if an override cannot be parsed.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        if let Some(enable) = var("ENABLE") {
            self.messaging.enable = parse_bool(&format!("{ENV_PREFIX}ENABLE"), &enable)?;
        }
        if let Some(kind) = var("TYPE") {
            self.messaging.kind = kind;
        }
        if let Some(url) = var("URL") {
            self.messaging.url = url;
        }
        if let Some(name) = var("CLIENT_NAME") {
            self.messaging.client_name = Some(name);
        }
        if let Some(username) = var("USERNAME") {
            self.messaging.username = Some(username);
        }
        if let Some(password) = var("PASSWORD") {
            self.messaging.password = Some(password);
        }
        if let Some(poll_timeout) = var("POLL_TIMEOUT") {
            self.messaging.poll_timeout = parse_duration(poll_timeout.trim()).map_err(|e| {
                Error::Configuration(format!("{ENV_PREFIX}POLL_TIMEOUT must be a duration: {e}"))
            })?;
        }
        if let Some(enable) = lookup(TRACING_ENV) {
            self.observability.tracing.enable = parse_bool(TRACING_ENV, &enable)?;
        }

        Ok(self)
    }

    /// Enables messaging on `kind` at `url`.
    #[must_use]
    pub fn with_backend(mut self, kind: BackendKind, url: impl Into<String>) -> Self {
        self.messaging.enable = true;
        self.messaging.kind = kind.to_string();
        self.messaging.url = url.into();
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.messaging.username = Some(username.into());
        self.messaging.password = Some(password.into());
        self
    }

    /// Sets the client name.
    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.messaging.client_name = Some(name.into());
        self
    }

    /// Sets the group-cursor poll timeout.
    #[must_use]
    pub const fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.messaging.poll_timeout = poll_timeout;
        self
    }

    /// Enables or disables trace propagation.
    #[must_use]
    pub const fn with_tracing(mut self, enable: bool) -> Self {
        self.observability.tracing.enable = enable;
        self
    }

    /// The configured backend, or `None` when messaging is disabled.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the backend kind is unsupported or
    /// the URL is missing.
    pub fn validate(&self) -> Result<Option<BackendKind>, Error> {
        if !self.messaging.enable {
            return Ok(None);
        }

        let kind = self.messaging.kind.parse::<BackendKind>()?;

        if self.messaging.url.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "messaging url is required for {kind}"
            )));
        }

        if self.messaging.poll_timeout.is_zero() {
            return Err(Error::Configuration(
                "poll timeout must be greater than zero".to_string(),
            ));
        }

        Ok(Some(kind))
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(Error::Configuration(format!(
            "{name} must be a boolean, got `{other}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use ebrick_events::{ErrorKind, StreamError};

    const CONFIG: &str = r#"
[messaging]
enable = true
type = "redis"
url = "redis://localhost:6379"
username = "app"
password = "secret"
poll_timeout = "250ms"

[observability.tracing]
enable = true
"#;

    #[test]
    fn test_default_config_is_disabled() {
        let config = Config::default();

        assert!(!config.messaging.enable);
        assert_eq!(config.messaging.poll_timeout, DEFAULT_POLL_TIMEOUT);
        assert!(!config.observability.tracing.enable);
        assert_matches!(config.validate(), Ok(None));
    }

    #[test]
    fn test_parse_toml() {
        let config = Config::from_toml(CONFIG).unwrap();

        assert!(config.messaging.enable);
        assert_eq!(config.messaging.kind, "redis");
        assert_eq!(config.messaging.url, "redis://localhost:6379");
        assert_eq!(config.messaging.username.as_deref(), Some("app"));
        assert_eq!(config.messaging.password.as_deref(), Some("secret"));
        assert_eq!(config.messaging.poll_timeout, Duration::from_millis(250));
        assert!(config.observability.tracing.enable);
        assert_matches!(config.validate(), Ok(Some(BackendKind::Redis)));
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = Config::from_toml("[messaging]\ntype = \"nats\"\n").unwrap();

        assert!(!config.messaging.enable);
        assert_eq!(config.messaging.kind, "nats");
        assert_eq!(config.messaging.poll_timeout, DEFAULT_POLL_TIMEOUT);
    }

    #[test]
    fn test_invalid_toml_is_a_configuration_error() {
        let error = Config::from_toml("[messaging\n").unwrap_err();

        assert_matches!(error, Error::ParseConfig(_));
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("ebrick-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, CONFIG).unwrap();

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.messaging.kind, "redis");
    }

    #[test]
    fn test_missing_file_is_a_configuration_error() {
        let path = std::env::temp_dir().join(format!("ebrick-{}.toml", uuid::Uuid::new_v4()));

        let error = Config::from_file(&path).unwrap_err();

        assert_matches!(error, Error::ReadConfig { .. });
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let env = HashMap::from([
            ("MESSAGING_TYPE", "nats"),
            ("MESSAGING_URL", "nats://broker:4222"),
            ("MESSAGING_POLL_TIMEOUT", "50ms"),
            ("OBSERVABILITY_TRACING_ENABLE", "false"),
        ]);

        let config = Config::from_toml(CONFIG)
            .unwrap()
            .apply_overrides(|name| env.get(name).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.messaging.kind, "nats");
        assert_eq!(config.messaging.url, "nats://broker:4222");
        assert_eq!(config.messaging.username.as_deref(), Some("app"));
        assert_eq!(config.messaging.poll_timeout, Duration::from_millis(50));
        assert!(!config.observability.tracing.enable);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let result = Config::default().apply_overrides(|name| {
            (name == "MESSAGING_ENABLE").then(|| "maybe".to_string())
        });

        assert_matches!(result, Err(Error::Configuration(_)));
    }

    #[test]
    fn test_unsupported_kind_is_rejected() {
        let config = Config::default().with_backend(BackendKind::Nats, "nats://localhost:4222");
        let config = Config {
            messaging: MessagingConfig {
                kind: "kafka".to_string(),
                ..config.messaging
            },
            ..config
        };

        let error = config.validate().unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Configuration);
        assert!(error.to_string().contains("kafka"));
    }

    #[test]
    fn test_missing_url_is_rejected() {
        let config = Config::default().with_backend(BackendKind::Redis, "");

        assert_matches!(config.validate(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("NATS".parse::<BackendKind>().unwrap(), BackendKind::Nats);
        assert_eq!(" redis ".parse::<BackendKind>().unwrap(), BackendKind::Redis);
        assert_matches!("".parse::<BackendKind>(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_debug_hides_password() {
        let config = Config::default().with_credentials("app", "secret");

        let debug = format!("{:?}", config.messaging);

        assert!(debug.contains("app"));
        assert!(!debug.contains("secret"));
    }
}

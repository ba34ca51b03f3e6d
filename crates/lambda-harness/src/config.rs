//! Configuration loading and management.
//!
//! Configuration is layered with figment. Sources, later overriding earlier:
//! 1. Default values (compiled in)
//! 2. Config file: `lambda-harness.toml` in the working directory (optional)
//! 3. Environment variables with the `LAMBDA_HARNESS_` prefix, nested with `__`
//!
//! | Variable | Config Path |
//! |----------|-------------|
//! | `LAMBDA_HARNESS_HTTP__HOST` | `http.host` |
//! | `LAMBDA_HARNESS_HTTP__PORT` | `http.port` |
//! | `LAMBDA_HARNESS_POLLER__INTERVAL` | `poller.interval` (ms) |
//! | `LAMBDA_HARNESS_QUEUE__VISIBILITY_TIMEOUT` | `queue.visibility_timeout` (ms) |
//! | `LAMBDA_HARNESS_FUNCTION__REGION` | `function.region` |

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "lambda-harness.toml";
const ENV_PREFIX: &str = "LAMBDA_HARNESS_";

/// Top-level harness configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// HTTP dispatch server settings.
    pub http: HttpConfig,
    /// Queue poll dispatcher settings.
    pub poller: PollerConfig,
    /// In-memory queue service settings.
    pub queue: QueueConfig,
    /// Simulated function environment.
    pub function: FunctionConfig,
}

impl HarnessConfig {
    /// Loads configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Loads configuration using a custom config file path.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed.
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(HarnessConfig::default()));

        if config_path.as_ref().exists() {
            figment = figment.merge(Toml::file(config_path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        Ok(figment.extract()?)
    }

    /// Creates a new config builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// HTTP dispatch server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind. `0` picks any free port.
    pub port: u16,
    /// Stage name reported in the request context.
    pub stage: String,
    /// API identifier reported in the request context.
    pub api_id: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            stage: "local".to_string(),
            api_id: "local-api".to_string(),
        }
    }
}

/// Queue poll dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Sleep between two poll iterations, in milliseconds.
    #[serde(with = "duration_ms")]
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

/// In-memory queue service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a received message stays invisible before redelivery, in milliseconds.
    #[serde(with = "duration_ms")]
    pub visibility_timeout: Duration,
    /// Prefix of generated queue URLs.
    pub base_url: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            base_url: "http://localhost:9324/000000000000".to_string(),
        }
    }
}

/// Simulated function environment used to synthesize contexts and ARNs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionConfig {
    /// AWS region.
    pub region: String,
    /// AWS account ID.
    pub account_id: String,
    /// Function version.
    pub function_version: String,
    /// Function memory size in MB.
    pub memory_size_mb: u32,
    /// Invocation timeout in milliseconds.
    ///
    /// Used for the context deadline only. Handlers are never interrupted.
    #[serde(with = "duration_ms")]
    pub invocation_timeout: Duration,
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            account_id: "123456789012".to_string(),
            function_version: "$LATEST".to_string(),
            memory_size_mb: 128,
            invocation_timeout: Duration::from_millis(3000),
        }
    }
}

/// Builder for constructing configuration programmatically.
#[derive(Debug, Default)]
#[must_use = "builders do nothing unless .build() is called"]
pub struct ConfigBuilder {
    config: HarnessConfig,
}

impl ConfigBuilder {
    /// Creates a new config builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the HTTP host.
    pub fn http_host(mut self, host: impl Into<String>) -> Self {
        self.config.http.host = host.into();
        self
    }

    /// Sets the HTTP port.
    pub fn http_port(mut self, port: u16) -> Self {
        self.config.http.port = port;
        self
    }

    /// Sets the stage reported in HTTP events.
    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.config.http.stage = stage.into();
        self
    }

    /// Sets the sleep between poll iterations.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poller.interval = interval;
        self
    }

    /// Sets the queue visibility timeout.
    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.config.queue.visibility_timeout = timeout;
        self
    }

    /// Sets the AWS region.
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.config.function.region = region.into();
        self
    }

    /// Sets the AWS account ID.
    pub fn account_id(mut self, account_id: impl Into<String>) -> Self {
        self.config.function.account_id = account_id.into();
        self
    }

    /// Sets the invocation timeout used for context deadlines.
    pub fn invocation_timeout(mut self, timeout: Duration) -> Self {
        self.config.function.invocation_timeout = timeout;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> HarnessConfig {
        self.config
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = HarnessConfig::default();

        assert_eq!(config.http.host, "127.0.0.1");
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.http.stage, "local");
        assert_eq!(config.poller.interval, Duration::from_secs(1));
        assert_eq!(config.queue.visibility_timeout, Duration::from_secs(30));
        assert_eq!(config.function.region, "us-east-1");
        assert_eq!(config.function.account_id, "123456789012");
    }

    #[test]
    fn test_config_builder() {
        let config = HarnessConfig::builder()
            .http_host("0.0.0.0")
            .http_port(0)
            .stage("dev")
            .poll_interval(Duration::from_millis(25))
            .visibility_timeout(Duration::ZERO)
            .region("eu-west-2")
            .account_id("000000000000")
            .invocation_timeout(Duration::from_secs(10))
            .build();

        assert_eq!(config.http.host, "0.0.0.0");
        assert_eq!(config.http.port, 0);
        assert_eq!(config.http.stage, "dev");
        assert_eq!(config.poller.interval, Duration::from_millis(25));
        assert_eq!(config.queue.visibility_timeout, Duration::ZERO);
        assert_eq!(config.function.region, "eu-west-2");
        assert_eq!(config.function.account_id, "000000000000");
        assert_eq!(config.function.invocation_timeout, Duration::from_secs(10));
    }

    #[test]
    #[serial]
    fn test_load_from_toml() {
        let toml_content = r#"
[http]
port = 9100
stage = "staging"

[poller]
interval = 250

[queue]
visibility_timeout = 500

[function]
region = "ap-southeast-2"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = HarnessConfig::load_from_path(temp_file.path()).unwrap();

        assert_eq!(config.http.port, 9100);
        assert_eq!(config.http.stage, "staging");
        assert_eq!(config.http.host, "127.0.0.1");
        assert_eq!(config.poller.interval, Duration::from_millis(250));
        assert_eq!(config.queue.visibility_timeout, Duration::from_millis(500));
        assert_eq!(config.function.region, "ap-southeast-2");
    }

    #[test]
    #[serial]
    fn test_load_nonexistent_file_uses_defaults() {
        let config = HarnessConfig::load_from_path("/nonexistent/path/harness.toml").unwrap();

        assert_eq!(config, HarnessConfig::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[http]\nport = 9100\n").unwrap();

        temp_env::with_vars(
            [
                ("LAMBDA_HARNESS_HTTP__PORT", Some("9200")),
                ("LAMBDA_HARNESS_POLLER__INTERVAL", Some("40")),
            ],
            || {
                let config = HarnessConfig::load_from_path(temp_file.path()).unwrap();
                assert_eq!(config.http.port, 9200);
                assert_eq!(config.poller.interval, Duration::from_millis(40));
            },
        );
    }

    #[test]
    #[serial]
    fn test_invalid_value_is_reported() {
        temp_env::with_var("LAMBDA_HARNESS_HTTP__PORT", Some("not-a-port"), || {
            let result = HarnessConfig::load_from_path("/nonexistent/path/harness.toml");
            assert!(matches!(result, Err(ConfigError::Figment(_))));
        });
    }
}

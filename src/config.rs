//! Configuration module for the log collector.
//!
//! All settings come from `LOG_COLLECTOR_*` environment variables and fall back
//! to defaults suitable for a single collector host.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default sink endpoint (a Logstash HTTP input).
const DEFAULT_SINK_URL: &str = "http://logstash:5000/";

/// Default network status service used to build the endpoint directory.
const DEFAULT_DIRECTORY_URL: &str = "https://status-v2.herokuapp.com/json";

/// Default root of the offset ledger.
const DEFAULT_WORKSPACE: &str = "./workspace";

/// Port on which nodes expose their log service.
const DEFAULT_NODE_PORT: u16 = 8666;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const MIN_POLL_INTERVAL_SECS: u64 = 1;
const MAX_POLL_INTERVAL_SECS: u64 = 3_600;

const DEFAULT_START_JITTER_SECS: u64 = 30;
const MAX_START_JITTER_SECS: u64 = 600;

const DEFAULT_RETRY_BACKOFF_SECS: u64 = 5;
const MIN_RETRY_BACKOFF_SECS: u64 = 1;
const MAX_RETRY_BACKOFF_SECS: u64 = 300;

/// Directory re-sync once per day.
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 24 * 60 * 60;
const MIN_RECONCILE_INTERVAL_SECS: u64 = 60;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;

/// Error type for configuration loading failures
#[derive(Debug, Error)]
#[error("Configuration error for {env_var}: {message}")]
pub struct ConfigError {
    pub message: String,
    pub env_var: String,
}

impl ConfigError {
    fn new(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: env_var.to_string(),
        }
    }
}

/// Configuration for the collector process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Sink URL receiving one POST per record
    pub sink_url: String,

    /// Root directory of the offset ledger
    pub workspace_path: PathBuf,

    /// Delay between the end of one discovery tick and the start of the next
    pub poll_interval: Duration,

    /// Upper bound of the random delay before a pod's first tick
    pub start_jitter: Duration,

    /// Fixed delay before an undelivered record is retried
    pub retry_backoff: Duration,

    /// How often the supervisor re-fetches the endpoint directory
    pub reconcile_interval: Duration,

    /// Timeout for discovery and sink requests (batch streams are unbounded)
    pub request_timeout: Duration,

    /// How often the stats reporter logs a fleet summary
    pub stats_interval: Duration,

    /// Network status service URL
    pub directory_url: String,

    /// Static endpoint list; takes precedence over `directory_url`
    pub directory_file: Option<PathBuf>,

    /// Port of the log service on every node
    pub node_port: u16,

    /// Whether sources honour `&start=N` on batch streams
    pub start_offset_supported: bool,

    /// Mark the existing backlog as delivered when an endpoint is first seen
    pub skip_history: bool,
}

/// The subset of configuration a single pod needs.
#[derive(Debug, Clone)]
pub struct PodConfig {
    pub poll_interval: Duration,
    pub start_jitter: Duration,
    pub retry_backoff: Duration,
    pub request_timeout: Duration,
    pub start_offset_supported: bool,
    pub skip_history: bool,
}

impl Default for PodConfig {
    fn default() -> Self {
        Config::default().pod_config()
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a numeric or boolean variable cannot be
    /// parsed or falls outside its allowed range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let sink_url =
            env::var("LOG_COLLECTOR_SINK_URL").unwrap_or_else(|_| DEFAULT_SINK_URL.to_string());
        if sink_url.trim().is_empty() {
            return Err(ConfigError::new(
                "LOG_COLLECTOR_SINK_URL",
                "sink URL must not be empty",
            ));
        }

        let workspace_path = env::var("LOG_COLLECTOR_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_WORKSPACE));

        let poll_interval = Self::parse_secs(
            "LOG_COLLECTOR_POLL_INTERVAL_SECS",
            DEFAULT_POLL_INTERVAL_SECS,
            MIN_POLL_INTERVAL_SECS,
            MAX_POLL_INTERVAL_SECS,
        )?;
        let start_jitter = Self::parse_secs(
            "LOG_COLLECTOR_START_JITTER_SECS",
            DEFAULT_START_JITTER_SECS,
            0,
            MAX_START_JITTER_SECS,
        )?;
        let retry_backoff = Self::parse_secs(
            "LOG_COLLECTOR_RETRY_BACKOFF_SECS",
            DEFAULT_RETRY_BACKOFF_SECS,
            MIN_RETRY_BACKOFF_SECS,
            MAX_RETRY_BACKOFF_SECS,
        )?;
        let reconcile_interval = Self::parse_secs(
            "LOG_COLLECTOR_RECONCILE_INTERVAL_SECS",
            DEFAULT_RECONCILE_INTERVAL_SECS,
            MIN_RECONCILE_INTERVAL_SECS,
            u64::MAX,
        )?;
        let request_timeout = Self::parse_secs(
            "LOG_COLLECTOR_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
            1,
            600,
        )?;
        let stats_interval = Self::parse_secs(
            "LOG_COLLECTOR_STATS_INTERVAL_SECS",
            DEFAULT_STATS_INTERVAL_SECS,
            1,
            3_600,
        )?;

        let directory_url = env::var("LOG_COLLECTOR_DIRECTORY_URL")
            .unwrap_or_else(|_| DEFAULT_DIRECTORY_URL.to_string());
        let directory_file = env::var("LOG_COLLECTOR_DIRECTORY_FILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let node_port = match env::var("LOG_COLLECTOR_NODE_PORT") {
            Ok(value) => value.parse::<u16>().map_err(|_| {
                ConfigError::new(
                    "LOG_COLLECTOR_NODE_PORT",
                    format!("'{}' is not a valid port", value),
                )
            })?,
            Err(_) => DEFAULT_NODE_PORT,
        };

        let start_offset_supported = Self::parse_bool("LOG_COLLECTOR_START_OFFSET", true)?;
        let skip_history = Self::parse_bool("LOG_COLLECTOR_SKIP_HISTORY", false)?;

        Ok(Self {
            sink_url,
            workspace_path,
            poll_interval: Duration::from_secs(poll_interval),
            start_jitter: Duration::from_secs(start_jitter),
            retry_backoff: Duration::from_secs(retry_backoff),
            reconcile_interval: Duration::from_secs(reconcile_interval),
            request_timeout: Duration::from_secs(request_timeout),
            stats_interval: Duration::from_secs(stats_interval),
            directory_url,
            directory_file,
            node_port,
            start_offset_supported,
            skip_history,
        })
    }

    /// Settings handed to every pod the supervisor starts.
    pub fn pod_config(&self) -> PodConfig {
        PodConfig {
            poll_interval: self.poll_interval,
            start_jitter: self.start_jitter,
            retry_backoff: self.retry_backoff,
            request_timeout: self.request_timeout,
            start_offset_supported: self.start_offset_supported,
            skip_history: self.skip_history,
        }
    }

    /// Parse a number of seconds from an environment variable with range checks.
    fn parse_secs(env_var: &str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
        match env::var(env_var) {
            Ok(value) => {
                let secs: u64 = value.trim().parse().map_err(|_| {
                    ConfigError::new(env_var, format!("'{}' is not a valid number", value))
                })?;

                if secs < min {
                    return Err(ConfigError::new(
                        env_var,
                        format!("{} is below minimum ({}s)", secs, min),
                    ));
                }

                if secs > max {
                    return Err(ConfigError::new(
                        env_var,
                        format!("{} exceeds maximum ({}s)", secs, max),
                    ));
                }

                Ok(secs)
            }
            Err(_) => Ok(default),
        }
    }

    fn parse_bool(env_var: &str, default: bool) -> Result<bool, ConfigError> {
        match env::var(env_var) {
            Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::new(
                    env_var,
                    format!("'{}' is not a valid boolean", value),
                )),
            },
            Err(_) => Ok(default),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sink_url: DEFAULT_SINK_URL.to_string(),
            workspace_path: PathBuf::from(DEFAULT_WORKSPACE),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            start_jitter: Duration::from_secs(DEFAULT_START_JITTER_SECS),
            retry_backoff: Duration::from_secs(DEFAULT_RETRY_BACKOFF_SECS),
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            stats_interval: Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS),
            directory_url: DEFAULT_DIRECTORY_URL.to_string(),
            directory_file: None,
            node_port: DEFAULT_NODE_PORT,
            start_offset_supported: true,
            skip_history: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    // Restores an environment variable when dropped
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sink_url, "http://logstash:5000/");
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.start_jitter, Duration::from_secs(30));
        assert_eq!(config.retry_backoff, Duration::from_secs(5));
        assert_eq!(config.reconcile_interval, Duration::from_secs(86_400));
        assert_eq!(config.node_port, 8666);
        assert!(config.start_offset_supported);
        assert!(!config.skip_history);
    }

    #[test]
    #[serial]
    fn test_config_from_env_with_defaults() {
        let _g1 = EnvGuard::remove("LOG_COLLECTOR_SINK_URL");
        let _g2 = EnvGuard::remove("LOG_COLLECTOR_POLL_INTERVAL_SECS");
        let _g3 = EnvGuard::remove("LOG_COLLECTOR_DIRECTORY_FILE");
        let _g4 = EnvGuard::remove("LOG_COLLECTOR_START_OFFSET");

        let config = Config::from_env().expect("Should load with defaults");
        assert_eq!(config.sink_url, "http://logstash:5000/");
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert!(config.directory_file.is_none());
        assert!(config.start_offset_supported);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        let _g1 = EnvGuard::set("LOG_COLLECTOR_SINK_URL", "http://sink:9000/ingest");
        let _g2 = EnvGuard::set("LOG_COLLECTOR_POLL_INTERVAL_SECS", "15");
        let _g3 = EnvGuard::set("LOG_COLLECTOR_WORKSPACE", "/var/lib/collector");
        let _g4 = EnvGuard::set("LOG_COLLECTOR_DIRECTORY_FILE", "/etc/collector/pods.json");
        let _g5 = EnvGuard::set("LOG_COLLECTOR_START_OFFSET", "false");
        let _g6 = EnvGuard::set("LOG_COLLECTOR_SKIP_HISTORY", "yes");

        let config = Config::from_env().expect("Should load custom values");
        assert_eq!(config.sink_url, "http://sink:9000/ingest");
        assert_eq!(config.poll_interval, Duration::from_secs(15));
        assert_eq!(config.workspace_path, PathBuf::from("/var/lib/collector"));
        assert_eq!(
            config.directory_file,
            Some(PathBuf::from("/etc/collector/pods.json"))
        );
        assert!(!config.start_offset_supported);
        assert!(config.skip_history);

        let pod = config.pod_config();
        assert_eq!(pod.poll_interval, Duration::from_secs(15));
        assert!(pod.skip_history);
    }

    #[test]
    #[serial]
    fn test_invalid_poll_interval() {
        let _guard = EnvGuard::set("LOG_COLLECTOR_POLL_INTERVAL_SECS", "soon");

        let err = Config::from_env().unwrap_err();
        assert_eq!(err.env_var, "LOG_COLLECTOR_POLL_INTERVAL_SECS");
        assert!(err.message.contains("not a valid number"));
    }

    #[test]
    #[serial]
    fn test_retry_backoff_below_min() {
        let _guard = EnvGuard::set("LOG_COLLECTOR_RETRY_BACKOFF_SECS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("below minimum"));
    }

    #[test]
    #[serial]
    fn test_start_jitter_exceeds_max() {
        let _guard = EnvGuard::set("LOG_COLLECTOR_START_JITTER_SECS", "9999");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("exceeds maximum"));
    }

    #[test]
    #[serial]
    fn test_invalid_boolean() {
        let _guard = EnvGuard::set("LOG_COLLECTOR_SKIP_HISTORY", "maybe");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("not a valid boolean"));
    }

    #[test]
    #[serial]
    fn test_invalid_node_port() {
        let _guard = EnvGuard::set("LOG_COLLECTOR_NODE_PORT", "70000");

        let err = Config::from_env().unwrap_err();
        assert_eq!(err.env_var, "LOG_COLLECTOR_NODE_PORT");
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::new("TEST_VAR", "test error");
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );
    }
}

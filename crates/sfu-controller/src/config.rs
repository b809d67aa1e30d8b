//! SFU Controller configuration.
//!
//! Configuration is loaded from environment variables.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default IP the media worker listens on for RTC traffic.
pub const DEFAULT_RTC_LISTEN_IP: &str = "0.0.0.0";

/// Default transport connect timeout in seconds.
pub const DEFAULT_TRANSPORT_CONNECT_TIMEOUT_SECONDS: u64 = 15;

/// Default engine operation timeout in seconds.
pub const DEFAULT_ENGINE_OPERATION_TIMEOUT_SECONDS: u64 = 15;

/// Upper bound for both timeouts above.
pub const MAX_TIMEOUT_SECONDS: u64 = 60;

/// Default settle delay before a paused consumer is resumed.
pub const DEFAULT_CONSUMER_RESUME_DELAY_MS: u64 = 750;

/// Default retry window after an ICE/DTLS failure.
pub const DEFAULT_ICE_FAILURE_GRACE_SECONDS: u64 = 30;

/// Default initial delay before restarting a dead media worker.
pub const DEFAULT_ENGINE_RESTART_DELAY_MS: u64 = 1000;

/// Default cap on the worker restart backoff.
pub const DEFAULT_ENGINE_RESTART_MAX_DELAY_MS: u64 = 30_000;

/// Default room capacity.
pub const DEFAULT_MAX_PEERS_PER_ROOM: usize = 50;

/// Default SFU instance ID prefix.
pub const DEFAULT_SFU_ID_PREFIX: &str = "sfu";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// SFU Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Media engine worker executable.
    pub worker_bin: String,

    /// Extra arguments passed to the worker.
    pub worker_args: Vec<String>,

    /// Unique identifier for this SFU instance.
    pub sfu_id: String,

    /// WebSocket signaling bind address (default: "0.0.0.0:8080").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// IP the worker binds RTC sockets on.
    pub rtc_listen_ip: String,

    /// Public address announced in ICE candidates, if different from the listen IP.
    pub rtc_announced_address: Option<String>,

    pub transport_connect_timeout_seconds: u64,

    pub engine_operation_timeout_seconds: u64,

    pub consumer_resume_delay_ms: u64,

    pub ice_failure_grace_seconds: u64,

    pub engine_restart_delay_ms: u64,

    pub engine_restart_max_delay_ms: u64,

    /// Maximum peers in one room's video session.
    pub max_peers_per_room: usize,

    pub log_format: LogFormat,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Per-peer timing and capacity settings handed to the actors.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub transport_connect_timeout: Duration,
    pub engine_operation_timeout: Duration,
    pub consumer_resume_delay: Duration,
    pub ice_failure_grace: Duration,
    pub max_peers_per_room: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            transport_connect_timeout: Duration::from_secs(
                DEFAULT_TRANSPORT_CONNECT_TIMEOUT_SECONDS,
            ),
            engine_operation_timeout: Duration::from_secs(DEFAULT_ENGINE_OPERATION_TIMEOUT_SECONDS),
            consumer_resume_delay: Duration::from_millis(DEFAULT_CONSUMER_RESUME_DELAY_MS),
            ice_failure_grace: Duration::from_secs(DEFAULT_ICE_FAILURE_GRACE_SECONDS),
            max_peers_per_room: DEFAULT_MAX_PEERS_PER_ROOM,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let worker_bin = vars
            .get("SFU_WORKER_BIN")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("SFU_WORKER_BIN".to_string()))?
            .clone();

        let worker_args = vars
            .get("SFU_WORKER_ARGS")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let signaling_bind_address = vars
            .get("SFU_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let rtc_listen_ip = vars
            .get("SFU_RTC_LISTEN_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_RTC_LISTEN_IP.to_string());

        let rtc_announced_address = vars
            .get("SFU_RTC_ANNOUNCED_ADDRESS")
            .filter(|s| !s.trim().is_empty())
            .cloned();

        let transport_connect_timeout_seconds = parse_bounded(
            vars,
            "SFU_TRANSPORT_CONNECT_TIMEOUT_SECONDS",
            DEFAULT_TRANSPORT_CONNECT_TIMEOUT_SECONDS,
            1,
            MAX_TIMEOUT_SECONDS,
        )?;

        let engine_operation_timeout_seconds = parse_bounded(
            vars,
            "SFU_ENGINE_OPERATION_TIMEOUT_SECONDS",
            DEFAULT_ENGINE_OPERATION_TIMEOUT_SECONDS,
            1,
            MAX_TIMEOUT_SECONDS,
        )?;

        let consumer_resume_delay_ms = parse_bounded(
            vars,
            "SFU_CONSUMER_RESUME_DELAY_MS",
            DEFAULT_CONSUMER_RESUME_DELAY_MS,
            0,
            10_000,
        )?;

        let ice_failure_grace_seconds = parse_bounded(
            vars,
            "SFU_ICE_FAILURE_GRACE_SECONDS",
            DEFAULT_ICE_FAILURE_GRACE_SECONDS,
            1,
            600,
        )?;

        let engine_restart_delay_ms = parse_bounded(
            vars,
            "SFU_ENGINE_RESTART_DELAY_MS",
            DEFAULT_ENGINE_RESTART_DELAY_MS,
            1,
            u64::MAX,
        )?;

        let engine_restart_max_delay_ms = parse_bounded(
            vars,
            "SFU_ENGINE_RESTART_MAX_DELAY_MS",
            DEFAULT_ENGINE_RESTART_MAX_DELAY_MS,
            1,
            u64::MAX,
        )?;

        if engine_restart_max_delay_ms < engine_restart_delay_ms {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_ENGINE_RESTART_MAX_DELAY_MS ({engine_restart_max_delay_ms}) must not be \
                 less than SFU_ENGINE_RESTART_DELAY_MS ({engine_restart_delay_ms})"
            )));
        }

        let max_peers_per_room = match vars.get("SFU_MAX_PEERS_PER_ROOM") {
            Some(value) => {
                let parsed: usize = value.parse().map_err(|e| {
                    ConfigError::InvalidValue(format!(
                        "SFU_MAX_PEERS_PER_ROOM must be a valid positive integer, got '{value}': {e}"
                    ))
                })?;
                if parsed == 0 {
                    return Err(ConfigError::InvalidValue(
                        "SFU_MAX_PEERS_PER_ROOM must be greater than 0".to_string(),
                    ));
                }
                parsed
            }
            None => DEFAULT_MAX_PEERS_PER_ROOM,
        };

        let log_format = match vars.get("SFU_LOG_FORMAT").map(String::as_str) {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "SFU_LOG_FORMAT must be 'text' or 'json', got '{other}'"
                )))
            }
        };

        // Generate SFU instance ID
        let sfu_id = vars.get("SFU_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SFU_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            worker_bin,
            worker_args,
            sfu_id,
            signaling_bind_address,
            health_bind_address,
            rtc_listen_ip,
            rtc_announced_address,
            transport_connect_timeout_seconds,
            engine_operation_timeout_seconds,
            consumer_resume_delay_ms,
            ice_failure_grace_seconds,
            engine_restart_delay_ms,
            engine_restart_max_delay_ms,
            max_peers_per_room,
            log_format,
        })
    }

    /// Timing and capacity settings for room and peer actors.
    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            transport_connect_timeout: Duration::from_secs(self.transport_connect_timeout_seconds),
            engine_operation_timeout: Duration::from_secs(self.engine_operation_timeout_seconds),
            consumer_resume_delay: Duration::from_millis(self.consumer_resume_delay_ms),
            ice_failure_grace: Duration::from_secs(self.ice_failure_grace_seconds),
            max_peers_per_room: self.max_peers_per_room,
        }
    }
}

fn parse_bounded(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    let Some(raw) = vars.get(name) else {
        return Ok(default);
    };

    let value: u64 = raw.parse().map_err(|e| {
        ConfigError::InvalidValue(format!(
            "{name} must be a valid non-negative integer, got '{raw}': {e}"
        ))
    })?;

    if value < min {
        return Err(ConfigError::InvalidValue(format!(
            "{name} must be at least {min}, got {value}"
        )));
    }
    if value > max {
        return Err(ConfigError::InvalidValue(format!(
            "{name} must not exceed {max}, got {value}"
        )));
    }

    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "SFU_WORKER_BIN".to_string(),
            "/usr/local/bin/media-worker".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let vars = base_vars();

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.worker_bin, "/usr/local/bin/media-worker");
        assert!(config.worker_args.is_empty());
        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.rtc_listen_ip, DEFAULT_RTC_LISTEN_IP);
        assert!(config.rtc_announced_address.is_none());
        assert_eq!(
            config.transport_connect_timeout_seconds,
            DEFAULT_TRANSPORT_CONNECT_TIMEOUT_SECONDS
        );
        assert_eq!(
            config.engine_operation_timeout_seconds,
            DEFAULT_ENGINE_OPERATION_TIMEOUT_SECONDS
        );
        assert_eq!(
            config.consumer_resume_delay_ms,
            DEFAULT_CONSUMER_RESUME_DELAY_MS
        );
        assert_eq!(
            config.ice_failure_grace_seconds,
            DEFAULT_ICE_FAILURE_GRACE_SECONDS
        );
        assert_eq!(config.max_peers_per_room, DEFAULT_MAX_PEERS_PER_ROOM);
        assert_eq!(config.log_format, LogFormat::Text);
        // SFU ID should be auto-generated
        assert!(config.sfu_id.starts_with("sfu-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert(
            "SFU_WORKER_ARGS".to_string(),
            "--log-level warn  --rtc-min-port 40000".to_string(),
        );
        vars.insert(
            "SFU_SIGNALING_BIND_ADDRESS".to_string(),
            "127.0.0.1:9000".to_string(),
        );
        vars.insert(
            "SFU_RTC_ANNOUNCED_ADDRESS".to_string(),
            "203.0.113.7".to_string(),
        );
        vars.insert(
            "SFU_TRANSPORT_CONNECT_TIMEOUT_SECONDS".to_string(),
            "20".to_string(),
        );
        vars.insert("SFU_CONSUMER_RESUME_DELAY_MS".to_string(), "500".to_string());
        vars.insert("SFU_MAX_PEERS_PER_ROOM".to_string(), "8".to_string());
        vars.insert("SFU_LOG_FORMAT".to_string(), "json".to_string());
        vars.insert("SFU_ID".to_string(), "sfu-custom-001".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(
            config.worker_args,
            vec!["--log-level", "warn", "--rtc-min-port", "40000"]
        );
        assert_eq!(config.signaling_bind_address, "127.0.0.1:9000");
        assert_eq!(config.rtc_announced_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(config.transport_connect_timeout_seconds, 20);
        assert_eq!(config.consumer_resume_delay_ms, 500);
        assert_eq!(config.max_peers_per_room, 8);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.sfu_id, "sfu-custom-001");
    }

    #[test]
    fn test_from_vars_missing_worker_bin() {
        let mut vars = base_vars();
        vars.remove("SFU_WORKER_BIN");

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(name)) if name == "SFU_WORKER_BIN"));
    }

    #[test]
    fn test_timeout_out_of_range_rejected() {
        let mut vars = base_vars();
        vars.insert(
            "SFU_TRANSPORT_CONNECT_TIMEOUT_SECONDS".to_string(),
            "0".to_string(),
        );
        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("must be at least 1"))
        );

        let mut vars = base_vars();
        vars.insert(
            "SFU_ENGINE_OPERATION_TIMEOUT_SECONDS".to_string(),
            "61".to_string(),
        );
        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("must not exceed 60"))
        );
    }

    #[test]
    fn test_non_numeric_value_rejected() {
        let mut vars = base_vars();
        vars.insert(
            "SFU_ICE_FAILURE_GRACE_SECONDS".to_string(),
            "soon".to_string(),
        );
        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("must be a valid"))
        );
    }

    #[test]
    fn test_restart_max_delay_below_initial_rejected() {
        let mut vars = base_vars();
        vars.insert("SFU_ENGINE_RESTART_DELAY_MS".to_string(), "5000".to_string());
        vars.insert(
            "SFU_ENGINE_RESTART_MAX_DELAY_MS".to_string(),
            "1000".to_string(),
        );
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_zero_room_capacity_rejected() {
        let mut vars = base_vars();
        vars.insert("SFU_MAX_PEERS_PER_ROOM".to_string(), "0".to_string());
        assert!(
            matches!(Config::from_vars(&vars), Err(ConfigError::InvalidValue(msg)) if msg.contains("greater than 0"))
        );
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let mut vars = base_vars();
        vars.insert("SFU_LOG_FORMAT".to_string(), "xml".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_session_settings_conversion() {
        let mut vars = base_vars();
        vars.insert("SFU_CONSUMER_RESUME_DELAY_MS".to_string(), "250".to_string());
        let config = Config::from_vars(&vars).unwrap();

        let settings = config.session_settings();
        assert_eq!(settings.consumer_resume_delay, Duration::from_millis(250));
        assert_eq!(
            settings.transport_connect_timeout,
            Duration::from_secs(DEFAULT_TRANSPORT_CONNECT_TIMEOUT_SECONDS)
        );
        assert_eq!(settings.max_peers_per_room, DEFAULT_MAX_PEERS_PER_ROOM);
    }
}

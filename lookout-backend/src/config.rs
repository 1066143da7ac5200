use std::env::var;
use std::time::Duration;

use dotenvy::dotenv;

/// Application configuration with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    /// Request body size limit in bytes
    /// Env: REQUEST_BODY_LIMIT (default: 1048576 = 1MB)
    pub request_body_limit: usize,

    /// Request timeout in seconds
    /// Env: REQUEST_TIMEOUT_SECS (default: 30)
    pub request_timeout: Duration,

    /// Server port
    /// Env: PORT (default: 3000)
    pub port: u16,

    /// Database file path
    /// Env: DATABASE_PATH (default: "lookout.db")
    pub database_path: String,

    /// Delay between a player joining and the first ping sample
    /// Env: PING_LOGIN_DELAY_SECS (default: 30, 7200 or more disables ping tracking)
    pub ping_login_delay: Duration,

    /// Ping samples per stored aggregate
    /// Env: PING_WINDOW (default: 30)
    pub ping_window: usize,

    /// Performance samples per stored record
    /// Env: TPS_WINDOW (default: 60)
    pub tps_window: usize,

    /// Delay between server registration and the first performance sample
    /// Env: TPS_STARTUP_DELAY_SECS (default: 60)
    pub tps_startup_delay: Duration,

    /// Sampling tick for both collectors
    /// Env: SAMPLE_INTERVAL_MS (default: 1000)
    pub sample_interval: Duration,

    /// Inactivity after which session time counts as AFK
    /// Env: AFK_THRESHOLD_SECS (default: 180)
    pub afk_threshold: Duration,

    /// Idle time before a cached view is dropped
    /// Env: JSON_CACHE_TTL_SECS (default: 60)
    pub json_cache_ttl: Duration,

    /// Interval of the cache cleanup task
    /// Env: JSON_CACHE_CLEANUP_SECS (default: 60)
    pub json_cache_cleanup: Duration,

    /// How long stored sessions and samples are kept
    /// Env: DATA_RETENTION_DAYS (default: 30)
    pub data_retention: Duration,

    /// Interval of the retention task
    /// Env: RETENTION_INTERVAL_SECS (default: 3600)
    pub retention_interval: Duration,

    /// Upper bound for persisting open sessions on shutdown
    /// Env: SHUTDOWN_TIMEOUT_SECS (default: 1200)
    pub shutdown_timeout: Duration,

    /// Concurrent non-critical jobs before new ones are dropped
    /// Env: NON_CRITICAL_LIMIT (default: 64)
    pub non_critical_limit: usize,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let _ = dotenv(); //for debugging mostly
        let defaults = Self::default();
        Self {
            request_body_limit: env_or_default("REQUEST_BODY_LIMIT", defaults.request_body_limit),
            request_timeout: env_secs("REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            port: env_or_default("PORT", defaults.port),
            database_path: env_or_default_string("DATABASE_PATH", &defaults.database_path),
            ping_login_delay: env_secs("PING_LOGIN_DELAY_SECS", defaults.ping_login_delay),
            ping_window: env_or_default("PING_WINDOW", defaults.ping_window),
            tps_window: env_or_default("TPS_WINDOW", defaults.tps_window),
            tps_startup_delay: env_secs("TPS_STARTUP_DELAY_SECS", defaults.tps_startup_delay),
            sample_interval: Duration::from_millis(env_or_default(
                "SAMPLE_INTERVAL_MS",
                defaults.sample_interval.as_millis() as u64,
            )),
            afk_threshold: env_secs("AFK_THRESHOLD_SECS", defaults.afk_threshold),
            json_cache_ttl: env_secs("JSON_CACHE_TTL_SECS", defaults.json_cache_ttl),
            json_cache_cleanup: env_secs("JSON_CACHE_CLEANUP_SECS", defaults.json_cache_cleanup),
            data_retention: Duration::from_secs(
                env_or_default("DATA_RETENTION_DAYS", 30u64) * 24 * 60 * 60,
            ),
            retention_interval: env_secs("RETENTION_INTERVAL_SECS", defaults.retention_interval),
            shutdown_timeout: env_secs("SHUTDOWN_TIMEOUT_SECS", defaults.shutdown_timeout),
            non_critical_limit: env_or_default("NON_CRITICAL_LIMIT", defaults.non_critical_limit),
        }
    }
}

impl Default for Config {
    /// Create configuration with all default values
    fn default() -> Self {
        Self {
            request_body_limit: 1024 * 1024, // 1 MB
            request_timeout: Duration::from_secs(30),
            port: 3000,
            database_path: "lookout.db".to_string(),
            ping_login_delay: Duration::from_secs(30),
            ping_window: 30,
            tps_window: 60,
            tps_startup_delay: Duration::from_secs(60),
            sample_interval: Duration::from_millis(1000),
            afk_threshold: Duration::from_secs(180),
            json_cache_ttl: Duration::from_secs(60),
            json_cache_cleanup: Duration::from_secs(60),
            data_retention: Duration::from_secs(30 * 24 * 60 * 60),
            retention_interval: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(20 * 60),
            non_critical_limit: 64,
        }
    }
}

/// Parse environment variable or return default value
fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

/// Parse a whole number of seconds or return default value
fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or_default(key, default.as_secs()))
}

/// Parse environment variable string or return default value
fn env_or_default_string(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.request_body_limit, 1024 * 1024);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.port, 3000);
        assert_eq!(config.database_path, "lookout.db");
        assert_eq!(config.ping_login_delay, Duration::from_secs(30));
        assert_eq!(config.ping_window, 30);
        assert_eq!(config.tps_window, 60);
        assert_eq!(config.afk_threshold, Duration::from_secs(180));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1200));
        assert_eq!(config.non_critical_limit, 64);
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        // Keys no test sets, so parallel tests cannot interfere
        assert_eq!(env_or_default("LOOKOUT_TEST_UNSET_NUMBER", 7u16), 7);
        assert_eq!(
            env_secs("LOOKOUT_TEST_UNSET_SECS", Duration::from_secs(5)),
            Duration::from_secs(5)
        );
        assert_eq!(env_or_default_string("LOOKOUT_TEST_UNSET_PATH", "x.db"), "x.db");
    }
}

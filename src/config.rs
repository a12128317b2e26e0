//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub read_status: ReadStatusConfig,
    pub notifier: NotifierConfig,
    pub realtime: RealtimeConfig,
    pub pagination: PaginationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Read-cursor write policy
#[derive(Debug, Clone, Deserialize)]
pub struct ReadStatusConfig {
    /// Default debounce before the cursor upsert is issued
    pub debounce_ms: u64,
    /// Attempts per write before rolling back (1 = no retry)
    pub max_attempts: u32,
    /// Linear backoff between attempts
    pub retry_backoff_ms: u64,
}

impl ReadStatusConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Toast deduplication
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Window during which repeated failures for one item show a single toast
    pub dedupe_window_ms: u64,
    /// Maximum number of keys tracked in memory
    pub max_tracked_keys: usize,
}

impl NotifierConfig {
    pub fn dedupe_window(&self) -> Duration {
        Duration::from_millis(self.dedupe_window_ms)
    }
}

/// Realtime change feed configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// Broadcast buffer before slow listeners start lagging
    pub channel_capacity: usize,
    /// Pause before a dropped listener resubscribes
    pub resubscribe_delay_ms: u64,
    /// Interval of the full unread refresh (0 disables it)
    pub refresh_interval_seconds: u64,
    /// Close sessions with no open stream after this long without a
    /// request (0 keeps them until shutdown)
    pub session_idle_seconds: u64,
}

impl RealtimeConfig {
    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }

    pub fn session_idle(&self) -> Option<Duration> {
        (self.session_idle_seconds > 0).then(|| Duration::from_secs(self.session_idle_seconds))
    }
}

/// Message history paging
#[derive(Debug, Clone, Deserialize)]
pub struct PaginationConfig {
    pub page_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (VERSUS__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("database.path", "data/versus.db")?
            .set_default("read_status.debounce_ms", 0)?
            .set_default("read_status.max_attempts", 1)?
            .set_default("read_status.retry_backoff_ms", 250)?
            .set_default("notifier.dedupe_window_ms", 5000)?
            .set_default("notifier.max_tracked_keys", 1000)?
            .set_default("realtime.channel_capacity", 1024)?
            .set_default("realtime.resubscribe_delay_ms", 500)?
            .set_default("realtime.refresh_interval_seconds", 300)?
            .set_default("realtime.session_idle_seconds", 900)?
            .set_default("pagination.page_size", crate::chat::DEFAULT_PAGE_SIZE as i64)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("VERSUS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.pagination.page_size == 0 {
            return Err(crate::error::AppError::Config(
                "pagination.page_size must be greater than 0".to_string(),
            ));
        }

        if self.realtime.channel_capacity == 0 {
            return Err(crate::error::AppError::Config(
                "realtime.channel_capacity must be greater than 0".to_string(),
            ));
        }

        if self.read_status.max_attempts == 0 {
            return Err(crate::error::AppError::Config(
                "read_status.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.realtime.refresh_interval_seconds == 0 {
            tracing::warn!("realtime.refresh_interval_seconds=0; periodic unread refresh disabled");
        }

        Ok(())
    }

    /// Configuration suitable for tests and local experiments.
    pub fn for_database(path: PathBuf) -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            database: DatabaseConfig { path },
            read_status: ReadStatusConfig {
                debounce_ms: 0,
                max_attempts: 1,
                retry_backoff_ms: 250,
            },
            notifier: NotifierConfig {
                dedupe_window_ms: 5000,
                max_tracked_keys: 1000,
            },
            realtime: RealtimeConfig {
                channel_capacity: 1024,
                resubscribe_delay_ms: 10,
                refresh_interval_seconds: 0,
                session_idle_seconds: 0,
            },
            pagination: PaginationConfig {
                page_size: crate::chat::DEFAULT_PAGE_SIZE,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig::for_database(PathBuf::from("/tmp/versus-test.db"))
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_page_size() {
        let mut config = valid_config();
        config.pagination.page_size = 0;

        let error = config
            .validate()
            .expect_err("an empty page size must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message) if message.contains("pagination.page_size")
        ));
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let mut config = valid_config();
        config.read_status.max_attempts = 0;

        let error = config
            .validate()
            .expect_err("a write policy without attempts must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message) if message.contains("read_status.max_attempts")
        ));
    }

    #[test]
    fn durations_are_derived_from_millis() {
        let config = valid_config();
        assert_eq!(config.read_status.debounce(), Duration::ZERO);
        assert_eq!(config.notifier.dedupe_window(), Duration::from_secs(5));
        assert_eq!(config.realtime.resubscribe_delay(), Duration::from_millis(10));
        assert_eq!(config.realtime.session_idle(), None);
    }
}

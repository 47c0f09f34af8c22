//! Configuration management for autoquest
//!
//! All configuration is loaded from `./config/autoquest.toml`.
//! No hardcoded defaults exist in source code - all defaults are in the config template.

use serde::Deserialize;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration file path relative to working directory
pub const CONFIG_PATH: &str = "./config/autoquest.toml";

/// Default configuration file content - this is the ONLY place defaults exist
pub const DEFAULT_CONFIG: &str = include_str!("../config/autoquest.toml");

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] io::Error),

    #[error("Failed to parse configuration file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid URL in '{field}': {url}")]
    InvalidUrl { field: String, url: String },

    #[error("Configuration field '{field}' cannot be empty or zero")]
    EmptyRequired { field: String },

    #[error("Configuration field '{field}' out of range: {reason}")]
    OutOfRange { field: String, reason: String },
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub browser: BrowserConfig,
    pub query: QueryConfig,
    pub retry: RetryConfig,
    pub storage: StorageConfig,
}

/// Browser session configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    pub assistant_url: String,
    pub debug_port: u16,
    pub attach_timeout_secs: u64,
    pub response_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub stability_checks: u32,
    pub min_response_chars: usize,
    pub accept_partial_on_timeout: bool,
    pub activity_timeout_secs: u64,
    pub input_selectors: Vec<String>,
    pub response_selectors: Vec<String>,
    pub new_thread_selectors: Vec<String>,
}

impl BrowserConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn activity_timeout(&self) -> Duration {
        Duration::from_secs(self.activity_timeout_secs)
    }
}

/// Query packing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Consecutive pending fields of one entity packed into one exchange
    pub fields_per_query: usize,
}

/// Retry and backoff configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub parse_attempts: u32,
    pub attach_attempts: u32,
    pub backoff_base_delay_ms: u64,
    pub backoff_max_delay_ms: u64,
}

impl RetryConfig {
    /// Exponential backoff delay before a given attempt (1-indexed), capped.
    /// The first attempt gets no delay; jitter is applied by the caller.
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(2).min(20);
        let delay_ms = self
            .backoff_base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Persistence paths
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub db_path: String,
    pub backup_dir: String,
    pub backup_enabled: bool,
}

impl AppConfig {
    /// Load configuration from the default path
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(Path::new(CONFIG_PATH))
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the embedded default configuration. Used when no config file
    /// exists and the caller did not ask to create one.
    pub fn embedded_default() -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(DEFAULT_CONFIG)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.browser.assistant_url.starts_with("http://")
            && !self.browser.assistant_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidUrl {
                field: "browser.assistant_url".to_string(),
                url: self.browser.assistant_url.clone(),
            });
        }

        for (name, value) in [
            ("browser.attach_timeout_secs", self.browser.attach_timeout_secs),
            ("browser.response_timeout_secs", self.browser.response_timeout_secs),
            ("browser.poll_interval_ms", self.browser.poll_interval_ms),
            ("browser.activity_timeout_secs", self.browser.activity_timeout_secs),
            ("retry.backoff_base_delay_ms", self.retry.backoff_base_delay_ms),
            ("retry.backoff_max_delay_ms", self.retry.backoff_max_delay_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::EmptyRequired {
                    field: name.to_string(),
                });
            }
        }

        if self.browser.stability_checks == 0 {
            return Err(ConfigError::EmptyRequired {
                field: "browser.stability_checks".to_string(),
            });
        }

        for (name, selectors) in [
            ("browser.input_selectors", &self.browser.input_selectors),
            ("browser.response_selectors", &self.browser.response_selectors),
            ("browser.new_thread_selectors", &self.browser.new_thread_selectors),
        ] {
            if selectors.is_empty() || selectors.iter().any(|s| s.trim().is_empty()) {
                return Err(ConfigError::EmptyRequired {
                    field: name.to_string(),
                });
            }
        }

        if self.query.fields_per_query == 0 {
            return Err(ConfigError::EmptyRequired {
                field: "query.fields_per_query".to_string(),
            });
        }
        if self.query.fields_per_query > 10 {
            return Err(ConfigError::OutOfRange {
                field: "query.fields_per_query".to_string(),
                reason: "more than 10 fields per exchange makes responses unparseable".to_string(),
            });
        }

        if self.retry.max_attempts == 0
            || self.retry.parse_attempts == 0
            || self.retry.attach_attempts == 0
        {
            return Err(ConfigError::EmptyRequired {
                field: "retry attempt budgets".to_string(),
            });
        }

        if self.retry.backoff_max_delay_ms < self.retry.backoff_base_delay_ms {
            return Err(ConfigError::OutOfRange {
                field: "retry.backoff_max_delay_ms".to_string(),
                reason: "must be >= retry.backoff_base_delay_ms".to_string(),
            });
        }

        if self.storage.db_path.trim().is_empty() {
            return Err(ConfigError::EmptyRequired {
                field: "storage.db_path".to_string(),
            });
        }

        Ok(())
    }

    /// Create default configuration file at the standard location
    pub fn create_default_config() -> Result<PathBuf, ConfigError> {
        let path = Path::new(CONFIG_PATH);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::File::create(path)?;
        file.write_all(DEFAULT_CONFIG.as_bytes())?;

        Ok(path.to_path_buf())
    }

    /// Check if stdin is a TTY (interactive terminal)
    pub fn is_interactive() -> bool {
        io::stdin().is_terminal()
    }

    /// Prompt user to create default config (only in interactive mode)
    pub fn prompt_create_config() -> Result<Option<PathBuf>, ConfigError> {
        if !Self::is_interactive() {
            return Ok(None);
        }

        print!("Configuration file not found. Create default config? [Y/n] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let input = input.trim().to_lowercase();

        if input.is_empty() || input == "y" || input == "yes" {
            let path = Self::create_default_config()?;
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let config: Result<AppConfig, _> = toml::from_str(DEFAULT_CONFIG);
        assert!(config.is_ok(), "Default config should parse: {:?}", config.err());
    }

    #[test]
    fn test_default_config_validates() {
        let config: AppConfig = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert!(config.validate().is_ok(), "Default config should validate");
    }

    #[test]
    fn test_invalid_assistant_url_rejected() {
        let mut config: AppConfig = toml::from_str(DEFAULT_CONFIG).unwrap();
        config.browser.assistant_url = "not-a-url".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_empty_selectors_rejected() {
        let mut config: AppConfig = toml::from_str(DEFAULT_CONFIG).unwrap();
        config.browser.input_selectors.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyRequired { .. })
        ));
    }

    #[test]
    fn test_fields_per_query_bounds() {
        let mut config: AppConfig = toml::from_str(DEFAULT_CONFIG).unwrap();
        config.query.fields_per_query = 0;
        assert!(config.validate().is_err());
        config.query.fields_per_query = 11;
        assert!(config.validate().is_err());
        config.query.fields_per_query = 4;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_calculation_exponential() {
        let retry = RetryConfig {
            max_attempts: 5,
            parse_attempts: 2,
            attach_attempts: 3,
            backoff_base_delay_ms: 1000,
            backoff_max_delay_ms: 30000,
        };

        assert_eq!(retry.calculate_backoff_delay(1), Duration::ZERO);
        assert_eq!(retry.calculate_backoff_delay(2), Duration::from_millis(1000)); // 1000 * 2^0
        assert_eq!(retry.calculate_backoff_delay(3), Duration::from_millis(2000)); // 1000 * 2^1
        assert_eq!(retry.calculate_backoff_delay(4), Duration::from_millis(4000)); // 1000 * 2^2
    }

    #[test]
    fn test_backoff_max_cap() {
        let retry = RetryConfig {
            max_attempts: 12,
            parse_attempts: 2,
            attach_attempts: 3,
            backoff_base_delay_ms: 1000,
            backoff_max_delay_ms: 5000,
        };

        // 1000 * 2^9 = 512000, but should be capped at 5000
        assert_eq!(retry.calculate_backoff_delay(11), Duration::from_millis(5000));
    }

    #[test]
    fn test_backoff_delay_non_decreasing() {
        let retry = RetryConfig {
            max_attempts: 8,
            parse_attempts: 2,
            attach_attempts: 3,
            backoff_base_delay_ms: 500,
            backoff_max_delay_ms: 10000,
        };

        let mut prev = Duration::ZERO;
        for attempt in 1..=8 {
            let d = retry.calculate_backoff_delay(attempt);
            assert!(d >= prev, "delay decreased at attempt {}", attempt);
            prev = d;
        }
    }
}

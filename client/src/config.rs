//! Configuration management for the sync client.

use std::env;
use std::time::Duration;

use tether_engine::ConflictStrategy;

/// Sync client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// SQLite connection URL for the local store
    pub database_url: String,
    /// Identity of this device in mirror snapshots
    pub device_id: String,
    /// User data collections to sync and report on
    pub collections: Vec<String>,
    /// Whether the periodic sync timer runs
    pub auto_sync: bool,
    /// Period of the auto-sync timer
    pub auto_sync_interval: Duration,
    /// Policy for conflicts found while merging remote records
    pub conflict_strategy: ConflictStrategy,
    /// Retry budget for newly queued operations
    pub max_retries: u32,
    /// Pause between queued operations during a drain
    pub drain_delay: Duration,
    /// Wait after coming online before draining
    pub settle_delay: Duration,
    /// Records applied per chunk before yielding
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://tether.db?mode=rwc".to_string(),
            device_id: uuid::Uuid::new_v4().to_string(),
            collections: vec![
                "meetings".to_string(),
                "transcripts".to_string(),
                "settings".to_string(),
            ],
            auto_sync: true,
            auto_sync_interval: Duration::from_secs(15 * 60),
            conflict_strategy: ConflictStrategy::SmartMerge,
            max_retries: tether_engine::queue::DEFAULT_MAX_RETRIES,
            drain_delay: Duration::from_millis(100),
            settle_delay: Duration::from_millis(1000),
            batch_size: 50,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = env::var("TETHER_DATABASE_URL").unwrap_or(defaults.database_url);
        let device_id = env::var("TETHER_DEVICE_ID").unwrap_or(defaults.device_id);

        let collections = match env::var("TETHER_COLLECTIONS") {
            Ok(raw) => parse_collections(&raw)?,
            Err(_) => defaults.collections,
        };

        let auto_sync = match env::var("TETHER_AUTO_SYNC") {
            Ok(raw) => parse_bool("TETHER_AUTO_SYNC", &raw)?,
            Err(_) => defaults.auto_sync,
        };

        let auto_sync_interval = read_u64("TETHER_AUTO_SYNC_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.auto_sync_interval);
        if auto_sync_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "TETHER_AUTO_SYNC_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }

        let conflict_strategy = match env::var("TETHER_CONFLICT_STRATEGY") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "TETHER_CONFLICT_STRATEGY",
                value: raw,
            })?,
            Err(_) => defaults.conflict_strategy,
        };

        let max_retries = match read_u64("TETHER_MAX_RETRIES")? {
            Some(value) => u32::try_from(value).map_err(|_| ConfigError::Invalid {
                key: "TETHER_MAX_RETRIES",
                value: value.to_string(),
            })?,
            None => defaults.max_retries,
        };

        let drain_delay = read_u64("TETHER_DRAIN_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.drain_delay);
        let settle_delay = read_u64("TETHER_SETTLE_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.settle_delay);

        let batch_size = read_u64("TETHER_BATCH_SIZE")?
            .map(|value| value.max(1) as usize)
            .unwrap_or(defaults.batch_size);

        Ok(Self {
            database_url,
            device_id,
            collections,
            auto_sync,
            auto_sync_interval,
            conflict_strategy,
            max_retries,
            drain_delay,
            settle_delay,
            batch_size,
        })
    }
}

fn read_u64(key: &'static str) -> Result<Option<u64>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(None),
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
        }),
    }
}

fn parse_collections(raw: &str) -> Result<Vec<String>, ConfigError> {
    let collections: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();

    if collections.is_empty() {
        return Err(ConfigError::Invalid {
            key: "TETHER_COLLECTIONS",
            value: raw.to_string(),
        });
    }
    if let Some(internal) = collections
        .iter()
        .find(|name| tether_engine::record::is_internal_collection(name))
    {
        return Err(ConfigError::ReservedCollection(internal.clone()));
    }
    Ok(collections)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },

    #[error("Collection name is reserved for internal use: {0}")]
    ReservedCollection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.auto_sync_interval, Duration::from_secs(900));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.drain_delay, Duration::from_millis(100));
        assert_eq!(config.settle_delay, Duration::from_secs(1));
        assert_eq!(config.conflict_strategy, ConflictStrategy::SmartMerge);
        assert_eq!(config.collections.len(), 3);
    }

    #[test]
    fn collections_are_trimmed() {
        assert_eq!(
            parse_collections(" meetings, ,notes ").unwrap(),
            vec!["meetings".to_string(), "notes".to_string()]
        );
        assert!(parse_collections(" , ").is_err());
        assert!(matches!(
            parse_collections("meetings,_offline_queue"),
            Err(ConfigError::ReservedCollection(_))
        ));
    }

    #[test]
    fn bools_accept_common_spellings() {
        assert!(parse_bool("K", "Yes").unwrap());
        assert!(!parse_bool("K", "off").unwrap());
        assert!(parse_bool("K", "maybe").is_err());
    }
}

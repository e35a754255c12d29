//! Daemon configuration
//!
//! Loaded from a YAML file, validated once at startup. Three sections:
//! the target database, pipeline tuning shared by every pipeline, and the
//! named upstream sources with their dialect and table mapping.
//!
//! ```yaml
//! target:
//!   host: gp-master
//!   database: warehouse
//!   user: silt
//!   password: secret
//!   pool_size: 10
//! sources:
//!   orders:
//!     dialect: debezium
//!     topic: dbserver1
//!     table_map:
//!       orders.public.orders: analytics.orders
//! ```

use crate::error::{Result, SiltError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use validator::Validate;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct Config {
    /// Target database connection settings
    #[validate(nested)]
    pub target: TargetConfig,

    /// Pipeline tuning knobs
    #[serde(default)]
    #[validate(nested)]
    pub pipeline: PipelineConfig,

    /// Named upstream sources
    pub sources: HashMap<String, SourceConfig>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SiltError::config(format!(
                "cannot read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| SiltError::config(format!("invalid config file: {e}")))?;
        config
            .validate()
            .map_err(|e| SiltError::config(e.to_string()))?;
        if config.sources.is_empty() {
            return Err(SiltError::config("no sources configured"));
        }
        for (name, source) in &config.sources {
            if source.table_map.is_empty() {
                return Err(SiltError::config(format!(
                    "source {name} has an empty table_map"
                )));
            }
        }
        Ok(config)
    }

    /// Every distinct mapped target table across all sources.
    pub fn mapped_tables(&self) -> Vec<&String> {
        let mut tables: Vec<&String> = self
            .sources
            .values()
            .flat_map(|s| s.table_map.values())
            .collect();
        tables.sort();
        tables.dedup();
        tables
    }
}

/// Target database connection settings.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TargetConfig {
    /// Hostname of the target master
    #[validate(length(min = 1, max = 255))]
    pub host: String,

    /// Port (default: 5432)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database name
    #[validate(length(min = 1, max = 127))]
    pub database: String,

    /// Username
    #[validate(length(min = 1, max = 128))]
    pub user: String,

    /// Password
    pub password: String,

    /// Number of loader connections in the pool
    #[serde(default = "default_pool_size")]
    #[validate(range(min = 1, max = 256))]
    pub pool_size: usize,

    /// Seconds after which a delete statement is considered slow and its
    /// plan is captured to the warning log
    #[serde(default = "default_slow_delete_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub slow_delete_secs: u64,
}

fn default_port() -> u16 {
    5432
}

fn default_pool_size() -> usize {
    10
}

fn default_slow_delete_secs() -> u64 {
    10
}

/// Pipeline tuning knobs, shared by every pipeline.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PipelineConfig {
    /// Upstream poll timeout in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    #[validate(range(min = 10, max = 60_000))]
    pub poll_timeout_ms: u64,

    /// Row-count bound of one merge window
    #[serde(default = "default_merge_threshold")]
    #[validate(range(min = 1))]
    pub merge_threshold: usize,

    /// Depth of each per-table ready-task queue
    #[serde(default = "default_task_queue_depth")]
    #[validate(range(min = 1, max = 64))]
    pub task_queue_depth: usize,

    /// Depth of the change-set and row-set queues between workers
    #[serde(default = "default_change_queue_depth")]
    #[validate(range(min = 1, max = 1024))]
    pub change_queue_depth: usize,

    /// Watchdog sampling interval in seconds
    #[serde(default = "default_watchdog_interval_secs")]
    #[validate(range(min = 1, max = 600))]
    pub watchdog_interval_secs: u64,

    /// Seconds of no load progress (with work in flight) before the
    /// watchdog stops the process
    #[serde(default = "default_stall_timeout_secs")]
    #[validate(range(min = 10, max = 86_400))]
    pub stall_timeout_secs: u64,
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_merge_threshold() -> usize {
    20_000
}

fn default_task_queue_depth() -> usize {
    2
}

fn default_change_queue_depth() -> usize {
    16
}

fn default_watchdog_interval_secs() -> u64 {
    10
}

fn default_stall_timeout_secs() -> u64 {
    300
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            merge_threshold: default_merge_threshold(),
            task_queue_depth: default_task_queue_depth(),
            change_queue_depth: default_change_queue_depth(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            stall_timeout_secs: default_stall_timeout_secs(),
        }
    }
}

/// Upstream CDC dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Topic-per-table CDC; one pipeline per source table
    Debezium,
    /// Partitioned single-topic CDC; one pipeline per partition
    Maxwell,
}

/// One upstream source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Wire dialect of this source
    pub dialect: Dialect,

    /// Topic name prefix (topic-per-table) or the single topic
    /// (partitioned)
    pub topic: String,

    /// Partition count of a partitioned topic; the consumer client would
    /// normally discover this
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Source qualified name to target qualified name
    pub table_map: HashMap<String, String>,

    /// Replay changes from a newline-delimited JSON file instead of a
    /// broker subscription
    #[serde(default)]
    pub replay: Option<PathBuf>,
}

fn default_partitions() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    const MINIMAL: &str = r#"
target:
  host: localhost
  database: warehouse
  user: silt
  password: secret
sources:
  orders:
    dialect: debezium
    topic: dbserver1
    table_map:
      orders.public.orders: analytics.orders
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse(MINIMAL);
        assert_eq!(config.target.port, 5432);
        assert_eq!(config.target.pool_size, 10);
        assert_eq!(config.target.slow_delete_secs, 10);
        assert_eq!(config.pipeline.poll_timeout_ms, 1000);
        assert_eq!(config.pipeline.merge_threshold, 20_000);
        assert_eq!(config.sources["orders"].dialect, Dialect::Debezium);
        assert_eq!(config.sources["orders"].partitions, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mapped_tables_deduplicates() {
        let yaml = r#"
target:
  host: localhost
  database: warehouse
  user: silt
  password: secret
sources:
  a:
    dialect: debezium
    topic: t1
    table_map:
      a.public.x: analytics.x
  b:
    dialect: maxwell
    topic: maxwell
    table_map:
      b.x: analytics.x
      b.y: analytics.y
"#;
        let config = parse(yaml);
        let tables = config.mapped_tables();
        assert_eq!(tables.len(), 2);
        assert!(tables.contains(&&"analytics.x".to_string()));
        assert!(tables.contains(&&"analytics.y".to_string()));
    }

    #[test]
    fn test_invalid_pool_size_rejected() {
        let mut config = parse(MINIMAL);
        config.target.pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dialect_parse() {
        assert_eq!(
            serde_yaml::from_str::<Dialect>("debezium").unwrap(),
            Dialect::Debezium
        );
        assert_eq!(
            serde_yaml::from_str::<Dialect>("maxwell").unwrap(),
            Dialect::Maxwell
        );
        assert!(serde_yaml::from_str::<Dialect>("kinesis").is_err());
    }
}

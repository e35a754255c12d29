//! # silt
//!
//! Incremental CDC replication into append-optimized analytic databases.
//! silt consumes row-level change events from a partitioned log broker,
//! folds them into compact per-table batches, and applies each batch with
//! bulk-load semantics: COPY into the target, deletes routed through a
//! per-connection temp table and a `DELETE ... WHERE EXISTS` join.
//!
//! ## Architecture
//!
//! ```text
//! upstream bytes
//!   -> Transformer  (decode one record into a canonical Row)
//!   -> Dispatcher   (partition rows into per-table row sets)
//!   -> Merger       (fold row sets into a compact LoadTask)
//!   -> ChangeLoader (COPY + delete-exists, adaptive optimistic mode)
//!   -> target database
//! ```
//!
//! Each pipeline owns one upstream consumer and its worker chain; loaders
//! share a fixed connection pool. Exactly-once apply relative to upstream
//! offsets comes from the commit-callback chain: a batch's offset is
//! committed only after every table it touched has committed on the
//! target, in arrival order.
//!
//! The scheduler collects worker failures and the watchdog samples
//! pipeline health; either raises the process-wide stop flag, which every
//! loop observes at its next yield point.

pub mod commit;
pub mod config;
pub mod dispatch;
pub mod encoding;
pub mod error;
pub mod loader;
pub mod merge;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod row;
pub mod scheduler;
pub mod source;
pub mod table;
pub mod transform;

pub use config::Config;
pub use error::{LoadError, Result, SiltError};
pub use pipeline::{Pipeline, PipelineState, Source};
pub use scheduler::{Scheduler, StopFlag, Watchdog};

use crate::metrics::PipelineRegistry;
use crate::pool::ConnectionPool;
use crate::table::Table;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared process context: configuration, discovered table metadata, the
/// loader connection pool, the stop flag, and the pipeline registry.
///
/// Built once at startup; the metadata map is read-only afterwards.
pub struct Context {
    /// Validated daemon configuration
    pub config: Config,
    /// Target table metadata, discovered once
    pub tables: HashMap<String, Arc<Table>>,
    /// Shared loader connections
    pub pool: Arc<ConnectionPool>,
    /// Process-wide stop flag
    pub stop: StopFlag,
    /// Pipeline registry for gauges and the watchdog
    pub registry: Arc<PipelineRegistry>,
}

impl Context {
    /// Connect to the target, discover metadata for every mapped table,
    /// and establish the loader connection pool.
    pub async fn init(config: Config) -> Result<Arc<Self>> {
        let (client, driver) = pool::connect_target(&config.target).await?;
        let tables = table::discover_tables(&client, config.mapped_tables()).await?;
        drop(client);
        driver.abort();

        let pool = ConnectionPool::connect(&config.target).await?;
        Ok(Arc::new(Self {
            config,
            tables,
            pool,
            stop: StopFlag::new(),
            registry: Arc::new(PipelineRegistry::new()),
        }))
    }
}

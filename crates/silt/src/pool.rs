//! Target connection pool
//!
//! A fixed set of connections is established once at startup, each
//! initialized with planner hints that favor the temp-table delete join
//! on analytic targets. Loaders borrow one connection per task and return
//! it through the guard; a failed task poisons its guard and the
//! connection is closed instead of returned, shrinking the pool until an
//! operator intervenes. Borrowing from an empty pool fails fast.
//!
//! The per-connection temp-table name cache rides on the connection:
//! temp tables live for the connection's lifetime and only the borrower
//! touches the set.

use crate::config::TargetConfig;
use crate::error::{Result, SiltError};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, warn};

/// One pooled target connection plus its scratch state.
pub struct TargetConn {
    client: Client,
    driver: tokio::task::JoinHandle<()>,
    temp_tables: HashSet<String>,
}

impl TargetConn {
    fn close(self) {
        // Dropping the client tears the connection down; the driver task
        // ends with it.
        self.driver.abort();
    }
}

/// Open one client against the target and spawn its connection driver.
pub async fn connect_target(
    config: &TargetConfig,
) -> Result<(Client, tokio::task::JoinHandle<()>)> {
    let (client, connection) = tokio_postgres::Config::new()
        .host(&config.host)
        .port(config.port)
        .dbname(&config.database)
        .user(&config.user)
        .password(&config.password)
        .connect(NoTls)
        .await?;
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("target connection error: {e}");
        }
    });
    Ok((client, driver))
}

/// Fixed-size pool of target connections shared by every loader.
pub struct ConnectionPool {
    idle: Mutex<VecDeque<TargetConn>>,
    live: AtomicUsize,
}

impl ConnectionPool {
    /// Establish the configured number of connections and prepare each
    /// for bulk loading.
    pub async fn connect(config: &TargetConfig) -> Result<Arc<Self>> {
        info!(
            size = config.pool_size,
            "establishing loader connections to {}:{}/{}",
            config.host,
            config.port,
            config.database
        );
        let mut idle = VecDeque::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            let (client, driver) = connect_target(config).await?;
            client
                .batch_execute(
                    "set enable_nestloop = on; \
                     set enable_seqscan = off; \
                     set enable_hashjoin = off;",
                )
                .await?;
            // Greenplum-only knob; harmless to miss elsewhere.
            if let Err(e) = client.batch_execute("set gp_autostats_mode = none;").await {
                debug!("gp_autostats_mode not supported: {e}");
            }
            idle.push_back(TargetConn {
                client,
                driver,
                temp_tables: HashSet::new(),
            });
        }
        info!(size = config.pool_size, "loader connections established");
        Ok(Arc::new(Self {
            live: AtomicUsize::new(idle.len()),
            idle: Mutex::new(idle),
        }))
    }

    /// Borrow a connection, failing fast when none is idle.
    pub fn checkout(self: &Arc<Self>) -> Result<PooledConn> {
        let conn = self.idle.lock().pop_front();
        match conn {
            Some(conn) => Ok(PooledConn {
                conn: Some(conn),
                pool: self.clone(),
                poisoned: false,
            }),
            None => Err(SiltError::NoConnection),
        }
    }

    /// Connections still alive (idle plus borrowed).
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Close every idle connection at shutdown.
    pub fn close(&self) {
        let mut idle = self.idle.lock();
        while let Some(conn) = idle.pop_front() {
            self.live.fetch_sub(1, Ordering::Relaxed);
            conn.close();
        }
    }
}

/// Guard over a borrowed connection.
///
/// Returned to the pool on drop unless poisoned, in which case the
/// connection is closed and the pool permanently shrinks by one.
pub struct PooledConn {
    conn: Option<TargetConn>,
    pool: Arc<ConnectionPool>,
    poisoned: bool,
}

impl PooledConn {
    /// The underlying client.
    pub fn client(&self) -> &Client {
        &self.conn.as_ref().expect("connection present until drop").client
    }

    /// Mark the connection unusable; it will be dropped instead of
    /// returned.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    /// Check whether a temp table was already created here for `table`.
    pub fn has_temp_table(&self, table: &str) -> bool {
        self.conn
            .as_ref()
            .expect("connection present until drop")
            .temp_tables
            .contains(table)
    }

    /// Remember that the temp table for `table` exists on this
    /// connection.
    pub fn mark_temp_table(&mut self, table: String) {
        self.conn
            .as_mut()
            .expect("connection present until drop")
            .temp_tables
            .insert(table);
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.poisoned {
            let remaining = self.pool.live.fetch_sub(1, Ordering::Relaxed) - 1;
            warn!(remaining, "dropping poisoned target connection");
            conn.close();
        } else {
            self.pool.idle.lock().push_back(conn);
        }
    }
}

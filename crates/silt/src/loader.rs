//! Change loading
//!
//! One [`ChangeLoader`] per destination table applies ready
//! [`LoadTask`]s inside a single target transaction:
//!
//! 1. Ensure the per-connection temp table exists (autocommit window).
//! 2. Delete phase: COPY the key set into the temp table, then
//!    `DELETE ... WHERE EXISTS` against the target. Skipped when the
//!    delete set is empty and the loader is optimistic.
//! 3. Insert phase: COPY the merged tuples straight into the target.
//! 4. Commit, fire the task's callbacks in order, return the connection.
//!
//! The loader adapts between two modes. Optimistic (the steady state)
//! inserts directly and only deletes what the task explicitly deletes.
//! A duplicate-key violation rolls the transaction back, flips the loader
//! to pessimistic, and retries with the insert keys as the delete set;
//! pessimistic mode keeps pre-deleting every affected key until a task's
//! delete phase removes exactly its own delete-set size, proof that no
//! insert key collided anymore.
//!
//! COPY data streams through a bounded in-process pipe: the loader
//! produces tuple text, a spawned driver feeds the target's
//! COPY-from-STDIN sink. Both halves terminate on every path; producer
//! errors are re-raised only after the driver has been awaited.

use crate::error::{classify_copy_error, LoadError, Result};
use crate::merge::LoadTask;
use crate::metrics::PipelineStats;
use crate::pool::{ConnectionPool, PooledConn};
use crate::scheduler::StopFlag;
use crate::table::Table;
use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_postgres::{CopyInSink, SimpleQueryMessage};
use tracing::{debug, error, info, warn};

const COPY_PIPE_DEPTH: usize = 64;
const COPY_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Seam between the tuple pipe and the target's COPY protocol.
#[async_trait]
pub(crate) trait BulkSink: Send + 'static {
    /// Push one chunk of COPY text.
    async fn feed(&mut self, chunk: Bytes) -> std::result::Result<(), LoadError>;

    /// Complete the COPY and return the loaded row count.
    async fn finish(self) -> std::result::Result<u64, LoadError>;
}

/// COPY-from-STDIN sink over a pooled connection.
pub(crate) struct PgCopySink {
    sink: Pin<Box<CopyInSink<Bytes>>>,
}

impl PgCopySink {
    pub(crate) fn new(sink: CopyInSink<Bytes>) -> Self {
        Self {
            sink: Box::pin(sink),
        }
    }
}

#[async_trait]
impl BulkSink for PgCopySink {
    async fn feed(&mut self, chunk: Bytes) -> std::result::Result<(), LoadError> {
        self.sink.as_mut().send(chunk).await.map_err(classify_copy_error)
    }

    async fn finish(mut self) -> std::result::Result<u64, LoadError> {
        self.sink.as_mut().finish().await.map_err(classify_copy_error)
    }
}

/// Stream tuples through a bounded pipe into a bulk sink.
///
/// The driver half runs as its own task; the producer half is the caller.
/// Closing the pipe on every producer exit path is what guarantees the
/// driver terminates, and the driver erroring out closes the pipe from
/// its side, unblocking a producer stuck on backpressure. Driver errors
/// take precedence over producer errors. A raised stop flag interrupts
/// production and fails the task so the transaction never commits a
/// partial batch.
pub(crate) async fn run_copy<S>(
    sink: S,
    tuples: impl Iterator<Item = Bytes>,
    stop: &StopFlag,
) -> std::result::Result<u64, LoadError>
where
    S: BulkSink,
{
    let (tx, mut rx) = mpsc::channel::<Bytes>(COPY_PIPE_DEPTH);
    let driver = tokio::spawn(async move {
        let mut sink = sink;
        while let Some(chunk) = rx.recv().await {
            sink.feed(chunk).await?;
        }
        sink.finish().await
    });

    let mut produce_err = None;
    for chunk in tuples {
        if stop.is_raised() {
            produce_err = Some(LoadError::Pipe("copy interrupted by stop".to_string()));
            break;
        }
        if tx.send(chunk).await.is_err() {
            produce_err = Some(LoadError::Pipe("copy driver closed the pipe".to_string()));
            break;
        }
    }
    drop(tx);

    // The single cancellation point inside a task: poll the driver and
    // yield briefly, bailing out of the sleep loop once stop is raised.
    // The final await resolves promptly because the pipe is closed.
    while !driver.is_finished() && !stop.is_raised() {
        tokio::time::sleep(COPY_POLL_INTERVAL).await;
    }
    match driver.await {
        Ok(Ok(count)) => match produce_err {
            Some(e) => Err(e),
            None => Ok(count),
        },
        Ok(Err(e)) => Err(e),
        Err(e) => Err(LoadError::Pipe(format!("copy driver terminated abnormally: {e}"))),
    }
}

fn temp_table_name(mapped_table: &str) -> String {
    mapped_table.replace('.', "_")
}

fn copy_statement(table: &str, columns: &[String]) -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH DELIMITER '|' NULL '' CSV QUOTE '\"' ESCAPE E'\\\\';",
        table,
        columns.join(",")
    )
}

fn delete_statement(target: &str, temp: &str, keys: &[String]) -> String {
    let conditions = keys
        .iter()
        .map(|k| format!("{target}.{k}={temp}.{k}"))
        .collect::<Vec<_>>()
        .join(" and ");
    format!("DELETE FROM {target} WHERE EXISTS (SELECT 1 FROM {temp} WHERE {conditions});")
}

/// A pessimistic loader flips back once a delete phase removed exactly
/// the task's own delete-set size: none of the optimistically inserted
/// keys collided.
fn flips_back_to_optimistic(optimistic: bool, affected: u64, task_delete_size: usize) -> bool {
    !optimistic && affected == task_delete_size as u64
}

/// Per-table loader worker.
pub struct ChangeLoader {
    mapped_table: String,
    table: Arc<Table>,
    pool: Arc<ConnectionPool>,
    stop: StopFlag,
    stats: Arc<PipelineStats>,
    slow_delete: Duration,
    optimistic: bool,
}

impl ChangeLoader {
    pub fn new(
        table: Arc<Table>,
        pool: Arc<ConnectionPool>,
        stop: StopFlag,
        stats: Arc<PipelineStats>,
        slow_delete: Duration,
    ) -> Self {
        Self {
            mapped_table: table.name.clone(),
            table,
            pool,
            stop,
            stats,
            slow_delete,
            optimistic: true,
        }
    }

    /// Pull ready tasks until shutdown. Any load failure drops the
    /// borrowed connection and stops the pipeline.
    pub async fn run(mut self, mut tasks: mpsc::Receiver<LoadTask>) -> Result<()> {
        loop {
            let task = tokio::select! {
                task = tasks.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
                _ = self.stop.notified() => break,
            };

            let mut conn = self.pool.checkout()?;
            match self.execute_task(&mut conn, &task).await {
                Ok(()) => {
                    self.stats.record_task_loaded(task.merged_rows as u64);
                }
                Err(e) => {
                    let _ = conn.client().batch_execute("ROLLBACK").await;
                    conn.poison();
                    if self.stop.is_raised() {
                        info!(
                            table = %self.mapped_table,
                            "load task abandoned during shutdown: {e}"
                        );
                        break;
                    }
                    error!(table = %self.mapped_table, "failed to load task: {e}");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn execute_task(
        &mut self,
        conn: &mut PooledConn,
        task: &LoadTask,
    ) -> std::result::Result<(), LoadError> {
        // An empty task never touches the temp table; it still commits
        // below so its callbacks fire.
        if !task.is_empty() {
            self.ensure_temp_table(conn).await?;
        }

        conn.client()
            .batch_execute("BEGIN")
            .await
            .map_err(|e| LoadError::sql("begin", e))?;
        self.apply(conn, task).await?;
        conn.client()
            .batch_execute("COMMIT")
            .await
            .map_err(LoadError::Commit)?;

        for callback in &task.callbacks {
            callback.done();
        }
        debug!(
            table = %self.mapped_table,
            rows = task.merged_rows,
            inserts = task.insert.len(),
            deletes = task.delete.len(),
            "load task committed"
        );
        Ok(())
    }

    async fn apply(
        &mut self,
        conn: &mut PooledConn,
        task: &LoadTask,
    ) -> std::result::Result<(), LoadError> {
        if !task.delete.is_empty() || (!self.optimistic && !task.insert.is_empty()) {
            let mut delete_set: HashSet<&String> = task.delete.iter().collect();
            if !self.optimistic {
                delete_set.extend(task.insert.keys());
            }
            let affected = self.delete_phase(conn, &delete_set).await?;
            if flips_back_to_optimistic(self.optimistic, affected, task.delete.len()) {
                self.optimistic = true;
                info!(table = %self.mapped_table, "switching back to optimistic mode");
            }
        }

        if !task.insert.is_empty() {
            self.insert_phase(conn, task).await?;
        }
        Ok(())
    }

    async fn delete_phase(
        &self,
        conn: &PooledConn,
        keys: &HashSet<&String>,
    ) -> std::result::Result<u64, LoadError> {
        let temp = temp_table_name(&self.mapped_table);
        self.copy_into(conn, &temp, &self.table.key_names, keys.iter().copied())
            .await?;

        let sql = delete_statement(&self.mapped_table, &temp, &self.table.key_names);
        let started = Instant::now();
        let affected = conn
            .client()
            .execute(sql.as_str(), &[])
            .await
            .map_err(|e| LoadError::sql("delete", e))?;
        let elapsed = started.elapsed();
        if elapsed >= self.slow_delete {
            self.capture_delete_plan(conn, &temp, elapsed).await;
        }
        Ok(affected)
    }

    async fn insert_phase(
        &mut self,
        conn: &mut PooledConn,
        task: &LoadTask,
    ) -> std::result::Result<(), LoadError> {
        let columns = self.table.column_names();
        let tuples: HashSet<&String> = task.insert.values().collect();

        match self
            .copy_into(conn, &self.mapped_table, &columns, tuples.iter().copied())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_duplicate_key() && self.optimistic => {
                let _ = conn.client().batch_execute("ROLLBACK").await;
                conn.client()
                    .batch_execute("BEGIN")
                    .await
                    .map_err(|e| LoadError::sql("begin", e))?;
                self.optimistic = false;
                self.stats.record_load_retry();
                info!(
                    table = %self.mapped_table,
                    "duplicate key on optimistic insert, switching to pessimistic mode"
                );

                let keys: HashSet<&String> = task.insert.keys().collect();
                self.delete_phase(conn, &keys).await?;
                self.copy_into(conn, &self.mapped_table, &columns, tuples.iter().copied())
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn copy_into<'a>(
        &self,
        conn: &PooledConn,
        target: &str,
        columns: &[String],
        tuples: impl Iterator<Item = &'a String>,
    ) -> std::result::Result<u64, LoadError> {
        let sql = copy_statement(target, columns);
        let sink: CopyInSink<Bytes> = conn
            .client()
            .copy_in(sql.as_str())
            .await
            .map_err(classify_copy_error)?;
        run_copy(
            PgCopySink::new(sink),
            tuples.map(|t| Bytes::copy_from_slice(t.as_bytes())),
            &self.stop,
        )
        .await
    }

    /// Temp tables are created lazily per connection and live until the
    /// connection closes; rows drop on every commit.
    async fn ensure_temp_table(
        &self,
        conn: &mut PooledConn,
    ) -> std::result::Result<(), LoadError> {
        if conn.has_temp_table(&self.mapped_table) {
            return Ok(());
        }
        let sql = format!(
            "CREATE TEMP TABLE {} ON COMMIT DELETE ROWS AS SELECT * FROM {} LIMIT 0;",
            temp_table_name(&self.mapped_table),
            self.mapped_table
        );
        conn.client()
            .batch_execute(&sql)
            .await
            .map_err(|e| LoadError::sql("create temp table", e))?;
        conn.mark_temp_table(self.mapped_table.clone());
        debug!(table = %self.mapped_table, "created temp table");
        Ok(())
    }

    /// Diagnostic only: a failed or empty EXPLAIN never fails the task.
    async fn capture_delete_plan(&self, conn: &PooledConn, temp: &str, elapsed: Duration) {
        let sql = format!(
            "EXPLAIN {}",
            delete_statement(&self.mapped_table, temp, &self.table.key_names)
        );
        match conn.client().simple_query(&sql).await {
            Ok(messages) => {
                let plan: Vec<&str> = messages
                    .iter()
                    .filter_map(|m| match m {
                        SimpleQueryMessage::Row(row) => row.get(0),
                        _ => None,
                    })
                    .collect();
                if plan.is_empty() {
                    warn!(
                        table = %self.mapped_table,
                        secs = elapsed.as_secs(),
                        "slow delete, no plan available"
                    );
                } else {
                    warn!(
                        table = %self.mapped_table,
                        secs = elapsed.as_secs(),
                        plan = %plan.join("\n"),
                        "slow delete"
                    );
                }
            }
            Err(e) => {
                warn!(table = %self.mapped_table, "failed to capture delete plan: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_temp_table_name() {
        assert_eq!(temp_table_name("analytics.users"), "analytics_users");
    }

    #[test]
    fn test_copy_statement() {
        let sql = copy_statement(
            "analytics.users",
            &["id".to_string(), "name".to_string()],
        );
        assert_eq!(
            sql,
            "COPY analytics.users (id,name) FROM STDIN \
             WITH DELIMITER '|' NULL '' CSV QUOTE '\"' ESCAPE E'\\\\';"
        );
    }

    #[test]
    fn test_delete_statement() {
        let sql = delete_statement(
            "analytics.users",
            "analytics_users",
            &["id".to_string(), "tenant".to_string()],
        );
        assert_eq!(
            sql,
            "DELETE FROM analytics.users WHERE EXISTS (SELECT 1 FROM analytics_users \
             WHERE analytics.users.id=analytics_users.id \
             and analytics.users.tenant=analytics_users.tenant);"
        );
    }

    #[test]
    fn test_flip_back_requires_exact_count() {
        // Flips back only on exact equality, and only out of pessimistic
        // mode.
        assert!(flips_back_to_optimistic(false, 3, 3));
        assert!(!flips_back_to_optimistic(false, 2, 3)); // no-op delete
        assert!(!flips_back_to_optimistic(false, 4, 3)); // extra collisions
        assert!(!flips_back_to_optimistic(true, 3, 3));
        assert!(flips_back_to_optimistic(false, 0, 0));
    }

    #[derive(Default)]
    struct MockSinkState {
        chunks: Vec<Bytes>,
        finished: bool,
    }

    struct MockSink {
        state: Arc<Mutex<MockSinkState>>,
        fail_feed_at: Option<usize>,
        fail_finish: bool,
    }

    impl MockSink {
        fn new(state: Arc<Mutex<MockSinkState>>) -> Self {
            Self {
                state,
                fail_feed_at: None,
                fail_finish: false,
            }
        }

        fn failing_feed(state: Arc<Mutex<MockSinkState>>, at: usize) -> Self {
            Self {
                fail_feed_at: Some(at),
                ..Self::new(state)
            }
        }

        fn failing_finish(state: Arc<Mutex<MockSinkState>>) -> Self {
            Self {
                fail_finish: true,
                ..Self::new(state)
            }
        }
    }

    #[async_trait]
    impl BulkSink for MockSink {
        async fn feed(&mut self, chunk: Bytes) -> std::result::Result<(), LoadError> {
            let mut state = self.state.lock();
            if self.fail_feed_at == Some(state.chunks.len()) {
                return Err(LoadError::Pipe("injected feed failure".to_string()));
            }
            state.chunks.push(chunk);
            Ok(())
        }

        async fn finish(self) -> std::result::Result<u64, LoadError> {
            let mut state = self.state.lock();
            state.finished = true;
            if self.fail_finish {
                return Err(LoadError::DuplicateKey("users_pkey".to_string()));
            }
            Ok(state.chunks.len() as u64)
        }
    }

    fn tuples(n: usize) -> Vec<Bytes> {
        (0..n)
            .map(|i| Bytes::from(format!("{i}|\"v\"\n")))
            .collect()
    }

    #[tokio::test]
    async fn test_run_copy_success() {
        let state = Arc::new(Mutex::new(MockSinkState::default()));
        let stop = StopFlag::new();

        let count = run_copy(MockSink::new(state.clone()), tuples(3).into_iter(), &stop)
            .await
            .unwrap();

        assert_eq!(count, 3);
        let state = state.lock();
        assert!(state.finished);
        assert_eq!(state.chunks.len(), 3);
    }

    #[tokio::test]
    async fn test_run_copy_empty_input_still_finishes() {
        let state = Arc::new(Mutex::new(MockSinkState::default()));
        let stop = StopFlag::new();

        let count = run_copy(MockSink::new(state.clone()), tuples(0).into_iter(), &stop)
            .await
            .unwrap();

        assert_eq!(count, 0);
        assert!(state.lock().finished);
    }

    #[tokio::test]
    async fn test_run_copy_driver_error_unblocks_producer() {
        // More tuples than the pipe holds, driver dies on the first feed:
        // the producer must not deadlock and the driver error wins.
        let state = Arc::new(Mutex::new(MockSinkState::default()));
        let stop = StopFlag::new();

        let err = run_copy(
            MockSink::failing_feed(state.clone(), 0),
            tuples(COPY_PIPE_DEPTH * 4).into_iter(),
            &stop,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, LoadError::Pipe(_)));
        assert!(!state.lock().finished);
    }

    #[tokio::test]
    async fn test_run_copy_finish_error_surfaces() {
        let state = Arc::new(Mutex::new(MockSinkState::default()));
        let stop = StopFlag::new();

        let err = run_copy(
            MockSink::failing_finish(state.clone()),
            tuples(2).into_iter(),
            &stop,
        )
        .await
        .unwrap_err();

        assert!(err.is_duplicate_key());
        assert!(state.lock().finished);
    }

    #[tokio::test]
    async fn test_run_copy_stop_interrupts_production() {
        let state = Arc::new(Mutex::new(MockSinkState::default()));
        let stop = StopFlag::new();
        stop.raise();

        let err = run_copy(MockSink::new(state.clone()), tuples(10).into_iter(), &stop)
            .await
            .unwrap_err();

        assert!(matches!(err, LoadError::Pipe(_)));
        // The driver still terminated cleanly.
        assert!(state.lock().finished);
    }
}

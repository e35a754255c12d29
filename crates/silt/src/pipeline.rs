//! Replication pipelines
//!
//! A pipeline owns one upstream consumer and the worker chain behind it:
//! consumer, transformer, dispatcher, and one merger plus one loader per
//! destination table, all connected by bounded channels. Pipelines are
//! independent; one stopping does not stop its peers unless the watchdog
//! escalates.
//!
//! Two dialects:
//!
//! - topic-per-table ([`Pipeline::debezium`]): one pipeline per source
//!   table, subscribed to `<topic-prefix>.<schema>.<table>`.
//! - partitioned single-topic ([`Pipeline::maxwell`]): one pipeline per
//!   partition; the source table identity rides in each record.
//!
//! The broker client itself stays behind the [`Source`] trait.

use crate::commit::CommitQueue;
use crate::config::SourceConfig;
use crate::dispatch::{run_dispatcher, Dispatcher, TransformedBatch};
use crate::error::{Result, SiltError};
use crate::loader::ChangeLoader;
use crate::merge::run_merger;
use crate::metrics::PipelineStats;
use crate::row::Row;
use crate::scheduler::StopFlag;
use crate::table::Table;
use crate::transform::{DebeziumTransformer, MaxwellTransformer, Transformer};
use crate::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// One raw record from the upstream log.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    /// Topic the record arrived on
    pub topic: String,
    /// Record value; `None` is a tombstone
    pub value: Option<String>,
}

/// One upstream poll batch.
#[derive(Debug)]
pub struct ChangeSet {
    /// Records in arrival order
    pub records: Vec<SourceRecord>,
    /// Position to commit once every record's effects are durable
    pub position: u64,
}

/// Boundary to the upstream consumer client.
///
/// Offset storage is the client's problem: the pipeline only tells it
/// which position became durable, strictly in arrival order.
#[async_trait]
pub trait Source: Send {
    /// Wait up to `timeout` for the next batch of records.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ChangeSet>>;

    /// Acknowledge everything up to and including `position`.
    async fn commit(&mut self, position: u64) -> Result<()>;
}

/// Externally observable pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    /// Healthy and consuming
    Normal = 0,
    /// Transient upstream error, retrying
    Degraded = 1,
    /// Terminal
    Stopped = 2,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Normal => write!(f, "NORMAL"),
            PipelineState::Degraded => write!(f, "DEGRADED"),
            PipelineState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Lock-free state cell sampled by the watchdog.
#[derive(Debug)]
pub struct SharedPipelineState(AtomicU8);

impl SharedPipelineState {
    pub fn new() -> Self {
        Self(AtomicU8::new(PipelineState::Normal as u8))
    }

    pub fn get(&self) -> PipelineState {
        match self.0.load(Ordering::Acquire) {
            0 => PipelineState::Normal,
            1 => PipelineState::Degraded,
            _ => PipelineState::Stopped,
        }
    }

    pub fn set(&self, state: PipelineState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for SharedPipelineState {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic of a topic-per-table pipeline: the configured prefix plus the
/// source table's `.schema.table` suffix.
pub fn debezium_topic(topic_prefix: &str, source_table: &str) -> Result<String> {
    let dot = source_table.find('.').ok_or_else(|| {
        SiltError::config(format!("source table {source_table:?} is not qualified"))
    })?;
    Ok(format!("{topic_prefix}{}", &source_table[dot..]))
}

/// One replication pipeline, ready to spawn.
pub struct Pipeline {
    name: String,
    source: Box<dyn Source>,
    transformer: Box<dyn Transformer>,
    tables: Vec<Arc<Table>>,
}

impl Pipeline {
    /// Build a topic-per-table pipeline for one source table.
    pub fn debezium(
        cxt: &Context,
        source_name: &str,
        config: &SourceConfig,
        source_table: &str,
        source: Box<dyn Source>,
    ) -> Result<Self> {
        let mapped = config.table_map.get(source_table).ok_or_else(|| {
            SiltError::config(format!("source table {source_table} is not mapped"))
        })?;
        let table = cxt
            .tables
            .get(mapped)
            .ok_or_else(|| SiltError::catalog(format!("no metadata for {mapped}")))?
            .clone();
        let topic = debezium_topic(&config.topic, source_table)?;
        let transformer = DebeziumTransformer::new(
            source_name,
            Arc::new(config.table_map.clone()),
            Arc::new(cxt.tables.clone()),
        );
        Ok(Self {
            name: format!("debezium-{source_name}-{topic}"),
            source,
            transformer: Box::new(transformer),
            tables: vec![table],
        })
    }

    /// Build a partitioned-topic pipeline for one partition.
    pub fn maxwell(
        cxt: &Context,
        source_name: &str,
        config: &SourceConfig,
        partition: u32,
        source: Box<dyn Source>,
    ) -> Result<Self> {
        let mut names: Vec<&String> = config.table_map.values().collect();
        names.sort();
        names.dedup();
        let tables = names
            .into_iter()
            .map(|mapped| {
                cxt.tables
                    .get(mapped)
                    .cloned()
                    .ok_or_else(|| SiltError::catalog(format!("no metadata for {mapped}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let transformer = MaxwellTransformer::new(
            Arc::new(config.table_map.clone()),
            Arc::new(cxt.tables.clone()),
        );
        Ok(Self {
            name: format!("maxwell-{source_name}-{partition}"),
            source,
            transformer: Box::new(transformer),
            tables,
        })
    }

    /// Pipeline name, used in logs and the registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn every worker of this pipeline into `workers` and register it
    /// with the process registry.
    pub fn spawn(self, cxt: &Context, workers: &mut JoinSet<Result<()>>) {
        let state = Arc::new(SharedPipelineState::new());
        let stats = Arc::new(PipelineStats::new());
        cxt.registry
            .register(self.name.clone(), state.clone(), stats.clone());

        let commits = Arc::new(CommitQueue::new());
        let tuning = &cxt.config.pipeline;
        let (change_tx, change_rx) = mpsc::channel(tuning.change_queue_depth);
        let (batch_tx, batch_rx) = mpsc::channel(tuning.change_queue_depth);

        let mut lanes = HashMap::new();
        for table in &self.tables {
            let (set_tx, set_rx) = mpsc::channel(tuning.change_queue_depth);
            let (task_tx, task_rx) = mpsc::channel(tuning.task_queue_depth);
            lanes.insert(table.name.clone(), set_tx);

            workers.spawn(run_merger(
                table.name.clone(),
                set_rx,
                task_tx,
                tuning.merge_threshold,
                cxt.stop.clone(),
                stats.clone(),
            ));
            let loader = ChangeLoader::new(
                table.clone(),
                cxt.pool.clone(),
                cxt.stop.clone(),
                stats.clone(),
                Duration::from_secs(cxt.config.target.slow_delete_secs),
            );
            workers.spawn(loader.run(task_rx));
        }

        let dispatcher = Dispatcher::new(lanes, commits.clone(), stats.clone());
        workers.spawn(run_dispatcher(dispatcher, batch_rx, cxt.stop.clone()));
        workers.spawn(run_transformer(
            self.name.clone(),
            self.transformer,
            change_rx,
            batch_tx,
            stats.clone(),
            cxt.stop.clone(),
        ));
        workers.spawn(run_consumer(
            self.name.clone(),
            self.source,
            change_tx,
            commits,
            state,
            stats,
            cxt.stop.clone(),
            Duration::from_millis(tuning.poll_timeout_ms),
        ));

        info!(pipeline = %self.name, tables = self.tables.len(), "pipeline started");
    }
}

/// Consumer worker: polls the source, feeds the transform stage, and
/// commits released positions back upstream between polls.
#[allow(clippy::too_many_arguments)]
async fn run_consumer(
    name: String,
    mut source: Box<dyn Source>,
    changes: mpsc::Sender<ChangeSet>,
    commits: Arc<CommitQueue>,
    state: Arc<SharedPipelineState>,
    stats: Arc<PipelineStats>,
    stop: StopFlag,
    poll_timeout: Duration,
) -> Result<()> {
    let mut backoff = Duration::from_millis(100);
    while !stop.is_raised() {
        if let Some(position) = commits.advance() {
            if let Err(e) = source.commit(position).await {
                warn!(pipeline = %name, "failed to commit position {position}: {e}");
                state.set(PipelineState::Degraded);
            }
        }

        match source.poll(poll_timeout).await {
            Ok(Some(set)) => {
                backoff = Duration::from_millis(100);
                state.set(PipelineState::Normal);
                stats.record_polled(set.records.len() as u64);
                if changes.send(set).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                state.set(PipelineState::Normal);
            }
            Err(e) => {
                warn!(pipeline = %name, "upstream poll failed, retrying: {e}");
                state.set(PipelineState::Degraded);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = stop.notified() => break,
                }
                backoff = (backoff * 2).min(Duration::from_secs(10));
            }
        }
    }

    // Release whatever completed while we were shutting down.
    if let Some(position) = commits.advance() {
        let _ = source.commit(position).await;
    }
    state.set(PipelineState::Stopped);
    info!(pipeline = %name, "consumer stopped");
    Ok(())
}

/// Transform worker: decodes each record of a batch into a canonical row.
///
/// Malformed records are skipped with a warning; their batch still
/// acknowledges, the record just contributes nothing.
async fn run_transformer(
    name: String,
    transformer: Box<dyn Transformer>,
    mut changes: mpsc::Receiver<ChangeSet>,
    batches: mpsc::Sender<TransformedBatch>,
    stats: Arc<PipelineStats>,
    stop: StopFlag,
) -> Result<()> {
    loop {
        let set = tokio::select! {
            set = changes.recv() => match set {
                Some(set) => set,
                None => break,
            },
            _ = stop.notified() => break,
        };

        let mut rows = Vec::with_capacity(set.records.len());
        for record in &set.records {
            let mut row = Row::default();
            match transformer.transform(record, &mut row) {
                Ok(true) => {
                    stats.record_transformed();
                    rows.push(row);
                }
                Ok(false) => stats.record_skipped(),
                Err(e) if e.is_record_local() => {
                    warn!(
                        pipeline = %name,
                        topic = %record.topic,
                        "skipping malformed record: {e}"
                    );
                    stats.record_skipped();
                }
                Err(e) => return Err(e),
            }
        }

        let batch = TransformedBatch {
            rows,
            position: set.position,
        };
        if batches.send(batch).await.is_err() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(PipelineState::Normal.to_string(), "NORMAL");
        assert_eq!(PipelineState::Degraded.to_string(), "DEGRADED");
        assert_eq!(PipelineState::Stopped.to_string(), "STOPPED");
    }

    #[test]
    fn test_shared_state_round_trip() {
        let state = SharedPipelineState::new();
        assert_eq!(state.get(), PipelineState::Normal);
        state.set(PipelineState::Degraded);
        assert_eq!(state.get(), PipelineState::Degraded);
        state.set(PipelineState::Stopped);
        assert_eq!(state.get(), PipelineState::Stopped);
    }

    #[test]
    fn test_debezium_topic_derivation() {
        assert_eq!(
            debezium_topic("dbserver1", "orders.public.users").unwrap(),
            "dbserver1.public.users"
        );
        assert!(debezium_topic("dbserver1", "users").is_err());
    }
}

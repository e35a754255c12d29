//! Row-set merging
//!
//! A merger folds a bounded window of closed [`RowSet`]s for one table
//! into a single [`LoadTask`]: the chronologically last state per key in
//! `insert`, delete markers in `delete`, and the contributing callbacks in
//! arrival order. Folding keeps only what the loader has to apply, so a
//! key rewritten a thousand times in the window costs one COPY line.
//!
//! Mergers are lazy relative to the loaders: finished tasks travel through
//! a bounded channel and merging continues while the loader is busy with
//! an earlier task.

use crate::error::{Result, SiltError};
use crate::metrics::PipelineStats;
use crate::row::{Row, RowOp, RowSet};
use crate::commit::CommitCallback;
use crate::scheduler::StopFlag;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::debug;

/// Merged batch of changes for one target table, the unit of work for a
/// loader.
#[derive(Debug, Default)]
pub struct LoadTask {
    /// Destination table
    pub mapped_table: String,
    /// Key encodings to delete
    pub delete: HashSet<String>,
    /// Key encoding to full tuple encoding, latest state wins
    pub insert: HashMap<String, String>,
    /// Callbacks of every contributing row set, in arrival order
    pub callbacks: Vec<CommitCallback>,
    /// Rows folded into this task
    pub merged_rows: usize,
}

impl LoadTask {
    /// Create an empty task for one table.
    pub fn new(mapped_table: impl Into<String>) -> Self {
        Self {
            mapped_table: mapped_table.into(),
            ..Self::default()
        }
    }

    /// Fold one row into the task.
    ///
    /// Inserts and updates record the latest tuple per key; deletes drop
    /// the key from `insert` and mark it for deletion. An update that
    /// moved the row to a new key splits into delete-old plus insert-new,
    /// in that order. Delete markers survive a later re-insert of the same
    /// key: the loader still has to clear the old target row first.
    pub fn merge_row(&mut self, row: Row) -> Result<()> {
        match row.op {
            RowOp::Insert | RowOp::Update => {
                let tuple = row.tuple.ok_or_else(|| {
                    SiltError::merge(format!(
                        "{} row for {} is missing its tuple",
                        row.op, row.mapped_table
                    ))
                })?;
                if row.old_keys.as_deref().is_some_and(|old| old != row.keys) {
                    let old = row.old_keys.unwrap();
                    self.insert.remove(&old);
                    self.delete.insert(old);
                }
                self.insert.insert(row.keys, tuple);
            }
            RowOp::Delete => {
                self.insert.remove(&row.keys);
                self.delete.insert(row.keys);
            }
        }
        self.merged_rows += 1;
        Ok(())
    }

    /// Fold a whole row set and take over its callback.
    pub fn absorb(&mut self, set: RowSet) -> Result<()> {
        for row in set.rows {
            self.merge_row(row)?;
        }
        self.callbacks.push(set.callback);
        Ok(())
    }

    /// Check whether the task carries neither inserts nor deletes.
    ///
    /// Empty tasks are still loaded: the commit has to happen so the
    /// callbacks fire.
    pub fn is_empty(&self) -> bool {
        self.delete.is_empty() && self.insert.is_empty()
    }
}

/// Per-table merger worker.
///
/// Waits for the first closed row set, then folds in whatever else is
/// already queued up to `merge_threshold` rows, and ships the finished
/// task. Blocking on the full task channel is the backpressure path from
/// a slow loader back to the dispatcher.
pub async fn run_merger(
    mapped_table: String,
    mut rowsets: mpsc::Receiver<RowSet>,
    tasks: mpsc::Sender<LoadTask>,
    merge_threshold: usize,
    stop: StopFlag,
    stats: Arc<PipelineStats>,
) -> Result<()> {
    loop {
        let first = tokio::select! {
            set = rowsets.recv() => match set {
                Some(set) => set,
                None => break,
            },
            _ = stop.notified() => break,
        };

        let mut task = LoadTask::new(mapped_table.clone());
        task.absorb(first)?;
        while task.merged_rows < merge_threshold {
            match rowsets.try_recv() {
                Ok(set) => task.absorb(set)?,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        debug!(
            table = %task.mapped_table,
            rows = task.merged_rows,
            inserts = task.insert.len(),
            deletes = task.delete.len(),
            "merged load task"
        );
        stats.record_task_merged(task.merged_rows as u64);

        if tasks.send(task).await.is_err() {
            return Err(SiltError::merge(format!(
                "loader for {mapped_table} went away before its merge output drained"
            )));
        }
    }
    Ok(())
}

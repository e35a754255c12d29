//! Row dispatch
//!
//! The dispatcher takes each transformed upstream batch, partitions its
//! rows by mapped table, and closes exactly one [`RowSet`] per touched
//! table. The callbacks attached to those sets are siblings: the batch's
//! upstream offset only advances once every one of them has fired.

use crate::commit::CommitQueue;
use crate::error::{Result, SiltError};
use crate::metrics::PipelineStats;
use crate::row::{Row, RowSet};
use crate::scheduler::StopFlag;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Output of the transform stage for one upstream batch.
#[derive(Debug)]
pub struct TransformedBatch {
    /// Canonical rows in arrival order
    pub rows: Vec<Row>,
    /// Upstream position the batch acknowledges
    pub position: u64,
}

/// Routes rows from one pipeline into per-table row-set lanes.
pub struct Dispatcher {
    lanes: HashMap<String, mpsc::Sender<RowSet>>,
    commits: Arc<CommitQueue>,
    stats: Arc<PipelineStats>,
}

impl Dispatcher {
    pub fn new(
        lanes: HashMap<String, mpsc::Sender<RowSet>>,
        commits: Arc<CommitQueue>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            lanes,
            commits,
            stats,
        }
    }

    /// Partition one batch into per-table row sets and hand them to the
    /// mergers.
    ///
    /// A batch whose records were all skipped registers with zero
    /// siblings, so its offset still advances.
    pub async fn dispatch(&self, batch: TransformedBatch) -> Result<()> {
        let mut grouped: Vec<(String, Vec<Row>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for row in batch.rows {
            match index.get(&row.mapped_table) {
                Some(&at) => grouped[at].1.push(row),
                None => {
                    index.insert(row.mapped_table.clone(), grouped.len());
                    let table = row.mapped_table.clone();
                    grouped.push((table, vec![row]));
                }
            }
        }

        let callbacks = self.commits.register(batch.position, grouped.len());
        debug!(
            position = batch.position,
            tables = grouped.len(),
            "dispatching upstream batch"
        );

        for ((table, rows), callback) in grouped.into_iter().zip(callbacks) {
            let lane = self.lanes.get(&table).ok_or_else(|| {
                SiltError::catalog(format!("no loader lane for table {table}"))
            })?;
            self.stats.record_dispatched(rows.len() as u64);
            let set = RowSet {
                mapped_table: table.clone(),
                rows,
                callback,
            };
            if lane.send(set).await.is_err() {
                return Err(SiltError::merge(format!("row-set lane for {table} closed")));
            }
        }
        Ok(())
    }
}

/// Dispatch worker: drains transformed batches until shutdown.
pub async fn run_dispatcher(
    dispatcher: Dispatcher,
    mut batches: mpsc::Receiver<TransformedBatch>,
    stop: StopFlag,
) -> Result<()> {
    loop {
        let batch = tokio::select! {
            batch = batches.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
            _ = stop.notified() => break,
        };
        if let Err(e) = dispatcher.dispatch(batch).await {
            // Lanes close while draining a raised stop flag; that is not
            // a failure of this pipeline.
            if stop.is_raised() {
                break;
            }
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::RowOp;

    fn row(table: &str, key: &str) -> Row {
        Row {
            op: RowOp::Insert,
            mapped_table: table.to_string(),
            keys: format!("{key}\n"),
            tuple: Some(format!("{key}|\"x\"\n")),
            ..Row::default()
        }
    }

    fn dispatcher_with_lanes(
        tables: &[&str],
        commits: Arc<CommitQueue>,
    ) -> (Dispatcher, HashMap<String, mpsc::Receiver<RowSet>>) {
        let mut lanes = HashMap::new();
        let mut receivers = HashMap::new();
        for table in tables {
            let (tx, rx) = mpsc::channel(8);
            lanes.insert(table.to_string(), tx);
            receivers.insert(table.to_string(), rx);
        }
        let dispatcher = Dispatcher::new(lanes, commits, Arc::new(PipelineStats::new()));
        (dispatcher, receivers)
    }

    #[tokio::test]
    async fn test_one_row_set_per_table_per_batch() {
        let commits = Arc::new(CommitQueue::new());
        let (dispatcher, mut receivers) =
            dispatcher_with_lanes(&["t.a", "t.b"], commits.clone());

        let batch = TransformedBatch {
            rows: vec![row("t.a", "1"), row("t.b", "2"), row("t.a", "3")],
            position: 42,
        };
        dispatcher.dispatch(batch).await.unwrap();

        let set_a = receivers.get_mut("t.a").unwrap().try_recv().unwrap();
        assert_eq!(set_a.len(), 2);
        assert_eq!(set_a.rows[0].keys, "1\n");
        assert_eq!(set_a.rows[1].keys, "3\n");
        // only one set per table for the batch
        assert!(receivers.get_mut("t.a").unwrap().try_recv().is_err());

        let set_b = receivers.get_mut("t.b").unwrap().try_recv().unwrap();
        assert_eq!(set_b.len(), 1);
    }

    #[tokio::test]
    async fn test_sibling_callbacks_gate_the_offset() {
        let commits = Arc::new(CommitQueue::new());
        let (dispatcher, mut receivers) =
            dispatcher_with_lanes(&["t.a", "t.b"], commits.clone());

        dispatcher
            .dispatch(TransformedBatch {
                rows: vec![row("t.a", "1"), row("t.b", "2")],
                position: 7,
            })
            .await
            .unwrap();

        let set_a = receivers.get_mut("t.a").unwrap().try_recv().unwrap();
        let set_b = receivers.get_mut("t.b").unwrap().try_recv().unwrap();

        set_a.callback.done();
        assert_eq!(commits.advance(), None);
        set_b.callback.done();
        assert_eq!(commits.advance(), Some(7));
    }

    #[tokio::test]
    async fn test_empty_batch_still_advances() {
        let commits = Arc::new(CommitQueue::new());
        let (dispatcher, _receivers) = dispatcher_with_lanes(&["t.a"], commits.clone());

        dispatcher
            .dispatch(TransformedBatch {
                rows: vec![],
                position: 9,
            })
            .await
            .unwrap();
        assert_eq!(commits.advance(), Some(9));
    }
}

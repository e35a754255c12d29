//! Built-in sources
//!
//! The production consumer client lives outside this crate; anything that
//! implements [`Source`] can drive a pipeline. What ships here is
//! [`ReplaySource`], which replays newline-delimited JSON records from a
//! file in fixed-size batches. It exists for smoke tests and offline
//! backfills and doubles as the reference implementation of the poll and
//! commit contract.

use crate::error::{Result, SiltError};
use crate::pipeline::{ChangeSet, Source, SourceRecord};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Replays records from a newline-delimited JSON file.
pub struct ReplaySource {
    topic: String,
    lines: Vec<String>,
    next: usize,
    batch_size: usize,
    committed: Option<u64>,
}

impl ReplaySource {
    /// Load a replay file. Blank lines are skipped.
    pub fn from_file(path: impl AsRef<Path>, topic: impl Into<String>, batch_size: usize) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SiltError::source(format!(
                "cannot read replay file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let lines = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self {
            topic: topic.into(),
            lines,
            next: 0,
            batch_size: batch_size.max(1),
            committed: None,
        })
    }

    /// Build a source from in-memory records.
    pub fn from_records(
        topic: impl Into<String>,
        lines: Vec<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            topic: topic.into(),
            lines,
            next: 0,
            batch_size: batch_size.max(1),
            committed: None,
        }
    }

    /// Last committed position, if any.
    pub fn committed(&self) -> Option<u64> {
        self.committed
    }

    /// Whether every record has been handed out.
    pub fn is_drained(&self) -> bool {
        self.next >= self.lines.len()
    }
}

#[async_trait]
impl Source for ReplaySource {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ChangeSet>> {
        if self.is_drained() {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }
        let end = (self.next + self.batch_size).min(self.lines.len());
        let records = self.lines[self.next..end]
            .iter()
            .map(|line| SourceRecord {
                topic: self.topic.clone(),
                value: Some(line.clone()),
            })
            .collect();
        self.next = end;
        Ok(Some(ChangeSet {
            records,
            position: end as u64,
        }))
    }

    async fn commit(&mut self, position: u64) -> Result<()> {
        self.committed = Some(position);
        debug!(topic = %self.topic, position, "replay position committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replay_batches_and_positions() {
        let lines: Vec<String> = (0..5).map(|i| format!("{{\"n\":{i}}}")).collect();
        let mut source = ReplaySource::from_records("t", lines, 2);

        let batch = source.poll(Duration::from_millis(1)).await.unwrap().unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.position, 2);

        let batch = source.poll(Duration::from_millis(1)).await.unwrap().unwrap();
        assert_eq!(batch.position, 4);

        let batch = source.poll(Duration::from_millis(1)).await.unwrap().unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.position, 5);
        assert!(source.is_drained());

        // Drained source waits out the timeout and yields nothing.
        assert!(source.poll(Duration::from_millis(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_is_recorded() {
        let mut source = ReplaySource::from_records("t", vec!["{}".to_string()], 10);
        assert_eq!(source.committed(), None);
        source.poll(Duration::from_millis(1)).await.unwrap();
        source.commit(1).await.unwrap();
        assert_eq!(source.committed(), Some(1));
    }
}

//! Canonical change representation
//!
//! Every upstream dialect decodes into the same [`Row`]: an operation, a
//! producer timestamp, origin and mapped table identities, and the key and
//! tuple encodings already in the target's bulk-load text format. Rows are
//! grouped per destination table into [`RowSet`]s, the unit handed to a
//! merger.

use crate::commit::CommitCallback;

/// Change operation type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RowOp {
    /// Row inserted (or read during an initial snapshot)
    #[default]
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl std::fmt::Display for RowOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowOp::Insert => write!(f, "INSERT"),
            RowOp::Update => write!(f, "UPDATE"),
            RowOp::Delete => write!(f, "DELETE"),
        }
    }
}

/// One change event in canonical form.
///
/// `keys` and `tuple` are complete COPY lines (trailing newline included)
/// so loaders can stream them without re-encoding. `tuple` is present iff
/// the operation is not a delete; `old_keys` is present only for updates
/// that moved the row to a different primary key.
#[derive(Debug, Clone, Default)]
pub struct Row {
    /// Operation type
    pub op: RowOp,
    /// Upstream event timestamp (milliseconds, monotonic per source)
    pub produce_time: i64,
    /// Upstream identifier of the source table
    pub origin_table: String,
    /// Fully-qualified target table resolved through the table mapping
    pub mapped_table: String,
    /// Encoded primary-key tuple
    pub keys: String,
    /// Encoded prior primary-key tuple when an update changed the key
    pub old_keys: Option<String>,
    /// Encoded full row; absent for deletes
    pub tuple: Option<String>,
}

impl Row {
    /// Check if this row changed its primary key.
    pub fn is_key_change(&self) -> bool {
        self.old_keys.as_deref().is_some_and(|old| old != self.keys)
    }
}

/// An ordered window of rows for one mapped table, closed by the
/// dispatcher at an upstream batch boundary.
///
/// Each set carries exactly one [`CommitCallback`]; sibling callbacks of
/// the same upstream batch all have to fire before its offset advances.
#[derive(Debug)]
pub struct RowSet {
    /// Destination table shared by every row in the set
    pub mapped_table: String,
    /// Rows in arrival order
    pub rows: Vec<Row>,
    /// Acknowledgement token for the originating upstream batch
    pub callback: CommitCallback,
}

impl RowSet {
    /// Number of rows in the set.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

//! # Change Sets
//!
//! Decodes the engine's raw change payload into typed change sets.
//!
//! ## Index Coordinates
//!
//! ```text
//! before:  [a, b, c, d]        deletions      = [1]      (pre-change)
//! after:   [a, c, X, d']       insertions     = [2]      (post-change)
//!                              changes        = [3]      (pre-change)
//!                              changes_after  = [3]      (post-change)
//! ```
//!
//! Deletions and pre-change modifications index the collection as it was
//! before the commit; insertions and post-change modifications index it as
//! it is after. Applying deletions (descending) then insertions (ascending)
//! to the old contents reproduces the new contents.
//!
//! ## Initial Events
//!
//! The first payload after a registration is always empty. An empty payload
//! is classified as initial, never as an update with no changes.

use serde::Serialize;

use crate::engine::{RawChange, RawRange};

// =============================================================================
// Ranges
// =============================================================================

/// A contiguous run of indices `[start, start + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexRange {
    pub start: usize,
    pub length: usize,
}

impl IndexRange {
    /// One past the last index in the range.
    pub fn end(&self) -> usize {
        self.start + self.length
    }

    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end()
    }
}

impl From<RawRange> for IndexRange {
    fn from(range: RawRange) -> Self {
        IndexRange {
            start: range.from,
            length: range.to - range.from,
        }
    }
}

fn convert(ranges: Vec<RawRange>) -> Vec<IndexRange> {
    ranges.into_iter().map(IndexRange::from).collect()
}

// =============================================================================
// Collection Change Set
// =============================================================================

/// Positional changes to a list, set, or result set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    deletions: Vec<usize>,
    insertions: Vec<usize>,
    changes: Vec<usize>,
    changes_after: Vec<usize>,
    deletion_ranges: Vec<IndexRange>,
    insertion_ranges: Vec<IndexRange>,
    change_ranges: Vec<IndexRange>,
    change_ranges_after: Vec<IndexRange>,
}

impl ChangeSet {
    /// Deleted indices (pre-change).
    pub fn deletions(&self) -> &[usize] {
        &self.deletions
    }

    /// Inserted indices (post-change).
    pub fn insertions(&self) -> &[usize] {
        &self.insertions
    }

    /// Modified indices (pre-change).
    pub fn changes(&self) -> &[usize] {
        &self.changes
    }

    /// Modified indices (post-change).
    pub fn changes_after(&self) -> &[usize] {
        &self.changes_after
    }

    pub fn deletion_ranges(&self) -> &[IndexRange] {
        &self.deletion_ranges
    }

    pub fn insertion_ranges(&self) -> &[IndexRange] {
        &self.insertion_ranges
    }

    pub fn change_ranges(&self) -> &[IndexRange] {
        &self.change_ranges
    }

    pub fn change_ranges_after(&self) -> &[IndexRange] {
        &self.change_ranges_after
    }

    /// Total number of deletions, insertions, and modifications.
    pub fn len(&self) -> usize {
        self.deletions.len() + self.insertions.len() + self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Map Change Set
// =============================================================================

/// Keyed changes to a map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MapChangeSet {
    pub deletions: Vec<String>,
    pub insertions: Vec<String>,
    pub changes: Vec<String>,
}

impl MapChangeSet {
    pub fn len(&self) -> usize {
        self.deletions.len() + self.insertions.len() + self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Builder
// =============================================================================

/// How a raw payload must be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// First notification after registration.
    Initial,
    /// A delta against the previous notification.
    Update,
    /// The observed object (or the owner of the observed collection) is gone.
    Deleted,
}

/// Decodes one [`RawChange`].
#[derive(Debug, Clone, Copy)]
pub struct ChangeSetBuilder<'a> {
    raw: &'a RawChange,
}

impl<'a> ChangeSetBuilder<'a> {
    pub fn new(raw: &'a RawChange) -> Self {
        Self { raw }
    }

    pub fn kind(&self) -> ChangeKind {
        if self.raw.is_root_deleted() {
            ChangeKind::Deleted
        } else if self.raw.is_empty() {
            ChangeKind::Initial
        } else {
            ChangeKind::Update
        }
    }

    pub fn is_initial(&self) -> bool {
        self.kind() == ChangeKind::Initial
    }

    /// Builds the positional change set, with ranges.
    pub fn collection(&self) -> ChangeSet {
        let raw = self.raw;
        ChangeSet {
            deletions: raw.deletions().to_vec(),
            insertions: raw.insertions().to_vec(),
            changes: raw.modifications().to_vec(),
            changes_after: raw.modifications_new().to_vec(),
            deletion_ranges: convert(raw.deletion_ranges()),
            insertion_ranges: convert(raw.insertion_ranges()),
            change_ranges: convert(raw.modification_ranges()),
            change_ranges_after: convert(raw.modification_ranges_new()),
        }
    }

    pub fn map(&self) -> MapChangeSet {
        MapChangeSet {
            deletions: self.raw.deleted_keys().to_vec(),
            insertions: self.raw.inserted_keys().to_vec(),
            changes: self.raw.modified_keys().to_vec(),
        }
    }

    /// Changed field names of an object; empty for the initial event.
    pub fn changed_fields(&self) -> Vec<String> {
        self.raw.changed_fields().to_vec()
    }
}

//! Delete deduplication.
//!
//! The audit trail can report the same identity more than once (duplicate
//! records, or a package deleted, re-pushed, and deleted again). A catalog
//! commit holds at most one item per identity, so deletions are split into
//! segments in which no identity repeats. Each segment becomes one commit.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

use feedsync_core::PackageIdentity;

/// Deletions that can be committed together: no identity appears twice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSegment {
    entries: BTreeMap<DateTime<Utc>, Vec<PackageIdentity>>,
    len: usize,
}

impl DeleteSegment {
    /// Timestamp buckets in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (&DateTime<Utc>, &Vec<PackageIdentity>)> {
        self.entries.iter()
    }

    /// Number of identities in the segment.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the segment holds no identities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Latest deletion timestamp in the segment.
    #[must_use]
    pub fn latest(&self) -> Option<DateTime<Utc>> {
        self.entries.keys().next_back().copied()
    }

    fn push(&mut self, at: DateTime<Utc>, identity: PackageIdentity) {
        self.entries.entry(at).or_default().push(identity);
        self.len += 1;
    }
}

/// Splits time-ordered deletions into segments without repeated identities.
///
/// Identities are walked in timestamp order. When an identity already present
/// in the current segment recurs, the current segment is closed and a new one
/// starts with the recurring identity under its own timestamp. Concatenating
/// the segments reproduces the input, grouped by timestamp.
#[must_use]
pub fn segment_deletes(deletes: &BTreeMap<DateTime<Utc>, Vec<PackageIdentity>>) -> Vec<DeleteSegment> {
    let mut segments = Vec::new();
    let mut current = DeleteSegment::default();
    let mut seen: HashSet<&PackageIdentity> = HashSet::new();

    for (at, identities) in deletes {
        for identity in identities {
            if !seen.insert(identity) {
                segments.push(std::mem::take(&mut current));
                seen.clear();
                seen.insert(identity);
            }
            current.push(*at, identity.clone());
        }
    }

    if !current.is_empty() {
        segments.push(current);
    }

    segments
}

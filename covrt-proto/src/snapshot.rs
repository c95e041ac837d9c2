//! Owned, serializable view of runtime coverage data.
//!
//! Encoded as `[u8 version][postcard body]`. The version byte is bumped
//! whenever [`ClassRecord`] changes shape.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Current snapshot encoding version.
pub const SNAPSHOT_VERSION: u8 = 1;

/// Hit flags recorded for one instrumented class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRecord {
    /// Instrumentation stamp; records with different stamps describe
    /// different builds of the class and are never combined.
    pub stamp: i64,
    /// Per-method block hit flags.
    pub blocks: Vec<Vec<bool>>,
}

impl ClassRecord {
    /// Number of blocks hit at least once.
    pub fn hits(&self) -> usize {
        self.blocks.iter().flatten().filter(|&&b| b).count()
    }

    /// ORs `other`'s flags into `self`, growing shorter vectors as needed.
    fn absorb(&mut self, other: &Self) {
        if self.blocks.len() < other.blocks.len() {
            self.blocks.resize_with(other.blocks.len(), Vec::new);
        }
        for (mine, theirs) in self.blocks.iter_mut().zip(&other.blocks) {
            if mine.len() < theirs.len() {
                mine.resize(theirs.len(), false);
            }
            for (m, t) in mine.iter_mut().zip(theirs) {
                *m |= *t;
            }
        }
    }
}

/// Coverage data keyed by class name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSnapshot {
    /// Records ordered by class name.
    pub classes: BTreeMap<String, ClassRecord>,
}

impl CoverageSnapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Returns `true` if no class is recorded.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Inserts or replaces the record for `name`.
    pub fn insert(&mut self, name: impl Into<String>, record: ClassRecord) {
        self.classes.insert(name.into(), record);
    }

    /// Merges `other` into `self`.
    ///
    /// Records with equal stamps have their flags OR-ed together. A record
    /// whose stamp differs from the existing one replaces it.
    pub fn merge(&mut self, other: &Self) {
        for (name, theirs) in &other.classes {
            match self.classes.entry(name.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(theirs.clone());
                }
                Entry::Occupied(mut slot) => {
                    let mine = slot.get_mut();
                    if mine.stamp == theirs.stamp {
                        mine.absorb(theirs);
                    } else {
                        *mine = theirs.clone();
                    }
                }
            }
        }
    }

    /// Encodes as `[version][postcard body]`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![SNAPSHOT_VERSION];
        out.extend(postcard::to_allocvec(self)?);
        Ok(out)
    }

    /// Decodes bytes produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (&version, body) = bytes.split_first().ok_or(Error::EmptySnapshot)?;
        if version != SNAPSHOT_VERSION {
            return Err(Error::UnsupportedSnapshotVersion(version));
        }
        Ok(postcard::from_bytes(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(stamp: i64, blocks: &[&[bool]]) -> ClassRecord {
        ClassRecord {
            stamp,
            blocks: blocks.iter().map(|b| b.to_vec()).collect(),
        }
    }

    #[test]
    fn merge_ors_matching_stamps() {
        let mut a = CoverageSnapshot::new();
        a.insert("Foo", record(7, &[&[true, false], &[false]]));
        let mut b = CoverageSnapshot::new();
        b.insert("Foo", record(7, &[&[false, true], &[false, false, true]]));
        b.insert("Bar", record(1, &[&[true]]));

        a.merge(&b);

        assert_eq!(a.len(), 2);
        assert_eq!(a.classes["Foo"].blocks, vec![vec![true, true], vec![false, false, true]]);
        assert_eq!(a.classes["Bar"].hits(), 1);
    }

    #[test]
    fn merge_replaces_on_stamp_mismatch() {
        let mut a = CoverageSnapshot::new();
        a.insert("Foo", record(1, &[&[true, true]]));
        let mut b = CoverageSnapshot::new();
        b.insert("Foo", record(2, &[&[false]]));

        a.merge(&b);

        assert_eq!(a.classes["Foo"], record(2, &[&[false]]));
    }

    #[test]
    fn bytes_roundtrip() {
        let mut snap = CoverageSnapshot::new();
        snap.insert("a.B", record(-3, &[&[true], &[]]));
        let bytes = snap.to_bytes().unwrap();
        assert_eq!(bytes[0], SNAPSHOT_VERSION);
        assert_eq!(CoverageSnapshot::from_bytes(&bytes).unwrap(), snap);
    }

    #[test]
    fn rejects_unknown_version_and_empty_input() {
        assert!(matches!(
            CoverageSnapshot::from_bytes(&[9, 0]),
            Err(Error::UnsupportedSnapshotVersion(9))
        ));
        assert!(matches!(
            CoverageSnapshot::from_bytes(&[]),
            Err(Error::EmptySnapshot)
        ));
    }
}

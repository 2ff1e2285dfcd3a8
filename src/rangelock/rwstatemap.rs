//! The per-transaction shadow of the global range-lock map (spec §4.2,
//! §9 "Range-lock map") plus the record-range arithmetic shared by every
//! regular-file call.

use std::collections::BTreeMap;

use super::pgtree::{PageTree, RecordId};
use crate::error::{Error, Result};

/// The level this transaction actually holds globally for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeldLevel {
    Read,
    Write,
}

/// What this transaction will need for one record by the time it commits.
/// A record can be recorded as `Write`-desired before the global write
/// lock is actually taken: §4.6 defers the write acquisition to
/// `pre_commit`, sorted by offset, so that the only place cross-file
/// locks are ordered is that single sorted pass (design notes, §4.6
/// step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DesiredLevel {
    Read,
    Write,
}

struct Entry {
    held: Option<HeldLevel>,
    desired: DesiredLevel,
}

/// Converts a half-open byte range into the (inclusive) record-id range it
/// covers, given the configured record size.
pub fn records_in_range(offset: i64, nbyte: usize, record_size: usize) -> impl Iterator<Item = RecordId> {
    let first = (offset as u64) / record_size as u64;
    let last = if nbyte == 0 {
        first
    } else {
        ((offset as u64) + nbyte as u64 - 1) / record_size as u64
    };
    first..=last
}

/// Per-transaction byte-range lock bookkeeping for one regular file.
///
/// Reads take the global lock immediately (spec §4.5: read's exec
/// "Acquire reader range lock"), since the overlay of in-transaction
/// writes onto a read needs a consistent snapshot from the moment of the
/// call. Writes are recorded locally and only actually locked globally
/// at `pre_commit`, because nothing a write does becomes visible outside
/// the transaction before commit (spec §4.5: write's undo is a no-op,
/// "nothing globally visible yet") — there is no correctness reason to
/// take the global write bit any earlier, and deferring it lets
/// `pre_commit` sort all of a transaction's write acquisitions by offset
/// before applying them, which is the ordering spec §4.6 calls out as the
/// system's only cross-transaction deadlock-avoidance point.
#[derive(Default)]
pub struct RangeLockSet {
    entries: BTreeMap<RecordId, Entry>,
}

impl RangeLockSet {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// Acquires (immediately, globally) read access to every record in
    /// `[offset, offset+nbyte)`.
    pub fn acquire_read(&mut self, global: &PageTree, record_size: usize, offset: i64, nbyte: usize) -> Result<()> {
        for rec in records_in_range(offset, nbyte, record_size) {
            match self.entries.get(&rec) {
                Some(_) => continue,
                None => {
                    if global.try_rdlock(rec) {
                        self.entries.insert(rec, Entry { held: Some(HeldLevel::Read), desired: DesiredLevel::Read });
                    } else {
                        return Err(Error::Conflict);
                    }
                }
            }
        }
        Ok(())
    }

    /// Records that every record in `[offset, offset+nbyte)` will need
    /// the write lock by commit time. Does not touch the global map yet.
    pub fn acquire_write(&mut self, record_size: usize, offset: i64, nbyte: usize) {
        for rec in records_in_range(offset, nbyte, record_size) {
            self.entries
                .entry(rec)
                .and_modify(|e| e.desired = DesiredLevel::Write)
                .or_insert(Entry { held: None, desired: DesiredLevel::Write });
        }
    }

    /// Finalizes every pending write acquisition, in ascending record
    /// order (spec §4.6 step 2). Returns `Conflict` on the first failure;
    /// records already finalized before the failure remain held (the
    /// caller aborts the whole transaction in that case, so they will be
    /// released by `release_all` during rollback).
    pub fn pre_commit(&mut self, global: &PageTree) -> Result<()> {
        for (rec, entry) in self.entries.iter_mut() {
            if entry.desired != DesiredLevel::Write {
                continue;
            }
            match entry.held {
                Some(HeldLevel::Write) => {}
                Some(HeldLevel::Read) => {
                    if global.try_upgrade(*rec) {
                        entry.held = Some(HeldLevel::Write);
                    } else {
                        return Err(Error::Conflict);
                    }
                }
                None => {
                    if global.try_wrlock(*rec) {
                        entry.held = Some(HeldLevel::Write);
                    } else {
                        return Err(Error::Conflict);
                    }
                }
            }
        }
        Ok(())
    }

    /// Releases every globally held record, in descending record order
    /// (spec §4.6 step 5 / §4.7 step 2: "reverse offset order").
    pub fn release_all(&mut self, global: &PageTree) {
        for (rec, entry) in self.entries.iter().rev() {
            match entry.held {
                Some(HeldLevel::Read) => global.rdunlock(*rec),
                Some(HeldLevel::Write) => global.wrunlock(*rec),
                None => {}
            }
        }
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_then_write_same_tx_upgrades_at_precommit() {
        let global = PageTree::new();
        let mut local = RangeLockSet::new();
        local.acquire_read(&global, 512, 0, 10).unwrap();
        local.acquire_write(512, 0, 10);
        local.pre_commit(&global).unwrap();
        local.release_all(&global);
    }

    #[test]
    fn two_transactions_writing_same_range_conflict() {
        let global = PageTree::new();
        let mut a = RangeLockSet::new();
        let mut b = RangeLockSet::new();
        a.acquire_write(512, 0, 10);
        b.acquire_write(512, 0, 10);
        a.pre_commit(&global).unwrap();
        assert_eq!(b.pre_commit(&global), Err(Error::Conflict));
        a.release_all(&global);
    }
}

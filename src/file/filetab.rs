//! Per-variant file interning table (spec §3.3, §4.3).

use std::os::unix::io::RawFd;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::CcMode;
use crate::error::{Error, Result};
use crate::fileid::FileId;

use super::{ChrDev, Dir, Fifo, FileCore, RefOutcome, RegFile, Socket};

/// A file-record type that can be created in the dead (unreferenced)
/// state and exposes its common [`FileCore`].
pub trait FileSlot {
    fn new_dead() -> Self;
    fn core(&self) -> &FileCore;
}

impl FileSlot for RegFile {
    fn new_dead() -> Self {
        RegFile::new_dead()
    }
    fn core(&self) -> &FileCore {
        &self.core
    }
}
impl FileSlot for Dir {
    fn new_dead() -> Self {
        Dir::new_dead()
    }
    fn core(&self) -> &FileCore {
        &self.core
    }
}
impl FileSlot for Fifo {
    fn new_dead() -> Self {
        Fifo::new_dead()
    }
    fn core(&self) -> &FileCore {
        &self.core
    }
}
impl FileSlot for ChrDev {
    fn new_dead() -> Self {
        ChrDev::new_dead()
    }
    fn core(&self) -> &FileCore {
        &self.core
    }
}
impl FileSlot for Socket {
    fn new_dead() -> Self {
        Socket::new_dead()
    }
    fn core(&self) -> &FileCore {
        &self.core
    }
}

/// Fixed-capacity table of file records for one variant (spec §3.3).
///
/// Slots never move once appended: `ref_fildes` grows the table only by
/// pushing, and reuses a dead slot in place, so a slot's index is a
/// stable handle (`file_slot_index` in spec §3.5) for as long as the
/// process runs. Capacity is `MAXNUMFD`, the kernel's descriptor limit.
pub struct FileTab<T> {
    slots: RwLock<Vec<Arc<T>>>,
    capacity: usize,
}

impl<T: FileSlot> FileTab<T> {
    pub fn new(capacity: usize) -> Self {
        Self { slots: RwLock::new(Vec::new()), capacity }
    }

    /// Interns the file behind `fildes`, returning the (possibly shared)
    /// record and its stable slot index (spec §4.3).
    pub fn ref_fildes(&self, fildes: RawFd, default_cc: CcMode) -> Result<(Arc<T>, usize)> {
        let id = FileId::of_fildes(fildes)?;

        if let Some(found) = Self::scan_for_match(&self.slots.read(), id) {
            return Ok(found);
        }

        let mut slots = self.slots.write();
        if let Some(found) = Self::scan_for_match(&slots, id) {
            return Ok(found);
        }
        for (i, rec) in slots.iter().enumerate() {
            if rec.core().try_reuse_dead(id, default_cc) != RefOutcome::NoMatch {
                return Ok((rec.clone(), i));
            }
        }
        if slots.len() >= self.capacity {
            return Err(Error::Conflict);
        }
        let rec = Arc::new(T::new_dead());
        let outcome = rec.core().try_reuse_dead(id, default_cc);
        debug_assert_eq!(outcome, RefOutcome::Reused);
        let idx = slots.len();
        slots.push(rec.clone());
        Ok((rec, idx))
    }

    fn scan_for_match(slots: &[Arc<T>], id: FileId) -> Option<(Arc<T>, usize)> {
        for (i, rec) in slots.iter().enumerate() {
            if rec.core().cmp_and_ref(id) == RefOutcome::Matched {
                return Some((rec.clone(), i));
            }
        }
        None
    }

    pub fn get(&self, index: usize) -> Arc<T> {
        self.slots.read()[index].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn same_file_interns_to_one_record() {
        let f = tempfile::tempfile().unwrap();
        let tab: FileTab<RegFile> = FileTab::new(16);
        let (rec_a, idx_a) = tab.ref_fildes(f.as_raw_fd(), CcMode::TwoPL).unwrap();
        let (rec_b, idx_b) = tab.ref_fildes(f.as_raw_fd(), CcMode::TwoPL).unwrap();
        assert_eq!(idx_a, idx_b);
        assert!(Arc::ptr_eq(&rec_a, &rec_b));
        assert!(rec_a.core.is_live());
    }

    #[test]
    fn distinct_files_get_distinct_slots() {
        let a = tempfile::tempfile().unwrap();
        let b = tempfile::tempfile().unwrap();
        let tab: FileTab<RegFile> = FileTab::new(16);
        let (_, idx_a) = tab.ref_fildes(a.as_raw_fd(), CcMode::TwoPL).unwrap();
        let (_, idx_b) = tab.ref_fildes(b.as_raw_fd(), CcMode::TwoPL).unwrap();
        assert_ne!(idx_a, idx_b);
    }
}

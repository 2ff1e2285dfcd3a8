//! Byte-range locking for regular files (spec §4.2).

mod pgtree;
mod rwstatemap;

pub use pgtree::{PageTree, RecordId, PGTREE_NENTRIES};
pub use rwstatemap::{records_in_range, RangeLockSet};

//! Software transactional memory for POSIX file-descriptor operations.
//!
//! This engine gives a transaction atomic, isolated semantics over a
//! bounded set of file-descriptor syscalls: `read`/`write`/`pread`/
//! `pwrite`/`lseek`/`fcntl`/`open`/`close`/`pipe`/`dup`/`fsync`/`sync`,
//! plus socket calls (`socket`/`bind`/`connect`/`listen`/`accept`/`send`/
//! `recv`/`shutdown`) and `select`. A transaction's effects on these
//! calls become visible to the rest of the process atomically at
//! [`fildes_tx::FildesTx::commit`], or vanish entirely at
//! [`fildes_tx::FildesTx::rollback`].
//!
//! # Architecture
//!
//! Six layers, from identity to transaction root:
//!
//! - **File-id** ([`fileid`]): the `(dev, ino, mode, fifo_flags)` tuple
//!   that identifies the kernel object behind a fildes, independent of
//!   which process descriptor currently names it.
//! - **File** ([`file`]): one record per unique kernel object, holding a
//!   reference count, a concurrency-control mode, and a field-level rwlock
//!   array. One variant per file type: [`file::RegFile`], [`file::Dir`],
//!   [`file::Fifo`], [`file::ChrDev`], [`file::Socket`].
//! - **File table** ([`file::filetab`]): interns file-ids into file
//!   records, one table per variant.
//! - **OFD** (open file description, [`ofdtx`]): a transaction's private
//!   view of one file record — buffered writes, a local offset shadow,
//!   and the lock state this transaction itself holds.
//! - **Descriptor** ([`fd`], [`fdtx`]): the process-wide slot a raw fildes
//!   number names, and a transaction's reference to it.
//! - **Transaction** ([`fildes_tx`]): the root that ties a transaction's
//!   `fd_tx`/`ofd_tx` tables together with its event log and drives
//!   commit/rollback.
//!
//! # Concurrency control
//!
//! Every file record and fd_tx chooses between two modes (see
//! [`config::CcMode`]):
//!
//! - **Two-phase locking (`TwoPL`)**: the default. Effects are buffered in
//!   the `ofd_tx` and replayed against the kernel only at commit, under
//!   locks acquired as the transaction executes and released afterward.
//! - **`NoUndo`**: effects run immediately at `exec` time, irrevocably.
//!   Any operation with no meaningful undo — consuming bytes from a pipe
//!   or socket via `read`/`recv`, `connect`, `bind`, `shutdown` — is
//!   `NoUndo`-only and returns [`error::Error::Revocable`] otherwise,
//!   telling the host to restart the transaction irrevocably.
//!
//! # Non-goals
//!
//! This engine does not implement directory-entry operations (`open`'s
//! path resolution is delegated to the kernel as-is; no `mkdir`/`unlink`/
//! `rename` semantics live here), does not provide an optimistic
//! (timestamp-based) concurrency mode, and does not itself schedule or
//! limit the threads driving transactions.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod call;
pub mod config;
pub mod error;
pub mod fd;
pub mod fdtx;
pub mod file;
pub mod fileid;
pub mod fildes_tx;
pub mod ofdtx;
pub mod oplog;
pub mod rangelock;
pub mod rwlock;

pub use crate::config::{CcMode, Config, ValidationMode};
pub use crate::error::{Error, Result};
pub use crate::fildes_tx::{Engine, FildesTx};

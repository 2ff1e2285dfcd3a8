//! Exercises the cross-layer invariants from the field-level and
//! fildes-level locking protocol, driven through the public API rather
//! than the internal lock types directly.

use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use fdtx_engine::{Engine, FildesTx};

fn new_engine() -> Arc<Engine> {
    Arc::new(Engine::default())
}

/// Invariant: a concurrent writer to the same byte range must see a
/// conflict rather than a silently lost update (2PL range locking, not
/// last-writer-wins).
#[test]
fn overlapping_pwrite_ranges_conflict_at_exec_or_commit() {
    let engine = new_engine();
    let file = tempfile::NamedTempFile::new().unwrap();
    file.as_file().set_len(4).unwrap();
    let fildes = file.as_raw_fd();

    let mut tx_a = FildesTx::new(engine.clone());
    let mut tx_b = FildesTx::new(engine);
    tx_a.exec_pwrite(fildes, b"AAAA", 0, false).unwrap();

    let b_result = tx_b.exec_pwrite(fildes, b"BBBB", 0, false);
    match b_result {
        Ok(_) => {
            // Both staged: the conflict must then surface at commit time
            // for at least one of them.
            let a_commit = tx_a.commit();
            let b_commit = tx_b.commit();
            assert!(
                a_commit.is_err() || b_commit.is_err(),
                "overlapping writers must not both commit silently"
            );
        }
        Err(_) => {
            tx_a.commit().unwrap();
        }
    }
}

/// Invariant: once one transaction has called `close` on a fildes (its
/// slot moves to `Closing` immediately, not deferred to commit), a
/// second transaction trying to reference the same fildes number sees
/// the conflict right away rather than racing the closer to commit.
#[test]
fn close_then_foreign_use_conflicts_immediately() {
    let engine = new_engine();
    let file = tempfile::NamedTempFile::new().unwrap();
    let fildes = file.as_raw_fd();

    let mut closer = FildesTx::new(engine.clone());
    closer.exec_close(fildes, false).unwrap();

    let mut other = FildesTx::new(engine);
    let mut buf = [0u8; 1];
    let err = other.exec_read(fildes, &mut buf, false).unwrap_err();
    assert_eq!(err, fdtx_engine::Error::Conflict);

    closer.commit().unwrap();
    // `other` never acquired a reference, so it has nothing to undo.
    other.rollback().unwrap();
}

/// Invariant: read-your-own-writes — a transaction's own buffered write
/// is visible to its own subsequent read, even though nothing has
/// reached the kernel yet.
#[test]
fn read_your_own_write_without_commit() {
    let engine = new_engine();
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), b"aaaa").unwrap();
    let fildes = file.as_raw_fd();

    let mut tx = FildesTx::new(engine);
    tx.exec_pwrite(fildes, b"ZZ", 1, false).unwrap();
    let mut buf = [0u8; 4];
    tx.exec_pread(fildes, &mut buf, 0, false).unwrap();
    assert_eq!(&buf, b"aZZa");
    tx.rollback().unwrap();
}

/// Invariant: a FIFO read has no 2PL form and must report `Revocable`
/// unless the transaction runs irrevocably.
#[test]
fn fifo_read_requires_noundo() {
    let engine = new_engine();
    let mut tx = FildesTx::new(engine);
    let (read_fd, write_fd) = tx.exec_pipe(true).unwrap();
    tx.exec_write(write_fd, b"x", true).unwrap();

    let mut buf = [0u8; 1];
    let err = tx.exec_read(read_fd, &mut buf, false).unwrap_err();
    assert_eq!(err, fdtx_engine::Error::Revocable);
}

/// Invariant: `connect`/`bind`/`shutdown` are always irrevocable-only,
/// regardless of the socket's configured default CC mode.
#[test]
fn socket_bind_requires_noundo() {
    let engine = new_engine();
    let mut tx = FildesTx::new(engine);
    let fildes = tx.exec_socket(libc::AF_UNIX, libc::SOCK_STREAM, 0, true).unwrap();

    let addr = libc::sockaddr { sa_family: libc::AF_UNIX as libc::sa_family_t, sa_data: [0; 14] };
    let err = tx
        .exec_bind(fildes, &addr as *const _, std::mem::size_of::<libc::sockaddr>() as libc::socklen_t, false)
        .unwrap_err();
    assert_eq!(err, fdtx_engine::Error::Revocable);
}

/// Invariant: `lseek` on a FIFO always fails with `ESPIPE`, under any CC
/// mode.
#[test]
fn fifo_lseek_is_espipe() {
    let engine = new_engine();
    let mut tx = FildesTx::new(engine);
    let (read_fd, _write_fd) = tx.exec_pipe(true).unwrap();
    let err = tx.exec_lseek(read_fd, 0, nix::unistd::Whence::SeekSet, true).unwrap_err();
    assert_eq!(err, fdtx_engine::Error::Errno(nix::errno::Errno::ESPIPE));
}

/// Invariant: `O_TRUNC` without irrevocable mode is rejected up front,
/// before any kernel call is made, rather than silently truncating a
/// file no other reader can recover.
#[test]
fn open_with_truncate_requires_noundo() {
    let engine = new_engine();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trunc.txt");
    std::fs::write(&path, b"existing").unwrap();

    let mut tx = FildesTx::new(engine);
    let err = tx
        .exec_open(
            None,
            &path,
            nix::fcntl::OFlag::O_WRONLY | nix::fcntl::OFlag::O_TRUNC,
            nix::sys::stat::Mode::empty(),
            false,
        )
        .unwrap_err();
    assert_eq!(err, fdtx_engine::Error::Revocable);
    assert_eq!(std::fs::read(&path).unwrap(), b"existing");
}

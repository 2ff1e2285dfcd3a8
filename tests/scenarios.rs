//! End-to-end commit/rollback scenarios driven through the public API,
//! one real kernel object (regular file, pipe, or socket pair) per test.

use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use fdtx_engine::{CcMode, Config, Engine, FildesTx};
use nix::unistd::Whence;

fn new_engine() -> Arc<Engine> {
    Arc::new(Engine::default())
}

/// S1: a committed write is visible to a fresh transaction afterward.
#[test]
fn s1_committed_write_is_visible_to_later_transaction() {
    let engine = new_engine();
    let file = tempfile::NamedTempFile::new().unwrap();
    let fildes = file.as_raw_fd();

    let mut tx1 = FildesTx::new(engine.clone());
    tx1.exec_write(fildes, b"v1", false).unwrap();
    tx1.commit().unwrap();

    let mut buf = [0u8; 2];
    let mut tx2 = FildesTx::new(engine);
    tx2.exec_pread(fildes, &mut buf, 0, false).unwrap();
    assert_eq!(&buf, b"v1");
}

/// S2: two transactions writing disjoint byte ranges of the same file
/// both commit without conflict.
#[test]
fn s2_disjoint_pwrite_ranges_do_not_conflict() {
    let engine = new_engine();
    let file = tempfile::NamedTempFile::new().unwrap();
    file.as_file().set_len(8).unwrap();
    let fildes = file.as_raw_fd();

    let mut tx_a = FildesTx::new(engine.clone());
    let mut tx_b = FildesTx::new(engine.clone());
    tx_a.exec_pwrite(fildes, b"AAAA", 0, false).unwrap();
    tx_b.exec_pwrite(fildes, b"BBBB", 4, false).unwrap();
    tx_a.commit().unwrap();
    tx_b.commit().unwrap();

    let contents = std::fs::read(file.path()).unwrap();
    assert_eq!(&contents, b"AAAABBBB");
}

/// S3: a rolled-back transaction leaves no trace, including its own
/// opened-and-unlinked file.
#[test]
fn s3_rollback_of_create_unlinks_and_closes() {
    let engine = new_engine();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("created.txt");

    let mut tx = FildesTx::new(engine);
    let fildes = tx
        .exec_open(
            None,
            &path,
            nix::fcntl::OFlag::O_CREAT | nix::fcntl::OFlag::O_EXCL | nix::fcntl::OFlag::O_RDWR,
            nix::sys::stat::Mode::from_bits_truncate(0o644),
            false,
        )
        .unwrap();
    assert!(fildes >= 0);
    tx.exec_write(fildes, b"scratch", false).unwrap();
    tx.rollback().unwrap();

    assert!(!path.exists(), "rollback of O_CREAT|O_EXCL must unlink the created file");
}

/// S4: a committed open+write is visible on disk, and the created file
/// is *not* cleaned up (commit keeps it, rollback would not have).
#[test]
fn s4_commit_of_create_keeps_file_and_contents() {
    let engine = new_engine();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kept.txt");

    let mut tx = FildesTx::new(engine);
    let fildes = tx
        .exec_open(
            None,
            &path,
            nix::fcntl::OFlag::O_CREAT | nix::fcntl::OFlag::O_EXCL | nix::fcntl::OFlag::O_RDWR,
            nix::sys::stat::Mode::from_bits_truncate(0o644),
            false,
        )
        .unwrap();
    tx.exec_write(fildes, b"kept", false).unwrap();
    tx.commit().unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), b"kept");
}

/// S5: a pipe created and written within one transaction is only
/// readable by another descriptor after commit flushes the buffered
/// write to the kernel.
#[test]
fn s5_pipe_write_buffered_until_commit() {
    let engine = new_engine();
    let mut tx = FildesTx::new(engine.clone());
    let (read_fd, write_fd) = tx.exec_pipe(false).unwrap();
    tx.exec_write(write_fd, b"piped", false).unwrap();
    tx.commit().unwrap();

    let mut reader_tx = FildesTx::new(engine);
    let mut buf = [0u8; 5];
    reader_tx
        .exec_read(read_fd, &mut buf, true)
        .expect("fifo read requires NoUndo");
    assert_eq!(&buf, b"piped");
}

/// S6: `lseek` followed by a read within the same transaction observes
/// the transaction's own prior write (read-your-own-writes), and an
/// absolute `SEEK_SET` to a stale position after rollback has no
/// lasting effect on the shared file offset.
#[test]
fn s6_lseek_and_read_your_own_write_then_rollback_offset_is_unaffected() {
    let engine = new_engine();
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), b"0123456789").unwrap();
    let fildes = file.as_raw_fd();

    let mut tx = FildesTx::new(engine.clone());
    let pos = tx.exec_lseek(fildes, 5, Whence::SeekSet, false).unwrap();
    assert_eq!(pos, 5);
    tx.exec_write(fildes, b"XY", false).unwrap();
    tx.exec_lseek(fildes, -2, Whence::SeekCur, false).unwrap();
    let mut buf = [0u8; 2];
    tx.exec_read(fildes, &mut buf, false).unwrap();
    assert_eq!(&buf, b"XY");
    tx.rollback().unwrap();

    let mut verify_tx = FildesTx::new(engine);
    let mut buf = [0u8; 10];
    verify_tx.exec_pread(fildes, &mut buf, 0, false).unwrap();
    assert_eq!(&buf, b"0123456789", "rolled-back write/seek must not reach disk");
}

/// A file record configured `NoUndo` applies every effect immediately;
/// `rollback` afterward cannot take any of it back.
#[test]
fn noundo_regfile_effects_survive_a_rollback_call() {
    let config = Config::new().cc_mode_for(fdtx_engine::file::FileType::RegFile, CcMode::NoUndo);
    let engine = Arc::new(Engine::new(config));
    let file = tempfile::NamedTempFile::new().unwrap();
    let fildes = file.as_raw_fd();

    let mut tx = FildesTx::new(engine);
    tx.exec_write(fildes, b"irrevocable", false).unwrap();
    tx.rollback().unwrap();

    assert_eq!(std::fs::read(file.path()).unwrap(), b"irrevocable");
}

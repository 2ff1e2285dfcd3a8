//! The transaction root (spec §3.7): per-transaction descriptor and OFD
//! tables, the event log, and the commit/rollback protocol (§4.6, §4.7).

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::Whence;

use crate::call::{CallKind, Cookie, FdEvent};
use crate::config::{CcMode, Config};
use crate::error::{Error, Result};
use crate::fd::FdTable;
use crate::fdtx::FdTx;
use crate::file::filetab::FileTab;
use crate::file::{ChrDev, Dir, Fifo, FileType, RegFile, Socket};
use crate::ofdtx::{chrdev::ChrDevTx, dir::DirTx, fifo::FifoTx, regfile::RegFileTx, socket::SocketTx, OfdTx};
use crate::oplog::{FcntlOp, OpLog, OpenOp, PipeOp};

/// Process-wide shared state: the five per-variant file tables, the
/// descriptor table, and host configuration (spec §2 table: L2-L5
/// "Shared object" column). One `Engine` is constructed by the host and
/// shared, typically via `Arc`, by every concurrent [`FildesTx`].
pub struct Engine {
    pub config: Config,
    pub fd_table: FdTable,
    pub regfile_tab: FileTab<RegFile>,
    pub dir_tab: FileTab<Dir>,
    pub fifo_tab: FileTab<Fifo>,
    pub chrdev_tab: FileTab<ChrDev>,
    pub socket_tab: FileTab<Socket>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let capacity = nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE)
            .map(|(soft, _hard)| soft as usize)
            .unwrap_or(65536);
        Self {
            config,
            fd_table: FdTable::new(),
            regfile_tab: FileTab::new(capacity),
            dir_tab: FileTab::new(capacity),
            fifo_tab: FileTab::new(capacity),
            chrdev_tab: FileTab::new(capacity),
            socket_tab: FileTab::new(capacity),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Config::new())
    }
}

fn classify(fildes: RawFd) -> Result<FileType> {
    let st = nix::sys::stat::fstat(unsafe { std::os::fd::BorrowedFd::borrow_raw(fildes) })?;
    let mode = st.st_mode & libc::S_IFMT;
    Ok(match mode {
        libc::S_IFREG => FileType::RegFile,
        libc::S_IFDIR => FileType::Dir,
        libc::S_IFIFO => FileType::Fifo,
        libc::S_IFCHR => FileType::ChrDev,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::ChrDev,
    })
}

/// One transaction's view of the whole file-descriptor subsystem (spec
/// §3.7). Holds no references across transactions: everything here is
/// dropped (cascading into `unref`) by `commit`/`rollback`.
pub struct FildesTx {
    engine: Arc<Engine>,
    fd_tx: HashMap<RawFd, FdTx>,
    ofd_tx: HashMap<(FileType, usize), OfdTx>,
    event_log: Vec<FdEvent>,
    root_oplog: OpLog,
    irrevocable: bool,
}

impl FildesTx {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            fd_tx: HashMap::new(),
            ofd_tx: HashMap::new(),
            event_log: Vec::new(),
            root_oplog: OpLog::new(),
            irrevocable: false,
        }
    }

    fn log_event(&mut self, call: CallKind, fildes: RawFd, cookie: Cookie) {
        debug!(target: self.engine.config.get_log_target(), "exec {call:?} fildes={fildes} cookie={cookie}");
        self.event_log.push(FdEvent { call, fildes, cookie });
    }

    fn note_irrevocable(&mut self, is_noundo: bool) {
        if is_noundo {
            self.irrevocable = true;
        }
    }

    /// Resolves (creating if necessary) the `fd_tx`/`ofd_tx` pair for
    /// `fildes`, interning its file record on first reference (spec §4.3,
    /// §4.4). `want_new` forces a fresh binding (spec §4.4 table,
    /// `WANTNEW`) for calls that just created `fildes` themselves.
    fn bind(&mut self, fildes: RawFd, want_new: bool, is_noundo: bool) -> Result<(FileType, usize)> {
        self.note_irrevocable(is_noundo);
        if let Some(tx) = self.fd_tx.get(&fildes) {
            if tx.holds_ref() && !want_new {
                return Ok((tx.file_type(), tx.file_slot_index()));
            }
        }
        let file_type = classify(fildes)?;
        let default_cc = if self.irrevocable { CcMode::NoUndo } else { self.engine.config.default_cc_mode(file_type) };
        let (slot_idx, cc_mode) = match file_type {
            FileType::RegFile => {
                let (rec, idx) = self.engine.regfile_tab.ref_fildes(fildes, default_cc)?;
                let cc = rec.core.cc_mode();
                self.ofd_tx.entry((file_type, idx)).or_insert_with(|| OfdTx::RegFile(RegFileTx::new(rec)));
                (idx, cc)
            }
            FileType::Dir => {
                let (rec, idx) = self.engine.dir_tab.ref_fildes(fildes, default_cc)?;
                let cc = rec.core.cc_mode();
                self.ofd_tx.entry((file_type, idx)).or_insert_with(|| OfdTx::Dir(DirTx::new(rec)));
                (idx, cc)
            }
            FileType::Fifo => {
                let (rec, idx) = self.engine.fifo_tab.ref_fildes(fildes, default_cc)?;
                let cc = rec.core.cc_mode();
                let raw_flags = nix::fcntl::fcntl(unsafe { std::os::fd::BorrowedFd::borrow_raw(fildes) }, FcntlArg::F_GETFL).unwrap_or(0);
                let is_read_end = !OFlag::from_bits_truncate(raw_flags).contains(OFlag::O_WRONLY);
                self.ofd_tx.entry((file_type, idx)).or_insert_with(|| OfdTx::Fifo(FifoTx::new(rec, is_read_end)));
                (idx, cc)
            }
            FileType::ChrDev => {
                let (rec, idx) = self.engine.chrdev_tab.ref_fildes(fildes, default_cc)?;
                let cc = rec.core.cc_mode();
                self.ofd_tx.entry((file_type, idx)).or_insert_with(|| OfdTx::ChrDev(ChrDevTx::new(rec)));
                (idx, cc)
            }
            FileType::Socket => {
                let (rec, idx) = self.engine.socket_tab.ref_fildes(fildes, default_cc)?;
                let cc = rec.core.cc_mode();
                self.ofd_tx.entry((file_type, idx)).or_insert_with(|| OfdTx::Socket(SocketTx::new(rec)));
                (idx, cc)
            }
        };
        let fd_tx = self.fd_tx.entry(fildes).or_insert_with(FdTx::empty);
        fd_tx.ref_fildes(&self.engine.fd_table, fildes, file_type, slot_idx, cc_mode, want_new)?;
        let ofd = self.ofd_tx.get_mut(&(file_type, slot_idx)).expect("just inserted");
        match ofd {
            OfdTx::RegFile(t) => t.bind(fildes)?,
            OfdTx::ChrDev(t) => t.bind(fildes)?,
            OfdTx::Fifo(t) => t.bind(),
            OfdTx::Dir(t) => t.bind(),
            OfdTx::Socket(t) => t.bind_tx(),
        }
        Ok((file_type, slot_idx))
    }

    fn ofd_mut(&mut self, key: (FileType, usize)) -> &mut OfdTx {
        self.ofd_tx.get_mut(&key).expect("ofd_tx must be bound before use")
    }

    // ---- read/write family (spec §4.5) ----

    pub fn exec_read(&mut self, fildes: RawFd, buf: &mut [u8], is_noundo: bool) -> Result<usize> {
        let key = self.bind(fildes, false, is_noundo)?;
        let record_size = self.engine.config.get_record_size();
        let n = match self.ofd_mut(key) {
            OfdTx::RegFile(t) => t.exec_read(fildes, buf, record_size)?,
            OfdTx::ChrDev(t) => t.exec_read(fildes, buf)?,
            OfdTx::Fifo(t) => t.exec_read(fildes, buf)?,
            _ => return Err(Error::Errno(Errno::EINVAL)),
        };
        self.log_event(CallKind::Read, fildes, 0);
        Ok(n)
    }

    pub fn exec_write(&mut self, fildes: RawFd, buf: &[u8], is_noundo: bool) -> Result<usize> {
        let key = self.bind(fildes, false, is_noundo)?;
        let record_size = self.engine.config.get_record_size();
        let n = match self.ofd_mut(key) {
            OfdTx::RegFile(t) => t.exec_write(fildes, buf, record_size)?,
            OfdTx::ChrDev(t) => t.exec_write(fildes, buf)?,
            OfdTx::Fifo(t) => t.exec_write(fildes, buf)?,
            OfdTx::Socket(t) => t.exec_send(fildes, buf, 0)?,
            _ => return Err(Error::Errno(Errno::EINVAL)),
        };
        self.log_event(CallKind::Write, fildes, 0);
        Ok(n)
    }

    pub fn exec_pread(&mut self, fildes: RawFd, buf: &mut [u8], offset: i64, is_noundo: bool) -> Result<usize> {
        let key = self.bind(fildes, false, is_noundo)?;
        let record_size = self.engine.config.get_record_size();
        let n = match self.ofd_mut(key) {
            OfdTx::RegFile(t) => t.exec_pread(fildes, buf, offset, record_size)?,
            _ => return Err(Error::Errno(Errno::ESPIPE)),
        };
        self.log_event(CallKind::Pread, fildes, 0);
        Ok(n)
    }

    pub fn exec_pwrite(&mut self, fildes: RawFd, buf: &[u8], offset: i64, is_noundo: bool) -> Result<usize> {
        let key = self.bind(fildes, false, is_noundo)?;
        let record_size = self.engine.config.get_record_size();
        let n = match self.ofd_mut(key) {
            OfdTx::RegFile(t) => t.exec_pwrite(fildes, buf, offset, record_size)?,
            _ => return Err(Error::Errno(Errno::ESPIPE)),
        };
        self.log_event(CallKind::Pwrite, fildes, 0);
        Ok(n)
    }

    pub fn exec_lseek(&mut self, fildes: RawFd, offset: i64, whence: Whence, is_noundo: bool) -> Result<i64> {
        let key = self.bind(fildes, false, is_noundo)?;
        let result = match self.ofd_mut(key) {
            OfdTx::RegFile(t) => t.exec_lseek(fildes, offset, whence)?,
            OfdTx::ChrDev(t) => t.exec_lseek(fildes, offset, whence)?,
            OfdTx::Fifo(t) => t.exec_lseek()?,
            OfdTx::Socket(_) => return Err(Error::Errno(Errno::ESPIPE)),
            OfdTx::Dir(_) => return Err(Error::Errno(Errno::EISDIR)),
        };
        self.log_event(CallKind::Lseek, fildes, 0);
        Ok(result)
    }

    pub fn exec_fsync(&mut self, fildes: RawFd, is_noundo: bool) -> Result<()> {
        let key = self.bind(fildes, false, is_noundo)?;
        if let OfdTx::RegFile(t) = self.ofd_mut(key) {
            t.exec_fsync(fildes)?;
        }
        self.log_event(CallKind::Fsync, fildes, 0);
        Ok(())
    }

    /// `sync` (spec §4.5: "NoUndo runs it twice (once at exec, once at
    /// apply) to get commit-time durability").
    pub fn exec_sync(&mut self, fildes: RawFd, is_noundo: bool) -> Result<()> {
        let key = self.bind(fildes, false, is_noundo)?;
        if let OfdTx::RegFile(t) = self.ofd_mut(key) {
            t.exec_sync(fildes)?;
        }
        self.log_event(CallKind::Sync, fildes, 0);
        Ok(())
    }

    // ---- fildes lifecycle (spec §4.5) ----

    pub fn exec_open(&mut self, dirfd: Option<RawFd>, path: &Path, oflag: OFlag, mode: Mode, is_noundo: bool) -> Result<RawFd> {
        if oflag.contains(OFlag::O_TRUNC) && !is_noundo {
            return Err(Error::Revocable);
        }
        self.note_irrevocable(is_noundo);
        let dirfd = dirfd.unwrap_or(libc::AT_FDCWD);
        let c_path = std::ffi::CString::new(std::os::unix::ffi::OsStrExt::as_bytes(path.as_os_str()))
            .map_err(|_| Error::Errno(Errno::EINVAL))?;
        let new_fd = Errno::result(unsafe { libc::openat(dirfd, c_path.as_ptr(), oflag.bits(), mode.bits() as libc::c_uint) })?;
        let unlink_on_undo = oflag.contains(OFlag::O_CREAT) && oflag.contains(OFlag::O_EXCL);
        let st = nix::sys::stat::fstat(unsafe { std::os::fd::BorrowedFd::borrow_raw(new_fd) })?;
        self.bind(new_fd, true, is_noundo)?;
        let cookie = self.root_oplog.push_openop(OpenOp {
            path: path.to_path_buf(),
            unlink_on_undo,
            created_ino: st.st_ino as u64,
            created_dev: st.st_dev as u64,
        });
        self.log_event(CallKind::Open, new_fd, cookie);
        Ok(new_fd)
    }

    pub fn exec_close(&mut self, fildes: RawFd, is_noundo: bool) -> Result<()> {
        let _ = self.bind(fildes, false, is_noundo)?;
        self.fd_tx.get_mut(&fildes).expect("bound above").signal_close(&self.engine.fd_table)?;
        self.log_event(CallKind::Close, fildes, 0);
        Ok(())
    }

    pub fn exec_pipe(&mut self, is_noundo: bool) -> Result<(RawFd, RawFd)> {
        self.note_irrevocable(is_noundo);
        let mut fds: [RawFd; 2] = [0, 0];
        Errno::result(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        let (read_fd, write_fd) = (fds[0], fds[1]);
        self.bind(read_fd, true, is_noundo)?;
        self.bind(write_fd, true, is_noundo)?;
        let cookie = self.root_oplog.push_pipeop(PipeOp { read_fildes: read_fd, write_fildes: write_fd });
        self.log_event(CallKind::Pipe, read_fd, cookie);
        Ok((read_fd, write_fd))
    }

    pub fn exec_dup(&mut self, fildes: RawFd, cloexec: bool, is_noundo: bool) -> Result<RawFd> {
        let _ = self.bind(fildes, false, is_noundo)?;
        self.note_irrevocable(is_noundo);
        let arg = if cloexec { FcntlArg::F_DUPFD_CLOEXEC(0) } else { FcntlArg::F_DUPFD(0) };
        let new_fd = nix::fcntl::fcntl(unsafe { std::os::fd::BorrowedFd::borrow_raw(fildes) }, arg)?;
        self.bind(new_fd, true, is_noundo)?;
        self.log_event(CallKind::Dup, new_fd, 0);
        Ok(new_fd)
    }

    // ---- fcntl (spec §4.5 "fcntl") ----

    pub fn exec_fcntl_getfd(&mut self, fildes: RawFd, is_noundo: bool) -> Result<i32> {
        let _ = self.bind(fildes, false, is_noundo)?;
        let flags = nix::fcntl::fcntl(unsafe { std::os::fd::BorrowedFd::borrow_raw(fildes) }, FcntlArg::F_GETFD)?;
        self.log_event(CallKind::Fcntl, fildes, 0);
        Ok(flags)
    }

    /// `F_SETFD` is handled at the fd level, not the ofd level (spec §4.5
    /// "fcntl": mutates the descriptor's `CLOEXEC` bit and bumps the
    /// `fd` version).
    pub fn exec_fcntl_setfd(&mut self, fildes: RawFd, cloexec: bool, is_noundo: bool) -> Result<()> {
        let _ = self.bind(fildes, false, is_noundo)?;
        let old = nix::fcntl::fcntl(unsafe { std::os::fd::BorrowedFd::borrow_raw(fildes) }, FcntlArg::F_GETFD)?;
        let old_cloexec = (old & libc::FD_CLOEXEC) != 0;
        let new_flags = if cloexec { libc::FD_CLOEXEC } else { 0 };
        nix::fcntl::fcntl(unsafe { std::os::fd::BorrowedFd::borrow_raw(fildes) }, FcntlArg::F_SETFD(nix::fcntl::FdFlag::from_bits_truncate(new_flags)))?;
        self.fd_tx.get_mut(&fildes).expect("bound above").mark_localstate(&self.engine.fd_table)?;
        self.fd_tx.get_mut(&fildes).unwrap().fcntl_ops.push(FcntlOp::SetFd { old_cloexec });
        self.log_event(CallKind::Fcntl, fildes, 0);
        Ok(())
    }

    pub fn exec_fcntl_getfl(&mut self, fildes: RawFd, is_noundo: bool) -> Result<i32> {
        let key = self.bind(fildes, false, is_noundo)?;
        let flags = match self.ofd_mut(key) {
            OfdTx::RegFile(_) | OfdTx::Dir(_) | OfdTx::Socket(_) => {
                nix::fcntl::fcntl(unsafe { std::os::fd::BorrowedFd::borrow_raw(fildes) }, FcntlArg::F_GETFL)?
            }
            OfdTx::ChrDev(t) => t.exec_fcntl_getfl(fildes)?,
            OfdTx::Fifo(_) => nix::fcntl::fcntl(unsafe { std::os::fd::BorrowedFd::borrow_raw(fildes) }, FcntlArg::F_GETFL)?,
        };
        self.log_event(CallKind::Fcntl, fildes, 0);
        Ok(flags)
    }

    pub fn exec_fcntl_setfl(&mut self, fildes: RawFd, new_flags: i32, is_noundo: bool) -> Result<()> {
        let key = self.bind(fildes, false, is_noundo)?;
        match self.ofd_mut(key) {
            OfdTx::ChrDev(t) => t.exec_fcntl_setfl(fildes, new_flags)?,
            OfdTx::Fifo(t) => t.exec_fcntl_setfl(fildes, new_flags)?,
            _ => {
                if !is_noundo {
                    return Err(Error::Revocable);
                }
                nix::fcntl::fcntl(unsafe { std::os::fd::BorrowedFd::borrow_raw(fildes) }, FcntlArg::F_SETFL(OFlag::from_bits_truncate(new_flags)))?;
            }
        }
        self.log_event(CallKind::Fcntl, fildes, 0);
        Ok(())
    }

    // ---- socket I/O (spec §1, §4.5, §4 [ADDED] "bind") ----

    pub fn exec_socket(&mut self, domain: i32, ty: i32, protocol: i32, is_noundo: bool) -> Result<RawFd> {
        self.note_irrevocable(is_noundo);
        let ret = unsafe { libc::socket(domain, ty, protocol) };
        let new_fd = Errno::result(ret)?;
        self.bind(new_fd, true, is_noundo)?;
        self.log_event(CallKind::Socket, new_fd, 0);
        Ok(new_fd)
    }

    pub fn exec_bind(&mut self, fildes: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t, is_noundo: bool) -> Result<()> {
        if !is_noundo {
            return Err(Error::Revocable);
        }
        let key = self.bind(fildes, false, is_noundo)?;
        match self.ofd_mut(key) {
            OfdTx::Socket(t) => t.exec_bind(fildes, addr, addrlen)?,
            _ => return Err(Error::Errno(Errno::ENOTSOCK)),
        }
        self.log_event(CallKind::Bind, fildes, 0);
        Ok(())
    }

    pub fn exec_connect(&mut self, fildes: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t, is_noundo: bool) -> Result<()> {
        if !is_noundo {
            return Err(Error::Revocable);
        }
        let key = self.bind(fildes, false, is_noundo)?;
        match self.ofd_mut(key) {
            OfdTx::Socket(t) => t.exec_connect(fildes, addr, addrlen)?,
            _ => return Err(Error::Errno(Errno::ENOTSOCK)),
        }
        self.log_event(CallKind::Connect, fildes, 0);
        Ok(())
    }

    pub fn exec_listen(&mut self, fildes: RawFd, backlog: i32, is_noundo: bool) -> Result<()> {
        let key = self.bind(fildes, false, is_noundo)?;
        match self.ofd_mut(key) {
            OfdTx::Socket(t) => t.exec_listen(fildes, backlog)?,
            _ => return Err(Error::Errno(Errno::ENOTSOCK)),
        }
        self.log_event(CallKind::Listen, fildes, 0);
        Ok(())
    }

    pub fn exec_accept(&mut self, fildes: RawFd, is_noundo: bool) -> Result<RawFd> {
        let _ = self.bind(fildes, false, is_noundo)?;
        self.note_irrevocable(is_noundo);
        let ret = unsafe { libc::accept(fildes, std::ptr::null_mut(), std::ptr::null_mut()) };
        let new_fd = Errno::result(ret)?;
        self.bind(new_fd, true, is_noundo)?;
        self.log_event(CallKind::Accept, new_fd, 0);
        Ok(new_fd)
    }

    pub fn exec_send(&mut self, fildes: RawFd, buf: &[u8], flags: i32, is_noundo: bool) -> Result<usize> {
        let key = self.bind(fildes, false, is_noundo)?;
        let n = match self.ofd_mut(key) {
            OfdTx::Socket(t) => t.exec_send(fildes, buf, flags)?,
            _ => return Err(Error::Errno(Errno::ENOTSOCK)),
        };
        self.log_event(CallKind::Send, fildes, 0);
        Ok(n)
    }

    pub fn exec_recv(&mut self, fildes: RawFd, buf: &mut [u8], flags: i32, is_noundo: bool) -> Result<usize> {
        let key = self.bind(fildes, false, is_noundo)?;
        let n = match self.ofd_mut(key) {
            OfdTx::Socket(t) => t.exec_recv(fildes, buf, flags)?,
            _ => return Err(Error::Errno(Errno::ENOTSOCK)),
        };
        self.log_event(CallKind::Recv, fildes, 0);
        Ok(n)
    }

    pub fn exec_shutdown(&mut self, fildes: RawFd, how: nix::sys::socket::Shutdown, is_noundo: bool) -> Result<()> {
        if !is_noundo {
            return Err(Error::Revocable);
        }
        let key = self.bind(fildes, false, is_noundo)?;
        match self.ofd_mut(key) {
            OfdTx::Socket(t) => t.exec_shutdown(fildes, how)?,
            _ => return Err(Error::Errno(Errno::ENOTSOCK)),
        }
        self.log_event(CallKind::Shutdown, fildes, 0);
        Ok(())
    }

    /// `select` (spec SPEC_FULL §3 "[ADDED] select() exec call"): always
    /// `NoUndo`, observes no transaction-local state, operates on
    /// caller-owned raw fds this engine does not track.
    pub fn exec_select(&mut self, read_fds: &[RawFd], write_fds: &[RawFd], timeout: Option<Duration>) -> Result<(Vec<RawFd>, Vec<RawFd>)> {
        let mut pollfds: Vec<libc::pollfd> = read_fds
            .iter()
            .map(|&fd| libc::pollfd { fd, events: libc::POLLIN, revents: 0 })
            .chain(write_fds.iter().map(|&fd| libc::pollfd { fd, events: libc::POLLOUT, revents: 0 }))
            .collect();
        let timeout_ms = timeout.map(|d| d.as_millis() as libc::c_int).unwrap_or(-1);
        let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
        Errno::result(ret)?;
        let nread = read_fds.len();
        let ready_read = pollfds[..nread].iter().filter(|p| p.revents & libc::POLLIN != 0).map(|p| p.fd).collect();
        let ready_write = pollfds[nread..].iter().filter(|p| p.revents & libc::POLLOUT != 0).map(|p| p.fd).collect();
        self.log_event(CallKind::Select, -1, 0);
        Ok((ready_read, ready_write))
    }

    // ---- commit / rollback (spec §4.6, §4.7) ----

    /// Commits this transaction (spec §4.6).
    pub fn commit(&mut self) -> Result<()> {
        let mut fildes_sorted: Vec<RawFd> = self.fd_tx.keys().copied().collect();
        fildes_sorted.sort_unstable();
        let mut ofd_sorted: Vec<(FileType, usize)> = self.ofd_tx.keys().copied().collect();
        ofd_sorted.sort_by_key(|(ty, idx)| (*ty as usize, *idx));

        for key in &ofd_sorted {
            if let Err(e) = self.ofd_tx.get_mut(key).unwrap().pre_commit() {
                warn!(target: self.engine.config.get_log_target(), "pre_commit conflict on {key:?}");
                return Err(e);
            }
        }

        for fildes in &fildes_sorted {
            self.fd_tx.get(fildes).unwrap().validate(&self.engine.fd_table)?;
        }

        for fildes in &fildes_sorted {
            if let Some((ty, idx)) = self.fd_tx.get(fildes).unwrap().holds_ref().then(|| {
                let tx = self.fd_tx.get(fildes).unwrap();
                (tx.file_type(), tx.file_slot_index())
            }) {
                self.ofd_tx.get_mut(&(ty, idx)).unwrap().apply(*fildes)?;
            }
        }

        for key in &ofd_sorted {
            self.ofd_tx.get_mut(key).unwrap().update_cc();
        }

        self.finish()
    }

    /// Aborts this transaction (spec §4.7).
    pub fn rollback(&mut self) -> Result<()> {
        for event in self.event_log.iter().rev() {
            match event.call {
                CallKind::Open => {
                    let op = &self.root_oplog.openops[event.cookie];
                    if op.unlink_on_undo && still_same_inode(&op.path, op.created_dev, op.created_ino) {
                        let _ = nix::unistd::unlink(op.path.as_path());
                    }
                    if let Some(tx) = self.fd_tx.get_mut(&event.fildes) {
                        let _ = tx.signal_close(&self.engine.fd_table);
                    }
                }
                CallKind::Pipe => {
                    let op = &self.root_oplog.pipeops[event.cookie];
                    for fd in [op.read_fildes, op.write_fildes] {
                        if let Some(tx) = self.fd_tx.get_mut(&fd) {
                            let _ = tx.signal_close(&self.engine.fd_table);
                        }
                    }
                }
                CallKind::Dup | CallKind::Accept | CallKind::Socket => {
                    if let Some(tx) = self.fd_tx.get_mut(&event.fildes) {
                        let _ = tx.signal_close(&self.engine.fd_table);
                    }
                }
                _ => {
                    if let Some(tx) = self.fd_tx.get(&event.fildes) {
                        let key = (tx.file_type(), tx.file_slot_index());
                        if let Some(ofd) = self.ofd_tx.get_mut(&key) {
                            ofd.undo(event.fildes)?;
                        }
                    }
                }
            }
        }
        for ofd in self.ofd_tx.values_mut() {
            ofd.clear_cc();
        }
        self.finish()
    }

    /// Drops every reference held by this transaction, cascading into the
    /// real kernel `close(2)` for any fildes whose last reference just
    /// went away while `Closing` (spec §4.6 step 7 / §4.7 step 3).
    fn finish(&mut self) -> Result<()> {
        for ofd in self.ofd_tx.values_mut() {
            ofd.finish();
        }
        self.ofd_tx.clear();
        for (fildes, tx) in self.fd_tx.iter_mut() {
            if tx.unref(&self.engine.fd_table)? {
                let _ = nix::unistd::close(*fildes);
            }
        }
        self.fd_tx.clear();
        self.event_log.clear();
        self.root_oplog = OpLog::new();
        self.irrevocable = false;
        Ok(())
    }
}

/// Verifies a path still resolves to the inode `open`'s undo is about to
/// unlink, so a concurrent rename/replace of the same path is not
/// clobbered (spec §4.5 "open"'s undo: "verified by stat+fstat
/// comparison").
fn still_same_inode(path: &Path, dev: u64, ino: u64) -> bool {
    match nix::sys::stat::stat(path) {
        Ok(st) => st.st_dev as u64 == dev && st.st_ino as u64 == ino,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    fn new_tx() -> FildesTx {
        FildesTx::new(Arc::new(Engine::default()))
    }

    #[test]
    fn write_then_commit_is_visible() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let fildes = file.as_raw_fd();
        let mut tx = new_tx();
        tx.exec_write(fildes, b"hello", false).unwrap();
        tx.commit().unwrap();
        let contents = std::fs::read(file.path()).unwrap();
        assert_eq!(&contents, b"hello");
    }

    #[test]
    fn write_then_rollback_is_invisible() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"hello").unwrap();
        let fildes = file.as_raw_fd();
        let mut tx = new_tx();
        tx.exec_pwrite(fildes, b"WORLD", 0, false).unwrap();
        tx.rollback().unwrap();
        let contents = std::fs::read(file.path()).unwrap();
        assert_eq!(&contents, b"hello");
    }

    #[test]
    fn read_after_own_write_sees_it() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let fildes = file.as_raw_fd();
        let mut tx = new_tx();
        tx.exec_write(fildes, b"X", false).unwrap();
        tx.exec_lseek(fildes, -1, Whence::SeekCur, false).unwrap();
        let mut buf = [0u8; 1];
        tx.exec_read(fildes, &mut buf, false).unwrap();
        assert_eq!(buf[0], b'X');
        tx.commit().unwrap();
    }
}

//! Host-controlled configuration surface (spec §6.3).

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

use crate::file::FileType;

/// Concurrency-control mode for a file record or a per-transaction `fd_tx`.
///
/// `NoUndo` ("irrevocable") runs all effects at `exec` time and holds no
/// locks; `TwoPL` buffers effects and replays them at commit under locks
/// acquired during `exec`. Both variants are described in spec §4.5; the
/// optimistic "TS" mode mentioned in spec §9 is deliberately not
/// implemented (Open Question, see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum CcMode {
    /// All effects happen at `exec`, nothing can be undone.
    NoUndo = 0,
    /// Two-phase locking: effects are buffered and applied at commit.
    TwoPL = 1,
}

/// When optimistic reads are validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum ValidationMode {
    /// Validate at each operation.
    Op,
    /// Defer all validation to commit.
    Domain,
}

/// Host-controlled configuration for one engine instance.
///
/// Mirrors the builder style used by the teacher's `SessionConfig`
/// (`session_mt.rs`): a `Default` impl plus chained setters.
#[derive(Debug, Clone)]
pub struct Config {
    cc_mode: [CcMode; FileType::COUNT],
    validation_mode: ValidationMode,
    optcc: bool,
    record_size: usize,
    max_threads_hint: usize,
    log_target: &'static str,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cc_mode: [CcMode::TwoPL; FileType::COUNT],
            validation_mode: ValidationMode::Op,
            optcc: false,
            record_size: default_record_size(),
            max_threads_hint: 16,
            log_target: "fdtx_engine",
        }
    }
}

fn default_record_size() -> usize {
    // Byte-range lock granularity defaults to the host page size, the same
    // crate the teacher uses to size its own I/O buffers.
    page_size::get()
}

impl Config {
    /// Start a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default CC mode used for a given file type when a file
    /// record is first bound to a file-id.
    pub fn cc_mode_for(mut self, ty: FileType, mode: CcMode) -> Self {
        self.cc_mode[ty as usize] = mode;
        self
    }

    /// The default CC mode configured for a file type.
    pub fn default_cc_mode(&self, ty: FileType) -> CcMode {
        self.cc_mode[ty as usize]
    }

    /// Set the validation mode.
    pub fn validation_mode(mut self, mode: ValidationMode) -> Self {
        self.validation_mode = mode;
        self
    }

    pub fn get_validation_mode(&self) -> ValidationMode {
        self.validation_mode
    }

    /// Reserved hook for an optimistic CC mode (spec §6.3, §9). The 2PL
    /// path is authoritative; this flag is carried but not acted on.
    pub fn optcc(mut self, optcc: bool) -> Self {
        self.optcc = optcc;
        self
    }

    pub fn get_optcc(&self) -> bool {
        self.optcc
    }

    /// Byte-range lock record size, in bytes. Must be a power of two.
    pub fn record_size(mut self, record_size: usize) -> Self {
        assert!(record_size.is_power_of_two(), "record_size must be a power of two");
        self.record_size = record_size;
        self
    }

    pub fn get_record_size(&self) -> usize {
        self.record_size
    }

    /// Advisory sizing hint for internal map pre-allocation; never a hard
    /// cap (the engine never spawns or limits threads itself, spec §5).
    pub fn max_threads_hint(mut self, hint: usize) -> Self {
        self.max_threads_hint = hint;
        self
    }

    pub fn get_max_threads_hint(&self) -> usize {
        self.max_threads_hint
    }

    /// The `log` target string this engine instance traces under.
    pub fn log_target(mut self, target: &'static str) -> Self {
        self.log_target = target;
        self
    }

    pub fn get_log_target(&self) -> &'static str {
        self.log_target
    }
}

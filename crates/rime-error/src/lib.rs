#![forbid(unsafe_code)]
//! Error types for RimeFS.
//!
//! Defines `RimeError` and a `Result<T>` alias used throughout the
//! workspace, plus the sticky per-filesystem error state that refuses
//! further writes once an on-disk inconsistency has been observed.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::error;

/// Unified error type for all RimeFS operations.
#[derive(Debug, Error)]
pub enum RimeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk invariant violated (cycle, out-of-group bitmap, bad pointer).
    /// The filesystem is marked errored and further writes are refused.
    #[error("inconsistency at block {block}: {detail}")]
    Inconsistency { block: u64, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// A verified branch chain changed under the walker; retry from scratch.
    #[error("branch chain changed during walk of inode {ino}")]
    Conflict { ino: u64 },

    #[error("no space left on device")]
    NoSpace,

    #[error("memory allocation failed")]
    NoMem,

    /// Illegal access, e.g. writing the active snapshot directly.
    #[error("permission denied")]
    Permission,

    /// The journal has been aborted; the write will not land.
    #[error("journal aborted")]
    Aborted,

    #[error("operation cancelled")]
    Cancelled,
}

impl RimeError {
    /// Convert this error into a POSIX errno for host integration.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Inconsistency { .. } => libc::EIO,
            Self::Format(_) => libc::EINVAL,
            Self::Conflict { .. } => libc::EAGAIN,
            Self::NoSpace => libc::ENOSPC,
            Self::NoMem => libc::ENOMEM,
            Self::Permission => libc::EPERM,
            Self::Aborted => libc::EROFS,
            Self::Cancelled => libc::ECANCELED,
        }
    }
}

/// Result alias using `RimeError`.
pub type Result<T> = std::result::Result<T, RimeError>;

// ── Filesystem error state ──────────────────────────────────────────────────

/// Sticky error latch for one mounted filesystem.
///
/// Once set, `check()` fails every subsequent write path with `Aborted`,
/// and the first recorded message is kept for recovery tooling.
#[derive(Debug, Default)]
pub struct FsErrorState {
    errored: AtomicBool,
    first: Mutex<Option<String>>,
}

impl FsErrorState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an inconsistency and latch the error state.
    ///
    /// Returns the `Inconsistency` error for propagation.
    pub fn mark(&self, block: u64, detail: impl Into<String>) -> RimeError {
        let detail = detail.into();
        error!(event = "fs_error", block, detail = %detail);
        if !self.errored.swap(true, Ordering::SeqCst) {
            *self.first.lock() = Some(detail.clone());
        }
        RimeError::Inconsistency { block, detail }
    }

    /// Whether the filesystem has been marked errored.
    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.errored.load(Ordering::SeqCst)
    }

    /// Fail with `Aborted` if the filesystem is errored.
    pub fn check(&self) -> Result<()> {
        if self.is_errored() {
            return Err(RimeError::Aborted);
        }
        Ok(())
    }

    /// The first recorded inconsistency message, if any.
    #[must_use]
    pub fn first_error(&self) -> Option<String> {
        self.first.lock().clone()
    }
}

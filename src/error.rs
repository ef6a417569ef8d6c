//! Typed errors at protocol boundaries.
//!
//! Everything is wrapped in `anyhow::Result` at the application-glue
//! level, a convention kept throughout `controller::run`/`worker::run`.
//! The two boundaries a caller needs to branch on by kind — message
//! framing and kernel-table pushes — get their own `thiserror` enum
//! instead, so a caller can match on `FrameError::Fatal` without
//! string-matching an `anyhow::Error`.

use thiserror::Error;

/// Errors from `message::read_frame`/`write_frame`. A framing violation is
/// fatal — the typed variants let `main.rs` turn any of them into a
/// process exit without guessing from a message string.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error on message link: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("unknown message kind {0}")]
    UnknownKind(u16),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Errors from the kernel table administrative interface. These
/// are logged and do not roll back in-memory state: the next
/// successful push converges.
#[derive(Debug, Error)]
pub enum PfError {
    #[error("pf table name {0:?} exceeds the maximum table name length")]
    NameTooLong(String),

    #[error("pf table {0} does not exist")]
    NoSuchTable(String),

    #[error("pf ioctl failed: {0}")]
    Ioctl(#[from] std::io::Error),
}

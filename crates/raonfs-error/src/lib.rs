#![forbid(unsafe_code)]
//! Error types for raonfs.
//!
//! Two-layer error model: `ParseError` (in `raonfs-types`) reports on-disk
//! format violations detected while decoding raw bytes; `RaonError` (this
//! crate) is the user-facing type returned by the engine's public surface.
//! The conversion between the two lives in `raonfs-core`, which depends on
//! both crates — this crate stays free of parsing dependencies so the graph
//! has no cycles.
//!
//! Mapping policy at the boundary:
//!
//! | ParseError variant  | RaonError variant | Rationale |
//! |---------------------|-------------------|-----------|
//! | `InvalidMagic`      | `BadMagic`        | Wrong magic means "not this filesystem", not corruption; callers probing several formats treat it as a soft miss |
//! | `InsufficientData`  | `Corruption`      | A truncated record on a mounted image is structural damage |
//! | `InvalidField`      | `Corruption`      | Out-of-range field values on a mounted image likewise |
//! | `IntegerConversion` | `Corruption`      | Overflow in decoded values likewise |
//!
//! `NotFound` is an ordinary lookup outcome, not a defect; the engine never
//! retries anything internally (the medium is immutable, a failed block
//! fetch is reported as `Io` and retry policy belongs to the device layer).

use thiserror::Error;

/// Unified error type for all raonfs operations.
#[derive(Debug, Error)]
pub enum RaonError {
    /// Underlying block device I/O failure (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The superblock magic does not match: this is not a raonfs image.
    #[error("bad magic: expected {expected:#010x}, got {actual:#010x}")]
    BadMagic { expected: u32, actual: u32 },

    /// Structurally invalid on-disk data at a known byte offset.
    ///
    /// Truncated records, inconsistent size fields, out-of-table type tags.
    #[error("corrupt metadata at offset {offset}: {detail}")]
    Corruption { offset: u64, detail: String },

    /// A requested byte range starts at or beyond the filesystem size.
    #[error("read out of range: offset {pos} beyond filesystem size {total}")]
    OutOfRange { pos: u64, total: u64 },

    /// Name lookup completed without a match.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// Attempted to read a link target from a non-symlink inode.
    #[error("not a symbolic link")]
    NotSymlink,

    /// The filesystem is read-only and a mutation was attempted.
    #[error("read-only filesystem")]
    ReadOnly,

    /// The format stores no extended attributes.
    #[error("no such attribute")]
    NoAttribute,
}

impl RaonError {
    /// Convert this error into a POSIX errno suitable for a VFS layer.
    ///
    /// The mapping is exhaustive — every variant has an explicit arm, so
    /// adding a variant without assigning its errno is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::BadMagic { .. } | Self::OutOfRange { .. } | Self::NotSymlink => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::ReadOnly => libc::EROFS,
            Self::NoAttribute => libc::ENODATA,
        }
    }
}

/// Result alias using `RaonError`.
pub type Result<T> = std::result::Result<T, RaonError>;

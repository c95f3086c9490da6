#![forbid(unsafe_code)]
//! Error types for the superblock and journal-consistency layers.
//!
//! # Error Taxonomy
//!
//! Two layers:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ffs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `FfsError` | `ffs-error` (this crate) | Mount, remount, recovery and runtime fault reporting |
//!
//! ## Mapping Policy: ParseError → FfsError
//!
//! `ffs-error` is independent of `ffs-types` and `ffs-ondisk`. The conversion
//! from `ParseError` to `FfsError` lives in `ffs-core`, which depends on both.
//!
//! | ParseError Variant | FfsError Variant |
//! |--------------------|------------------|
//! | `InsufficientData` | `CorruptMetadata { block, detail }` |
//! | `InvalidMagic` | `NotThisFilesystem` (primary superblock) or `CorruptMetadata` |
//! | `InvalidField` | `InvalidGeometry` / `CorruptMetadata` depending on field |
//! | `IntegerConversion` | `CorruptMetadata { block, detail }` |
//!
//! ## Load-time vs runtime
//!
//! Load-time structural errors (`NotThisFilesystem`, `UnsupportedFeature`,
//! `JournalFailure` during mandatory replay) abort a mount with full unwind.
//! Runtime `CorruptMetadata` / `IoFailure` are routed through the fault
//! controller in `ffs-core` rather than returned to whoever noticed them.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`FfsError::to_errno`].
//! The match is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `IoFailure` | `EIO` |
//! | `NotThisFilesystem` | `EINVAL` |
//! | `UnsupportedFeature` | `EOPNOTSUPP` |
//! | `CorruptMetadata` | `EUCLEAN` |
//! | `JournalFailure` | `EINVAL` |
//! | `ReadOnlyRecoveryRefused` | `EROFS` |
//! | `OutOfMemory` | `ENOMEM` |
//! | `AlreadyAborted` | `EROFS` |
//! | `ReadOnly` | `EROFS` |
//! | `InvalidOption` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `Format` | `EINVAL` |
//! | `DeviceEjected` | `ENODEV` |
//! | `Busy` | `EBUSY` |

use thiserror::Error;

/// Unified error type for mount, recovery and runtime fault paths.
#[derive(Debug, Error)]
pub enum FfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A block-level read or write failed at a known block.
    #[error("I/O failure at block {block}: {detail}")]
    IoFailure { block: u64, detail: String },

    /// Superblock magic mismatch: the volume belongs to someone else.
    #[error("not this filesystem: {0}")]
    NotThisFilesystem(String),

    /// Unknown incompatible bits, or unknown read-only-compatible bits on a
    /// writable mount.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Checksum or range-check failure at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    CorruptMetadata { block: u64, detail: String },

    /// Journal replay, journal-device validation, or journal I/O failure.
    #[error("journal failure: {0}")]
    JournalFailure(String),

    /// Recovery is needed but the device cannot be written.
    #[error("journal recovery required but device is read-only")]
    ReadOnlyRecoveryRefused,

    #[error("out of memory")]
    OutOfMemory,

    /// Operation attempted after the volume or its journal aborted.
    #[error("operation attempted after abort")]
    AlreadyAborted,

    /// Volume is mounted read-only and a write was attempted.
    #[error("read-only filesystem")]
    ReadOnly,

    /// Mount option string rejected.
    #[error("invalid mount option: {0}")]
    InvalidOption(String),

    /// On-disk geometry is numerically invalid or unsupported.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Structurally invalid format that is not a plain magic mismatch.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// The backing device has been administratively ejected.
    #[error("device not present")]
    DeviceEjected,

    /// Operation refused because outstanding on-disk work is pending.
    #[error("busy: {0}")]
    Busy(String),
}

impl FfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// Policy notes:
    /// - `CorruptMetadata` → `EUCLEAN` (the kernel's `EFSCORRUPTED`).
    /// - `AlreadyAborted` and `ReadOnlyRecoveryRefused` → `EROFS`: both mean
    ///   "no writes will be accepted".
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::IoFailure { .. } => libc::EIO,
            Self::CorruptMetadata { .. } => libc::EUCLEAN,
            Self::UnsupportedFeature(_) => libc::EOPNOTSUPP,
            Self::NotThisFilesystem(_)
            | Self::JournalFailure(_)
            | Self::InvalidOption(_)
            | Self::InvalidGeometry(_)
            | Self::Format(_) => libc::EINVAL,
            Self::ReadOnlyRecoveryRefused | Self::AlreadyAborted | Self::ReadOnly => libc::EROFS,
            Self::OutOfMemory => libc::ENOMEM,
            Self::DeviceEjected => libc::ENODEV,
            Self::Busy(_) => libc::EBUSY,
        }
    }
}

/// Result alias using `FfsError`.
pub type Result<T> = std::result::Result<T, FfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(FfsError, libc::c_int)> = vec![
            (FfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                FfsError::IoFailure {
                    block: 3,
                    detail: "short read".into(),
                },
                libc::EIO,
            ),
            (FfsError::NotThisFilesystem("magic".into()), libc::EINVAL),
            (
                FfsError::UnsupportedFeature("incompat 0x10000".into()),
                libc::EOPNOTSUPP,
            ),
            (
                FfsError::CorruptMetadata {
                    block: 2,
                    detail: "group 0 checksum".into(),
                },
                libc::EUCLEAN,
            ),
            (FfsError::JournalFailure("bad uuid".into()), libc::EINVAL),
            (FfsError::ReadOnlyRecoveryRefused, libc::EROFS),
            (FfsError::OutOfMemory, libc::ENOMEM),
            (FfsError::AlreadyAborted, libc::EROFS),
            (FfsError::ReadOnly, libc::EROFS),
            (FfsError::InvalidOption("bogus".into()), libc::EINVAL),
            (FfsError::InvalidGeometry("bpg=0".into()), libc::EINVAL),
            (FfsError::Format("rev".into()), libc::EINVAL),
            (FfsError::DeviceEjected, libc::ENODEV),
            (FfsError::Busy("orphans".into()), libc::EBUSY),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let ffs = FfsError::Io(raw);
        assert_eq!(ffs.to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = FfsError::CorruptMetadata {
            block: 42,
            detail: "bad checksum".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 42: bad checksum"
        );
        assert_eq!(
            FfsError::NotThisFilesystem("magic 0x0".into()).to_string(),
            "not this filesystem: magic 0x0"
        );
        assert_eq!(FfsError::ReadOnly.to_string(), "read-only filesystem");
        assert_eq!(
            FfsError::ReadOnlyRecoveryRefused.to_string(),
            "journal recovery required but device is read-only"
        );
    }
}

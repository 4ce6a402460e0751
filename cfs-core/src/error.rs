//! Error taxonomy for the filesystem core.
//!
//! Mirrors the kind/propagation table of the format: host-level I/O failures
//! are fatal at mount, structural invariants are fatal at any time, and
//! everything else is a POSIX errno that the caller (FUSE bridge, REPL, mkfs,
//! fsck) surfaces however is natural for that caller.

/// Crate-wide result alias, mirroring the `EResult<T>` convention used
/// throughout filesystem code bases that carry a single error enum end to
/// end.
pub type EResult<T> = Result<T, CfsError>;

/// All ways a core operation can fail.
#[derive(thiserror::Error, Debug)]
pub enum CfsError {
    /// Image file could not be opened (missing, permissions).
    #[error("cannot open image: {0}")]
    CannotOpen(String),

    /// Image is smaller than the minimum of 1 MiB.
    #[error("image too small (< 1 MiB)")]
    TooSmall,

    /// `mmap` itself failed.
    #[error("mmap failed: {0}")]
    MmapFailed(String),

    /// Magic number did not match; this is not a CFS image.
    #[error("not a CFS image")]
    NotCfs,

    /// Header could not be recovered from head+tail candidates.
    #[error("header corrupt and unrecoverable")]
    HeaderCorrupt,

    /// Bitmap mirrors disagree and neither matches the header checksum.
    #[error("bitmap mirrors inconsistent and unrecoverable")]
    BitmapUnrecoverable,

    /// Allocator exhausted even after the OOM reclaim pass.
    #[error("no free blocks")]
    NoMoreFreeSpaces,

    /// LZ4 (de)compression failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// An internal invariant was violated. The image must be treated as
    /// corrupt; callers should stop issuing further mutations.
    #[error("assertion failed: {0}")]
    AssertionFailed(&'static str),

    /// A POSIX-style errno, used for the bulk of recoverable failures
    /// (ENOENT, ENOSPC, EEXIST, ENOTDIR, ENOTEMPTY, EINVAL, EIO, ...).
    #[error("{}", errno_message(*.0))]
    Errno(i32),
}

fn errno_message(code: i32) -> String {
    // SAFETY: strerror is not thread-safe in the general case, but every
    // caller here only reads the returned pointer before another libc call
    // can happen on this thread.
    unsafe {
        let ptr = libc::strerror(code);
        if ptr.is_null() {
            return format!("errno {code}");
        }
        std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

impl CfsError {
    /// Raw negative errno value for the FUSE reply path. Structural and
    /// host-I/O errors are mapped to `EIO` since there is no better POSIX
    /// equivalent.
    pub fn to_errno(&self) -> i32 {
        match self {
            CfsError::Errno(e) => *e,
            CfsError::NoMoreFreeSpaces => libc::ENOSPC,
            CfsError::CannotOpen(_)
            | CfsError::TooSmall
            | CfsError::MmapFailed(_)
            | CfsError::NotCfs
            | CfsError::HeaderCorrupt
            | CfsError::BitmapUnrecoverable
            | CfsError::Compression(_)
            | CfsError::AssertionFailed(_) => libc::EIO,
        }
    }
}

impl From<std::io::Error> for CfsError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(code) => CfsError::Errno(code),
            None => CfsError::Errno(libc::EIO),
        }
    }
}

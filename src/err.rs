use core::fmt::Debug;

/// `BaseError` is a common trait implemented by every error type defined in
/// this crate.
///
/// It is dependent on the [`Debug`] trait, which makes sense as we are
/// dealing with errors.
pub trait BaseError: Debug {}

/// `CanFail` is a return type for functions that are allowed to fail, and
/// don't need to return anything.
///
/// For instance, it is used when appending a log entry, or when updating a
/// persistent structure in place.
pub type CanFail<T> = Result<(), T>;

/// Error type shared by all filesystem-core operations.
///
/// Each variant maps onto the single errno surfaced at the filesystem
/// boundary for that failure class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmfsError {
    /// The block allocator is empty, or the block-map height ceiling was
    /// reached (`ENOSPC`).
    NoSpace,

    /// A DRAM allocation for a helper structure failed (`ENOMEM`).
    NoMemory,

    /// A reserved or otherwise unreachable inode was requested (`EACCES`).
    AccessDenied,

    /// Malformed parameters, a duplicate directory entry, or corruption
    /// detected while walking a log (`EINVAL`).
    Invalid,

    /// An inode with a nonzero deletion time was reopened (`ESTALE`).
    Stale,

    /// No data (or no hole) exists past the requested offset (`ENXIO`).
    NoExtent,

    /// The directory already holds an entry with this name (`EEXIST`).
    Exists,

    /// Superblock checksum mismatch, an unknown log entry type, or an
    /// impossible block-map shape (`EIO`).
    Io,
}

impl BaseError for PmfsError {}

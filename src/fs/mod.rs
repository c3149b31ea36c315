//! File-system related code.
//!
//! Contains the persistent-memory filesystem core ([`pmfs`]) together with
//! the small amount of surface shared by filesystem implementations.

use crate::errors::PmfsError;

pub mod pmfs;

pub type IOResult<T> = Result<T, PmfsError>;

/// Target of a region search within a file, `SEEK_DATA`/`SEEK_HOLE` style.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekTarget {
    /// Find the first offset at or after the given one that falls inside
    /// written data.
    Data,

    /// Find the first offset at or after the given one that falls inside a
    /// hole.
    Hole,
}

//! Timestamp representation for persistent structures.

use bytemuck::{Pod, Zeroable};

/// A 32-bit Unix timestamp, as stored in persistent inodes and log entries.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct UnixTimestamp32(pub u32);

impl From<u32> for UnixTimestamp32 {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<UnixTimestamp32> for u32 {
    fn from(value: UnixTimestamp32) -> Self {
        value.0
    }
}

impl core::fmt::Display for UnixTimestamp32 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

/// Source of wall-clock time for metadata updates.
///
/// The host environment provides one at mount; the default stands still,
/// which only affects timestamp fields.
pub type ClockSource = fn() -> UnixTimestamp32;

pub fn null_clock() -> UnixTimestamp32 {
    UnixTimestamp32(0)
}

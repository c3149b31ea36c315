//! Core of a persistent-memory filesystem (PMFS).
//!
//! The crate implements the on-media data structures of a byte-addressable,
//! directly-mapped filesystem and the algorithms that keep them consistent
//! across power loss: per-inode append-only metadata logs, radix block maps,
//! the in-DRAM directory index, the inode table, the persistent truncate
//! list and the mount-time recovery replay.
//!
//! The block allocator, write-protection primitives and the lite journal are
//! external collaborators reached through narrow contracts; small default
//! implementations ship with the crate so it is usable stand-alone.

#![no_std]
#![allow(dead_code)]
#![allow(clippy::mut_from_ref)]

extern crate alloc;

#[cfg(test)]
extern crate std;

#[macro_use]
pub mod cons;

mod err;
pub mod fs;
pub mod mem;
pub mod time;

pub mod errors {
    pub use crate::err::*;
}

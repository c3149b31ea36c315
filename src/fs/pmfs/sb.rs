//! PMFS superblock structures.
//!
//! The superblock anchors the persistent layout: magic, block size, region
//! size, and the offsets of the fixed inodes. A redundant copy sits right
//! behind the primary so a torn or corrupted primary can be repaired at
//! mount.
//!
//! The identity fields are covered by a crc16 checksum. Mutable mount
//! state (clean bit, last write time, truncate-list head) lives past the
//! checksummed area, so updating it never invalidates the checksum; the
//! truncate-list head in particular is rewritten on every list operation.

use bytemuck::{Pod, Zeroable};

use crate::fs::pmfs::crc16_calc;
use crate::fs::pmfs::inode::PMFS_INODE_SIZE;
use crate::time::UnixTimestamp32;

/// Size reserved for one superblock copy.
pub const PMFS_SB_SIZE: usize = 512;

/// Magic identifying a PMFS region.
pub const PMFS_SUPER_MAGIC: u16 = 0xEFFC;

/// Offset of the primary superblock.
pub const PRIMARY_SUPER_OFFSET: u64 = 0;

/// Offset of the redundant superblock copy.
pub const REDUNDANT_SUPER_OFFSET: u64 = PMFS_SB_SIZE as u64;

/// Offset of the root inode (ino 1).
pub const ROOT_INODE_OFFSET: u64 = 2 * PMFS_SB_SIZE as u64;

/// Offset of the blocknode-list inode (ino 2).
pub const BLOCKNODE_INODE_OFFSET: u64 = ROOT_INODE_OFFSET + PMFS_INODE_SIZE as u64;

/// Offset of the inode-table inode.
pub const INODE_TABLE_INODE_OFFSET: u64 = BLOCKNODE_INODE_OFFSET + PMFS_INODE_SIZE as u64;

/// 4 KiB blocks at the head of the region that never reach the allocator
/// (superblocks and the fixed inodes).
pub const RESERVED_BLOCKS: u64 = 1;

/// End of the checksummed identity area within the superblock; everything
/// past this offset is mutable mount state.
pub const SB_STATIC_END: usize = 72;

/// The filesystem was cleanly unmounted; free-block ranges saved to the
/// blocknode inode log are trustworthy.
pub const SB_STATE_CLEAN: u32 = 0x0000_0001;

/// Offset of the `s_state` field within the superblock.
pub const SB_STATE_FIELD: u64 = 72;

/// Offset of the `s_truncate_head` field within the superblock.
pub const SB_TRUNCATE_HEAD_FIELD: u64 = 80;

/// On-media superblock.
///
/// Fields up to [`SB_STATIC_END`] are written once at format time and
/// covered by `s_sum`; the remainder is mutable state.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct PmfsSuperblock {
    /// crc16 over the identity fields (everything in
    /// `[2, SB_STATIC_END)`).
    pub(crate) s_sum: u16,

    /// [`PMFS_SUPER_MAGIC`].
    pub(crate) s_magic: u16,

    /// Filesystem block size in bytes (4096).
    pub(crate) s_blocksize: u32,

    /// Total size of the mapped region, in bytes.
    pub(crate) s_size: u64,

    /// Volume label, NUL-padded.
    pub(crate) s_volume_name: [u8; 16],

    /// Anchor of the saved block map: the inode whose log receives the
    /// free-range snapshot at clean unmount.
    pub(crate) s_blockmap_root: u64,

    /// Offset of the root inode.
    pub(crate) s_root_inode_offset: u64,

    /// Offset of the blocknode-list inode.
    pub(crate) s_blocknode_inode_offset: u64,

    /// Offset of the inode-table inode.
    pub(crate) s_inode_table_offset: u64,

    /// Feature flags. No optional features are defined yet; nonzero bits
    /// reject the mount.
    pub(crate) s_features: u32,

    /// Format time.
    pub(crate) s_mkfs_time: UnixTimestamp32,

    /// Mutable state bits ([`SB_STATE_CLEAN`]).
    pub(crate) s_state: u32,

    /// Last write (unmount) time.
    pub(crate) s_wtime: UnixTimestamp32,

    /// Head of the persistent truncate list: the inode number of the
    /// first listed inode, 0 when the list is empty.
    pub(crate) s_truncate_head: u64,

    reserved: [u8; 424],
}

impl PmfsSuperblock {
    pub(crate) fn is_valid_magic(&self) -> bool {
        self.s_magic == PMFS_SUPER_MAGIC
    }

    /// Compares the checksum of the identity fields to the stored value.
    pub(crate) fn validate_chksum(&self) -> bool {
        let comp_chksum = self.compute_chksum();

        if comp_chksum != self.s_sum {
            error!(
                "pmfs",
                "invalid superblock checksum (got {:#06x} expected {:#06x})",
                comp_chksum,
                self.s_sum
            );

            return false;
        }

        true
    }

    /// Updates the stored checksum from the current identity fields.
    /// Required after any change before [`SB_STATIC_END`].
    pub(crate) fn update_chksum(&mut self) {
        self.s_sum = self.compute_chksum();
    }

    pub(crate) fn is_clean(&self) -> bool {
        self.s_state & SB_STATE_CLEAN != 0
    }

    fn compute_chksum(&self) -> u16 {
        let bytes = bytemuck::bytes_of(self);

        crc16_calc(&bytes[core::mem::size_of::<u16>()..SB_STATIC_END])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_layout() {
        assert_eq!(core::mem::size_of::<PmfsSuperblock>(), PMFS_SB_SIZE);

        let sb = PmfsSuperblock::zeroed();
        let base = &sb as *const _ as usize;
        assert_eq!(
            core::ptr::addr_of!(sb.s_state) as usize - base,
            SB_STATE_FIELD as usize
        );
        assert_eq!(
            core::ptr::addr_of!(sb.s_truncate_head) as usize - base,
            SB_TRUNCATE_HEAD_FIELD as usize
        );
    }

    #[test]
    fn checksum_ignores_mutable_state() {
        let mut sb = PmfsSuperblock::zeroed();
        sb.s_magic = PMFS_SUPER_MAGIC;
        sb.s_blocksize = 4096;
        sb.update_chksum();
        assert!(sb.validate_chksum());

        sb.s_state = SB_STATE_CLEAN;
        sb.s_truncate_head = 42;
        assert!(sb.validate_chksum());

        sb.s_size = 1 << 20;
        assert!(!sb.validate_chksum());
    }
}

//! Persistent inodes, the inode table, and the DRAM header table.
//!
//! Persistent inodes are fixed 128-byte, cacheline-aligned slots. The two
//! basic inodes (root and blocknode list) live at fixed offsets behind the
//! superblocks; every other inode is a slot of the table file owned by the
//! inode-table inode, addressed through its persistent block map.
//!
//! Slot allocation is a linear scan from a free hint: a slot is free when
//! `links_count == 0` and it either was never used (`mode == 0`) or was
//! deleted (`dtime != 0`). When the scan exhausts the table, the table
//! file grows by one block and the scan retries.

use alloc::sync::Arc;

use bytemuck::{Pod, Zeroable};
use hashbrown::HashMap;
use spin::RwLock;

use crate::errors::{CanFail, PmfsError};
use crate::fs::pmfs::balloc::BlockKind;
use crate::fs::pmfs::btree::{self, FileBlockMap};
use crate::fs::pmfs::dir::DirTree;
use crate::fs::pmfs::log::free_inode_log;
use crate::fs::pmfs::sb::INODE_TABLE_INODE_OFFSET;
use crate::fs::pmfs::Pmfs;
use crate::fs::IOResult;
use crate::mem::CACHELINE_SIZE;
use crate::time::UnixTimestamp32;

/// Size of a persistent inode slot.
pub const PMFS_INODE_SIZE: usize = 128;

/// log2 of [`PMFS_INODE_SIZE`], used to size the inode table.
pub const PMFS_INODE_BITS: u32 = 7;

/// The root directory.
pub const ROOT_INO: u64 = 1;

/// The blocknode-list inode.
pub const BLOCKNODE_INO: u64 = 2;

/// First inode number handed out by the table scan; ino 0 is reserved and
/// slots 1 and 2 shadow the fixed inodes.
pub const FREE_INODE_HINT_START: u64 = 3;

/// Table files on regions at least this large use 2 MiB blocks.
pub const LARGE_INODE_TABLE_THRESHOLD: usize = 0x2000_0000;

/// Initial table size on large regions.
pub const LARGE_INODE_TABLE_SIZE: u64 = 0x20_0000;

/// Byte offset of `log_head` within a persistent inode.
pub const LOG_HEAD_FIELD: u64 = 64;

/// Byte offset of `log_tail` within a persistent inode.
pub const LOG_TAIL_FIELD: u64 = 72;

/// Byte offset of the inline truncate item within a persistent inode.
pub const TRUNCATE_ITEM_FIELD: u64 = 112;

/// File mode / type representation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct FileMode(pub u16);

impl FileMode {
    pub const S_IFMT: u16 = 0xF000;
    pub const S_IFREG: u16 = 0x8000;
    pub const S_IFDIR: u16 = 0x4000;
    pub const S_IFLNK: u16 = 0xA000;
    pub const S_IFBLK: u16 = 0x6000;
    pub const S_IFCHR: u16 = 0x2000;

    pub fn is_reg(self) -> bool {
        self.0 & Self::S_IFMT == Self::S_IFREG
    }

    pub fn is_dir(self) -> bool {
        self.0 & Self::S_IFMT == Self::S_IFDIR
    }

    pub fn is_symlink(self) -> bool {
        self.0 & Self::S_IFMT == Self::S_IFLNK
    }

    pub fn is_device(self) -> bool {
        matches!(self.0 & Self::S_IFMT, Self::S_IFBLK | Self::S_IFCHR)
    }

    /// Directory-entry file type code (the mode's type nibble).
    pub fn file_type(self) -> u8 {
        ((self.0 & Self::S_IFMT) >> 12) as u8
    }
}

/// Defines a standard structure for flag-related persistent fields.
#[macro_export]
macro_rules! pmfs_flag_field {
    ($struct_name: tt, $size: ident, $desc: literal) => {
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable,
        )]
        #[repr(transparent)]
        #[doc = $desc]
        pub struct $struct_name(pub $size);

        impl core::ops::BitAnd for $struct_name {
            type Output = Self;

            fn bitand(self, rhs: Self) -> Self::Output {
                Self(self.0 & rhs.0)
            }
        }

        impl core::ops::BitOr for $struct_name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self::Output {
                Self(self.0 | rhs.0)
            }
        }

        impl core::ops::BitXor for $struct_name {
            type Output = Self;

            fn bitxor(self, rhs: Self) -> Self::Output {
                Self(self.0 ^ rhs.0)
            }
        }

        impl core::ops::Not for $struct_name {
            type Output = Self;

            fn not(self) -> Self::Output {
                Self(!self.0)
            }
        }
    };
}

pmfs_flag_field!(
    InodeFlags,
    u32,
    "Per-inode behavior flags, stored persistently and partially inherited \
by new inodes from their parent directory."
);

impl InodeFlags {
    pub const EMPTY: Self = Self(0);

    pub const SECRM_FL: Self = Self(0x0000_0001);
    pub const UNRM_FL: Self = Self(0x0000_0002);
    pub const COMPR_FL: Self = Self(0x0000_0004);
    pub const SYNC_FL: Self = Self(0x0000_0008);
    pub const IMMUTABLE_FL: Self = Self(0x0000_0010);
    pub const APPEND_FL: Self = Self(0x0000_0020);
    pub const NODUMP_FL: Self = Self(0x0000_0040);
    pub const NOATIME_FL: Self = Self(0x0000_0080);
    pub const JOURNAL_DATA_FL: Self = Self(0x0000_4000);
    pub const NOTAIL_FL: Self = Self(0x0000_8000);
    pub const DIRSYNC_FL: Self = Self(0x0001_0000);
    pub const TOPDIR_FL: Self = Self(0x0002_0000);

    /// Blocks are allocated beyond EOF; a later truncate reclaims them.
    pub const EOFBLOCKS_FL: Self = Self(0x2000_0000);

    /// Flags a new inode inherits from its parent directory.
    pub const INHERITED: Self = Self(
        Self::SECRM_FL.0
            | Self::UNRM_FL.0
            | Self::COMPR_FL.0
            | Self::SYNC_FL.0
            | Self::NODUMP_FL.0
            | Self::NOATIME_FL.0
            | Self::JOURNAL_DATA_FL.0
            | Self::NOTAIL_FL.0
            | Self::DIRSYNC_FL.0,
    );

    /// Flags appropriate for regular files.
    pub const REG_MASK: Self = Self(!(Self::DIRSYNC_FL.0 | Self::TOPDIR_FL.0));

    /// Flags appropriate for anything that is neither a regular file nor a
    /// directory.
    pub const OTHER_MASK: Self = Self(Self::NODUMP_FL.0 | Self::NOATIME_FL.0);

    pub fn includes(self, flags: Self) -> bool {
        self & flags == flags
    }
}

/// Masks out flags that are inappropriate for the given type of inode.
pub(crate) fn mask_flags(mode: FileMode, flags: InodeFlags) -> InodeFlags {
    let flags = flags & InodeFlags::INHERITED;

    if mode.is_dir() {
        flags
    } else if mode.is_reg() {
        flags & InodeFlags::REG_MASK
    } else {
        flags & InodeFlags::OTHER_MASK
    }
}

/// On-media inode.
///
/// The first 16 bytes hold the block-map `(root, height)` pair; the second
/// cacheline groups `log_head`, `log_tail` and `log_pages` so the log
/// chain is republished in one flush. The last 16 bytes are the inline
/// truncate-list item.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct PmfsInode {
    pub(crate) i_rsvd: u16,
    /// Block-map height, 0 to 3.
    pub(crate) height: u8,
    /// Data-block granularity ([`BlockKind`] raw value).
    pub(crate) i_blk_type: u8,
    pub(crate) i_flags: InodeFlags,
    /// Block-map root: a data block or log entry offset at height 0, an
    /// interior node otherwise. 0 iff the inode owns no blocks.
    pub(crate) root: u64,
    pub(crate) i_size: u64,
    pub(crate) i_ctime: UnixTimestamp32,
    pub(crate) i_mtime: UnixTimestamp32,
    /// Deletion time; nonzero means the slot is free.
    pub(crate) i_dtime: UnixTimestamp32,
    pub(crate) i_mode: FileMode,
    pub(crate) i_links_count: u16,
    /// Data blocks owned, in 4 KiB units.
    pub(crate) i_blocks: u64,
    pub(crate) i_atime: UnixTimestamp32,
    pub(crate) i_uid: u32,
    pub(crate) i_gid: u32,
    pub(crate) i_generation: u32,
    /// First page of the inode's metadata log, 0 when never logged.
    pub(crate) log_head: u64,
    /// Next write position; published only after the entry is durable.
    pub(crate) log_tail: u64,
    pub(crate) log_pages: u32,
    /// Extended-attribute "present" bit; no payload is defined.
    pub(crate) i_xattr: u32,
    pub(crate) ino: u64,
    /// Device numbers for special files.
    pub(crate) dev_rdev: u32,
    i_pad: u32,
    i_reserved: u64,
    /// Next inode on the persistent truncate list.
    pub(crate) i_next_truncate: u64,
    /// Size to truncate to when recovering the list after a crash.
    pub(crate) i_truncate_size: u64,
}

impl PmfsInode {
    pub(crate) fn blk_kind(&self) -> IOResult<BlockKind> {
        BlockKind::from_raw(self.i_blk_type)
    }

    /// Whether the table slot may be handed out again.
    pub(crate) fn is_free_slot(&self) -> bool {
        self.i_links_count == 0 && (self.i_mode.0 == 0 || self.i_dtime.0 != 0)
    }

    /// A live inode has no deletion time and at least one link.
    pub(crate) fn is_live(&self) -> bool {
        self.i_dtime.0 == 0 && self.i_links_count > 0
    }
}

/// Number of inode slots per data block of the table file.
pub(crate) fn inodes_per_block(kind: BlockKind) -> u64 {
    kind.size() >> PMFS_INODE_BITS
}

/// Per-inode DRAM state, pointed to by the header table.
pub struct InodeInfoHeader {
    pub ino: u64,
    /// Offset of the authoritative persistent inode.
    pub pi_addr: u64,
    pub i_mode: FileMode,
    pub i_size: u64,
    /// Length of the inode's log chain, in pages.
    pub log_pages: u32,
    /// Block map of regular files; empty for directories.
    pub map: FileBlockMap,
    /// Name index of directories; empty for files.
    pub dir_index: DirTree,
}

impl InodeInfoHeader {
    pub fn new(ino: u64, pi_addr: u64, i_mode: FileMode) -> Self {
        Self {
            ino,
            pi_addr,
            i_mode,
            i_size: 0,
            log_pages: 0,
            map: FileBlockMap::new(),
            dir_index: DirTree::new(),
        }
    }
}

pub type LockedHeader = Arc<RwLock<InodeInfoHeader>>;

/// DRAM table mapping inode numbers to their cached headers.
pub struct HeaderTable {
    inner: RwLock<HashMap<u64, LockedHeader>>,
}

impl HeaderTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn find(&self, ino: u64) -> Option<LockedHeader> {
        self.inner.read().get(&ino).cloned()
    }

    /// Installs a header, replacing any previous incarnation.
    pub fn assign(&self, ino: u64, header: InodeInfoHeader) -> LockedHeader {
        let locked: LockedHeader = Arc::new(RwLock::new(header));
        self.inner.write().insert(ino, locked.clone());
        locked
    }

    pub fn remove(&self, ino: u64) {
        self.inner.write().remove(&ino);
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn inos(&self) -> alloc::vec::Vec<u64> {
        self.inner.read().keys().copied().collect()
    }
}

impl Default for HeaderTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocator state of the inode table, guarded by the table mutex.
pub(crate) struct InodeTableState {
    pub(crate) inodes_count: u64,
    pub(crate) free_inodes_count: u64,
    pub(crate) free_inode_hint: u64,
    pub(crate) max_inode: u64,
}

impl Pmfs {
    /// Read view of the persistent inode at `pi_addr`.
    pub(crate) fn inode(&self, pi_addr: u64) -> &PmfsInode {
        self.region.view::<PmfsInode>(pi_addr)
    }

    /// Write view of the persistent inode at `pi_addr`. Callers hold the
    /// lock covering the inode and bracket stores with the region
    /// write-protect guard.
    pub(crate) fn inode_mut(&self, pi_addr: u64) -> &mut PmfsInode {
        self.region.view_mut::<PmfsInode>(pi_addr)
    }

    /// Resolves an inode number to the offset of its persistent slot.
    ///
    /// # Errors
    ///
    /// [`PmfsError::AccessDenied`] for ino 0, the shadowed fixed slots,
    /// or a number past the table's end.
    pub fn get_inode_addr(&self, ino: u64) -> IOResult<u64> {
        use crate::fs::pmfs::sb::{BLOCKNODE_INODE_OFFSET, ROOT_INODE_OFFSET};

        match ino {
            ROOT_INO => return Ok(ROOT_INODE_OFFSET),
            BLOCKNODE_INO => return Ok(BLOCKNODE_INODE_OFFSET),
            0 => return Err(PmfsError::AccessDenied),
            _ => (),
        }

        if ino < FREE_INODE_HINT_START {
            return Err(PmfsError::AccessDenied);
        }

        let table = self.inode(INODE_TABLE_INODE_OFFSET);
        if ino >= table.i_size >> PMFS_INODE_BITS {
            return Err(PmfsError::AccessDenied);
        }

        let kind = table.blk_kind()?;
        let byte_idx = ino << PMFS_INODE_BITS;
        let block = btree::find_data_block(self, INODE_TABLE_INODE_OFFSET, byte_idx >> kind.shift());
        if block == 0 {
            return Err(PmfsError::Io);
        }

        Ok(block + (byte_idx & (kind.size() - 1)))
    }

    /// Initializes the inode table at format time: picks the table block
    /// granularity, sizes the initial table and allocates its zeroed
    /// blocks.
    pub(crate) fn init_inode_table(&self, num_inodes: Option<u64>) -> CanFail<PmfsError> {
        let init_size = match num_inodes {
            Some(n) => n << PMFS_INODE_BITS,
            None if self.region.len() >= LARGE_INODE_TABLE_THRESHOLD => LARGE_INODE_TABLE_SIZE,
            None => 1 << 12,
        };

        let kind = if init_size >= LARGE_INODE_TABLE_SIZE {
            BlockKind::Blk2M
        } else {
            BlockKind::Blk4K
        };

        let num_blocks = init_size.div_ceil(kind.size());

        {
            let _w = self.region.memunlock();
            let pi = self.inode_mut(INODE_TABLE_INODE_OFFSET);
            pi.i_mode = FileMode(0);
            pi.i_uid = 0;
            pi.i_gid = 0;
            pi.i_links_count = 1;
            pi.i_flags = InodeFlags::EMPTY;
            pi.height = 0;
            pi.i_dtime = UnixTimestamp32(0);
            pi.i_blk_type = kind as u8;
            pi.i_size = num_blocks << kind.shift();
            pi.ino = 0;
            self.region.flush(INODE_TABLE_INODE_OFFSET, PMFS_INODE_SIZE, false);
        }

        btree::alloc_data_blocks(self, INODE_TABLE_INODE_OFFSET, 0, num_blocks, true)
            .map_err(|e| {
                error!("pmfs-inode", "failed to initialize the inode table");
                e
            })?;

        let inodes_count = num_blocks * inodes_per_block(kind);
        let mut state = self.inode_table.lock();
        state.inodes_count = inodes_count;
        state.free_inodes_count = inodes_count - FREE_INODE_HINT_START;
        state.free_inode_hint = FREE_INODE_HINT_START;
        state.max_inode = FREE_INODE_HINT_START;

        dbg_verbose!(
            "pmfs-inode",
            "inode table initialized: {} slots, {:?} blocks",
            inodes_count,
            kind
        );

        Ok(())
    }

    /// Extends the table file by one block so the allocation scan can
    /// retry.
    fn increase_inode_table_size(&self, state: &mut InodeTableState) -> CanFail<PmfsError> {
        let table = self.inode(INODE_TABLE_INODE_OFFSET);
        let kind = table.blk_kind()?;
        let i_size = table.i_size;

        self.journal.begin(2);
        self.journal.log_range(INODE_TABLE_INODE_OFFSET, PMFS_INODE_SIZE);

        btree::alloc_data_blocks(self, INODE_TABLE_INODE_OFFSET, i_size >> kind.shift(), 1, true)
            .inspect_err(|_| {
                self.journal.commit();
                dbg_verbose!("pmfs-inode", "no space left to grow the inode table");
            })?;

        state.free_inode_hint = i_size >> PMFS_INODE_BITS;

        {
            let _w = self.region.memunlock();
            self.inode_mut(INODE_TABLE_INODE_OFFSET).i_size = i_size + kind.size();
            self.region.flush(INODE_TABLE_INODE_OFFSET, CACHELINE_SIZE, false);
        }
        self.journal.commit();

        state.free_inodes_count += inodes_per_block(kind);
        state.inodes_count = (i_size + kind.size()) >> PMFS_INODE_BITS;

        Ok(())
    }

    /// Allocates a fresh inode: linear scan from the free hint, growing
    /// the table on exhaustion. The slot is initialized, flushed and
    /// counted before the table mutex drops.
    ///
    /// Returns `(ino, pi_addr)`.
    pub(crate) fn new_pmfs_inode(
        &self,
        mode: FileMode,
        links_count: u16,
        parent_flags: InodeFlags,
        rdev: u32,
    ) -> IOResult<(u64, u64)> {
        let mut state = self.inode_table.lock();

        let mut i = state.free_inode_hint;
        let (ino, pi_addr) = loop {
            if i >= state.inodes_count {
                self.increase_inode_table_size(&mut state).map_err(|e| {
                    dbg_verbose!("pmfs-inode", "could not find a free inode");
                    e
                })?;
                i = state.free_inode_hint;
                continue;
            }

            let pi_addr = self.get_inode_addr(i)?;
            if self.inode(pi_addr).is_free_slot() {
                break (i, pi_addr);
            }
            i += 1;
        };

        dbg_verbose!("pmfs-inode", "allocating inode {}", ino);

        let now = (self.clock)();
        let generation = self
            .next_generation
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);

        self.journal.begin(1);
        self.journal.log_range(pi_addr, PMFS_INODE_SIZE);
        {
            let _w = self.region.memunlock();
            let pi = self.inode_mut(pi_addr);
            *pi = PmfsInode::zeroed();
            pi.i_blk_type = BlockKind::Blk4K as u8;
            pi.i_flags = mask_flags(mode, parent_flags);
            pi.i_mode = mode;
            pi.i_links_count = links_count;
            pi.i_ctime = now;
            pi.i_mtime = now;
            pi.i_atime = now;
            pi.i_generation = generation;
            pi.ino = ino;
            pi.dev_rdev = if mode.is_device() { rdev } else { 0 };
            self.region.flush(pi_addr, PMFS_INODE_SIZE, true);
        }
        self.journal.commit();

        state.free_inodes_count -= 1;
        state.free_inode_hint = if ino < state.inodes_count - 1 {
            ino + 1
        } else {
            FREE_INODE_HINT_START
        };
        state.max_inode = state.max_inode.max(ino);

        Ok((ino, pi_addr))
    }

    /// Returns an inode slot to the table: clears the block map root and
    /// size, stamps the deletion time and frees the log. The hint retreats
    /// so low slots are reused first.
    pub(crate) fn free_pmfs_inode(&self, ino: u64) -> CanFail<PmfsError> {
        let mut state = self.inode_table.lock();

        dbg_verbose!(
            "pmfs-inode",
            "free inode {} (free {} of {})",
            ino,
            state.free_inodes_count,
            state.inodes_count
        );

        let pi_addr = self.get_inode_addr(ino)?;

        self.journal.begin(1);
        self.journal.log_range(pi_addr, PMFS_INODE_SIZE);
        {
            let _w = self.region.memunlock();
            let pi = self.inode_mut(pi_addr);
            pi.root = 0;
            pi.height = 0;
            pi.i_size = 0;
            pi.i_dtime = (self.clock)();
            self.region.flush(pi_addr, PMFS_INODE_SIZE, true);
        }
        free_inode_log(self, pi_addr);
        self.journal.commit();

        if ino < state.free_inode_hint {
            state.free_inode_hint = ino;
        }
        state.free_inodes_count += 1;

        if state.free_inodes_count == state.inodes_count - FREE_INODE_HINT_START {
            dbg_verbose!("pmfs-inode", "filesystem is empty");
            state.free_inode_hint = FREE_INODE_HINT_START;
        }

        Ok(())
    }

    /// Looks up (or lazily rebuilds) the DRAM header of a live inode.
    ///
    /// # Errors
    ///
    /// [`PmfsError::Stale`] when the inode was deleted.
    pub fn inode_header(&self, ino: u64) -> IOResult<LockedHeader> {
        if let Some(header) = self.headers.find(ino) {
            return Ok(header);
        }

        let pi_addr = self.get_inode_addr(ino)?;
        let pi = self.inode(pi_addr);
        if !pi.is_live() {
            return Err(PmfsError::Stale);
        }

        let mut header = InodeInfoHeader::new(ino, pi_addr, pi.i_mode);
        header.i_size = pi.i_size;

        if pi.log_head != 0 {
            if pi.i_mode.is_dir() {
                crate::fs::pmfs::dir::rebuild_dir_inode_tree(self, pi_addr, &mut header, None)?;
            } else {
                crate::fs::pmfs::recovery::rebuild_file_inode_tree(self, pi_addr, &mut header, None)?;
            }
        }

        Ok(self.headers.assign(ino, header))
    }

    /// Finishes the deletion of an unlinked inode: frees the slot, the
    /// log, and every block its map references, then drops it from the
    /// truncate list and the header table.
    pub fn evict_inode(&self, ino: u64) -> CanFail<PmfsError> {
        self.check_writable()?;

        let pi_addr = self.get_inode_addr(ino)?;

        let (links, mode, kind, size, flags, height) = {
            let pi = self.inode(pi_addr);
            (
                pi.i_links_count,
                pi.i_mode,
                pi.blk_kind()?,
                pi.i_size,
                pi.i_flags,
                pi.height,
            )
        };

        dbg_verbose!("pmfs-inode", "evict inode {}", ino);

        if links == 0 && (mode.is_reg() || mode.is_dir() || mode.is_symlink()) {
            let last_blocknr = if flags.includes(InodeFlags::EOFBLOCKS_FL) {
                (1u64 << (u32::from(height) * btree::META_BLK_SHIFT)) - 1
            } else {
                let last = if size > 0 { (size - 1) >> kind.shift() } else { 0 };
                btree::sparse_last_blocknr(height, last)
            };

            let header = self.headers.find(ino);
            let (root, data_height) = {
                let pi = self.inode(pi_addr);
                (pi.root, pi.height)
            };

            // The file map references entries inside the log, so the
            // blocks go first and the log (with the slot) after.
            if mode.is_reg() {
                if let Some(header) = header {
                    let mut header = header.write();
                    btree::free_file_subtree(self, &mut header.map, kind, last_blocknr)?;
                }
            } else if mode.is_dir() || mode.is_symlink() {
                // Directory content lives in the log; anything hanging
                // off the persistent map goes too.
                btree::free_data_subtree(self, root, data_height, kind, last_blocknr);
            }

            self.free_pmfs_inode(ino)?;
        }

        self.truncate_del(ino)?;
        self.headers.remove(ino);

        Ok(())
    }

    /// Picks the data-block granularity of an empty file. Larger blocks
    /// trade internal fragmentation for flatter maps; the choice is
    /// per-inode and must happen before any block is owned.
    ///
    /// # Errors
    ///
    /// [`PmfsError::Invalid`] once the file has data.
    pub fn set_blocksize_hint(&self, ino: u64, kind: BlockKind) -> CanFail<PmfsError> {
        self.check_writable()?;

        let header = self.inode_header(ino)?;
        let hdr = header.write();
        let pi_addr = hdr.pi_addr;

        {
            let pi = self.inode(pi_addr);
            if pi.i_size != 0 || pi.i_blocks != 0 || pi.root != 0 {
                return Err(PmfsError::Invalid);
            }
        }

        let _w = self.region.memunlock();
        self.inode_mut(pi_addr).i_blk_type = kind as u8;
        self.region.flush(pi_addr, CACHELINE_SIZE, true);

        Ok(())
    }

    /// Clears the `EOFBLOCKS` flag once the owned blocks again cover the
    /// file size.
    pub(crate) fn check_eof_blocks(&self, pi_addr: u64) {
        let pi = self.inode(pi_addr);
        if pi.i_flags.includes(InodeFlags::EOFBLOCKS_FL)
            && pi.i_size + (1u64 << crate::mem::PAGE_SHIFT) > pi.i_blocks << crate::mem::PAGE_SHIFT
        {
            let _w = self.region.memunlock();
            let pi = self.inode_mut(pi_addr);
            pi.i_flags = pi.i_flags & !InodeFlags::EOFBLOCKS_FL;
            self.region.flush(pi_addr, CACHELINE_SIZE, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_layout() {
        assert_eq!(core::mem::size_of::<PmfsInode>(), PMFS_INODE_SIZE);

        let pi = PmfsInode::zeroed();
        let base = &pi as *const _ as usize;
        assert_eq!(core::ptr::addr_of!(pi.height) as usize - base, 2);
        assert_eq!(core::ptr::addr_of!(pi.root) as usize - base, 8);
        assert_eq!(
            core::ptr::addr_of!(pi.log_head) as usize - base,
            LOG_HEAD_FIELD as usize
        );
        assert_eq!(
            core::ptr::addr_of!(pi.log_tail) as usize - base,
            LOG_TAIL_FIELD as usize
        );
        assert_eq!(
            core::ptr::addr_of!(pi.i_next_truncate) as usize - base,
            TRUNCATE_ITEM_FIELD as usize
        );
    }

    #[test]
    fn slot_liveness() {
        let mut pi = PmfsInode::zeroed();
        assert!(pi.is_free_slot());
        assert!(!pi.is_live());

        pi.i_mode = FileMode(FileMode::S_IFREG | 0o644);
        pi.i_links_count = 1;
        assert!(!pi.is_free_slot());
        assert!(pi.is_live());

        pi.i_links_count = 0;
        pi.i_dtime = UnixTimestamp32(100);
        assert!(pi.is_free_slot());
    }

    #[test]
    fn flag_inheritance_masks_by_type() {
        let parent = InodeFlags::DIRSYNC_FL | InodeFlags::NOATIME_FL | InodeFlags::EOFBLOCKS_FL;

        let dir = mask_flags(FileMode(FileMode::S_IFDIR), parent);
        assert!(dir.includes(InodeFlags::DIRSYNC_FL));
        assert!(!dir.includes(InodeFlags::EOFBLOCKS_FL));

        let reg = mask_flags(FileMode(FileMode::S_IFREG), parent);
        assert!(!reg.includes(InodeFlags::DIRSYNC_FL));
        assert!(reg.includes(InodeFlags::NOATIME_FL));
    }
}

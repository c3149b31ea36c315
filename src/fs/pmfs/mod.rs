//! Persistent-memory filesystem core.
//!
//! The on-media layout starts with a checksummed superblock (and its
//! redundant copy), the fixed root and blocknode inodes, and the
//! inode-table inode whose file provides every other inode slot. All
//! metadata mutations flow through per-inode append-only logs; DRAM holds
//! the derived structures (directory indexes, file block maps, the header
//! table) and rebuilds them from the logs at mount.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytemuck::Zeroable;
use hashbrown::HashSet;
use spin::Mutex;

use crate::errors::PmfsError;
use crate::fs::IOResult;
use crate::mem::{PmRegion, CACHELINE_SIZE, PAGE_SHIFT, PAGE_SIZE};
use crate::time::{null_clock, ClockSource, UnixTimestamp32};

pub mod balloc;
pub mod btree;
pub mod dir;
pub mod file;
pub mod inode;
pub mod journal;
pub mod log;
pub mod recovery;
pub mod sb;
pub mod truncate;

#[cfg(test)]
mod scenarios;

pub use balloc::{BlockAllocator, BlockKind, ScanBitmap};
pub use dir::READDIR_END;
pub use file::SetAttrs;
pub use inode::{FileMode, InodeFlags, BLOCKNODE_INO, ROOT_INO};
pub use journal::{DisabledJournal, LiteJournal};

use balloc::BlockAllocator as Allocator;
use inode::{HeaderTable, InodeInfoHeader, InodeTableState, PmfsInode, PMFS_INODE_SIZE};
use sb::{
    PmfsSuperblock, BLOCKNODE_INODE_OFFSET, INODE_TABLE_INODE_OFFSET, PMFS_SB_SIZE,
    PMFS_SUPER_MAGIC, PRIMARY_SUPER_OFFSET, REDUNDANT_SUPER_OFFSET, RESERVED_BLOCKS,
    ROOT_INODE_OFFSET, SB_STATE_CLEAN, SB_STATE_FIELD,
};

/// Smallest region the layout fits in with room to work.
pub const PMFS_MIN_REGION_SIZE: usize = 1 << 20;

/// Parsed mount options. Unknown options reject the mount.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MountOpts {
    /// Accepted and recorded; the core itself never caches file data.
    pub pagecache: bool,

    /// Debug mask handed to the console (see [`crate::cons`]).
    pub dbgmask: u32,
}

impl MountOpts {
    /// Parses a comma-separated option string, e.g.
    /// `"pagecache,dbgmask=0x10"`.
    ///
    /// # Errors
    ///
    /// [`PmfsError::Invalid`] on an unknown option or malformed value.
    pub fn parse(options: &str) -> IOResult<Self> {
        let mut opts = Self::default();

        for token in options.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }

            match token.split_once('=') {
                None if token == "pagecache" => opts.pagecache = true,
                Some(("dbgmask", value)) => {
                    let parsed = if let Some(hex) = value.strip_prefix("0x") {
                        u32::from_str_radix(hex, 16)
                    } else {
                        value.parse()
                    };
                    opts.dbgmask = parsed.map_err(|_| PmfsError::Invalid)?;
                }
                _ => {
                    error!("pmfs", "unknown mount option '{}'", token);
                    return Err(PmfsError::Invalid);
                }
            }
        }

        Ok(opts)
    }
}

/// Format-time parameters.
#[derive(Clone, Copy, Debug)]
pub struct MkfsOptions {
    /// Initial inode-table capacity; sized from the region when absent.
    pub num_inodes: Option<u64>,

    /// Volume label, NUL-padded.
    pub volume_name: [u8; 16],

    /// Permission bits of the root directory.
    pub root_mode: u16,
    pub root_uid: u32,
    pub root_gid: u32,

    pub clock: ClockSource,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            num_inodes: None,
            volume_name: [0; 16],
            root_mode: 0o755,
            root_uid: 0,
            root_gid: 0,
            clock: null_clock,
        }
    }
}

/// A mounted persistent-memory filesystem.
///
/// All methods take `&self`; interior locks follow the documented
/// acquisition order (inode table, per-inode header, allocator, truncate
/// list). Share across threads with [`Arc`].
pub struct Pmfs {
    pub(crate) region: PmRegion,
    pub(crate) opts: MountOpts,
    pub(crate) allocator: Allocator,
    pub(crate) headers: HeaderTable,
    pub(crate) inode_table: Mutex<InodeTableState>,
    pub(crate) truncate_list: Mutex<HashSet<u64>>,
    pub(crate) journal: Box<dyn LiteJournal>,
    pub(crate) next_generation: AtomicU32,
    pub(crate) read_only: AtomicBool,
    pub(crate) clock: ClockSource,
}

impl Pmfs {
    fn new_state(region: PmRegion, opts: MountOpts, clock: ClockSource) -> Self {
        Self {
            region,
            opts,
            allocator: Allocator::new(),
            headers: HeaderTable::new(),
            inode_table: Mutex::new(InodeTableState {
                inodes_count: 0,
                free_inodes_count: 0,
                free_inode_hint: inode::FREE_INODE_HINT_START,
                max_inode: inode::FREE_INODE_HINT_START,
            }),
            truncate_list: Mutex::new(HashSet::new()),
            journal: Box::new(DisabledJournal),
            next_generation: AtomicU32::new(1),
            read_only: AtomicBool::new(false),
            clock,
        }
    }

    /// Formats `region` and returns it mounted.
    pub fn mkfs(region: PmRegion, opts: MkfsOptions) -> IOResult<Arc<Self>> {
        if region.len() < PMFS_MIN_REGION_SIZE {
            return Err(PmfsError::Invalid);
        }

        let fs = Self::new_state(region, MountOpts::default(), opts.clock);
        let total_blocks = (fs.region.len() as u64) >> PAGE_SHIFT;

        {
            let _w = fs.region.memunlock();
            fs.region.zero(0, PAGE_SIZE);

            let sb = fs.region.view_mut::<PmfsSuperblock>(PRIMARY_SUPER_OFFSET);
            sb.s_magic = PMFS_SUPER_MAGIC;
            sb.s_blocksize = PAGE_SIZE as u32;
            sb.s_size = fs.region.len() as u64;
            sb.s_volume_name = opts.volume_name;
            sb.s_blockmap_root = BLOCKNODE_INODE_OFFSET;
            sb.s_root_inode_offset = ROOT_INODE_OFFSET;
            sb.s_blocknode_inode_offset = BLOCKNODE_INODE_OFFSET;
            sb.s_inode_table_offset = INODE_TABLE_INODE_OFFSET;
            sb.s_features = 0;
            sb.s_mkfs_time = (opts.clock)();
            sb.update_chksum();
            fs.region.flush(PRIMARY_SUPER_OFFSET, PMFS_SB_SIZE, false);

            let primary = *fs.region.view::<PmfsSuperblock>(PRIMARY_SUPER_OFFSET);
            *fs.region.view_mut::<PmfsSuperblock>(REDUNDANT_SUPER_OFFSET) = primary;
            fs.region.flush(REDUNDANT_SUPER_OFFSET, PMFS_SB_SIZE, true);
        }

        fs.allocator.init_range(RESERVED_BLOCKS, total_blocks);

        fs.init_inode_table(opts.num_inodes)?;

        let now = (opts.clock)();
        {
            let _w = fs.region.memunlock();
            let pi = fs.inode_mut(BLOCKNODE_INODE_OFFSET);
            *pi = PmfsInode::zeroed();
            pi.i_links_count = 1;
            pi.i_blk_type = BlockKind::Blk4K as u8;
            pi.ino = BLOCKNODE_INO;
            pi.i_ctime = now;
            pi.i_mtime = now;
            fs.region.flush(BLOCKNODE_INODE_OFFSET, PMFS_INODE_SIZE, false);

            let pi = fs.inode_mut(ROOT_INODE_OFFSET);
            *pi = PmfsInode::zeroed();
            pi.i_mode = FileMode(FileMode::S_IFDIR | (opts.root_mode & !FileMode::S_IFMT));
            pi.i_links_count = 2;
            pi.i_blk_type = BlockKind::Blk4K as u8;
            pi.i_uid = opts.root_uid;
            pi.i_gid = opts.root_gid;
            pi.ino = ROOT_INO;
            pi.i_ctime = now;
            pi.i_mtime = now;
            pi.i_atime = now;
            fs.region.flush(ROOT_INODE_OFFSET, PMFS_INODE_SIZE, true);
        }

        let mut root_header = InodeInfoHeader::new(ROOT_INO, ROOT_INODE_OFFSET, {
            fs.inode(ROOT_INODE_OFFSET).i_mode
        });
        dir::append_dir_init_entries(&fs, ROOT_INODE_OFFSET, &mut root_header, ROOT_INO, ROOT_INO)?;
        fs.headers.assign(ROOT_INO, root_header);

        info!(
            "pmfs",
            "formatted region of {} blocks ({} inode slots)",
            total_blocks,
            fs.inode_table.lock().inodes_count
        );

        Ok(Arc::new(fs))
    }

    /// Mounts a previously formatted region, recovering whatever an
    /// unclean shutdown left behind.
    pub fn mount(region: PmRegion, options: &str, clock: ClockSource) -> IOResult<Arc<Self>> {
        let opts = MountOpts::parse(options)?;
        crate::cons::set_dbgmask(opts.dbgmask);

        if region.len() < PMFS_MIN_REGION_SIZE {
            return Err(PmfsError::Invalid);
        }

        let fs = Self::new_state(region, opts, clock);

        fs.check_super()?;

        let clean = fs.superblock().is_clean();

        // Drop the clean bit first: a crash from here on must trigger a
        // full scan next time.
        {
            let _w = fs.region.memunlock();
            let sb = fs.region.view_mut::<PmfsSuperblock>(PRIMARY_SUPER_OFFSET);
            sb.s_state &= !SB_STATE_CLEAN;
            fs.region.flush(SB_STATE_FIELD, CACHELINE_SIZE, true);
        }

        if clean {
            fs.load_blocknode_mappings()?;
        }
        fs.recover(clean)?;

        info!(
            "pmfs",
            "mounted {} ({} mount, {} free blocks)",
            fs.label(),
            if clean { "clean" } else { "recovered" },
            fs.allocator.count_free()
        );

        Ok(Arc::new(fs))
    }

    /// Verifies the superblock pair, repairing the primary from the
    /// redundant copy when only the primary is damaged.
    fn check_super(&self) -> IOResult<()> {
        let primary_ok = {
            let sb = self.superblock();
            sb.is_valid_magic() && sb.validate_chksum()
        };

        if !primary_ok {
            let redundant = *self.region.view::<PmfsSuperblock>(REDUNDANT_SUPER_OFFSET);
            if !(redundant.is_valid_magic() && redundant.validate_chksum()) {
                error!("pmfs", "both superblock copies are invalid");
                return Err(PmfsError::Io);
            }

            warn!("pmfs", "primary superblock invalid, repairing from the copy");
            let _w = self.region.memunlock();
            *self.region.view_mut::<PmfsSuperblock>(PRIMARY_SUPER_OFFSET) = redundant;
            self.region.flush(PRIMARY_SUPER_OFFSET, PMFS_SB_SIZE, true);
        }

        let sb = self.superblock();
        if sb.s_features != 0 {
            error!("pmfs", "unsupported feature flags {:#x}", sb.s_features);
            return Err(PmfsError::Invalid);
        }
        if sb.s_blocksize != PAGE_SIZE as u32 || sb.s_size > self.region.len() as u64 {
            return Err(PmfsError::Invalid);
        }

        Ok(())
    }

    /// Abandons the mount without writing anything back, leaving the
    /// region exactly as a power loss would. The next mount recovers.
    pub fn abandon(self) -> PmRegion {
        self.headers.clear();
        self.region
    }

    /// Cleanly unmounts: saves the free-space runs, stamps the clean bit
    /// and hands the region back.
    pub fn unmount(self) -> PmRegion {
        if !self.is_read_only() && self.save_blocknode_mappings().is_ok() {
            let _w = self.region.memunlock();
            let sb = self.region.view_mut::<PmfsSuperblock>(PRIMARY_SUPER_OFFSET);
            sb.s_state |= SB_STATE_CLEAN;
            sb.s_wtime = (self.clock)();
            self.region.flush(SB_STATE_FIELD, CACHELINE_SIZE, true);
        }

        self.headers.clear();
        self.region
    }

    pub(crate) fn superblock(&self) -> &PmfsSuperblock {
        self.region.view::<PmfsSuperblock>(PRIMARY_SUPER_OFFSET)
    }

    /// Volume label.
    pub fn label(&self) -> &str {
        let name = &self.superblock().s_volume_name;
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        core::str::from_utf8(&name[..end]).unwrap_or("?")
    }

    /// The filesystem dropped to read-only after a fatal recovery
    /// assertion.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Gate at the head of every mutating operation.
    pub(crate) fn check_writable(&self) -> crate::errors::CanFail<PmfsError> {
        if self.is_read_only() {
            return Err(PmfsError::Io);
        }

        Ok(())
    }

    /// Free 4 KiB blocks available to the allocator.
    pub fn free_blocks(&self) -> u64 {
        self.allocator.count_free()
    }

    /// Free inode slots in the table.
    pub fn free_inodes(&self) -> u64 {
        self.inode_table.lock().free_inodes_count
    }

    /// Whether the `pagecache` mount option was given.
    pub fn has_page_cache(&self) -> bool {
        self.opts.pagecache
    }

    pub(crate) fn now(&self) -> UnixTimestamp32 {
        (self.clock)()
    }
}

// CRC-16 lookup table (reflected polynomial 0xA001), in the style of the
// classic Rocksoft model tables.
const CRC16_TABLE: [u16; 256] = [
    0x0000, 0xC0C1, 0xC181, 0x0140, 0xC301, 0x03C0, 0x0280, 0xC241,
    0xC601, 0x06C0, 0x0780, 0xC741, 0x0500, 0xC5C1, 0xC481, 0x0440,
    0xCC01, 0x0CC0, 0x0D80, 0xCD41, 0x0F00, 0xCFC1, 0xCE81, 0x0E40,
    0x0A00, 0xCAC1, 0xCB81, 0x0B40, 0xC901, 0x09C0, 0x0880, 0xC841,
    0xD801, 0x18C0, 0x1980, 0xD941, 0x1B00, 0xDBC1, 0xDA81, 0x1A40,
    0x1E00, 0xDEC1, 0xDF81, 0x1F40, 0xDD01, 0x1DC0, 0x1C80, 0xDC41,
    0x1400, 0xD4C1, 0xD581, 0x1540, 0xD701, 0x17C0, 0x1680, 0xD641,
    0xD201, 0x12C0, 0x1380, 0xD341, 0x1100, 0xD1C1, 0xD081, 0x1040,
    0xF001, 0x30C0, 0x3180, 0xF141, 0x3300, 0xF3C1, 0xF281, 0x3240,
    0x3600, 0xF6C1, 0xF781, 0x3740, 0xF501, 0x35C0, 0x3480, 0xF441,
    0x3C00, 0xFCC1, 0xFD81, 0x3D40, 0xFF01, 0x3FC0, 0x3E80, 0xFE41,
    0xFA01, 0x3AC0, 0x3B80, 0xFB41, 0x3900, 0xF9C1, 0xF881, 0x3840,
    0x2800, 0xE8C1, 0xE981, 0x2940, 0xEB01, 0x2BC0, 0x2A80, 0xEA41,
    0xEE01, 0x2EC0, 0x2F80, 0xEF41, 0x2D00, 0xEDC1, 0xEC81, 0x2C40,
    0xE401, 0x24C0, 0x2580, 0xE541, 0x2700, 0xE7C1, 0xE681, 0x2640,
    0x2200, 0xE2C1, 0xE381, 0x2340, 0xE101, 0x21C0, 0x2080, 0xE041,
    0xA001, 0x60C0, 0x6180, 0xA141, 0x6300, 0xA3C1, 0xA281, 0x6240,
    0x6600, 0xA6C1, 0xA781, 0x6740, 0xA501, 0x65C0, 0x6480, 0xA441,
    0x6C00, 0xACC1, 0xAD81, 0x6D40, 0xAF01, 0x6FC0, 0x6E80, 0xAE41,
    0xAA01, 0x6AC0, 0x6B80, 0xAB41, 0x6900, 0xA9C1, 0xA881, 0x6840,
    0x7800, 0xB8C1, 0xB981, 0x7940, 0xBB01, 0x7BC0, 0x7A80, 0xBA41,
    0xBE01, 0x7EC0, 0x7F80, 0xBF41, 0x7D00, 0xBDC1, 0xBC81, 0x7C40,
    0xB401, 0x74C0, 0x7580, 0xB541, 0x7700, 0xB7C1, 0xB681, 0x7640,
    0x7200, 0xB2C1, 0xB381, 0x7340, 0xB101, 0x71C0, 0x7080, 0xB041,
    0x5000, 0x90C1, 0x9181, 0x5140, 0x9301, 0x53C0, 0x5280, 0x9241,
    0x9601, 0x56C0, 0x5780, 0x9741, 0x5500, 0x95C1, 0x9481, 0x5440,
    0x9C01, 0x5CC0, 0x5D80, 0x9D41, 0x5F00, 0x9FC1, 0x9E81, 0x5E40,
    0x5A00, 0x9AC1, 0x9B81, 0x5B40, 0x9901, 0x59C0, 0x5880, 0x9841,
    0x8801, 0x48C0, 0x4980, 0x8941, 0x4B00, 0x8BC1, 0x8A81, 0x4A40,
    0x4E00, 0x8EC1, 0x8F81, 0x4F40, 0x8D01, 0x4DC0, 0x4C80, 0x8C41,
    0x4400, 0x84C1, 0x8581, 0x4540, 0x8701, 0x47C0, 0x4680, 0x8641,
    0x8201, 0x42C0, 0x4380, 0x8341, 0x4100, 0x81C1, 0x8081, 0x4040,
];

/// CRC-16 over `buf`, seeded with all-ones.
pub(crate) fn crc16_calc(buf: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &b in buf {
        crc = CRC16_TABLE[usize::from((crc ^ u16::from(b)) & 0xFF)] ^ (crc >> 8);
    }

    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_known_value() {
        // CRC-16/MODBUS check value (poly 0xA001, init 0xFFFF).
        assert_eq!(crc16_calc(b"123456789"), 0x4B37);
    }

    #[test]
    fn mount_options_parse() {
        let opts = MountOpts::parse("pagecache,dbgmask=0x30").unwrap();
        assert!(opts.pagecache);
        assert_eq!(opts.dbgmask, 0x30);

        let opts = MountOpts::parse("dbgmask=16").unwrap();
        assert_eq!(opts.dbgmask, 16);

        assert_eq!(MountOpts::parse("").unwrap().dbgmask, 0);
        assert_eq!(MountOpts::parse("nosuchopt"), Err(PmfsError::Invalid));
        assert_eq!(MountOpts::parse("dbgmask=zz"), Err(PmfsError::Invalid));
    }
}

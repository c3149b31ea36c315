//! Per-inode append-only metadata log.
//!
//! Every metadata mutation is expressed as one entry appended to the
//! owning inode's log, a linked chain of 4 KiB pages. The caller writes
//! the entry body, flushes it, then publishes a new tail through
//! [`update_tail`], the single commit point. A reader never observes a
//! partial entry because the tail only advances after the entry's
//! cachelines are flushed and fenced.
//!
//! File logs are homogeneous streams of 32-byte [`FileWriteEntry`]
//! records and are garbage-collected when a page batch is appended: a page
//! whose entries are all fully invalidated is unlinked and returned to the
//! allocator. Directory logs hold variable-length typed records and are
//! only reclaimed when the inode is freed.

use bytemuck::{Pod, Zeroable};

use crate::errors::{CanFail, PmfsError};
use crate::fs::pmfs::inode::{InodeInfoHeader, LOG_HEAD_FIELD, LOG_TAIL_FIELD, PMFS_INODE_SIZE};
use crate::fs::pmfs::Pmfs;
use crate::fs::IOResult;
use crate::mem::{cache_align, CACHELINE_SIZE, PAGE_SHIFT};
use crate::time::UnixTimestamp32;

/// Fixed 32-byte entry slots per log page.
pub const ENTRIES_PER_PAGE: usize = 127;

/// Stride of fixed-size log entries.
pub const LOG_ENTRY_SIZE: usize = 32;

/// First byte past the last entry slot; the page tail sits here.
pub const LAST_ENTRY: u64 = 4064;

/// Low bits of a page-aligned persistent offset, used as the invalidation
/// counter inside `FileWriteEntry::block`.
pub const INVALID_MASK: u64 = 4095;

/// Saturation point of the invalidation counter.
pub const INVALID_SATURATE: u64 = 4000;

/// Largest log-page batch appended at once; growth is exponential in the
/// current page count, capped here.
pub const LOG_BATCH_MAX: u64 = 256;

/// Tag stored in the first byte of directory-log records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LogEntryType {
    FileWrite = 1,
    DirLog = 2,
    SetAttr = 3,
    LinkChange = 4,
}

impl LogEntryType {
    pub(crate) fn from_raw(raw: u8) -> IOResult<Self> {
        match raw {
            1 => Ok(Self::FileWrite),
            2 => Ok(Self::DirLog),
            3 => Ok(Self::SetAttr),
            4 => Ok(Self::LinkChange),
            _ => Err(PmfsError::Io),
        }
    }
}

/// A copy-on-write file write: `num_pages` data blocks starting at file
/// block `pgoff` (both in units of the inode's block kind) live at the
/// page-aligned persistent offset in `block`.
///
/// The low 12 bits of `block` count how many of the covered blocks have
/// since been superseded; `counter == num_pages` means the entry is dead.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct FileWriteEntry {
    pub(crate) block: u64,
    pub(crate) pgoff: u32,
    pub(crate) num_pages: u32,
    pub(crate) invalid_pages: u32,
    /// For both ctime and mtime.
    pub(crate) mtime: UnixTimestamp32,
    pub(crate) size: u64,
}

/// Attribute-change record (directory logs).
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct SetattrEntry {
    pub(crate) entry_type: u8,
    pub(crate) attr: u8,
    pub(crate) mode: u16,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) atime: UnixTimestamp32,
    pub(crate) mtime: UnixTimestamp32,
    pub(crate) ctime: UnixTimestamp32,
    pub(crate) size: u64,
}

/// Link-count change record (directory logs).
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct LinkChangeEntry {
    pub(crate) entry_type: u8,
    padding: u8,
    pub(crate) links: u16,
    pub(crate) ctime: UnixTimestamp32,
    pub(crate) flags: u32,
    pub(crate) generation: u32,
    paddings: [u64; 2],
}

impl LinkChangeEntry {
    pub(crate) fn new(links: u16, ctime: UnixTimestamp32, flags: u32, generation: u32) -> Self {
        Self {
            entry_type: LogEntryType::LinkChange as u8,
            padding: 0,
            links,
            ctime,
            flags,
            generation,
            paddings: [0; 2],
        }
    }
}

/// Trailer of every log page, linking to the next page in the chain.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct LogPageTail {
    padding: [u64; 3],
    pub(crate) next_page: u64,
}

/// Valid bits of the [`SetattrEntry::attr`] mask.
pub const ATTR_MODE: u8 = 1 << 0;
pub const ATTR_UID: u8 = 1 << 1;
pub const ATTR_GID: u8 = 1 << 2;
pub const ATTR_SIZE: u8 = 1 << 3;
pub const ATTR_ATIME: u8 = 1 << 4;
pub const ATTR_MTIME: u8 = 1 << 5;
pub const ATTR_CTIME: u8 = 1 << 6;

/// Page-aligned base of the page holding `p`.
#[inline]
pub const fn block_off(p: u64) -> u64 {
    p & !INVALID_MASK
}

/// Position of `p` within its page.
#[inline]
pub const fn entry_loc(p: u64) -> u64 {
    p & INVALID_MASK
}

/// Invalidation counter carried in a `FileWriteEntry::block` value.
#[inline]
pub const fn get_invalid(block: u64) -> u64 {
    block & INVALID_MASK
}

/// Offset of the page tail of the page holding `p`.
#[inline]
pub const fn page_tail_off(p: u64) -> u64 {
    block_off(p) + LAST_ENTRY
}

pub(crate) fn next_log_page(fs: &Pmfs, curr_p: u64) -> u64 {
    fs.region.view::<LogPageTail>(page_tail_off(curr_p)).next_page
}

/// Whether an entry of `size` bytes (optionally followed by a
/// cacheline-aligned inline inode) still fits in the current page.
pub(crate) fn is_last_entry(curr_p: u64, size: u64, new_inode: bool) -> bool {
    let entry_end = entry_loc(curr_p) + size;

    if !new_inode || entry_end > LAST_ENTRY {
        return entry_end > LAST_ENTRY;
    }

    let inode_start = if entry_end % CACHELINE_SIZE as u64 == 0 {
        entry_end
    } else {
        cache_align(entry_end) + CACHELINE_SIZE as u64
    };

    inode_start + PMFS_INODE_SIZE as u64 > LAST_ENTRY
}

/// End-of-page test for directory logs: no room for even an empty record,
/// unwritten (zeroed) slack the appender skipped over, or a directory
/// record with `name_len == 0`.
pub(crate) fn is_last_dir_entry(fs: &Pmfs, curr_p: u64) -> bool {
    // DIR_LOG_REC_LEN(0)
    if entry_loc(curr_p) + 28 > LAST_ENTRY {
        return true;
    }

    // First byte is the type tag, second the name length. The tag check
    // keeps zero bytes inside SET_ATTR / LINK_CHANGE records from reading
    // as the marker.
    let head = fs.region.bytes(curr_p, 2);
    head[0] == 0 || (head[0] == LogEntryType::DirLog as u8 && head[1] == 0)
}

/// Allocates and links `num_pages` zeroed log pages. The pages need not be
/// physically contiguous; the chain links whatever runs the allocator
/// hands out. Returns the offset of the first page and the page count.
pub(crate) fn allocate_inode_log_pages(fs: &Pmfs, num_pages: u64) -> IOResult<(u64, u64)> {
    use crate::fs::pmfs::balloc::BlockKind;

    let mut first: u64 = 0;
    let mut prev_page: u64 = 0;
    let mut remaining = num_pages;

    while remaining > 0 {
        let (base, got) = match fs.allocator.allocate_run(remaining, BlockKind::Blk4K) {
            Ok(run) => run,
            Err(e) => {
                // Nothing allocated yet means a clean failure; otherwise
                // hand back the partial chain.
                let mut curr = first;
                while curr != 0 {
                    let next = next_log_page(fs, curr);
                    fs.allocator.free(curr >> PAGE_SHIFT, 1, BlockKind::Blk4K);
                    curr = next;
                }
                error!("pmfs-log", "no inode log page available");
                return Err(e);
            }
        };

        let run_off = base << PAGE_SHIFT;
        let _w = fs.region.memunlock();
        fs.region.zero(run_off, (got << PAGE_SHIFT) as usize);

        // Coalesce the run into the chain.
        for i in 0..got {
            let page = run_off + (i << PAGE_SHIFT);
            if prev_page != 0 {
                fs.region
                    .view_mut::<LogPageTail>(page_tail_off(prev_page))
                    .next_page = page;
                fs.region.flush(page_tail_off(prev_page), LOG_ENTRY_SIZE, false);
            } else {
                first = page;
            }
            prev_page = page;
        }
        remaining -= got;
    }

    dbg_verbose!(
        "pmfs-log",
        "allocated {} log pages, chain head {:#x}",
        num_pages,
        first
    );

    Ok((first, num_pages))
}

/// A file-log page is dead iff every entry slot on it is fully
/// invalidated; zeroed (never written) slots count as dead.
fn curr_page_invalid(fs: &Pmfs, page_off: u64) -> bool {
    for i in 0..ENTRIES_PER_PAGE {
        let entry = fs
            .region
            .view::<FileWriteEntry>(page_off + (i * LOG_ENTRY_SIZE) as u64);
        if u64::from(entry.num_pages) != get_invalid(entry.block) {
            return false;
        }
    }

    true
}

fn free_log_page(fs: &Pmfs, page_off: u64) {
    use crate::fs::pmfs::balloc::BlockKind;

    fs.allocator
        .free(page_off >> PAGE_SHIFT, 1, BlockKind::Blk4K);
}

/// Unlinks dead pages from a file log and splices the freshly allocated
/// chain at the tail page. `log_head`, `log_tail` and `log_pages` are
/// rewritten as a group (they share the inode's second cacheline).
fn log_garbage_collect(
    fs: &Pmfs,
    pi_addr: u64,
    sih: &mut InodeInfoHeader,
    new_block: u64,
    num_pages: u64,
) -> CanFail<PmfsError> {
    let (log_head, log_tail) = {
        let pi = fs.inode(pi_addr);
        (pi.log_head, pi.log_tail)
    };

    let mut curr = log_head;
    let mut possible_head: u64 = 0;
    let mut found_head = false;
    let mut last_page: u64 = 0;
    let mut first_need_free = false;
    let mut freed: u64 = 0;

    loop {
        if block_off(curr) == block_off(log_tail) {
            // Don't recycle the tail page.
            if !found_head {
                possible_head = curr;
            }
            break;
        }

        let next = next_log_page(fs, curr);
        if curr_page_invalid(fs, curr) {
            freed += 1;
            if curr == log_head {
                // The old head is rewired around below; free it last so
                // the chain stays walkable until the new head is
                // published.
                first_need_free = true;
                last_page = curr;
            } else {
                dbg_verbose!("pmfs-log", "gc frees log page {:#x}", curr);
                let _w = fs.region.memunlock();
                fs.region
                    .view_mut::<LogPageTail>(page_tail_off(last_page))
                    .next_page = next;
                fs.region
                    .flush(page_tail_off(last_page), LOG_ENTRY_SIZE, true);
                free_log_page(fs, curr);
            }
        } else {
            if !found_head {
                possible_head = curr;
                found_head = true;
            }
            last_page = curr;
        }

        curr = next;
        if curr == 0 {
            break;
        }
    }

    let _w = fs.region.memunlock();
    fs.region
        .view_mut::<LogPageTail>(page_tail_off(log_tail))
        .next_page = new_block;
    fs.region.flush(page_tail_off(log_tail), LOG_ENTRY_SIZE, true);

    {
        let pi = fs.inode_mut(pi_addr);
        pi.log_head = possible_head;
        pi.log_tail = new_block;
        pi.log_pages = pi.log_pages + num_pages as u32 - freed as u32;
        sih.log_pages = pi.log_pages;
    }
    fs.region.flush(pi_addr + LOG_HEAD_FIELD, CACHELINE_SIZE, true);

    if first_need_free {
        dbg_verbose!("pmfs-log", "gc frees old log head {:#x}", log_head);
        free_log_page(fs, log_head);
    }

    Ok(())
}

/// Appends a page batch to the log, garbage-collecting file logs first.
/// Returns the first usable position of the new chain.
fn extend_inode_log(
    fs: &Pmfs,
    pi_addr: u64,
    sih: &mut InodeInfoHeader,
    curr_p: u64,
    is_file: bool,
) -> IOResult<u64> {
    let log_pages = u64::from(fs.inode(pi_addr).log_pages);
    let num_pages = log_pages.clamp(1, LOG_BATCH_MAX);

    let (new_block, allocated) = allocate_inode_log_pages(fs, num_pages)?;

    if is_file {
        log_garbage_collect(fs, pi_addr, sih, new_block, allocated)?;
    } else {
        let _w = fs.region.memunlock();
        fs.region
            .view_mut::<LogPageTail>(page_tail_off(curr_p))
            .next_page = new_block;
        fs.region.flush(page_tail_off(curr_p), LOG_ENTRY_SIZE, true);

        let pi = fs.inode_mut(pi_addr);
        pi.log_pages += allocated as u32;
        sih.log_pages = pi.log_pages;
        fs.region.flush(pi_addr + LOG_HEAD_FIELD, CACHELINE_SIZE, false);
    }

    Ok(new_block)
}

/// Returns the position the next entry of `size` bytes goes to, allocating
/// or extending the log chain as needed.
///
/// `tail` is the caller's running tail when several entries are appended
/// under one publication; 0 means start from the inode's published tail.
/// The position is strictly monotonic within one inode's log.
pub(crate) fn get_append_head(
    fs: &Pmfs,
    pi_addr: u64,
    sih: &mut InodeInfoHeader,
    tail: u64,
    size: u64,
    new_inode: bool,
    is_file: bool,
) -> IOResult<u64> {
    let mut curr_p = if tail != 0 {
        tail
    } else {
        fs.inode(pi_addr).log_tail
    };

    if curr_p == 0 {
        let (new_block, _) = allocate_inode_log_pages(fs, 1)?;
        {
            let _w = fs.region.memunlock();
            let pi = fs.inode_mut(pi_addr);
            pi.log_head = new_block;
            pi.log_pages = 1;
        }
        fs.region.flush(pi_addr + LOG_HEAD_FIELD, CACHELINE_SIZE, true);
        sih.log_pages = 1;
        curr_p = new_block;
    }

    if is_last_entry(curr_p, size, new_inode) {
        let next = next_log_page(fs, curr_p);
        curr_p = if next == 0 {
            extend_inode_log(fs, pi_addr, sih, curr_p, is_file)?
        } else {
            next
        };
    }

    Ok(curr_p)
}

/// Publishes a new log tail: fences all prior entry stores, then stores
/// and flushes the tail. This is the linearization point of the append.
pub(crate) fn update_tail(fs: &Pmfs, pi_addr: u64, new_tail: u64) {
    let _w = fs.region.memunlock();

    fs.region.barrier();
    fs.region.store_u64(pi_addr + LOG_TAIL_FIELD, new_tail);
    fs.region.flush(pi_addr + LOG_TAIL_FIELD, CACHELINE_SIZE, true);
}

/// Returns every page of the inode's log to the allocator and clears the
/// chain pointers last.
pub(crate) fn free_inode_log(fs: &Pmfs, pi_addr: u64) {
    let (log_head, log_tail) = {
        let pi = fs.inode(pi_addr);
        (pi.log_head, pi.log_tail)
    };

    if log_head == 0 || log_tail == 0 {
        return;
    }

    let mut curr = log_head;
    while curr != 0 {
        let next = next_log_page(fs, curr);
        dbg_verbose!("pmfs-log", "free log page {:#x}", curr);
        free_log_page(fs, block_off(curr));
        curr = next;
    }

    let _w = fs.region.memunlock();
    fs.region.store_u64(pi_addr + LOG_HEAD_FIELD, 0);
    fs.region.store_u64(pi_addr + LOG_TAIL_FIELD, 0);
    fs.inode_mut(pi_addr).log_pages = 0;
    fs.region.flush(pi_addr + LOG_HEAD_FIELD, CACHELINE_SIZE, true);
}

/// Applies a SET_ATTR record to the persistent inode, honoring the attr
/// mask.
pub(crate) fn apply_setattr_entry(fs: &Pmfs, pi_addr: u64, entry: &SetattrEntry) {
    let _w = fs.region.memunlock();
    let pi = fs.inode_mut(pi_addr);

    if entry.attr & ATTR_MODE != 0 {
        pi.i_mode = crate::fs::pmfs::inode::FileMode(entry.mode);
    }
    if entry.attr & ATTR_UID != 0 {
        pi.i_uid = entry.uid;
    }
    if entry.attr & ATTR_GID != 0 {
        pi.i_gid = entry.gid;
    }
    if entry.attr & ATTR_SIZE != 0 {
        pi.i_size = entry.size;
    }
    if entry.attr & ATTR_ATIME != 0 {
        pi.i_atime = entry.atime;
    }
    if entry.attr & ATTR_MTIME != 0 {
        pi.i_mtime = entry.mtime;
    }
    if entry.attr & ATTR_CTIME != 0 {
        pi.i_ctime = entry.ctime;
    }

    fs.region.flush(pi_addr, PMFS_INODE_SIZE, false);
}

/// Applies a LINK_CHANGE record to the persistent inode.
pub(crate) fn apply_link_change_entry(fs: &Pmfs, pi_addr: u64, entry: &LinkChangeEntry) {
    let _w = fs.region.memunlock();
    let pi = fs.inode_mut(pi_addr);

    pi.i_links_count = entry.links;
    pi.i_ctime = entry.ctime;
    pi.i_flags = crate::fs::pmfs::inode::InodeFlags(entry.flags);
    pi.i_generation = entry.generation;

    fs.region.flush(pi_addr, PMFS_INODE_SIZE, false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::PAGE_SIZE;

    #[test]
    fn entry_sizes() {
        assert_eq!(core::mem::size_of::<FileWriteEntry>(), LOG_ENTRY_SIZE);
        assert_eq!(core::mem::size_of::<SetattrEntry>(), LOG_ENTRY_SIZE);
        assert_eq!(core::mem::size_of::<LinkChangeEntry>(), LOG_ENTRY_SIZE);
        assert_eq!(core::mem::size_of::<LogPageTail>(), LOG_ENTRY_SIZE);
        assert_eq!(
            ENTRIES_PER_PAGE,
            (PAGE_SIZE - LOG_ENTRY_SIZE) / LOG_ENTRY_SIZE
        );
        assert_eq!(LAST_ENTRY, (ENTRIES_PER_PAGE * LOG_ENTRY_SIZE) as u64);
    }

    #[test]
    fn last_entry_detection() {
        // A 32-byte entry exactly filling the last slot fits.
        assert!(!is_last_entry(4032, 32, false));
        // One byte past the slot boundary does not.
        assert!(is_last_entry(4033, 32, false));
        assert!(is_last_entry(LAST_ENTRY, 32, false));

        // An inline inode at the last cacheline of the page is shifted to
        // the next page even though the entry itself fits.
        assert!(!is_last_entry(3800, 32, false));
        assert!(is_last_entry(3800, 32, true));
        // Early in the page both fit.
        assert!(!is_last_entry(0, 32, true));
    }

    #[test]
    fn invalid_counter_bits() {
        let block: u64 = 0x1000_0000;
        assert_eq!(get_invalid(block), 0);
        assert_eq!(get_invalid(block + 17), 17);
        assert_eq!(block_off(block + 17), block);
    }
}

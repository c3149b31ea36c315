//! Crash recovery and the free-space rebuild.
//!
//! An unclean mount walks every live inode's log and feeds the entries
//! back through the same insert/assign primitives the runtime uses:
//! directory logs rebuild their name index, file logs rebuild their block
//! map. Every log page and reachable data block is marked in a scan
//! bitmap, whose complement becomes the allocator's free space. Inode
//! slots that are live but referenced by no directory are leftovers of an
//! unpublished create and are swept. Finally the truncate list is
//! processed.
//!
//! A clean mount skips the bitmap: the allocator's runs were saved as
//! `(low, high)` pairs into the blocknode inode's log at unmount and are
//! loaded back directly.

use hashbrown::HashSet;

use crate::errors::{CanFail, PmfsError};
use crate::fs::pmfs::balloc::{BlockKind, ScanBitmap};
use crate::fs::pmfs::btree::{self, FileBlockMap, FANOUT, META_BLK_SHIFT};
use crate::fs::pmfs::dir::rebuild_dir_inode_tree;
use crate::fs::pmfs::inode::{
    InodeInfoHeader, PmfsInode, BLOCKNODE_INO, FREE_INODE_HINT_START, LOG_HEAD_FIELD,
    LOG_TAIL_FIELD, PMFS_INODE_SIZE, ROOT_INO,
};
use crate::fs::pmfs::log::{
    self, entry_loc, get_invalid, next_log_page, FileWriteEntry, LAST_ENTRY, LOG_ENTRY_SIZE,
};
use crate::fs::pmfs::sb::{BLOCKNODE_INODE_OFFSET, INODE_TABLE_INODE_OFFSET, RESERVED_BLOCKS};
use crate::fs::pmfs::Pmfs;
use crate::mem::{CACHELINE_SIZE, PAGE_SHIFT};

/// `(low, high)` block-range pairs per saved blocknode page.
pub const RANGENODE_PER_PAGE: usize = 254;

/// Replays a regular file's log into its DRAM block map. Entries that are
/// fully invalidated are skipped; the rest are assigned without freeing
/// (whatever they superseded was already freed before the crash). With a
/// scan bitmap, log pages are marked here and the reachable data blocks
/// afterwards by [`mark_file_map`].
pub(crate) fn rebuild_file_inode_tree(
    fs: &Pmfs,
    pi_addr: u64,
    header: &mut InodeInfoHeader,
    mut bm: Option<&mut ScanBitmap>,
) -> CanFail<PmfsError> {
    let (log_head, log_tail, ino) = {
        let pi = fs.inode(pi_addr);
        (pi.log_head, pi.log_tail, pi.ino)
    };

    dbg_verbose!("pmfs-recovery", "rebuild file {} block map", ino);

    header.map.clear();
    header.pi_addr = pi_addr;

    {
        // The map regenerates through the assignments below.
        let _w = fs.region.memunlock();
        let pi = fs.inode_mut(pi_addr);
        pi.root = 0;
        pi.height = 0;
        fs.region.flush(pi_addr, CACHELINE_SIZE, false);
    }

    if log_head == 0 || log_tail == 0 {
        // Nothing published; an interrupted first append may have left
        // head set with a zero tail, and the page is reclaimed through
        // the bitmap.
        if log_tail == 0 && log_head != 0 {
            let _w = fs.region.memunlock();
            fs.region.store_u64(pi_addr + LOG_HEAD_FIELD, 0);
            fs.inode_mut(pi_addr).log_pages = 0;
            fs.region.flush(pi_addr + LOG_HEAD_FIELD, CACHELINE_SIZE, false);
        }
        header.log_pages = 0;
        header.i_size = fs.inode(pi_addr).i_size;
        return Ok(());
    }

    if let Some(bm) = bm.as_deref_mut() {
        bm.set(log_head >> PAGE_SHIFT, BlockKind::Blk4K);
    }
    header.log_pages = 1;

    let mut curr_p = log_head;
    while curr_p != log_tail {
        if entry_loc(curr_p) == LAST_ENTRY {
            header.log_pages += 1;
            curr_p = next_log_page(fs, curr_p);
            if curr_p == 0 {
                error!("pmfs-recovery", "file {} log ends before its tail", ino);
                return Err(PmfsError::Io);
            }
            if let Some(bm) = bm.as_deref_mut() {
                bm.set(curr_p >> PAGE_SHIFT, BlockKind::Blk4K);
            }
            continue;
        }

        let (block, pgoff, num_pages) = {
            let entry = fs.region.view::<FileWriteEntry>(curr_p);
            (entry.block, u64::from(entry.pgoff), u64::from(entry.num_pages))
        };

        if num_pages != get_invalid(block) {
            btree::assign_blocks(fs, pi_addr, &mut header.map, pgoff, num_pages, curr_p, false)?;
        }

        curr_p += LOG_ENTRY_SIZE as u64;
    }

    // Pages past the tail stay allocated; keep them accounted.
    let mut page = log::block_off(curr_p);
    loop {
        let next = next_log_page(fs, page);
        if next == 0 {
            break;
        }
        header.log_pages += 1;
        page = next;
        if let Some(bm) = bm.as_deref_mut() {
            bm.set(page >> PAGE_SHIFT, BlockKind::Blk4K);
        }
    }

    let kind = fs.inode(pi_addr).blk_kind()?;
    if let Some(bm) = bm.as_deref_mut() {
        mark_file_map(fs, &header.map, kind, bm);

        // The persistent count may predate the crash; recompute it from
        // what is actually reachable.
        let leaves = count_reachable_blocks(fs, &header.map, kind);
        let _w = fs.region.memunlock();
        let pi = fs.inode_mut(pi_addr);
        pi.i_blocks = leaves;
        pi.log_pages = header.log_pages;
        fs.region.flush(pi_addr, PMFS_INODE_SIZE, false);
    }

    header.i_size = fs.inode(pi_addr).i_size;
    header.log_pages = fs.inode(pi_addr).log_pages;

    Ok(())
}

fn for_each_file_leaf(
    map: &FileBlockMap,
    nref: u64,
    height: u8,
    start_pgoff: u64,
    f: &mut dyn FnMut(u64, u64),
) {
    if height == 0 {
        f(start_pgoff, nref);
        return;
    }

    let bits = u32::from(height - 1) * META_BLK_SHIFT;
    for i in 0..FANOUT {
        let slot = map.arena_node(nref)[i];
        if slot == 0 {
            continue;
        }
        let unit = start_pgoff + ((i as u64) << bits);
        if height == 1 {
            f(unit, slot);
        } else {
            for_each_file_leaf(map, slot, height - 1, unit, f);
        }
    }
}

/// Marks every data block reachable through a file map.
fn mark_file_map(fs: &Pmfs, map: &FileBlockMap, kind: BlockKind, bm: &mut ScanBitmap) {
    if map.root() == 0 {
        return;
    }

    for_each_file_leaf(map, map.root(), map.height(), 0, &mut |unit, entry_off| {
        let entry = fs.region.view::<FileWriteEntry>(entry_off);
        let base = (entry.block & !log::INVALID_MASK) >> PAGE_SHIFT;
        let blocknr = base + (unit - u64::from(entry.pgoff)) * kind.blocks_4k();
        bm.set(blocknr, kind);
    });
}

fn count_reachable_blocks(_fs: &Pmfs, map: &FileBlockMap, kind: BlockKind) -> u64 {
    if map.root() == 0 {
        return 0;
    }

    let mut leaves = 0u64;
    for_each_file_leaf(map, map.root(), map.height(), 0, &mut |_, _| leaves += 1);

    leaves * kind.blocks_4k()
}

/// Marks the interior and data blocks of a persistent (directory-style)
/// map, the inode table's in particular.
fn mark_data_map(fs: &Pmfs, node: u64, height: u8, kind: BlockKind, bm: &mut ScanBitmap) {
    if node == 0 {
        return;
    }

    if height == 0 {
        bm.set(node >> PAGE_SHIFT, kind);
        return;
    }

    bm.set(node >> PAGE_SHIFT, BlockKind::Blk4K);
    for i in 0..FANOUT {
        let slot = fs.region.slice::<u64>(node, FANOUT)[i];
        if slot == 0 {
            continue;
        }
        if height == 1 {
            bm.set(slot >> PAGE_SHIFT, kind);
        } else {
            mark_data_map(fs, slot, height - 1, kind, bm);
        }
    }
}

impl Pmfs {
    /// Rebuilds all DRAM state (and, unless `clean`, the free space) from
    /// the persistent structures. Called once during mount.
    pub(crate) fn recover(&self, clean: bool) -> CanFail<PmfsError> {
        let total_blocks = (self.region.len() as u64) >> PAGE_SHIFT;
        let mut bm = if clean {
            None
        } else {
            Some(ScanBitmap::new(total_blocks))
        };

        if let Some(bm) = bm.as_mut() {
            for blocknr in 0..RESERVED_BLOCKS {
                bm.set(blocknr, BlockKind::Blk4K);
            }

            // The inode table is reached through its persistent map, not
            // through any log.
            let table = self.inode(INODE_TABLE_INODE_OFFSET);
            mark_data_map(self, table.root, table.height, table.blk_kind()?, bm);
        }

        if !clean {
            // Whatever the blocknode inode holds predates the crash.
            let _w = self.region.memunlock();
            self.region.store_u64(BLOCKNODE_INODE_OFFSET + LOG_HEAD_FIELD, 0);
            self.region.store_u64(BLOCKNODE_INODE_OFFSET + LOG_TAIL_FIELD, 0);
            self.region
                .flush(BLOCKNODE_INODE_OFFSET + LOG_HEAD_FIELD, CACHELINE_SIZE, false);
        }

        let inodes_count = {
            let table = self.inode(INODE_TABLE_INODE_OFFSET);
            table.i_size >> crate::fs::pmfs::inode::PMFS_INODE_BITS
        };

        let mut referenced: HashSet<u64> = HashSet::new();
        referenced.insert(ROOT_INO);
        referenced.insert(BLOCKNODE_INO);

        let mut live_inodes: u64 = 0;

        for ino in core::iter::once(ROOT_INO).chain(FREE_INODE_HINT_START..inodes_count) {
            let pi_addr = self.get_inode_addr(ino)?;
            let pi: PmfsInode = *self.inode(pi_addr);
            if !pi.is_live() {
                continue;
            }
            live_inodes += 1;

            let mut header = InodeInfoHeader::new(ino, pi_addr, pi.i_mode);
            header.i_size = pi.i_size;

            let result = if pi.i_mode.is_dir() {
                rebuild_dir_inode_tree(self, pi_addr, &mut header, bm.as_mut()).map(|()| {
                    for (_, node) in header.dir_index.iter() {
                        referenced.insert(node.ino);
                    }
                    if let Some(bm) = bm.as_mut() {
                        let _w = self.region.memunlock();
                        let pi = self.inode_mut(pi_addr);
                        pi.i_blocks = u64::from(header.log_pages);
                        self.region.flush(pi_addr, CACHELINE_SIZE, false);
                    }
                })
            } else if pi.log_head != 0 || pi.i_mode.is_reg() {
                rebuild_file_inode_tree(self, pi_addr, &mut header, bm.as_mut())
            } else {
                Ok(())
            };

            match result {
                Ok(()) => (),
                Err(PmfsError::Io) => {
                    // A chain claiming to continue past its own tail is
                    // unrecoverable; keep the filesystem readable.
                    error!(
                        "pmfs-recovery",
                        "inode {} has an impossible log chain, mounting read-only", ino
                    );
                    self.read_only
                        .store(true, core::sync::atomic::Ordering::Release);
                }
                Err(e) => {
                    error!(
                        "pmfs-recovery",
                        "inode {} log abandoned during replay ({:?})", ino, e
                    );
                }
            }

            self.headers.assign(ino, header);
        }

        // Free space is the complement of everything the scan reached.
        if let Some(bm) = bm.as_ref() {
            self.allocator.init_from_bitmap(bm, RESERVED_BLOCKS, total_blocks);
        }

        // Live slots no directory references are the residue of creates
        // whose publication never happened.
        for ino in FREE_INODE_HINT_START..inodes_count {
            let pi_addr = self.get_inode_addr(ino)?;
            if !self.inode(pi_addr).is_live() || referenced.contains(&ino) {
                continue;
            }

            info!("pmfs-recovery", "sweeping orphan inode {}", ino);
            {
                let _w = self.region.memunlock();
                self.inode_mut(pi_addr).i_links_count = 0;
                self.region.flush(pi_addr, CACHELINE_SIZE, false);
            }
            self.evict_inode(ino)?;
        }

        self.recover_truncate_list()?;

        // The table counters restart from the persistent slots.
        {
            let mut state = self.inode_table.lock();
            state.inodes_count = inodes_count;
            let mut free = 0;
            let mut hint = inodes_count;
            let mut max_inode = FREE_INODE_HINT_START;
            for ino in FREE_INODE_HINT_START..inodes_count {
                let pi_addr = self.get_inode_addr(ino)?;
                if self.inode(pi_addr).is_free_slot() {
                    free += 1;
                    hint = hint.min(ino);
                } else {
                    max_inode = ino;
                }
            }
            state.free_inodes_count = free;
            state.free_inode_hint = if hint == inodes_count {
                FREE_INODE_HINT_START
            } else {
                hint
            };
            state.max_inode = max_inode;
        }

        info!(
            "pmfs-recovery",
            "recovered {} live inodes ({} mount)",
            live_inodes,
            if clean { "clean" } else { "unclean" }
        );

        Ok(())
    }

    /// Saves the allocator's free runs into the blocknode inode's log as
    /// `(low, high)` pairs, 254 per page, zero-terminated.
    pub(crate) fn save_blocknode_mappings(&self) -> CanFail<PmfsError> {
        // Snapshot first: the pages allocated below land inside some
        // saved run, which is exactly what we want: once the runs are loaded
        // back, those pages are free again without an explicit free.
        let ranges = self.allocator.ranges();
        let num_pages = ranges.len().div_ceil(RANGENODE_PER_PAGE).max(1) as u64;

        let (new_block, _) = log::allocate_inode_log_pages(self, num_pages)?;

        let mut page = new_block;
        let mut slot = 0usize;
        {
            let _w = self.region.memunlock();
            for &(low, high) in &ranges {
                if slot == RANGENODE_PER_PAGE {
                    self.region.flush(page, LAST_ENTRY as usize, false);
                    page = next_log_page(self, page);
                    slot = 0;
                }
                let off = page + (slot * 16) as u64;
                self.region.store_u64(off, low);
                self.region.store_u64(off + 8, high);
                slot += 1;
            }
            self.region.flush(page, LAST_ENTRY as usize, false);

            let pi = self.inode_mut(BLOCKNODE_INODE_OFFSET);
            pi.log_head = new_block;
            pi.log_tail = page + (slot * 16) as u64;
            pi.log_pages = num_pages as u32;
            self.region
                .flush(BLOCKNODE_INODE_OFFSET + LOG_HEAD_FIELD, CACHELINE_SIZE, true);
        }

        info!(
            "pmfs",
            "saved {} free block ranges over {} pages",
            ranges.len(),
            num_pages
        );

        Ok(())
    }

    /// Loads the free runs saved by [`Self::save_blocknode_mappings`] and
    /// resets the blocknode log.
    pub(crate) fn load_blocknode_mappings(&self) -> CanFail<PmfsError> {
        let log_head = self.inode(BLOCKNODE_INODE_OFFSET).log_head;
        if log_head == 0 {
            error!("pmfs", "clean superblock without saved block ranges");
            return Err(PmfsError::Io);
        }

        let mut loaded = 0usize;
        let mut page = log_head;
        'pages: while page != 0 {
            for slot in 0..RANGENODE_PER_PAGE {
                let off = page + (slot * 16) as u64;
                let low = self.region.load_u64(off);
                if low == 0 {
                    break 'pages;
                }
                let high = self.region.load_u64(off + 8);
                self.allocator.init_range(low, high + 1);
                loaded += 1;
            }
            page = next_log_page(self, page);
        }

        {
            let _w = self.region.memunlock();
            self.region.store_u64(BLOCKNODE_INODE_OFFSET + LOG_HEAD_FIELD, 0);
            self.region.store_u64(BLOCKNODE_INODE_OFFSET + LOG_TAIL_FIELD, 0);
            self.inode_mut(BLOCKNODE_INODE_OFFSET).log_pages = 0;
            self.region
                .flush(BLOCKNODE_INODE_OFFSET + LOG_HEAD_FIELD, CACHELINE_SIZE, true);
        }

        info!("pmfs", "loaded {} saved free block ranges", loaded);

        Ok(())
    }
}

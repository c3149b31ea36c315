//! Per-inode block maps.
//!
//! Both map flavors are radix trees of 512-slot nodes walked with
//! [`META_BLK_SHIFT`] bits per level, height 0 to 3:
//!
//! - **Directory-style maps** (the inode table's backing file): leaf slots
//!   hold persistent offsets of data blocks; interior nodes are persistent
//!   4 KiB meta blocks, so the map survives remounts without a log replay.
//! - **File maps**: leaf slots hold persistent offsets of `FILE_WRITE` log
//!   entries (copy-on-write; several blocks may share one entry with
//!   different intra-entry offsets). Interior nodes live in a DRAM arena
//!   owned by the inode's header and are rebuilt from the log at mount.
//!
//! `height == 0` means the root is directly a leaf value. An interior slot
//! covering an all-zero subtree stores 0; a node whose slots all reach 0
//! during a truncate is freed and the tree collapses by peeling root
//! levels.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::errors::{CanFail, PmfsError};
use crate::fs::pmfs::balloc::BlockKind;
use crate::fs::pmfs::inode::InodeFlags;
use crate::fs::pmfs::log::{get_invalid, FileWriteEntry, INVALID_MASK, INVALID_SATURATE};
use crate::fs::pmfs::Pmfs;
use crate::fs::IOResult;
use crate::mem::{CACHELINE_SIZE, PAGE_SHIFT};

/// Bits consumed per interior level.
pub const META_BLK_SHIFT: u32 = 9;

/// Slots per interior node.
pub const FANOUT: usize = 1 << META_BLK_SHIFT;

/// Height ceiling; a block index needing a taller tree is refused.
pub const MAX_HEIGHT: u8 = 3;

type MetaNode = Box<[u64; FANOUT]>;

/// DRAM arena backing the interior nodes of one inode's file map. Node
/// references are `index + 1` so 0 keeps meaning "empty slot"; the arena's
/// lifecycle is tied to the owning inode header.
pub struct MetaArena {
    nodes: Vec<Option<MetaNode>>,
    free: Vec<u32>,
}

impl MetaArena {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
        }
    }

    fn alloc_node(&mut self) -> u64 {
        let node: MetaNode = Box::new([0u64; FANOUT]);

        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = Some(node);
            u64::from(idx) + 1
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() as u64
        }
    }

    fn free_node(&mut self, nref: u64) {
        let idx = (nref - 1) as u32;
        self.nodes[idx as usize] = None;
        self.free.push(idx);
    }

    fn node(&self, nref: u64) -> &[u64; FANOUT] {
        self.nodes[(nref - 1) as usize]
            .as_deref()
            .expect("dangling block-map node reference")
    }

    fn node_mut(&mut self, nref: u64) -> &mut [u64; FANOUT] {
        self.nodes[(nref - 1) as usize]
            .as_deref_mut()
            .expect("dangling block-map node reference")
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
    }
}

impl Default for MetaArena {
    fn default() -> Self {
        Self::new()
    }
}

/// A regular file's block map: arena plus the `(root, height)` pair packed
/// into one atomic word so readers always observe a consistent pair.
pub struct FileBlockMap {
    pub(crate) arena: MetaArena,
    root_height: AtomicU64,
}

impl FileBlockMap {
    pub fn new() -> Self {
        Self {
            arena: MetaArena::new(),
            root_height: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> u64 {
        self.root_height.load(Ordering::Acquire) >> 8
    }

    pub fn height(&self) -> u8 {
        (self.root_height.load(Ordering::Acquire) & 0xFF) as u8
    }

    pub(crate) fn set_root_height(&self, root: u64, height: u8) {
        debug_assert!(root < 1 << 56, "root offset exceeds packed range");
        self.root_height
            .store((root << 8) | u64::from(height), Ordering::Release);
    }

    pub fn clear(&mut self) {
        self.arena.clear();
        self.root_height.store(0, Ordering::Release);
    }

    /// Interior-node view for read-only walkers outside this module.
    pub(crate) fn arena_node(&self, nref: u64) -> &[u64; FANOUT] {
        self.arena.node(nref)
    }
}

impl Default for FileBlockMap {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn node_bits(height: u8) -> u32 {
    u32::from(height - 1) * META_BLK_SHIFT
}

/// Sparse files: a block index past what the tree height can address is
/// clamped; nothing beyond could have been allocated anyway.
pub(crate) fn sparse_last_blocknr(height: u8, last_blocknr: u64) -> u64 {
    let max = 1u64 << (u32::from(height) * META_BLK_SHIFT);
    if last_blocknr >= max {
        max - 1
    } else {
        last_blocknr
    }
}

fn is_empty_outside(node: &[u64; FANOUT], first_index: usize, last_index: usize) -> bool {
    node[..first_index].iter().all(|&slot| slot == 0)
        && node[last_index + 1..].iter().all(|&slot| slot == 0)
}

/// Mirrors the DRAM map root into the persistent inode. The persistent
/// pair is advisory for file maps (replay rebuilds it), but keeping it
/// current preserves the on-media invariant `root == 0` iff no blocks.
fn mirror_map_to_inode(fs: &Pmfs, pi_addr: u64, map: &FileBlockMap) {
    let _w = fs.region.memunlock();
    let pi = fs.inode_mut(pi_addr);
    pi.root = map.root();
    pi.height = map.height();
    fs.region.flush(pi_addr, CACHELINE_SIZE, false);
}

/// Bumps the invalidation counter of the entry covering `leaf_unit` and
/// frees the superseded data block, honoring the intra-entry offset.
fn invalidate_entry_block(fs: &Pmfs, entry_off: u64, leaf_unit: u64, kind: BlockKind) -> CanFail<PmfsError> {
    let (pgoff, num_pages, block) = {
        let entry = fs.region.view::<FileWriteEntry>(entry_off);
        (u64::from(entry.pgoff), u64::from(entry.num_pages), entry.block)
    };

    if pgoff > leaf_unit || pgoff + num_pages <= leaf_unit {
        error!(
            "pmfs-map",
            "entry at {:#x} does not cover block {} (pgoff {}, num {})",
            entry_off,
            leaf_unit,
            pgoff,
            num_pages
        );
        return Err(PmfsError::Io);
    }

    if get_invalid(block) < INVALID_SATURATE {
        let _w = fs.region.memunlock();
        fs.region.view_mut::<FileWriteEntry>(entry_off).block += 1;
        fs.region.flush(entry_off, core::mem::size_of::<FileWriteEntry>(), false);
    }

    let entry_units = leaf_unit - pgoff;
    let blocknr = ((block & !INVALID_MASK) >> PAGE_SHIFT) + entry_units * kind.blocks_4k();
    fs.allocator.free(blocknr, 1, kind);

    dbg_verbose!(
        "pmfs-map",
        "invalidated block {} of entry {:#x}, freed blocknr {}",
        leaf_unit,
        entry_off,
        blocknr
    );

    Ok(())
}

// ==================== file maps (DRAM arena) ====================

/// Looks a file block (in units of the inode's block kind) up in the map.
/// Returns the owning `FILE_WRITE` entry offset, or 0 for a hole.
pub(crate) fn find_entry(map: &FileBlockMap, blocknr: u64) -> u64 {
    let mut height = map.height();
    let mut bp = map.root();

    if bp == 0 || blocknr >= 1u64 << (u32::from(height) * META_BLK_SHIFT) {
        return 0;
    }

    let mut blocknr = blocknr;
    while height > 0 {
        let bits = node_bits(height);
        let idx = (blocknr >> bits) as usize;
        bp = map.arena.node(bp)[idx];
        if bp == 0 {
            return 0;
        }
        blocknr &= (1u64 << bits) - 1;
        height -= 1;
    }

    bp
}

/// Resolves a file block number (4 KiB units) to the persistent offset of
/// its data, or 0 for holes.
pub(crate) fn find_nvmm_block(fs: &Pmfs, map: &FileBlockMap, kind: BlockKind, file_blocknr: u64) -> u64 {
    let blk_shift = kind.shift() - PAGE_SHIFT;
    let blk_offset = file_blocknr & ((1u64 << blk_shift) - 1);
    let unit = file_blocknr >> blk_shift;

    let entry_off = find_entry(map, unit);
    if entry_off == 0 {
        return 0;
    }

    let entry = fs.region.view::<FileWriteEntry>(entry_off);
    let base = entry.block & !INVALID_MASK;
    let data = base + (unit - u64::from(entry.pgoff)) * kind.size();

    data + (blk_offset << PAGE_SHIFT)
}

fn increase_file_height(map: &mut FileBlockMap, new_height: u8) {
    let mut height = map.height();
    let mut prev_root = map.root();

    dbg_verbose!("pmfs-map", "increasing tree height {}:{}", height, new_height);
    while height < new_height {
        let nref = map.arena.alloc_node();
        map.arena.node_mut(nref)[0] = prev_root;
        prev_root = nref;
        height += 1;
    }

    map.set_root_height(prev_root, height);
}

#[allow(clippy::too_many_arguments)]
fn recursive_assign(
    fs: &Pmfs,
    pi_addr: u64,
    arena: &mut MetaArena,
    node_ref: u64,
    height: u8,
    first_blocknr: u64,
    last_blocknr: u64,
    curr_entry: u64,
    start_pgoff: u64,
    kind: BlockKind,
    free_superseded: bool,
) -> CanFail<PmfsError> {
    let bits = node_bits(height);
    let first_index = (first_blocknr >> bits) as usize;
    let last_index = (last_blocknr >> bits) as usize;

    for i in first_index..=last_index {
        if height == 1 {
            let slot = arena.node(node_ref)[i];
            if slot != 0 && free_superseded {
                invalidate_entry_block(fs, slot, start_pgoff + i as u64, kind)?;
                let _w = fs.region.memunlock();
                fs.inode_mut(pi_addr).i_blocks -= kind.blocks_4k();
            }
            arena.node_mut(node_ref)[i] = curr_entry;
        } else {
            let mut child = arena.node(node_ref)[i];
            if child == 0 {
                child = arena.alloc_node();
                arena.node_mut(node_ref)[i] = child;
            }

            let mask = (1u64 << bits) - 1;
            let first_blk = if i == first_index { first_blocknr & mask } else { 0 };
            let last_blk = if i == last_index { last_blocknr & mask } else { mask };

            recursive_assign(
                fs,
                pi_addr,
                arena,
                child,
                height - 1,
                first_blk,
                last_blk,
                curr_entry,
                start_pgoff + ((i as u64) << bits),
                kind,
                free_superseded,
            )?;
        }
    }

    Ok(())
}

/// Points `num` file blocks starting at `first_blocknr` (inode-block
/// units) at the `FILE_WRITE` entry at `curr_entry`, growing the tree as
/// needed. With `free_superseded`, a slot that was already set has its
/// previous entry invalidated and the superseded data block freed;
/// recovery replays pass `false` because the pre-crash invalidations are
/// already persistent.
///
/// # Errors
///
/// [`PmfsError::NoSpace`] when the needed height exceeds [`MAX_HEIGHT`];
/// the old `(root, height)` stays visible in that case.
pub(crate) fn assign_blocks(
    fs: &Pmfs,
    pi_addr: u64,
    map: &mut FileBlockMap,
    first_blocknr: u64,
    num: u64,
    curr_entry: u64,
    free_superseded: bool,
) -> CanFail<PmfsError> {
    let kind = fs.inode(pi_addr).blk_kind()?;
    let last_blocknr = first_blocknr + num - 1;

    let mut height = map.height();
    let blk_shift = u32::from(height) * META_BLK_SHIFT;

    if last_blocknr > (1u64 << blk_shift) - 1 {
        let mut total = last_blocknr >> blk_shift;
        while total > 0 {
            total >>= META_BLK_SHIFT;
            height += 1;
        }
        if height > MAX_HEIGHT {
            dbg_verbose!("pmfs-map", "max file size, cannot grow the block map");
            return Err(PmfsError::NoSpace);
        }
    }

    if map.root() == 0 {
        if height == 0 {
            map.set_root_height(curr_entry, 0);
        } else {
            increase_file_height(map, height);
            let root = map.root();
            recursive_assign(
                fs,
                pi_addr,
                &mut map.arena,
                root,
                height,
                first_blocknr,
                last_blocknr,
                curr_entry,
                0,
                kind,
                free_superseded,
            )?;
        }
    } else if height == 0 {
        // COW overwrite of a single-block file: re-assign the root.
        if free_superseded {
            invalidate_entry_block(fs, map.root(), first_blocknr, kind)?;
            let _w = fs.region.memunlock();
            fs.inode_mut(pi_addr).i_blocks -= kind.blocks_4k();
        }
        map.set_root_height(curr_entry, 0);
    } else {
        if height > map.height() {
            increase_file_height(map, height);
        }
        let root = map.root();
        recursive_assign(
            fs,
            pi_addr,
            &mut map.arena,
            root,
            height,
            first_blocknr,
            last_blocknr,
            curr_entry,
            0,
            kind,
            free_superseded,
        )?;
    }

    mirror_map_to_inode(fs, pi_addr, map);

    Ok(())
}

fn recursive_truncate_file(
    fs: &Pmfs,
    arena: &mut MetaArena,
    node_ref: u64,
    height: u8,
    first_blocknr: u64,
    last_blocknr: u64,
    start_pgoff: u64,
    kind: BlockKind,
) -> IOResult<(u64, bool)> {
    let bits = node_bits(height);
    let first_index = (first_blocknr >> bits) as usize;
    let last_index = (last_blocknr >> bits) as usize;

    let mut start = first_index;
    let mut end = last_index;
    let mut all_range_freed = true;
    let mut freed: u64 = 0;

    if height == 1 {
        for i in first_index..=last_index {
            let slot = arena.node(node_ref)[i];
            if slot == 0 {
                continue;
            }
            invalidate_entry_block(fs, slot, start_pgoff + i as u64, kind)?;
            freed += 1;
        }
    } else {
        for i in first_index..=last_index {
            let child = arena.node(node_ref)[i];
            if child == 0 {
                continue;
            }

            let mask = (1u64 << bits) - 1;
            let first_blk = if i == first_index { first_blocknr & mask } else { 0 };
            let last_blk = if i == last_index { last_blocknr & mask } else { mask };
            let pgoff = start_pgoff + ((i as u64) << bits);

            let (f, empty) =
                recursive_truncate_file(fs, arena, child, height - 1, first_blk, last_blk, pgoff, kind)?;
            freed += f;

            if empty {
                arena.free_node(child);
                arena.node_mut(node_ref)[i] = 0;
            } else {
                if i == first_index {
                    start += 1;
                } else if i == last_index {
                    end -= 1;
                }
                all_range_freed = false;
            }
        }
    }

    let node = arena.node_mut(node_ref);
    if all_range_freed && is_empty_outside(node, first_index, last_index) {
        Ok((freed, true))
    } else {
        if start <= end {
            node[start..=end].fill(0);
        }
        Ok((freed, false))
    }
}

fn count_file_leaves(arena: &MetaArena, node_ref: u64, height: u8) -> u64 {
    if height == 0 {
        return 1;
    }

    arena
        .node(node_ref)
        .iter()
        .filter(|&&slot| slot != 0)
        .map(|&slot| count_file_leaves(arena, slot, height - 1))
        .sum()
}

fn decrease_file_height(fs: &Pmfs, pi_addr: u64, map: &mut FileBlockMap, newsize: u64, newroot: u64) {
    let height = map.height();
    let mut new_height: u8 = 0;

    let i_blocks = fs.inode(pi_addr).i_blocks;
    if i_blocks != 0 && newsize != 0 {
        let kind = match fs.inode(pi_addr).blk_kind() {
            Ok(kind) => kind,
            Err(_) => return,
        };
        let mut last_blocknr = ((newsize + kind.size() - 1) >> kind.shift()) - 1;
        while last_blocknr > 0 {
            last_blocknr >>= META_BLK_SHIFT;
            new_height += 1;
        }
        if height == new_height {
            return;
        }
    } else {
        debug_assert!(newroot == 0, "empty map with a surviving root");
    }

    dbg_verbose!("pmfs-map", "reducing tree height {}->{}", height, new_height);

    let mut height = height;
    let mut newroot = newroot;
    while height > new_height && newroot != 0 {
        let next = map.arena.node(newroot)[0];
        map.arena.free_node(newroot);
        newroot = next;
        height -= 1;
    }

    map.set_root_height(newroot, new_height);
    mirror_map_to_inode(fs, pi_addr, map);
}

/// Frees file blocks in the byte range `[start, end)` and collapses the
/// tree. With the `EOFBLOCKS` flag set, the whole addressable range is
/// reclaimed instead of trusting `end`. When `mounting`, the block count
/// is recomputed from the surviving leaves rather than decremented.
pub(crate) fn truncate_file_blocks(
    fs: &Pmfs,
    pi_addr: u64,
    map: &mut FileBlockMap,
    start: u64,
    end: u64,
    mounting: bool,
) -> CanFail<PmfsError> {
    let (kind, height, flags) = {
        let pi = fs.inode(pi_addr);
        (pi.blk_kind()?, map.height(), pi.i_flags)
    };

    if map.root() == 0 {
        return Ok(());
    }

    let data_bits = kind.shift();
    let first_blocknr = (start + kind.size() - 1) >> data_bits;
    let last_blocknr = if flags.includes(InodeFlags::EOFBLOCKS_FL) {
        (1u64 << (u32::from(height) * META_BLK_SHIFT)) - 1
    } else {
        if end == 0 {
            return Ok(());
        }
        sparse_last_blocknr(height, (end - 1) >> data_bits)
    };

    if first_blocknr > last_blocknr {
        return Ok(());
    }

    let root = map.root();
    let freed;
    let newroot;

    if height == 0 {
        let pgoff = u64::from(fs.region.view::<FileWriteEntry>(root).pgoff);
        invalidate_entry_block(fs, root, pgoff, kind)?;
        newroot = 0;
        freed = 1;
    } else {
        let (f, empty) =
            recursive_truncate_file(fs, &mut map.arena, root, height, first_blocknr, last_blocknr, 0, kind)?;
        freed = f;
        newroot = if empty {
            map.arena.free_node(root);
            0
        } else {
            root
        };
    }

    {
        let _w = fs.region.memunlock();
        let pi = fs.inode_mut(pi_addr);
        if mounting {
            // A power failure interrupted whatever maintained the count;
            // recompute it from the surviving leaves.
            let leaves = if newroot == 0 {
                0
            } else if height == 0 {
                1
            } else {
                count_file_leaves(&map.arena, newroot, height)
            };
            pi.i_blocks = leaves * kind.blocks_4k();
        } else {
            pi.i_blocks -= freed * kind.blocks_4k();
        }
        let now = (fs.clock)();
        pi.i_mtime = now;
        pi.i_ctime = now;
    }

    decrease_file_height(fs, pi_addr, map, start, newroot);
    fs.check_eof_blocks(pi_addr);
    fs.region.flush(pi_addr, CACHELINE_SIZE, false);

    Ok(())
}

/// Frees everything a file's map references; used when the inode is
/// evicted. Returns the number of data blocks freed.
pub(crate) fn free_file_subtree(
    fs: &Pmfs,
    map: &mut FileBlockMap,
    kind: BlockKind,
    last_blocknr: u64,
) -> IOResult<u64> {
    let root = map.root();
    let height = map.height();

    if root == 0 {
        return Ok(0);
    }

    let freed = if height == 0 {
        let pgoff = u64::from(fs.region.view::<FileWriteEntry>(root).pgoff);
        invalidate_entry_block(fs, root, pgoff, kind)?;
        1
    } else {
        let (freed, empty) =
            recursive_truncate_file(fs, &mut map.arena, root, height, 0, last_blocknr, 0, kind)?;
        debug_assert!(empty, "subtree free left live leaves behind");
        map.arena.free_node(root);
        freed
    };

    map.set_root_height(0, 0);

    Ok(freed)
}

// ============== region search (SEEK_DATA / SEEK_HOLE) ==============

fn recursive_find_region(
    arena: &MetaArena,
    node_ref: u64,
    height: u8,
    first_blocknr: u64,
    last_blocknr: u64,
    data_found: &mut bool,
    hole_found: &mut bool,
    hole: bool,
) -> u64 {
    let bits = node_bits(height);
    let first_index = (first_blocknr >> bits) as usize;
    let last_index = (last_blocknr >> bits) as usize;
    let mut blocks: u64 = 0;

    for i in first_index..=last_index {
        let slot = arena.node(node_ref)[i];

        if height == 1 || slot == 0 {
            if slot != 0 {
                *data_found = true;
                if !hole {
                    return blocks;
                }
            } else {
                *hole_found = true;
            }

            if !*hole_found || !hole {
                blocks += 1u64 << bits;
            }
        } else {
            let mask = (1u64 << bits) - 1;
            let first_blk = if i == first_index { first_blocknr & mask } else { 0 };
            let last_blk = if i == last_index { last_blocknr & mask } else { mask };

            blocks += recursive_find_region(
                arena,
                slot,
                height - 1,
                first_blk,
                last_blk,
                data_found,
                hole_found,
                hole,
            );
            if !hole && *data_found {
                return blocks;
            }
        }
    }

    blocks
}

/// Scans `[first_blocknr, last_blocknr]` (inode-block units) for data or a
/// hole. Returns the scanned block count before the match plus the two
/// found flags.
pub(crate) fn find_region_blocks(
    map: &FileBlockMap,
    first_blocknr: u64,
    last_blocknr: u64,
    hole: bool,
) -> (u64, bool, bool) {
    let mut data_found = false;
    let mut hole_found = false;

    let blocks = recursive_find_region(
        &map.arena,
        map.root(),
        map.height(),
        first_blocknr,
        sparse_last_blocknr(map.height(), last_blocknr),
        &mut data_found,
        &mut hole_found,
        hole,
    );

    (blocks, data_found, hole_found)
}

// ============== directory-style maps (persistent nodes) ==============

fn pm_slot(fs: &Pmfs, node_off: u64, idx: usize) -> u64 {
    fs.region.slice::<u64>(node_off, FANOUT)[idx]
}

fn pm_set_slot(fs: &Pmfs, node_off: u64, idx: usize, value: u64) {
    let _w = fs.region.memunlock();
    fs.region.slice_mut::<u64>(node_off, FANOUT)[idx] = value;
    fs.region.flush(node_off + (idx * 8) as u64, 8, false);
}

fn new_meta_block(fs: &Pmfs) -> IOResult<u64> {
    let blocknr = fs.allocator.allocate(1, BlockKind::Blk4K)?;
    let off = blocknr << PAGE_SHIFT;
    let _w = fs.region.memunlock();
    fs.region.zero(off, 1 << PAGE_SHIFT);

    Ok(off)
}

/// Allocates one data block for the inode and counts it. Zeroes the block
/// when asked.
fn new_data_block(fs: &Pmfs, pi_addr: u64, kind: BlockKind, zero: bool) -> IOResult<u64> {
    let blocknr = fs.allocator.allocate(1, kind)?;

    if zero {
        let _w = fs.region.memunlock();
        fs.region.zero(blocknr << PAGE_SHIFT, kind.size() as usize);
    }

    let _w = fs.region.memunlock();
    fs.inode_mut(pi_addr).i_blocks += kind.blocks_4k();

    Ok(blocknr)
}

/// Looks a block (inode-block units) up in a persistent map. Returns the
/// data block's offset, or 0 for holes.
pub(crate) fn find_data_block(fs: &Pmfs, pi_addr: u64, blocknr: u64) -> u64 {
    let (mut height, mut bp) = {
        let pi = fs.inode(pi_addr);
        (pi.height, pi.root)
    };

    if bp == 0 || blocknr >= 1u64 << (u32::from(height) * META_BLK_SHIFT) {
        return 0;
    }

    let mut blocknr = blocknr;
    while height > 0 {
        let bits = node_bits(height);
        let idx = (blocknr >> bits) as usize;
        bp = pm_slot(fs, bp, idx);
        if bp == 0 {
            return 0;
        }
        blocknr &= (1u64 << bits) - 1;
        height -= 1;
    }

    bp
}

fn increase_data_height(fs: &Pmfs, pi_addr: u64, new_height: u8) -> CanFail<PmfsError> {
    let (mut height, mut prev_root) = {
        let pi = fs.inode(pi_addr);
        (pi.height, pi.root)
    };

    dbg_verbose!("pmfs-map", "increasing tree height {}:{}", height, new_height);
    while height < new_height {
        let node = match new_meta_block(fs) {
            Ok(node) => node,
            Err(e) => {
                error!("pmfs-map", "failed to increase block-map height");
                return Err(e);
            }
        };
        pm_set_slot(fs, node, 0, prev_root);
        prev_root = node;
        height += 1;
    }

    let _w = fs.region.memunlock();
    let pi = fs.inode_mut(pi_addr);
    pi.root = prev_root;
    pi.height = height;
    fs.region.flush(pi_addr, CACHELINE_SIZE, true);

    Ok(())
}

fn recursive_alloc_data(
    fs: &Pmfs,
    pi_addr: u64,
    node_off: u64,
    height: u8,
    first_blocknr: u64,
    last_blocknr: u64,
    zero: bool,
    kind: BlockKind,
) -> CanFail<PmfsError> {
    let bits = node_bits(height);
    let first_index = (first_blocknr >> bits) as usize;
    let last_index = (last_blocknr >> bits) as usize;

    for i in first_index..=last_index {
        if height == 1 {
            if pm_slot(fs, node_off, i) == 0 {
                let blocknr = match new_data_block(fs, pi_addr, kind, zero) {
                    Ok(blocknr) => blocknr,
                    Err(e) => {
                        // Flag the partial allocation so a later truncate
                        // reclaims whatever was handed out.
                        let _w = fs.region.memunlock();
                        let pi = fs.inode_mut(pi_addr);
                        pi.i_flags = pi.i_flags | InodeFlags::EOFBLOCKS_FL;
                        fs.region.flush(pi_addr, CACHELINE_SIZE, false);
                        return Err(e);
                    }
                };
                pm_set_slot(fs, node_off, i, blocknr << PAGE_SHIFT);
            }
        } else {
            if pm_slot(fs, node_off, i) == 0 {
                let node = new_meta_block(fs)?;
                pm_set_slot(fs, node_off, i, node);
            }

            let mask = (1u64 << bits) - 1;
            let first_blk = if i == first_index { first_blocknr & mask } else { 0 };
            let last_blk = if i == last_index { last_blocknr & mask } else { mask };

            recursive_alloc_data(
                fs,
                pi_addr,
                pm_slot(fs, node_off, i),
                height - 1,
                first_blk,
                last_blk,
                zero,
                kind,
            )?;
        }
    }

    Ok(())
}

/// Allocates data blocks for `[first_blocknr, first_blocknr + num)`
/// (inode-block units) in a persistent map, growing its height as needed.
pub(crate) fn alloc_data_blocks(
    fs: &Pmfs,
    pi_addr: u64,
    first_blocknr: u64,
    num: u64,
    zero: bool,
) -> CanFail<PmfsError> {
    let kind = fs.inode(pi_addr).blk_kind()?;
    let last_blocknr = first_blocknr + num - 1;

    let mut height = fs.inode(pi_addr).height;
    let blk_shift = u32::from(height) * META_BLK_SHIFT;

    dbg_verbose!(
        "pmfs-map",
        "alloc blocks height {} first {:#x} last {:#x}",
        height,
        first_blocknr,
        last_blocknr
    );

    if last_blocknr > (1u64 << blk_shift) - 1 {
        let mut total = last_blocknr >> blk_shift;
        while total > 0 {
            total >>= META_BLK_SHIFT;
            height += 1;
        }
        if height > MAX_HEIGHT {
            dbg_verbose!("pmfs-map", "max file size, cannot grow the block map");
            return Err(PmfsError::NoSpace);
        }
    }

    if fs.inode(pi_addr).root == 0 {
        if height == 0 {
            let blocknr = new_data_block(fs, pi_addr, kind, zero)?;
            let _w = fs.region.memunlock();
            let pi = fs.inode_mut(pi_addr);
            pi.root = blocknr << PAGE_SHIFT;
            pi.height = 0;
            fs.region.flush(pi_addr, CACHELINE_SIZE, true);
        } else {
            increase_data_height(fs, pi_addr, height)?;
            recursive_alloc_data(
                fs,
                pi_addr,
                fs.inode(pi_addr).root,
                height,
                first_blocknr,
                last_blocknr,
                zero,
                kind,
            )?;
        }
    } else {
        if height == 0 {
            // The single block already exists.
            return Ok(());
        }
        if height > fs.inode(pi_addr).height {
            increase_data_height(fs, pi_addr, height)?;
        }
        recursive_alloc_data(
            fs,
            pi_addr,
            fs.inode(pi_addr).root,
            height,
            first_blocknr,
            last_blocknr,
            zero,
            kind,
        )?;
    }

    Ok(())
}

fn recursive_truncate_data(
    fs: &Pmfs,
    node_off: u64,
    height: u8,
    first_blocknr: u64,
    last_blocknr: u64,
    kind: BlockKind,
) -> (u64, bool) {
    let bits = node_bits(height);
    let first_index = (first_blocknr >> bits) as usize;
    let last_index = (last_blocknr >> bits) as usize;

    let mut start = first_index;
    let mut end = last_index;
    let mut all_range_freed = true;
    let mut freed: u64 = 0;

    if height == 1 {
        for i in first_index..=last_index {
            let slot = pm_slot(fs, node_off, i);
            if slot == 0 {
                continue;
            }
            fs.allocator.free(slot >> PAGE_SHIFT, 1, kind);
            freed += 1;
        }
    } else {
        for i in first_index..=last_index {
            let child = pm_slot(fs, node_off, i);
            if child == 0 {
                continue;
            }

            let mask = (1u64 << bits) - 1;
            let first_blk = if i == first_index { first_blocknr & mask } else { 0 };
            let last_blk = if i == last_index { last_blocknr & mask } else { mask };

            let (f, empty) = recursive_truncate_data(fs, child, height - 1, first_blk, last_blk, kind);
            freed += f;

            if empty {
                // Interior nodes of persistent maps are plain 4 KiB blocks.
                fs.allocator.free(child >> PAGE_SHIFT, 1, BlockKind::Blk4K);
            } else {
                if i == first_index {
                    start += 1;
                } else if i == last_index {
                    end -= 1;
                }
                all_range_freed = false;
            }
        }
    }

    let outside_empty = {
        let node = fs.region.slice::<u64>(node_off, FANOUT);
        node[..first_index].iter().all(|&slot| slot == 0)
            && node[last_index + 1..].iter().all(|&slot| slot == 0)
    };

    if all_range_freed && outside_empty {
        (freed, true)
    } else {
        if start <= end {
            let _w = fs.region.memunlock();
            fs.region.slice_mut::<u64>(node_off, FANOUT)[start..=end].fill(0);
            fs.region.flush(node_off + (start * 8) as u64, (end - start + 1) * 8, false);
        }
        (freed, false)
    }
}

fn decrease_data_height(fs: &Pmfs, pi_addr: u64, newsize: u64, newroot: u64) {
    let (height, i_blocks) = {
        let pi = fs.inode(pi_addr);
        (pi.height, pi.i_blocks)
    };
    let mut new_height: u8 = 0;

    if i_blocks != 0 && newsize != 0 {
        let kind = match fs.inode(pi_addr).blk_kind() {
            Ok(kind) => kind,
            Err(_) => return,
        };
        let mut last_blocknr = ((newsize + kind.size() - 1) >> kind.shift()) - 1;
        while last_blocknr > 0 {
            last_blocknr >>= META_BLK_SHIFT;
            new_height += 1;
        }
        if height == new_height {
            return;
        }
    } else {
        debug_assert!(newroot == 0, "empty map with a surviving root");
    }

    let mut height = height;
    let mut newroot = newroot;
    while height > new_height && newroot != 0 {
        let next = pm_slot(fs, newroot, 0);
        fs.allocator.free(newroot >> PAGE_SHIFT, 1, BlockKind::Blk4K);
        newroot = next;
        height -= 1;
    }

    // Readers must never see a (root, height) pair that disagrees; the
    // pair shares the inode's first cacheline and is republished in one
    // flush under the per-inode lock.
    let _w = fs.region.memunlock();
    let pi = fs.inode_mut(pi_addr);
    pi.root = newroot;
    pi.height = new_height;
    fs.region.flush(pi_addr, CACHELINE_SIZE, true);
}

/// Frees data blocks of a persistent map in the byte range `[start, end)`
/// and collapses the tree, mirroring [`truncate_file_blocks`].
pub(crate) fn truncate_data_blocks(fs: &Pmfs, pi_addr: u64, start: u64, end: u64) -> CanFail<PmfsError> {
    let (kind, height, root, flags) = {
        let pi = fs.inode(pi_addr);
        (pi.blk_kind()?, pi.height, pi.root, pi.i_flags)
    };

    if root == 0 {
        return Ok(());
    }

    let data_bits = kind.shift();
    let first_blocknr = (start + kind.size() - 1) >> data_bits;
    let last_blocknr = if flags.includes(InodeFlags::EOFBLOCKS_FL) {
        (1u64 << (u32::from(height) * META_BLK_SHIFT)) - 1
    } else {
        if end == 0 {
            return Ok(());
        }
        sparse_last_blocknr(height, (end - 1) >> data_bits)
    };

    if first_blocknr > last_blocknr {
        return Ok(());
    }

    let freed;
    let newroot;
    if height == 0 {
        fs.allocator.free(root >> PAGE_SHIFT, 1, kind);
        newroot = 0;
        freed = 1;
    } else {
        let (f, empty) = recursive_truncate_data(fs, root, height, first_blocknr, last_blocknr, kind);
        freed = f;
        newroot = if empty {
            fs.allocator.free(root >> PAGE_SHIFT, 1, BlockKind::Blk4K);
            0
        } else {
            root
        };
    }

    {
        let _w = fs.region.memunlock();
        let pi = fs.inode_mut(pi_addr);
        pi.i_blocks -= freed * kind.blocks_4k();
        let now = (fs.clock)();
        pi.i_mtime = now;
        pi.i_ctime = now;
    }

    decrease_data_height(fs, pi_addr, start, newroot);
    fs.check_eof_blocks(pi_addr);
    fs.region.flush(pi_addr, CACHELINE_SIZE, false);

    Ok(())
}

/// Frees everything a persistent map references; used when the owning
/// inode is evicted.
pub(crate) fn free_data_subtree(fs: &Pmfs, root: u64, height: u8, kind: BlockKind, last_blocknr: u64) -> u64 {
    if root == 0 {
        return 0;
    }

    if height == 0 {
        fs.allocator.free(root >> PAGE_SHIFT, 1, kind);
        1
    } else {
        let (freed, empty) = recursive_truncate_data(fs, root, height, 0, last_blocknr, kind);
        debug_assert!(empty, "subtree free left live blocks behind");
        fs.allocator.free(root >> PAGE_SHIFT, 1, BlockKind::Blk4K);
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_references_keep_zero_reserved() {
        let mut arena = MetaArena::new();
        let a = arena.alloc_node();
        let b = arena.alloc_node();
        assert!(a != 0 && b != 0 && a != b);

        arena.free_node(a);
        let c = arena.alloc_node();
        assert_eq!(c, a);
    }

    #[test]
    fn packed_root_height_is_consistent() {
        let map = FileBlockMap::new();
        map.set_root_height(0xABCD_E000, 2);
        assert_eq!(map.root(), 0xABCD_E000);
        assert_eq!(map.height(), 2);
    }

    #[test]
    fn sparse_clamp() {
        assert_eq!(sparse_last_blocknr(1, 100), 100);
        assert_eq!(sparse_last_blocknr(1, 512), 511);
        assert_eq!(sparse_last_blocknr(2, 1 << 20), (1 << 18) - 1);
    }

    #[test]
    fn find_entry_on_empty_map_sees_holes() {
        let map = FileBlockMap::new();
        assert_eq!(find_entry(&map, 0), 0);
        assert_eq!(find_entry(&map, 1000), 0);
    }
}

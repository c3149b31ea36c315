//! Block allocation and the recovery scan bitmap.
//!
//! The allocator is an external collaborator of the filesystem core with a
//! narrow contract: `allocate(count, kind)` returning the base block number
//! of a contiguous, kind-aligned run, and `free(blocknr, count, kind)`. The
//! range-list implementation here satisfies that contract so the core is
//! usable stand-alone; block numbers are always expressed in 4 KiB units.
//!
//! [`ScanBitmap`] accumulates every block referenced while recovery walks
//! the inode logs; the allocator's free space is derived from its unset
//! bits afterwards.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::errors::PmfsError;
use crate::fs::IOResult;
use crate::mem::PAGE_SHIFT;

/// Data-block granularity of an inode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum BlockKind {
    #[default]
    Blk4K = 0,
    Blk2M = 1,
    Blk1G = 2,
}

impl BlockKind {
    pub(crate) fn from_raw(raw: u8) -> IOResult<Self> {
        match raw {
            0 => Ok(Self::Blk4K),
            1 => Ok(Self::Blk2M),
            2 => Ok(Self::Blk1G),
            _ => Err(PmfsError::Io),
        }
    }

    /// Shift of this block size: 12, 21 or 30.
    pub(crate) fn shift(self) -> u32 {
        match self {
            Self::Blk4K => 12,
            Self::Blk2M => 21,
            Self::Blk1G => 30,
        }
    }

    pub(crate) fn size(self) -> u64 {
        1 << self.shift()
    }

    /// Number of 4 KiB units per block of this kind.
    pub(crate) fn blocks_4k(self) -> u64 {
        1 << (self.shift() - PAGE_SHIFT)
    }
}

#[derive(Default)]
struct FreeArea {
    /// Free runs, keyed by start block, value is run length. Both in 4 KiB
    /// units. Runs never touch; neighbors are coalesced on free.
    runs: BTreeMap<u64, u64>,
    num_free: u64,

    alloc_count: u64,
    free_count: u64,
    allocated_blocks: u64,
    freed_blocks: u64,
}

/// Range-list block allocator.
pub struct BlockAllocator {
    area: Mutex<FreeArea>,
}

impl BlockAllocator {
    pub fn new() -> Self {
        Self {
            area: Mutex::new(FreeArea::default()),
        }
    }

    /// Adds `[start, end)` (4 KiB units) to the free space.
    pub fn init_range(&self, start: u64, end: u64) {
        if end > start {
            self.release(start, end - start);
        }
    }

    /// Allocates `count` contiguous blocks of `kind`, aligned to the kind's
    /// natural boundary. Returns the base block number in 4 KiB units.
    ///
    /// # Errors
    ///
    /// [`PmfsError::NoSpace`] when no run can satisfy the request.
    pub fn allocate(&self, count: u64, kind: BlockKind) -> IOResult<u64> {
        let needed = count
            .checked_mul(kind.blocks_4k())
            .ok_or(PmfsError::NoSpace)?;
        if needed == 0 {
            return Err(PmfsError::Invalid);
        }
        let align = kind.blocks_4k();

        let mut area = self.area.lock();
        let found = area.runs.iter().find_map(|(&start, &len)| {
            let aligned = start.next_multiple_of(align);
            (aligned + needed <= start + len).then_some((start, len, aligned))
        });

        let (start, len, aligned) = found.ok_or(PmfsError::NoSpace)?;

        area.runs.remove(&start);
        if aligned > start {
            area.runs.insert(start, aligned - start);
        }
        if aligned + needed < start + len {
            area.runs.insert(aligned + needed, start + len - aligned - needed);
        }
        area.num_free -= needed;
        area.alloc_count += 1;
        area.allocated_blocks += needed;

        Ok(aligned)
    }

    /// Allocates up to `max` contiguous blocks of `kind`, preferring the
    /// largest available run. Returns `(base, got)` with `1 <= got <= max`.
    ///
    /// # Errors
    ///
    /// [`PmfsError::NoSpace`] when nothing is free at this granularity.
    pub fn allocate_run(&self, max: u64, kind: BlockKind) -> IOResult<(u64, u64)> {
        let mut want = max;
        while want > 0 {
            if let Ok(base) = self.allocate(want, kind) {
                return Ok((base, want));
            }
            want /= 2;
        }

        Err(PmfsError::NoSpace)
    }

    /// Returns `count` blocks of `kind` starting at `blocknr` (4 KiB
    /// units) to the free space.
    pub fn free(&self, blocknr: u64, count: u64, kind: BlockKind) {
        let len = count * kind.blocks_4k();
        if len == 0 {
            return;
        }
        self.release(blocknr, len);

        let mut area = self.area.lock();
        area.free_count += 1;
        area.freed_blocks += len;
    }

    fn release(&self, start: u64, len: u64) {
        let mut area = self.area.lock();
        area.num_free += len;

        let mut start = start;
        let mut len = len;

        if let Some((&prev_start, &prev_len)) = area.runs.range(..start).next_back() {
            debug_assert!(prev_start + prev_len <= start, "double free of block run");
            if prev_start + prev_len == start {
                area.runs.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(&next_len) = area.runs.get(&(start + len)) {
            area.runs.remove(&(start + len));
            len += next_len;
        }

        area.runs.insert(start, len);
    }

    /// Number of free 4 KiB blocks.
    pub fn count_free(&self) -> u64 {
        self.area.lock().num_free
    }

    /// Snapshot of the free runs as inclusive `(low, high)` pairs, the
    /// shape persisted into the blocknode inode log at clean unmount.
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.area
            .lock()
            .runs
            .iter()
            .map(|(&start, &len)| (start, start + len - 1))
            .collect()
    }

    /// Lifetime allocation statistics `(alloc_calls, free_calls,
    /// allocated_blocks, freed_blocks)`.
    pub fn stats(&self) -> (u64, u64, u64, u64) {
        let area = self.area.lock();
        (
            area.alloc_count,
            area.free_count,
            area.allocated_blocks,
            area.freed_blocks,
        )
    }

    /// Rebuilds the free space as the complement of the scan bitmap over
    /// `[reserved, total)`.
    pub fn init_from_bitmap(&self, bm: &ScanBitmap, reserved: u64, total: u64) {
        let mut run_start = None;

        for blocknr in reserved..total {
            match (bm.is_set(blocknr), run_start) {
                (false, None) => run_start = Some(blocknr),
                (true, Some(start)) => {
                    self.init_range(start, blocknr);
                    run_start = None;
                }
                _ => (),
            }
        }
        if let Some(start) = run_start {
            self.init_range(start, total);
        }
    }
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// In-use block map accumulated during recovery, at 4 KiB granularity.
/// Larger kinds mark their covering 4 KiB runs.
pub struct ScanBitmap {
    words: Vec<u64>,
    bits: u64,
}

impl ScanBitmap {
    pub fn new(total_blocks: u64) -> Self {
        Self {
            words: vec![0; total_blocks.div_ceil(64) as usize],
            bits: total_blocks,
        }
    }

    /// Marks one block of `kind` at `blocknr` (4 KiB units) in use.
    pub fn set(&mut self, blocknr: u64, kind: BlockKind) {
        for b in blocknr..blocknr + kind.blocks_4k() {
            debug_assert!(b < self.bits, "scan bitmap mark out of range");
            self.words[(b / 64) as usize] |= 1 << (b % 64);
        }
    }

    pub fn is_set(&self, blocknr: u64) -> bool {
        self.words[(blocknr / 64) as usize] & (1 << (blocknr % 64)) != 0
    }

    pub fn count_set(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_round_trip() {
        let alloc = BlockAllocator::new();
        alloc.init_range(1, 1025);
        assert_eq!(alloc.count_free(), 1024);

        let a = alloc.allocate(4, BlockKind::Blk4K).unwrap();
        let b = alloc.allocate(4, BlockKind::Blk4K).unwrap();
        assert_ne!(a, b);
        assert_eq!(alloc.count_free(), 1016);

        alloc.free(a, 4, BlockKind::Blk4K);
        alloc.free(b, 4, BlockKind::Blk4K);
        assert_eq!(alloc.count_free(), 1024);
        assert_eq!(alloc.ranges(), vec![(1, 1024)]);
    }

    #[test]
    fn large_kind_allocation_is_aligned() {
        let alloc = BlockAllocator::new();
        alloc.init_range(1, 4096);

        let base = alloc.allocate(1, BlockKind::Blk2M).unwrap();
        assert_eq!(base % BlockKind::Blk2M.blocks_4k(), 0);
        assert_eq!(alloc.count_free(), 4095 - 512);
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let alloc = BlockAllocator::new();
        alloc.init_range(1, 9);

        assert!(alloc.allocate(8, BlockKind::Blk4K).is_ok());
        assert_eq!(alloc.allocate(1, BlockKind::Blk4K), Err(PmfsError::NoSpace));
    }

    #[test]
    fn allocate_run_falls_back_to_smaller_counts() {
        let alloc = BlockAllocator::new();
        alloc.init_range(1, 4);
        alloc.init_range(8, 16);

        let (base, got) = alloc.allocate_run(16, BlockKind::Blk4K).unwrap();
        assert_eq!((base, got), (8, 8));
    }

    #[test]
    fn bitmap_complement_becomes_free_space() {
        let mut bm = ScanBitmap::new(64);
        bm.set(1, BlockKind::Blk4K);
        bm.set(5, BlockKind::Blk4K);
        bm.set(6, BlockKind::Blk4K);

        let alloc = BlockAllocator::new();
        alloc.init_from_bitmap(&bm, 1, 64);

        assert_eq!(alloc.count_free(), 63 - 3);
        assert_eq!(alloc.ranges(), vec![(2, 4), (7, 63)]);
    }
}

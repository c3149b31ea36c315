//! File data paths: copy-on-write block writes, reads, size changes and
//! region search.
//!
//! A write never touches live data in place. Fresh blocks are allocated
//! and filled, one `FILE_WRITE` entry is appended per contiguous run, and
//! a single tail publication commits the whole write; only then does the
//! block map adopt the new entries, invalidating and freeing whatever
//! they supersede. A crash before the publication leaves the file exactly
//! as it was, since the allocated blocks are unreferenced and reclaimed by the
//! next recovery scan.

use crate::errors::{CanFail, PmfsError};
use crate::fs::pmfs::btree;
use crate::fs::pmfs::dir::append_setattr_entry;
use crate::fs::pmfs::inode::{FileMode, InodeFlags, PMFS_INODE_SIZE};
use crate::fs::pmfs::log::{
    self, entry_loc, next_log_page, update_tail, FileWriteEntry, SetattrEntry, ATTR_ATIME,
    ATTR_CTIME, ATTR_GID, ATTR_MODE, ATTR_MTIME, ATTR_UID, LAST_ENTRY, LOG_ENTRY_SIZE,
};
use crate::fs::pmfs::Pmfs;
use crate::fs::{IOResult, SeekTarget};
use crate::mem::{CACHELINE_SIZE, PAGE_SHIFT};
use crate::time::UnixTimestamp32;

/// Attribute changes accepted by [`Pmfs::set_attr`]; `None` fields are
/// left alone.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetAttrs {
    pub mode: Option<u16>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<UnixTimestamp32>,
    pub mtime: Option<UnixTimestamp32>,
    pub ctime: Option<UnixTimestamp32>,
    pub size: Option<u64>,
}

impl Pmfs {
    /// Copy-on-write write of `data` at byte `offset`. Returns the number
    /// of bytes written, which is less than `data.len()` only when the
    /// allocator runs dry mid-write (the published prefix stays durable).
    pub fn write(&self, ino: u64, offset: u64, data: &[u8]) -> IOResult<usize> {
        self.check_writable()?;
        if data.is_empty() {
            return Ok(0);
        }

        let header = self.inode_header(ino)?;
        let mut hdr = header.write();
        if !hdr.i_mode.is_reg() {
            return Err(PmfsError::Invalid);
        }

        let pi_addr = hdr.pi_addr;
        let kind = self.inode(pi_addr).blk_kind()?;
        let blk_size = kind.size();
        let i_size = self.inode(pi_addr).i_size;

        let end = offset + data.len() as u64;
        let start_unit = offset >> kind.shift();
        let last_unit = (end - 1) >> kind.shift();
        let new_size = i_size.max(end);
        let now = (self.clock)();

        let mut tail = self.inode(pi_addr).log_tail;
        let mut begin_tail = 0;
        let mut unit = start_unit;
        let mut written: usize = 0;

        while unit <= last_unit {
            let remaining_units = last_unit - unit + 1;
            let (base, got) = match self.allocator.allocate_run(remaining_units, kind) {
                Ok(run) => run,
                Err(e) => {
                    if begin_tail == 0 {
                        return Err(e);
                    }
                    break;
                }
            };
            let run_off = base << PAGE_SHIFT;

            {
                let _w = self.region.memunlock();

                // COW boundary fill: partially overwritten edge blocks
                // start from their previous content (or zeroes for
                // holes).
                for u in unit..unit + got {
                    let partial_head = u == start_unit && offset % blk_size != 0;
                    let partial_tail = u == last_unit && end % blk_size != 0;
                    if !(partial_head || partial_tail) {
                        continue;
                    }

                    let dest = run_off + (u - unit) * blk_size;
                    let old = btree::find_nvmm_block(
                        self,
                        &hdr.map,
                        kind,
                        u << (kind.shift() - PAGE_SHIFT),
                    );
                    if old != 0 {
                        let (dst, src) = (dest, old);
                        let bytes = self.region.bytes(src, blk_size as usize).to_vec();
                        self.region
                            .bytes_mut(dst, blk_size as usize)
                            .copy_from_slice(&bytes);
                    } else {
                        self.region.bytes_mut(dest, blk_size as usize).fill(0);
                    }
                }

                // Overlay the caller's bytes covering this run.
                let run_first_byte = unit * blk_size;
                let run_last_byte = (unit + got) * blk_size;
                let copy_from = offset.max(run_first_byte);
                let copy_to = end.min(run_last_byte);
                let src = &data[(copy_from - offset) as usize..(copy_to - offset) as usize];
                self.region
                    .bytes_mut(run_off + (copy_from - run_first_byte), src.len())
                    .copy_from_slice(src);
                self.region.flush(run_off, (got * blk_size) as usize, false);
            }

            let curr_p = log::get_append_head(self, pi_addr, &mut hdr, tail, LOG_ENTRY_SIZE as u64, false, true)?;
            {
                let _w = self.region.memunlock();
                *self.region.view_mut::<FileWriteEntry>(curr_p) = FileWriteEntry {
                    block: run_off,
                    pgoff: unit as u32,
                    num_pages: got as u32,
                    invalid_pages: 0,
                    mtime: now,
                    size: new_size,
                };
                self.region.flush(curr_p, LOG_ENTRY_SIZE, false);
            }

            dbg_verbose!(
                "pmfs-file",
                "entry @ {:#x}: pgoff {}, num {}, block {:#x}",
                curr_p,
                unit,
                got,
                run_off
            );

            {
                let _w = self.region.memunlock();
                self.inode_mut(pi_addr).i_blocks += got * kind.blocks_4k();
            }

            if begin_tail == 0 {
                begin_tail = curr_p;
            }
            tail = curr_p + LOG_ENTRY_SIZE as u64;

            let run_first_byte = unit * blk_size;
            let covered_from = offset.max(run_first_byte);
            let covered_to = end.min((unit + got) * blk_size);
            written += (covered_to - covered_from) as usize;
            unit += got;
        }

        // Single commit point for every entry of this write.
        update_tail(self, pi_addr, tail);

        self.reassign_file_btree(pi_addr, &mut hdr, begin_tail)?;

        {
            let _w = self.region.memunlock();
            let pi = self.inode_mut(pi_addr);
            // Only what actually reached the log counts towards the size.
            let covered_end = offset + written as u64;
            if covered_end > pi.i_size {
                pi.i_size = covered_end;
            }
            pi.i_mtime = now;
            pi.i_ctime = now;
            self.region.flush(pi_addr, CACHELINE_SIZE, false);
        }
        hdr.i_size = self.inode(pi_addr).i_size;
        self.check_eof_blocks(pi_addr);

        Ok(written)
    }

    /// Walks the entries appended since `begin_tail` and adopts them into
    /// the block map, invalidating superseded entries and freeing their
    /// blocks.
    pub(crate) fn reassign_file_btree(
        &self,
        pi_addr: u64,
        hdr: &mut crate::fs::pmfs::inode::InodeInfoHeader,
        begin_tail: u64,
    ) -> CanFail<PmfsError> {
        if begin_tail == 0 {
            return Ok(());
        }

        let log_tail = self.inode(pi_addr).log_tail;
        let mut curr = begin_tail;

        while curr != log_tail {
            if entry_loc(curr) == LAST_ENTRY {
                curr = next_log_page(self, curr);
            }
            if curr == log_tail {
                break;
            }

            let (pgoff, num_pages) = {
                let entry = self.region.view::<FileWriteEntry>(curr);
                (u64::from(entry.pgoff), u64::from(entry.num_pages))
            };
            btree::assign_blocks(self, pi_addr, &mut hdr.map, pgoff, num_pages, curr, true)?;

            curr += LOG_ENTRY_SIZE as u64;
        }

        Ok(())
    }

    /// Reads up to `buf.len()` bytes at `offset`; holes read as zeroes.
    /// Returns the byte count, 0 at or past EOF.
    pub fn read(&self, ino: u64, offset: u64, buf: &mut [u8]) -> IOResult<usize> {
        let header = self.inode_header(ino)?;
        let hdr = header.read();
        if !hdr.i_mode.is_reg() {
            return Err(PmfsError::Invalid);
        }

        let pi_addr = hdr.pi_addr;
        let kind = self.inode(pi_addr).blk_kind()?;
        let i_size = self.inode(pi_addr).i_size;

        if offset >= i_size {
            return Ok(0);
        }

        let count = buf.len().min((i_size - offset) as usize);
        let mut done = 0;

        while done < count {
            let pos = offset + done as u64;
            let blocknr = pos >> PAGE_SHIFT;
            let in_page = (pos & ((1u64 << PAGE_SHIFT) - 1)) as usize;
            let chunk = count.min(done + ((1usize << PAGE_SHIFT) - in_page)) - done;

            let data = btree::find_nvmm_block(self, &hdr.map, kind, blocknr);
            if data == 0 {
                buf[done..done + chunk].fill(0);
            } else {
                buf[done..done + chunk]
                    .copy_from_slice(self.region.bytes(data + in_page as u64, chunk));
            }

            done += chunk;
        }

        Ok(done)
    }

    /// Zeroes the tail of the 4 KiB page holding `newsize` so stale bytes
    /// cannot resurface when the file grows back over them.
    fn block_truncate_page(&self, hdr: &crate::fs::pmfs::inode::InodeInfoHeader, newsize: u64) {
        let page = 1u64 << PAGE_SHIFT;
        let offset = newsize & (page - 1);
        let i_size = self.inode(hdr.pi_addr).i_size;

        if offset == 0 || newsize > i_size {
            return;
        }

        let kind = match self.inode(hdr.pi_addr).blk_kind() {
            Ok(kind) => kind,
            Err(_) => return,
        };
        let data = btree::find_nvmm_block(self, &hdr.map, kind, newsize >> PAGE_SHIFT);
        if data == 0 {
            return;
        }

        let _w = self.region.memunlock();
        self.region.zero(data + offset, (page - offset) as usize);
    }

    fn do_truncate_locked(
        &self,
        hdr: &mut crate::fs::pmfs::inode::InodeInfoHeader,
        new_size: u64,
        mounting: bool,
    ) -> CanFail<PmfsError> {
        let pi_addr = hdr.pi_addr;
        let old_size = self.inode(pi_addr).i_size;

        self.block_truncate_page(hdr, new_size);

        {
            let _w = self.region.memunlock();
            let pi = self.inode_mut(pi_addr);
            pi.i_size = new_size;
            self.region.flush(pi_addr, CACHELINE_SIZE, false);
        }
        hdr.i_size = new_size;

        btree::truncate_file_blocks(self, pi_addr, &mut hdr.map, new_size, old_size, mounting)?;

        self.region.persist_mark();
        self.region.barrier();

        Ok(())
    }

    /// Changes a regular file's size. Shrinking frees the blocks past the
    /// new end; growing is sparse. The inode rides the truncate list for
    /// the duration, so a crash mid-free is finished at the next mount.
    pub fn set_size(&self, ino: u64, new_size: u64) -> CanFail<PmfsError> {
        self.check_writable()?;

        let header = self.inode_header(ino)?;
        let mut hdr = header.write();
        if !hdr.i_mode.is_reg() {
            return Err(PmfsError::Invalid);
        }

        let pi_addr = hdr.pi_addr;
        let (old_size, flags) = {
            let pi = self.inode(pi_addr);
            (pi.i_size, pi.i_flags)
        };
        if new_size == old_size && !flags.includes(InodeFlags::EOFBLOCKS_FL) {
            return Ok(());
        }

        self.truncate_add(ino, new_size)?;
        self.do_truncate_locked(&mut hdr, new_size, false)?;
        self.truncate_del(ino)?;

        Ok(())
    }

    /// Finishes a truncate found on the truncate list at mount; the block
    /// count is recomputed rather than trusted.
    pub(crate) fn apply_pending_truncate(&self, ino: u64, truncate_size: u64) -> CanFail<PmfsError> {
        let header = self.inode_header(ino)?;
        let mut hdr = header.write();

        if hdr.i_mode.is_reg() {
            self.do_truncate_locked(&mut hdr, truncate_size, true)?;
        }

        Ok(())
    }

    /// Applies attribute changes. A size change goes through the truncate
    /// path first. Directories log a SET_ATTR record in their own log;
    /// regular files update the persistent inode in place (atomically for
    /// a single field, under a journal transaction for several).
    pub fn set_attr(&self, ino: u64, attrs: &SetAttrs) -> CanFail<PmfsError> {
        self.check_writable()?;

        let mut attrs = *attrs;

        if let Some(size) = attrs.size.take() {
            self.set_size(ino, size)?;
            // The size path already refreshed the times.
            attrs.ctime = None;
            attrs.mtime = None;
        }

        let mut mask: u8 = 0;
        if attrs.mode.is_some() {
            mask |= ATTR_MODE;
        }
        if attrs.uid.is_some() {
            mask |= ATTR_UID;
        }
        if attrs.gid.is_some() {
            mask |= ATTR_GID;
        }
        if attrs.atime.is_some() {
            mask |= ATTR_ATIME;
        }
        if attrs.mtime.is_some() {
            mask |= ATTR_MTIME;
        }
        if attrs.ctime.is_some() {
            mask |= ATTR_CTIME;
        }
        if mask == 0 {
            return Ok(());
        }

        let header = self.inode_header(ino)?;
        let mut hdr = header.write();
        let pi_addr = hdr.pi_addr;

        if hdr.i_mode.is_dir() {
            let entry = SetattrEntry {
                entry_type: log::LogEntryType::SetAttr as u8,
                attr: mask,
                mode: attrs.mode.unwrap_or(0),
                uid: attrs.uid.unwrap_or(0),
                gid: attrs.gid.unwrap_or(0),
                atime: attrs.atime.unwrap_or_default(),
                mtime: attrs.mtime.unwrap_or_default(),
                ctime: attrs.ctime.unwrap_or_default(),
                size: self.inode(pi_addr).i_size,
            };

            let new_tail = append_setattr_entry(self, pi_addr, &mut hdr, &entry, 0)?;
            update_tail(self, pi_addr, new_tail);
            log::apply_setattr_entry(self, pi_addr, &entry);

            return Ok(());
        }

        let multi = mask.count_ones() > 1;
        if multi {
            self.journal.begin(1);
            self.journal.log_range(pi_addr, PMFS_INODE_SIZE);
        }

        {
            let _w = self.region.memunlock();
            let pi = self.inode_mut(pi_addr);
            if let Some(mode) = attrs.mode {
                pi.i_mode = FileMode(mode);
            }
            if let Some(uid) = attrs.uid {
                pi.i_uid = uid;
            }
            if let Some(gid) = attrs.gid {
                pi.i_gid = gid;
            }
            if let Some(atime) = attrs.atime {
                pi.i_atime = atime;
            }
            if let Some(mtime) = attrs.mtime {
                pi.i_mtime = mtime;
            }
            if let Some(ctime) = attrs.ctime {
                pi.i_ctime = ctime;
            }
            self.region.flush(pi_addr, PMFS_INODE_SIZE, true);
        }

        if multi {
            self.journal.commit();
        }

        Ok(())
    }

    /// `SEEK_DATA`/`SEEK_HOLE`: the first offset at or after `offset`
    /// inside data (resp. a hole).
    ///
    /// # Errors
    ///
    /// [`PmfsError::NoExtent`] when the offset is at or past EOF, or no
    /// data follows it.
    pub fn seek_region(&self, ino: u64, offset: u64, target: SeekTarget) -> IOResult<u64> {
        let header = self.inode_header(ino)?;
        let hdr = header.read();
        if !hdr.i_mode.is_reg() {
            return Err(PmfsError::Invalid);
        }

        let pi_addr = hdr.pi_addr;
        let pi = self.inode(pi_addr);
        let i_size = pi.i_size;
        let hole = target == SeekTarget::Hole;

        if offset >= i_size {
            return Err(PmfsError::NoExtent);
        }

        if pi.i_blocks == 0 || hdr.map.root() == 0 {
            return if hole {
                Ok(i_size)
            } else {
                Err(PmfsError::NoExtent)
            };
        }

        let kind = pi.blk_kind()?;
        let data_bits = kind.shift();
        let offset_in_block = offset & (kind.size() - 1);

        let (blocks, data_found, hole_found) = if hdr.map.height() == 0 {
            (0, true, false)
        } else {
            btree::find_region_blocks(&hdr.map, offset >> data_bits, i_size >> data_bits, hole)
        };

        dbg_verbose!(
            "pmfs-file",
            "find region offset {:#x} blocks {} data {} hole {}",
            offset,
            blocks,
            data_found,
            hole_found
        );

        if !hole && !data_found && hole_found {
            return Err(PmfsError::NoExtent);
        }

        if data_found && !hole_found {
            // Already inside data; a hole search runs to EOF.
            return if hole { Ok(i_size) } else { Ok(offset) };
        }

        if hole && hole_found && blocks == 0 {
            return if data_found { Ok(offset) } else { Ok(i_size) };
        }

        let found = if offset_in_block != 0 {
            let blocks = blocks - 1;
            offset + (blocks << data_bits) + (kind.size() - offset_in_block)
        } else {
            offset + (blocks << data_bits)
        };

        Ok(found.min(i_size))
    }
}

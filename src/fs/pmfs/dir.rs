//! Directory log and in-DRAM name index.
//!
//! A directory's content is its metadata log: every name ever linked or
//! unlinked is a `DIR_LOG` record (deletions carry `ino == 0`), so the
//! live name set is exactly what replaying the log yields. The in-DRAM
//! index is an ordered tree keyed by the BKDR hash of the name with the
//! full name as tie-breaker, so equal-hash names coexist and iteration
//! order never depends on insertion order.
//!
//! Records that create an inode carry a full inode image inline, placed
//! at the next cacheline boundary behind the record; the directory tail
//! publication makes name and inode visible in one atomic step.

use alloc::borrow::ToOwned;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use bytemuck::{Pod, Zeroable};

use crate::errors::{CanFail, PmfsError};
use crate::fs::pmfs::inode::{FileMode, InodeInfoHeader, PmfsInode, PMFS_INODE_SIZE};
use crate::fs::pmfs::log::{
    self, allocate_inode_log_pages, get_append_head, next_log_page, update_tail, LinkChangeEntry,
    LogEntryType, SetattrEntry,
};
use crate::fs::pmfs::Pmfs;
use crate::fs::IOResult;
use crate::mem::{cache_align, CACHELINE_SIZE, PAGE_SHIFT};
use crate::time::UnixTimestamp32;

/// Longest permitted name.
pub const PMFS_NAME_LEN: usize = 255;

/// Directory records are padded to 4-byte alignment.
pub const DIR_PAD: u64 = 4;

/// Fixed part of a directory record, before the name bytes.
pub const DIR_LOG_HEADER_LEN: u64 = 28;

/// Reserved readdir position meaning "no more entries".
pub const READDIR_END: u64 = 0x1;

/// On-media length of a directory record with an `n`-byte name.
pub const fn dir_log_rec_len(name_len: u64) -> u64 {
    (DIR_LOG_HEADER_LEN + name_len + DIR_PAD - 1) & !(DIR_PAD - 1)
}

/// Fixed header of a directory log record; `name_len` name bytes follow.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C, packed)]
pub struct DirLogEntry {
    pub(crate) entry_type: u8,
    pub(crate) name_len: u8,
    /// Type nibble of the target inode's mode.
    pub(crate) file_type: u8,
    /// A full inode image follows this record, cacheline-aligned.
    pub(crate) new_inode: u8,
    /// Total on-media record length.
    pub(crate) de_len: u16,
    /// The directory's link count after this operation.
    pub(crate) links_count: u16,
    /// For both mtime and ctime.
    pub(crate) mtime: UnixTimestamp32,
    /// Target inode; 0 deletes the name.
    pub(crate) ino: u64,
    /// The directory's size at append time.
    pub(crate) size: u64,
}

// BKDR string hash.
pub fn bkdr_hash(name: &[u8]) -> u32 {
    let seed: u32 = 131;
    let mut hash: u32 = 0;

    for &b in name {
        hash = hash.wrapping_mul(seed).wrapping_add(u32::from(b));
    }

    hash & 0x7FFF_FFFF
}

/// Index key: hash first, full name second, so hash collisions order
/// deterministically and identical names collide exactly.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirKey {
    pub hash: u32,
    pub name: Box<[u8]>,
}

impl DirKey {
    pub fn new(name: &[u8]) -> Self {
        Self {
            hash: bkdr_hash(name),
            name: name.to_owned().into_boxed_slice(),
        }
    }
}

/// One live name: the persistent offset of its authoritative log record
/// and the inode it resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirNode {
    pub nvmm: u64,
    pub ino: u64,
}

/// Ordered in-DRAM index over a directory's live names.
pub struct DirTree {
    tree: BTreeMap<DirKey, DirNode>,
}

impl DirTree {
    pub fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn clear(&mut self) {
        self.tree.clear();
    }

    /// # Errors
    ///
    /// [`PmfsError::Exists`] when the name is already present.
    pub fn insert(&mut self, name: &[u8], ino: u64, nvmm: u64) -> CanFail<PmfsError> {
        let key = DirKey::new(name);
        if self.tree.contains_key(&key) {
            dbg_verbose!("pmfs-dir", "entry already exists in the index");
            return Err(PmfsError::Exists);
        }

        self.tree.insert(key, DirNode { nvmm, ino });
        Ok(())
    }

    pub fn remove(&mut self, name: &[u8]) -> Option<DirNode> {
        self.tree.remove(&DirKey::new(name))
    }

    pub fn find(&self, name: &[u8]) -> Option<DirNode> {
        self.tree.get(&DirKey::new(name)).copied()
    }

    /// In-order iteration by `(hash, name)`.
    pub fn iter(&self) -> impl Iterator<Item = (&DirKey, &DirNode)> {
        self.tree.iter()
    }

    /// In-order iteration starting at `key`, inclusive.
    pub fn iter_from(&self, key: &DirKey) -> impl Iterator<Item = (&DirKey, &DirNode)> {
        self.tree.range(key.clone()..)
    }
}

impl Default for DirTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the record header and name at a log position.
pub(crate) fn read_dir_entry(fs: &Pmfs, curr_p: u64) -> (DirLogEntry, Vec<u8>) {
    let entry = fs.region.read_unaligned::<DirLogEntry>(curr_p);
    let name = fs
        .region
        .bytes(curr_p + DIR_LOG_HEADER_LEN, usize::from(entry.name_len))
        .to_owned();

    (entry, name)
}

/// Position of the cacheline-aligned inline inode behind the record at
/// `curr_p`, and the tail position past it.
fn inline_inode_pos(fs: &Pmfs, curr_p: u64, de_len: u64) -> (u64, u64) {
    let rec_end = curr_p + de_len;

    let inode_start = if log::is_last_entry(curr_p, de_len, true) {
        next_log_page(fs, curr_p)
    } else if rec_end % CACHELINE_SIZE as u64 == 0 {
        rec_end
    } else {
        cache_align(rec_end) + CACHELINE_SIZE as u64
    };

    (inode_start, inode_start + PMFS_INODE_SIZE as u64)
}

/// Appends one directory record (plus room for an inline inode image when
/// `new_inode`). Returns `(record_off, new_tail, inline_inode_off)`;
/// the tail is not published here.
#[allow(clippy::too_many_arguments)]
fn append_dir_inode_entry(
    fs: &Pmfs,
    pidir_addr: u64,
    dir_header: &mut InodeInfoHeader,
    ino: u64,
    name: &[u8],
    file_type: u8,
    link_change: i32,
    new_inode: bool,
    tail: u64,
) -> IOResult<(u64, u64, u64)> {
    let de_len = dir_log_rec_len(name.len() as u64);
    let curr_p = get_append_head(fs, pidir_addr, dir_header, tail, de_len, new_inode, false)?;

    let pidir = fs.inode(pidir_addr);
    let links_count = {
        let links = i32::from(pidir.i_links_count);
        links.saturating_add(link_change).max(0) as u16
    };

    let entry = DirLogEntry {
        entry_type: LogEntryType::DirLog as u8,
        name_len: name.len() as u8,
        file_type,
        new_inode: u8::from(new_inode),
        de_len: de_len as u16,
        links_count,
        mtime: (fs.clock)(),
        ino,
        size: pidir.i_size,
    };

    {
        let _w = fs.region.memunlock();
        fs.region.write_unaligned(curr_p, &entry);
        fs.region
            .bytes_mut(curr_p + DIR_LOG_HEADER_LEN, name.len())
            .copy_from_slice(name);
        fs.region.flush(curr_p, de_len as usize, false);
    }

    dbg_verbose!(
        "pmfs-dir",
        "dir entry @ {:#x}: ino {}, rec len {}, name len {}",
        curr_p,
        ino,
        de_len,
        name.len()
    );

    let (inline_pi, curr_tail) = if new_inode {
        inline_inode_pos(fs, curr_p, de_len)
    } else {
        (0, curr_p + de_len)
    };

    Ok((curr_p, curr_tail, inline_pi))
}

/// Writes the initial `.` and `..` records of a fresh directory into a
/// newly allocated first log page, then publishes the tail.
pub(crate) fn append_dir_init_entries(
    fs: &Pmfs,
    pi_addr: u64,
    dir_header: &mut InodeInfoHeader,
    self_ino: u64,
    parent_ino: u64,
) -> CanFail<PmfsError> {
    if fs.inode(pi_addr).log_head != 0 {
        dbg_verbose!("pmfs-dir", "log head already exists");
        return Err(PmfsError::Invalid);
    }

    let (new_block, _) = allocate_inode_log_pages(fs, 1)?;
    {
        let _w = fs.region.memunlock();
        let pi = fs.inode_mut(pi_addr);
        pi.log_head = new_block;
        pi.log_pages = 1;
        pi.i_blocks = 1;
        pi.i_size = 1 << PAGE_SHIFT;
        fs.region.flush(pi_addr, PMFS_INODE_SIZE, true);
    }
    dir_header.log_pages = 1;
    dir_header.i_size = 1 << PAGE_SHIFT;

    let now = (fs.clock)();
    let mut curr_p = new_block;
    for (name, ino, links) in [(&b"."[..], self_ino, 1u16), (&b".."[..], parent_ino, 2u16)] {
        let de_len = dir_log_rec_len(name.len() as u64);
        let entry = DirLogEntry {
            entry_type: LogEntryType::DirLog as u8,
            name_len: name.len() as u8,
            file_type: FileMode(FileMode::S_IFDIR).file_type(),
            new_inode: 0,
            de_len: de_len as u16,
            links_count: links,
            mtime: now,
            ino,
            size: 1 << PAGE_SHIFT,
        };

        {
            let _w = fs.region.memunlock();
            fs.region.write_unaligned(curr_p, &entry);
            fs.region
                .bytes_mut(curr_p + DIR_LOG_HEADER_LEN, name.len())
                .copy_from_slice(name);
            fs.region.flush(curr_p, de_len as usize, false);
        }

        dir_header.dir_index.insert(name, ino, curr_p)?;
        curr_p += de_len;
    }

    update_tail(fs, pi_addr, curr_p);

    Ok(())
}

/// Appends a name-pointing record and inserts it into the index. The
/// caller publishes the returned tail; a failed index insert is rolled
/// back by logging a compensating deletion before the publication.
#[allow(clippy::too_many_arguments)]
pub(crate) fn add_entry(
    fs: &Pmfs,
    pidir_addr: u64,
    dir_header: &mut InodeInfoHeader,
    name: &[u8],
    ino: u64,
    file_type: u8,
    link_change: i32,
    new_inode: bool,
    tail: u64,
) -> IOResult<(u64, u64, u64)> {
    if name.is_empty() || name.len() > PMFS_NAME_LEN {
        return Err(PmfsError::Invalid);
    }

    {
        let _w = fs.region.memunlock();
        let now = (fs.clock)();
        let pidir = fs.inode_mut(pidir_addr);
        pidir.i_mtime = now;
        pidir.i_ctime = now;
    }

    let (curr_entry, curr_tail, inline_pi) = append_dir_inode_entry(
        fs,
        pidir_addr,
        dir_header,
        ino,
        name,
        file_type,
        link_change,
        new_inode,
        tail,
    )?;

    if let Err(e) = dir_header.dir_index.insert(name, ino, curr_entry) {
        // Roll the log forward over the orphaned record so replay stays
        // idempotent.
        let (_, rollback_tail, _) =
            append_dir_inode_entry(fs, pidir_addr, dir_header, 0, name, 0, 0, false, curr_tail)?;
        update_tail(fs, pidir_addr, rollback_tail);
        return Err(e);
    }

    Ok((curr_entry, curr_tail, inline_pi))
}

/// Appends a deletion record (`ino == 0`) and removes the name from the
/// index. The caller publishes the returned tail.
pub(crate) fn remove_entry(
    fs: &Pmfs,
    pidir_addr: u64,
    dir_header: &mut InodeInfoHeader,
    name: &[u8],
    link_change: i32,
    tail: u64,
) -> IOResult<u64> {
    if name.is_empty() {
        return Err(PmfsError::Invalid);
    }

    {
        let _w = fs.region.memunlock();
        let now = (fs.clock)();
        let pidir = fs.inode_mut(pidir_addr);
        pidir.i_mtime = now;
        pidir.i_ctime = now;
    }

    let (_, curr_tail, _) = append_dir_inode_entry(
        fs,
        pidir_addr,
        dir_header,
        0,
        name,
        0,
        link_change,
        false,
        tail,
    )?;
    dir_header.dir_index.remove(name);

    Ok(curr_tail)
}

/// Appends a LINK_CHANGE record reflecting the inode's current link
/// count and identity to its own (directory) log.
pub(crate) fn append_link_change_entry(
    fs: &Pmfs,
    pi_addr: u64,
    header: &mut InodeInfoHeader,
    tail: u64,
) -> IOResult<u64> {
    let size = core::mem::size_of::<LinkChangeEntry>() as u64;
    let curr_p = get_append_head(fs, pi_addr, header, tail, size, false, false)?;

    let pi = fs.inode(pi_addr);
    let entry = LinkChangeEntry::new(
        pi.i_links_count,
        (fs.clock)(),
        pi.i_flags.0,
        pi.i_generation,
    );

    {
        let _w = fs.region.memunlock();
        fs.region.write_unaligned(curr_p, &entry);
        fs.region.flush(curr_p, size as usize, false);
    }

    Ok(curr_p + size)
}

/// Appends a SET_ATTR record to a directory's own log.
pub(crate) fn append_setattr_entry(
    fs: &Pmfs,
    pi_addr: u64,
    header: &mut InodeInfoHeader,
    entry: &SetattrEntry,
    tail: u64,
) -> IOResult<u64> {
    let size = core::mem::size_of::<SetattrEntry>() as u64;
    let curr_p = get_append_head(fs, pi_addr, header, tail, size, false, false)?;

    {
        let _w = fs.region.memunlock();
        fs.region.write_unaligned(curr_p, entry);
        fs.region.flush(curr_p, size as usize, false);
    }

    Ok(curr_p + size)
}

/// Replays a directory's log into a fresh index, applying attribute and
/// link-change records to the persistent inode on the way. With a scan
/// bitmap, every touched log page is marked in use.
pub(crate) fn rebuild_dir_inode_tree(
    fs: &Pmfs,
    pi_addr: u64,
    header: &mut InodeInfoHeader,
    mut bm: Option<&mut crate::fs::pmfs::balloc::ScanBitmap>,
) -> CanFail<PmfsError> {
    use crate::fs::pmfs::balloc::BlockKind;

    let (log_head, log_tail, ino) = {
        let pi = fs.inode(pi_addr);
        (pi.log_head, pi.log_tail, pi.ino)
    };

    dbg_verbose!(
        "pmfs-dir",
        "rebuild dir {} log {:#x}..{:#x}",
        ino,
        log_head,
        log_tail
    );

    header.dir_index.clear();
    header.pi_addr = pi_addr;

    if log_head == 0 {
        error!("pmfs-dir", "dir {} log is empty", ino);
        return Err(PmfsError::Io);
    }

    if let Some(bm) = bm.as_deref_mut() {
        bm.set(log_head >> PAGE_SHIFT, BlockKind::Blk4K);
    }
    header.log_pages = 1;

    let mut curr_p = log_head;
    while curr_p != log_tail {
        if log::is_last_dir_entry(fs, curr_p) {
            header.log_pages += 1;
            curr_p = next_log_page(fs, curr_p);
            if let Some(bm) = bm.as_deref_mut() {
                bm.set(curr_p >> PAGE_SHIFT, BlockKind::Blk4K);
            }
        }

        if curr_p == 0 {
            error!("pmfs-dir", "dir {} log ends before its tail", ino);
            return Err(PmfsError::Io);
        }

        let entry_type = fs.region.bytes(curr_p, 1)[0];
        match LogEntryType::from_raw(entry_type) {
            Ok(LogEntryType::SetAttr) => {
                let attr_entry = fs.region.read_unaligned::<SetattrEntry>(curr_p);
                log::apply_setattr_entry(fs, pi_addr, &attr_entry);
                curr_p += core::mem::size_of::<SetattrEntry>() as u64;
                continue;
            }
            Ok(LogEntryType::LinkChange) => {
                let link_entry = fs.region.read_unaligned::<LinkChangeEntry>(curr_p);
                log::apply_link_change_entry(fs, pi_addr, &link_entry);
                curr_p += core::mem::size_of::<LinkChangeEntry>() as u64;
                continue;
            }
            Ok(LogEntryType::DirLog) => (),
            _ => {
                error!(
                    "pmfs-dir",
                    "dir {}: unknown entry type {} at {:#x}, abandoning log",
                    ino,
                    entry_type,
                    curr_p
                );
                return Err(PmfsError::Invalid);
            }
        }

        let (entry, name) = read_dir_entry(fs, curr_p);

        if entry.ino > 0 {
            header.dir_index.insert(&name, entry.ino, curr_p)?;
        } else {
            header.dir_index.remove(&name);
        }

        {
            let _w = fs.region.memunlock();
            let pi = fs.inode_mut(pi_addr);
            pi.i_ctime = entry.mtime;
            pi.i_mtime = entry.mtime;
            pi.i_size = entry.size;
            pi.i_links_count = entry.links_count;
        }

        let de_len = u64::from(entry.de_len);
        let was_new_inode = entry.new_inode == 1;
        let record_off = curr_p;
        curr_p += de_len;

        // Skip the inline inode image, honoring the same alignment rule
        // used at append time.
        if was_new_inode {
            if log::is_last_entry(record_off, de_len, true) {
                header.log_pages += 1;
                curr_p = next_log_page(fs, record_off);
                if let Some(bm) = bm.as_deref_mut() {
                    bm.set(curr_p >> PAGE_SHIFT, BlockKind::Blk4K);
                }
            } else if curr_p % CACHELINE_SIZE as u64 != 0 {
                curr_p = cache_align(curr_p) + CACHELINE_SIZE as u64;
            }

            curr_p += PMFS_INODE_SIZE as u64;
        }
    }

    {
        let pi = fs.inode(pi_addr);
        header.i_size = pi.i_size;
        header.i_mode = pi.i_mode;
    }
    fs.region.flush(pi_addr, PMFS_INODE_SIZE, true);

    // Keep walking to the end of the chain: pages past the tail are
    // allocated and must stay accounted (and marked in use).
    let mut page = log::block_off(curr_p);
    loop {
        let next = fs.region.view::<log::LogPageTail>(page + log::LAST_ENTRY).next_page;
        if next == 0 {
            break;
        }
        header.log_pages += 1;
        page = next;
        if let Some(bm) = bm.as_deref_mut() {
            bm.set(page >> PAGE_SHIFT, BlockKind::Blk4K);
        }
    }

    Ok(())
}

impl Pmfs {
    /// Resolves `name` in a directory to its inode number.
    ///
    /// # Errors
    ///
    /// [`PmfsError::Invalid`] when the name does not exist.
    pub fn lookup(&self, parent_ino: u64, name: &[u8]) -> IOResult<u64> {
        let header = self.inode_header(parent_ino)?;
        let header = header.read();

        if !header.i_mode.is_dir() {
            return Err(PmfsError::Invalid);
        }

        header
            .dir_index
            .find(name)
            .map(|node| node.ino)
            .ok_or(PmfsError::Invalid)
    }

    /// Creates a regular or special file in `parent_ino`.
    pub fn create(&self, parent_ino: u64, name: &[u8], mode: FileMode, rdev: u32) -> IOResult<u64> {
        if mode.is_dir() {
            return Err(PmfsError::Invalid);
        }

        self.do_create(parent_ino, name, mode, rdev, 1)
    }

    /// Creates a directory in `parent_ino`, wiring `.` and `..` and
    /// bumping the parent's link count.
    pub fn mkdir(&self, parent_ino: u64, name: &[u8], mode_bits: u16) -> IOResult<u64> {
        let mode = FileMode(FileMode::S_IFDIR | (mode_bits & !FileMode::S_IFMT));

        self.do_create(parent_ino, name, mode, 0, 2)
    }

    fn do_create(
        &self,
        parent_ino: u64,
        name: &[u8],
        mode: FileMode,
        rdev: u32,
        links_count: u16,
    ) -> IOResult<u64> {
        self.check_writable()?;
        if name.is_empty() || name.len() > PMFS_NAME_LEN {
            return Err(PmfsError::Invalid);
        }

        let parent = self.inode_header(parent_ino)?;

        // The table mutex precedes the per-inode lock in the acquisition
        // order, so the slot is allocated before the parent is locked and
        // handed back if the name appeared in the meantime.
        let pidir_addr = {
            let parent_hdr = parent.read();
            if !parent_hdr.i_mode.is_dir() {
                return Err(PmfsError::Invalid);
            }
            if parent_hdr.dir_index.find(name).is_some() {
                return Err(PmfsError::Exists);
            }
            parent_hdr.pi_addr
        };
        let parent_flags = self.inode(pidir_addr).i_flags;
        let is_dir = mode.is_dir();

        let (ino, pi_addr) = self.new_pmfs_inode(mode, links_count, parent_flags, rdev)?;

        let mut child_header = InodeInfoHeader::new(ino, pi_addr, mode);
        if is_dir {
            append_dir_init_entries(self, pi_addr, &mut child_header, ino, parent_ino)?;
        }

        let mut parent_hdr = parent.write();
        if parent_hdr.dir_index.find(name).is_some() {
            drop(parent_hdr);
            {
                let _w = self.region.memunlock();
                self.inode_mut(pi_addr).i_links_count = 0;
            }
            self.free_pmfs_inode(ino)?;
            return Err(PmfsError::Exists);
        }

        // The record carries the freshly initialized inode image inline;
        // publishing the parent tail is the commit point for both.
        let link_change = i32::from(is_dir);
        let (_, curr_tail, inline_pi) = add_entry(
            self,
            pidir_addr,
            &mut parent_hdr,
            name,
            ino,
            mode.file_type(),
            link_change,
            true,
            0,
        )?;

        {
            let _w = self.region.memunlock();
            let image = *self.inode(pi_addr);
            *self.region.view_mut::<PmfsInode>(inline_pi) = image;
            self.region.flush(inline_pi, PMFS_INODE_SIZE, false);
        }

        update_tail(self, pidir_addr, curr_tail);

        if is_dir {
            let _w = self.region.memunlock();
            let pidir = self.inode_mut(pidir_addr);
            pidir.i_links_count += 1;
            self.region.flush(pidir_addr, CACHELINE_SIZE, false);
        }

        self.headers.assign(ino, child_header);

        Ok(ino)
    }

    /// Removes a non-directory name. When the target's link count drops
    /// to zero the inode goes onto the truncate list; its blocks are
    /// reclaimed by [`Pmfs::evict_inode`] once the last user is gone.
    pub fn unlink(&self, parent_ino: u64, name: &[u8]) -> CanFail<PmfsError> {
        self.check_writable()?;

        let parent = self.inode_header(parent_ino)?;
        let mut parent_hdr = parent.write();

        let victim = parent_hdr
            .dir_index
            .find(name)
            .ok_or(PmfsError::Invalid)?;
        let victim_addr = self.get_inode_addr(victim.ino)?;
        if self.inode(victim_addr).i_mode.is_dir() {
            return Err(PmfsError::Invalid);
        }

        let pidir_addr = parent_hdr.pi_addr;
        let new_tail = remove_entry(self, pidir_addr, &mut parent_hdr, name, 0, 0)?;
        update_tail(self, pidir_addr, new_tail);

        let links = {
            let _w = self.region.memunlock();
            let pi = self.inode_mut(victim_addr);
            pi.i_links_count -= 1;
            pi.i_ctime = (self.clock)();
            self.region.flush(victim_addr, CACHELINE_SIZE, true);
            pi.i_links_count
        };

        if links == 0 {
            self.truncate_add(victim.ino, 0)?;
        }

        Ok(())
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, parent_ino: u64, name: &[u8]) -> CanFail<PmfsError> {
        self.check_writable()?;

        let parent = self.inode_header(parent_ino)?;
        let mut parent_hdr = parent.write();

        let victim = parent_hdr
            .dir_index
            .find(name)
            .ok_or(PmfsError::Invalid)?;

        let child = self.inode_header(victim.ino)?;
        let mut child_hdr = child.write();
        if !child_hdr.i_mode.is_dir() {
            return Err(PmfsError::Invalid);
        }
        // `.` and `..` are all an empty directory holds.
        if child_hdr.dir_index.len() > 2 {
            return Err(PmfsError::Invalid);
        }

        let pidir_addr = parent_hdr.pi_addr;
        let new_tail = remove_entry(self, pidir_addr, &mut parent_hdr, name, -1, 0)?;
        update_tail(self, pidir_addr, new_tail);

        {
            let _w = self.region.memunlock();
            let pidir = self.inode_mut(pidir_addr);
            pidir.i_links_count -= 1;
            self.region.flush(pidir_addr, CACHELINE_SIZE, false);
        }

        let victim_addr = child_hdr.pi_addr;
        {
            let _w = self.region.memunlock();
            let pi = self.inode_mut(victim_addr);
            pi.i_links_count = 0;
            pi.i_ctime = (self.clock)();
            self.region.flush(victim_addr, CACHELINE_SIZE, false);
        }
        let tail = append_link_change_entry(self, victim_addr, &mut child_hdr, 0)?;
        update_tail(self, victim_addr, tail);

        self.truncate_add(victim.ino, 0)?;

        Ok(())
    }

    /// Renames within one directory. An existing target is replaced; the
    /// whole exchange is published with a single tail store, so a crash
    /// shows either the old or the new binding.
    pub fn rename(&self, parent_ino: u64, old_name: &[u8], new_name: &[u8]) -> CanFail<PmfsError> {
        self.check_writable()?;
        if old_name == new_name {
            return Ok(());
        }

        let parent = self.inode_header(parent_ino)?;
        let mut parent_hdr = parent.write();

        let moved = parent_hdr
            .dir_index
            .find(old_name)
            .ok_or(PmfsError::Invalid)?;
        let target = parent_hdr.dir_index.find(new_name);

        let pidir_addr = parent_hdr.pi_addr;
        let mut tail = 0;

        if target.is_some() {
            tail = remove_entry(self, pidir_addr, &mut parent_hdr, new_name, 0, tail)?;
        }
        tail = remove_entry(self, pidir_addr, &mut parent_hdr, old_name, 0, tail)?;

        let file_type = {
            let moved_addr = self.get_inode_addr(moved.ino)?;
            self.inode(moved_addr).i_mode.file_type()
        };
        let (_, new_tail, _) = add_entry(
            self,
            pidir_addr,
            &mut parent_hdr,
            new_name,
            moved.ino,
            file_type,
            0,
            false,
            tail,
        )?;
        update_tail(self, pidir_addr, new_tail);

        if let Some(target) = target {
            let target_addr = self.get_inode_addr(target.ino)?;
            let links = {
                let _w = self.region.memunlock();
                let pi = self.inode_mut(target_addr);
                pi.i_links_count = pi.i_links_count.saturating_sub(1);
                self.region.flush(target_addr, CACHELINE_SIZE, true);
                pi.i_links_count
            };
            if links == 0 {
                self.truncate_add(target.ino, 0)?;
            }
        }

        Ok(())
    }

    /// Iterates a directory in `(hash, name)` order, invoking `emit` per
    /// entry with `(name, ino, file_type)`. Iteration starts at `pos`: 0
    /// for the beginning, otherwise the persistent record offset returned
    /// by a previous call. Returns the resume position, or
    /// [`READDIR_END`].
    pub fn readdir(
        &self,
        ino: u64,
        pos: u64,
        emit: &mut dyn FnMut(&[u8], u64, u8) -> bool,
    ) -> IOResult<u64> {
        let header = self.inode_header(ino)?;
        let header = header.read();

        if !header.i_mode.is_dir() {
            return Err(PmfsError::Invalid);
        }
        if pos == READDIR_END {
            return Ok(READDIR_END);
        }

        let resume_key = if pos == 0 {
            None
        } else {
            let (_, name) = read_dir_entry(self, pos);
            Some(DirKey::new(&name))
        };

        let entries: alloc::vec::Vec<_> = match &resume_key {
            None => header.dir_index.iter().collect(),
            Some(key) => header.dir_index.iter_from(key).collect(),
        };

        for (key, node) in entries {
            let file_type = self
                .get_inode_addr(node.ino)
                .map(|addr| self.inode(addr).i_mode.file_type())
                .unwrap_or(0);

            if !emit(&key.name, node.ino, file_type) {
                return Ok(node.nvmm);
            }
        }

        Ok(READDIR_END)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rec_len_is_four_byte_padded() {
        assert_eq!(dir_log_rec_len(0), 28);
        assert_eq!(dir_log_rec_len(1), 32);
        assert_eq!(dir_log_rec_len(4), 32);
        assert_eq!(dir_log_rec_len(5), 36);
        assert_eq!(core::mem::size_of::<DirLogEntry>(), DIR_LOG_HEADER_LEN as usize);
    }

    #[test]
    fn bkdr_is_stable_and_masked() {
        let h = bkdr_hash(b"hello");
        assert_eq!(h, bkdr_hash(b"hello"));
        assert_ne!(h, bkdr_hash(b"world"));
        assert_eq!(h & 0x8000_0000, 0);
    }

    #[test]
    fn index_orders_by_hash_then_name() {
        let mut tree = DirTree::new();
        tree.insert(b"a", 10, 100).unwrap();
        tree.insert(b"b", 11, 200).unwrap();
        tree.insert(b"c", 12, 300).unwrap();

        let mut hashes: alloc::vec::Vec<u32> = tree.iter().map(|(k, _)| k.hash).collect();
        let sorted = {
            let mut s = hashes.clone();
            s.sort_unstable();
            s
        };
        assert_eq!(hashes, sorted);

        hashes.dedup();
        assert_eq!(hashes.len(), 3);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut tree = DirTree::new();
        tree.insert(b"name", 5, 50).unwrap();
        assert_eq!(tree.insert(b"name", 6, 60), Err(PmfsError::Exists));

        assert_eq!(tree.find(b"name").unwrap().ino, 5);
        assert!(tree.remove(b"name").is_some());
        assert!(tree.find(b"name").is_none());
    }
}

//! Persistent truncate list.
//!
//! Inodes whose block reclamation may be interrupted by a crash are
//! published on a singly-linked persistent list before the work starts:
//! unlinked-but-still-open inodes waiting for their final free, and
//! truncates that return blocks to the allocator before the operation is
//! fully durable. The list head lives in the superblock; each inode
//! carries its link and target size inline. Whatever is still listed at
//! mount is finished then.
//!
//! The insertion protocol makes the list crash-safe without a journal:
//! the item (next pointer and size) is flushed and fenced before the head
//! is atomically redirected to the new inode.

use crate::errors::{CanFail, PmfsError};
use crate::fs::pmfs::inode::TRUNCATE_ITEM_FIELD;
use crate::fs::pmfs::sb::SB_TRUNCATE_HEAD_FIELD;
use crate::fs::pmfs::Pmfs;

impl Pmfs {
    fn truncate_item_off(&self, ino: u64) -> crate::fs::IOResult<u64> {
        Ok(self.get_inode_addr(ino)? + TRUNCATE_ITEM_FIELD)
    }

    /// Publishes `ino` on the truncate list with the size the inode must
    /// end up at should a crash interrupt the caller.
    pub(crate) fn truncate_add(&self, ino: u64, truncate_size: u64) -> CanFail<PmfsError> {
        let mut listed = self.truncate_list.lock();
        if listed.contains(&ino) {
            return Ok(());
        }

        let item = self.truncate_item_off(ino)?;
        let head_next = self.region.load_u64(SB_TRUNCATE_HEAD_FIELD);

        {
            let _w = self.region.memunlock();
            self.region.store_u64(item, head_next);
            self.region.store_u64(item + 8, truncate_size);
            self.region.flush(item, 16, false);
        }

        // The item must be durable before the head can reach it.
        self.region.persist_mark();
        self.region.barrier();

        {
            let _w = self.region.memunlock();
            self.region.store_u64(SB_TRUNCATE_HEAD_FIELD, ino);
            self.region.flush(SB_TRUNCATE_HEAD_FIELD, 8, false);
        }
        self.region.persist_mark();
        self.region.barrier();

        listed.insert(ino);
        dbg_verbose!("pmfs-truncate", "inode {} listed, size {}", ino, truncate_size);

        Ok(())
    }

    /// Unlinks `ino` from the truncate list once the covered operation is
    /// fully persistent.
    pub(crate) fn truncate_del(&self, ino: u64) -> CanFail<PmfsError> {
        let mut listed = self.truncate_list.lock();
        if !listed.remove(&ino) {
            return Ok(());
        }

        // All prior truncate work must be durable before the inode leaves
        // the list.
        self.region.persist_mark();

        let next = self.region.load_u64(self.truncate_item_off(ino)?);

        // Locate the predecessor on the persistent chain.
        let mut prev: Option<u64> = None;
        let mut curr = self.region.load_u64(SB_TRUNCATE_HEAD_FIELD);
        while curr != 0 && curr != ino {
            prev = Some(curr);
            curr = self.region.load_u64(self.truncate_item_off(curr)?);
        }

        if curr == 0 {
            warn!("pmfs-truncate", "inode {} missing from the persistent list", ino);
            return Ok(());
        }

        self.region.barrier();

        let link = match prev {
            None => SB_TRUNCATE_HEAD_FIELD,
            Some(prev_ino) => self.truncate_item_off(prev_ino)?,
        };
        {
            let _w = self.region.memunlock();
            self.region.store_u64(link, next);
            self.region.flush(link, 8, false);
        }

        self.region.persist_mark();
        self.region.barrier();

        dbg_verbose!("pmfs-truncate", "inode {} delisted", ino);

        Ok(())
    }

    /// Kills the slot of an unlinked inode found on the truncate list at
    /// mount. The recovery scan skipped it (`links_count == 0` is not
    /// live), so its log pages and data blocks never reached the scan
    /// bitmap and are already free space; freeing them again would
    /// corrupt the allocator. Only the slot itself has to die.
    fn drop_unlinked_slot(&self, ino: u64) -> CanFail<PmfsError> {
        let pi_addr = self.get_inode_addr(ino)?;

        {
            let _w = self.region.memunlock();
            let pi = self.inode_mut(pi_addr);
            pi.root = 0;
            pi.height = 0;
            pi.i_size = 0;
            pi.log_head = 0;
            pi.log_tail = 0;
            pi.log_pages = 0;
            pi.i_dtime = (self.clock)();
            self.region
                .flush(pi_addr, crate::fs::pmfs::inode::PMFS_INODE_SIZE, true);
        }

        self.truncate_del(ino)?;
        self.headers.remove(ino);

        Ok(())
    }

    /// Finishes whatever the truncate list recorded at the time of a
    /// crash: deletion for link-less inodes, a truncate to the recorded
    /// size for the rest. The list is empty afterwards.
    pub(crate) fn recover_truncate_list(&self) -> CanFail<PmfsError> {
        let mut curr = self.region.load_u64(SB_TRUNCATE_HEAD_FIELD);

        while curr != 0 {
            let ino = curr;
            let item = self.truncate_item_off(ino)?;
            let next = self.region.load_u64(item);
            let truncate_size = self.region.load_u64(item + 8);

            {
                let mut listed = self.truncate_list.lock();
                listed.insert(ino);
            }

            let pi_addr = self.get_inode_addr(ino)?;
            let (links, live) = {
                let pi = self.inode(pi_addr);
                (pi.i_links_count, pi.i_dtime.0 == 0)
            };

            if links == 0 && live {
                info!("pmfs-recovery", "finishing deferred delete of inode {}", ino);
                self.drop_unlinked_slot(ino)?;
            } else if live {
                info!(
                    "pmfs-recovery",
                    "finishing deferred truncate of inode {} to {}", ino, truncate_size
                );
                self.apply_pending_truncate(ino, truncate_size)?;
                self.truncate_del(ino)?;
            } else {
                // Already freed; just delist.
                self.truncate_del(ino)?;
            }

            curr = next;
        }

        Ok(())
    }
}

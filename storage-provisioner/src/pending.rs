// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory bookkeeping of work awaiting a lifecycle transition.
//!
//! Owned exclusively by the reconciliation task; never persisted. Sets
//! deduplicate by construction, so re-marking pending work is a no-op,
//! and a worker restart rebuilds everything from the watchers' initial
//! events.

use std::collections::BTreeSet;

use storage_models::{
    FilesystemAttachmentId, FilesystemTag, VolumeAttachmentId, VolumeTag,
};

use crate::status::PendingCounts;

#[derive(Debug, Default)]
pub(crate) struct PendingWork {
    pub create_volumes: BTreeSet<VolumeTag>,
    pub destroy_volumes: BTreeSet<VolumeTag>,
    pub attach_volumes: BTreeSet<VolumeAttachmentId>,
    pub detach_volumes: BTreeSet<VolumeAttachmentId>,

    pub create_filesystems: BTreeSet<FilesystemTag>,
    pub destroy_filesystems: BTreeSet<FilesystemTag>,
    pub attach_filesystems: BTreeSet<FilesystemAttachmentId>,
    pub detach_filesystems: BTreeSet<FilesystemAttachmentId>,

    /// Attachment pairs for which an attach call has been issued this
    /// session. Provisioned pairs seen in watcher events are re-attached
    /// exactly once per worker session to repair operations lost across
    /// a restart; entries here suppress further re-enqueues.
    pub attached_this_session: BTreeSet<VolumeAttachmentId>,
    pub fs_attached_this_session: BTreeSet<FilesystemAttachmentId>,
}

impl PendingWork {
    /// Drops every trace of a volume that no longer exists.
    pub fn forget_volume(&mut self, tag: &VolumeTag) {
        self.create_volumes.remove(tag);
        self.destroy_volumes.remove(tag);
    }

    pub fn forget_filesystem(&mut self, tag: &FilesystemTag) {
        self.create_filesystems.remove(tag);
        self.destroy_filesystems.remove(tag);
    }

    pub fn forget_volume_attachment(&mut self, id: &VolumeAttachmentId) {
        self.attach_volumes.remove(id);
        self.detach_volumes.remove(id);
    }

    pub fn forget_filesystem_attachment(
        &mut self,
        id: &FilesystemAttachmentId,
    ) {
        self.attach_filesystems.remove(id);
        self.detach_filesystems.remove(id);
    }

    pub fn counts(&self) -> PendingCounts {
        PendingCounts {
            create_volumes: self.create_volumes.len(),
            attach_volumes: self.attach_volumes.len(),
            detach_volumes: self.detach_volumes.len(),
            destroy_volumes: self.destroy_volumes.len(),
            create_filesystems: self.create_filesystems.len(),
            attach_filesystems: self.attach_filesystems.len(),
            detach_filesystems: self.detach_filesystems.len(),
            destroy_filesystems: self.destroy_filesystems.len(),
        }
    }
}

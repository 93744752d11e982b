// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Filesystem entities as fetched from the authoritative store.

use serde::{Deserialize, Serialize};

use crate::tags::{FilesystemAttachmentId, FilesystemTag, VolumeTag};
use crate::Life;

/// Snapshot of a filesystem's authoritative record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filesystem {
    pub tag: FilesystemTag,
    pub life: Life,
    /// Set when the filesystem lives on the block device of an
    /// already-attached volume rather than independently-provisioned
    /// storage. Such filesystems are machine-scoped by construction.
    pub backing_volume: Option<VolumeTag>,
    pub info: Option<FilesystemInfo>,
}

impl Filesystem {
    pub fn is_provisioned(&self) -> bool {
        self.info.is_some()
    }

    pub fn is_volume_backed(&self) -> bool {
        self.backing_volume.is_some()
    }
}

/// Provider-assigned filesystem details, set exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemInfo {
    /// The provider's identifier for the filesystem. For volume-backed
    /// filesystems this is the block device name.
    pub filesystem_id: String,
    pub size_mib: u64,
}

/// Snapshot of a filesystem attachment's authoritative record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemAttachment {
    pub id: FilesystemAttachmentId,
    pub life: Life,
    pub info: Option<FilesystemAttachmentInfo>,
}

impl FilesystemAttachment {
    pub fn is_provisioned(&self) -> bool {
        self.info.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemAttachmentInfo {
    pub mount_point: String,
    pub read_only: bool,
}

/// A provisioned filesystem: the payload of `set_filesystem_info` and
/// of a provider's create result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedFilesystem {
    pub tag: FilesystemTag,
    pub info: FilesystemInfo,
}

/// A provisioned filesystem attachment: the payload of
/// `set_filesystem_attachment_info` and of a provider's attach result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedFilesystemAttachment {
    pub id: FilesystemAttachmentId,
    pub info: FilesystemAttachmentInfo,
}

/// Everything that must be gone before a dying filesystem may be
/// removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesystemDependents {
    pub attachments: Vec<FilesystemAttachmentId>,
}

impl FilesystemDependents {
    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }
}

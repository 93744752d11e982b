// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Volume entities as fetched from the authoritative store.

use serde::{Deserialize, Serialize};

use crate::params::ProviderType;
use crate::tags::{FilesystemTag, VolumeAttachmentId, VolumeTag};
use crate::Life;

/// Snapshot of a volume's authoritative record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub tag: VolumeTag,
    pub life: Life,
    /// Provider-assigned details. `None` until provisioning succeeds;
    /// immutable afterwards.
    pub info: Option<VolumeInfo>,
}

impl Volume {
    pub fn is_provisioned(&self) -> bool {
        self.info.is_some()
    }
}

/// Provider-assigned volume details, set exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    /// The provider's identifier for the volume (e.g. an EBS volume id).
    pub volume_id: String,
    /// Hardware identifier of the backing device, when the provider
    /// reports one (used to match block devices on the machine).
    pub hardware_id: Option<String>,
    pub size_mib: u64,
    /// Whether the volume outlives the machine it is attached to.
    pub persistent: bool,
    pub pool: ProviderType,
}

/// Snapshot of a volume attachment's authoritative record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub id: VolumeAttachmentId,
    pub life: Life,
    pub info: Option<VolumeAttachmentInfo>,
}

impl VolumeAttachment {
    pub fn is_provisioned(&self) -> bool {
        self.info.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachmentInfo {
    /// Device node under which the volume appears on the machine.
    pub device_name: String,
    pub read_only: bool,
}

/// A provisioned volume: the payload of `set_volume_info` and of a
/// provider's create result. Life is not carried; only the store owns
/// lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedVolume {
    pub tag: VolumeTag,
    pub info: VolumeInfo,
}

/// A provisioned volume attachment: the payload of
/// `set_volume_attachment_info` and of a provider's attach result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedVolumeAttachment {
    pub id: VolumeAttachmentId,
    pub info: VolumeAttachmentInfo,
}

/// Everything that must be gone before a dying volume may be removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeDependents {
    pub attachments: Vec<VolumeAttachmentId>,
    /// A filesystem backed by this volume's block device, if any.
    pub filesystem: Option<FilesystemTag>,
}

impl VolumeDependents {
    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty() && self.filesystem.is_none()
    }
}

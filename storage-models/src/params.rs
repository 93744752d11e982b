// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Desired-state parameter structs.
//!
//! The authoritative store records what each unprovisioned entity should
//! look like; the provisioner fetches these via the batched `*_params`
//! RPCs and hands them to the provider verbatim (plus the resource tags
//! from the environment configuration).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::tags::{
    FilesystemAttachmentId, FilesystemTag, VolumeAttachmentId, VolumeTag,
};
use crate::InstanceId;

/// Identifies a storage provider / pool type ("ebs", "loop", ...).
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ProviderType(String);

impl ProviderType {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters for creating one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeParams {
    pub tag: VolumeTag,
    pub size_mib: u64,
    pub provider: ProviderType,
    /// Pool-specific attributes (IOPS, volume type, ...), opaque to the
    /// provisioner.
    pub attributes: BTreeMap<String, String>,
    /// Key/value tags stamped onto the provisioned resource. Populated
    /// by the provisioner from the environment configuration.
    pub resource_tags: BTreeMap<String, String>,
    /// When the volume is to be attached in the same pass, the
    /// attachment parameters ride along so the provider can create and
    /// attach in one operation.
    pub attachment: Option<VolumeAttachmentParams>,
}

/// Parameters for attaching one volume to one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachmentParams {
    pub id: VolumeAttachmentId,
    /// Cloud instance id of the machine. The store does not track this;
    /// the provisioner fills it in from the machine accessor before any
    /// provider call, and gates the call on it existing.
    pub instance_id: Option<InstanceId>,
    /// Provider id of the volume; `None` while the volume itself is
    /// unprovisioned (create-and-attach passes).
    pub volume_id: Option<String>,
    pub provider: ProviderType,
    pub read_only: bool,
}

/// Parameters for creating one filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemParams {
    pub tag: FilesystemTag,
    pub size_mib: u64,
    pub provider: ProviderType,
    pub attributes: BTreeMap<String, String>,
    pub resource_tags: BTreeMap<String, String>,
    /// For volume-backed filesystems, the owning volume.
    pub backing_volume: Option<VolumeTag>,
}

/// Parameters for attaching one filesystem to one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemAttachmentParams {
    pub id: FilesystemAttachmentId,
    /// Filled in by the provisioner; see
    /// [`VolumeAttachmentParams::instance_id`].
    pub instance_id: Option<InstanceId>,
    /// Provider id of the filesystem; `None` while unprovisioned.
    pub filesystem_id: Option<String>,
    pub provider: ProviderType,
    /// Requested mount point; the provider derives one when absent.
    pub mount_point: Option<String>,
    pub read_only: bool,
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data model shared between the storage provisioner and its pluggable
//! backends: entity tags, lifecycle state, entity snapshots fetched from
//! the authoritative store, and the parameter structs handed to providers.

pub mod environ;
pub mod filesystem;
pub mod life;
pub mod machine;
pub mod params;
pub mod tags;
pub mod volume;

pub use environ::EnvironConfig;
pub use filesystem::Filesystem;
pub use filesystem::FilesystemAttachment;
pub use filesystem::FilesystemAttachmentInfo;
pub use filesystem::FilesystemDependents;
pub use filesystem::FilesystemInfo;
pub use filesystem::ProvisionedFilesystem;
pub use filesystem::ProvisionedFilesystemAttachment;
pub use life::Life;
pub use machine::BlockDevice;
pub use machine::InstanceId;
pub use params::FilesystemAttachmentParams;
pub use params::FilesystemParams;
pub use params::ProviderType;
pub use params::VolumeAttachmentParams;
pub use params::VolumeParams;
pub use tags::FilesystemAttachmentId;
pub use tags::FilesystemTag;
pub use tags::MachineTag;
pub use tags::TagParseError;
pub use tags::VolumeAttachmentId;
pub use tags::VolumeTag;
pub use volume::ProvisionedVolume;
pub use volume::ProvisionedVolumeAttachment;
pub use volume::Volume;
pub use volume::VolumeAttachment;
pub use volume::VolumeAttachmentInfo;
pub use volume::VolumeDependents;
pub use volume::VolumeInfo;

/// A per-item failure inside an otherwise-successful batched RPC.
///
/// Batched accessor writes report one of these per input rather than
/// failing the whole call; the affected item stays pending and is
/// retried on the next relevant event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ItemError {
    pub message: String,
}

impl ItemError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self { message: message.into() }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed facades over the authoritative store.
//!
//! These traits are the worker's only view of the outside world; the
//! RPC implementations live elsewhere and tests substitute mocks.
//!
//! Conventions shared by every method:
//!
//! - Watch streams deliver one initial event carrying the full current
//!   set on subscription, then one event per change. A closed stream is
//!   fatal to the worker.
//! - Batched reads return one `Option` per input tag, in input order;
//!   `None` means the entity no longer exists (the worker forgets it).
//! - Batched writes return one `Result<(), ItemError>` per input; an
//!   item failure leaves that item pending and is never fatal.
//! - `Err(AccessorError)` on any call is a transport failure and stops
//!   the worker.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use storage_models::{
    BlockDevice, EnvironConfig, Filesystem, FilesystemAttachment,
    FilesystemAttachmentId, FilesystemAttachmentParams, FilesystemDependents,
    FilesystemParams, FilesystemTag, InstanceId, ItemError, MachineTag,
    ProvisionedFilesystem, ProvisionedFilesystemAttachment, ProvisionedVolume,
    ProvisionedVolumeAttachment, Volume, VolumeAttachment, VolumeAttachmentId,
    VolumeAttachmentParams, VolumeDependents, VolumeParams, VolumeTag,
};

use crate::errors::AccessorError;

pub type ItemResults = Vec<Result<(), ItemError>>;

/// Read/watch/write facade for volumes and their attachments.
#[async_trait]
pub trait VolumeAccessor: Send + Sync {
    async fn watch_volumes(
        &self,
    ) -> Result<mpsc::Receiver<Vec<VolumeTag>>, AccessorError>;

    async fn watch_volume_attachments(
        &self,
    ) -> Result<mpsc::Receiver<Vec<VolumeAttachmentId>>, AccessorError>;

    async fn volumes(
        &self,
        tags: &[VolumeTag],
    ) -> Result<Vec<Option<Volume>>, AccessorError>;

    /// Desired-state parameters for unprovisioned volumes.
    async fn volume_params(
        &self,
        tags: &[VolumeTag],
    ) -> Result<Vec<Option<VolumeParams>>, AccessorError>;

    async fn volume_attachments(
        &self,
        ids: &[VolumeAttachmentId],
    ) -> Result<Vec<Option<VolumeAttachment>>, AccessorError>;

    async fn volume_attachment_params(
        &self,
        ids: &[VolumeAttachmentId],
    ) -> Result<Vec<Option<VolumeAttachmentParams>>, AccessorError>;

    async fn set_volume_info(
        &self,
        volumes: &[ProvisionedVolume],
    ) -> Result<ItemResults, AccessorError>;

    async fn set_volume_attachment_info(
        &self,
        attachments: &[ProvisionedVolumeAttachment],
    ) -> Result<ItemResults, AccessorError>;

    /// What must be gone before each volume may be removed.
    async fn volume_dependents(
        &self,
        tags: &[VolumeTag],
    ) -> Result<Vec<Option<VolumeDependents>>, AccessorError>;
}

/// Read/watch/write facade for filesystems and their attachments, plus
/// the machine-local block-device view backing volume-backed
/// filesystems.
#[async_trait]
pub trait FilesystemAccessor: Send + Sync {
    async fn watch_filesystems(
        &self,
    ) -> Result<mpsc::Receiver<Vec<FilesystemTag>>, AccessorError>;

    async fn watch_filesystem_attachments(
        &self,
    ) -> Result<mpsc::Receiver<Vec<FilesystemAttachmentId>>, AccessorError>;

    /// Fires whenever the machine's set of visible block devices
    /// changes. Machine-scoped workers only.
    async fn watch_block_devices(
        &self,
        machine: &MachineTag,
    ) -> Result<mpsc::Receiver<()>, AccessorError>;

    async fn filesystems(
        &self,
        tags: &[FilesystemTag],
    ) -> Result<Vec<Option<Filesystem>>, AccessorError>;

    async fn filesystem_params(
        &self,
        tags: &[FilesystemTag],
    ) -> Result<Vec<Option<FilesystemParams>>, AccessorError>;

    async fn filesystem_attachments(
        &self,
        ids: &[FilesystemAttachmentId],
    ) -> Result<Vec<Option<FilesystemAttachment>>, AccessorError>;

    async fn filesystem_attachment_params(
        &self,
        ids: &[FilesystemAttachmentId],
    ) -> Result<Vec<Option<FilesystemAttachmentParams>>, AccessorError>;

    async fn set_filesystem_info(
        &self,
        filesystems: &[ProvisionedFilesystem],
    ) -> Result<ItemResults, AccessorError>;

    async fn set_filesystem_attachment_info(
        &self,
        attachments: &[ProvisionedFilesystemAttachment],
    ) -> Result<ItemResults, AccessorError>;

    async fn filesystem_dependents(
        &self,
        tags: &[FilesystemTag],
    ) -> Result<Vec<Option<FilesystemDependents>>, AccessorError>;

    /// The block devices currently visible on `machine`, keyed by the
    /// volume each belongs to.
    async fn block_devices(
        &self,
        machine: &MachineTag,
    ) -> Result<BTreeMap<VolumeTag, BlockDevice>, AccessorError>;
}

/// Removal of backing-store records once entities are dead and their
/// dependents cleared. Pure bookkeeping; no provider interaction.
#[async_trait]
pub trait LifecycleManager: Send + Sync {
    async fn remove_volumes(
        &self,
        tags: &[VolumeTag],
    ) -> Result<ItemResults, AccessorError>;

    async fn remove_filesystems(
        &self,
        tags: &[FilesystemTag],
    ) -> Result<ItemResults, AccessorError>;

    async fn remove_volume_attachments(
        &self,
        ids: &[VolumeAttachmentId],
    ) -> Result<ItemResults, AccessorError>;

    async fn remove_filesystem_attachments(
        &self,
        ids: &[FilesystemAttachmentId],
    ) -> Result<ItemResults, AccessorError>;
}

/// Machine provisioning state.
#[async_trait]
pub trait MachineAccessor: Send + Sync {
    /// Fires when the machine's instance id is assigned (and on any
    /// later machine change; spurious events are harmless).
    async fn watch_machine(
        &self,
        machine: &MachineTag,
    ) -> Result<mpsc::Receiver<()>, AccessorError>;

    /// `None` while the machine is unprovisioned.
    async fn instance_id(
        &self,
        machine: &MachineTag,
    ) -> Result<Option<InstanceId>, AccessorError>;
}

/// Environment configuration.
#[async_trait]
pub trait EnvironAccessor: Send + Sync {
    async fn watch_config(
        &self,
    ) -> Result<mpsc::Receiver<()>, AccessorError>;

    async fn config(&self) -> Result<EnvironConfig, AccessorError>;
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The synthetic filesystem source for volume-backed pools.
//!
//! A volume-backed filesystem lives on the block device of an
//! already-attached volume, so "creating" one is a lookup against the
//! machine's observed block devices rather than a cloud call. The device
//! cache is fed by the block-device watcher; until the owning volume's
//! device appears, creation reports `NotReady` and the work stays
//! pending.
//!
//! Only machine-scoped workers use this source. The cache is shared with
//! the reconciliation task through a mutex, but only the task thread
//! ever touches it.

use async_trait::async_trait;
use camino::Utf8PathBuf;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use storage_models::{
    BlockDevice, FilesystemAttachmentParams, FilesystemInfo,
    FilesystemAttachmentInfo, FilesystemParams, MachineTag,
    ProvisionedFilesystem, ProvisionedFilesystemAttachment, VolumeTag,
};
use storage_provider::{FilesystemSource, ProviderError};

pub(crate) type BlockDeviceMap = BTreeMap<VolumeTag, BlockDevice>;

/// Serves filesystem create/attach for volume-backed pools from the
/// machine's local block devices.
#[derive(Clone)]
pub struct VolumeBackedFilesystemSource {
    machine: MachineTag,
    storage_dir: Utf8PathBuf,
    devices: Arc<Mutex<BlockDeviceMap>>,
}

impl VolumeBackedFilesystemSource {
    pub(crate) fn new(
        machine: MachineTag,
        storage_dir: Utf8PathBuf,
        devices: Arc<Mutex<BlockDeviceMap>>,
    ) -> Self {
        Self { machine, storage_dir, devices }
    }

    fn device_for(&self, volume: &VolumeTag) -> Option<BlockDevice> {
        self.devices.lock().unwrap().get(volume).cloned()
    }
}

#[async_trait]
impl FilesystemSource for VolumeBackedFilesystemSource {
    async fn create_filesystems(
        &self,
        params: &[FilesystemParams],
    ) -> Result<
        Vec<Result<ProvisionedFilesystem, ProviderError>>,
        ProviderError,
    > {
        let results = params
            .iter()
            .map(|p| {
                let volume = p.backing_volume.as_ref().ok_or_else(|| {
                    ProviderError::InvalidParams(format!(
                        "filesystem {} has no backing volume",
                        p.tag
                    ))
                })?;
                let device = self.device_for(volume).ok_or_else(|| {
                    ProviderError::NotReady(format!(
                        "block device for {volume} not yet visible on {}",
                        self.machine
                    ))
                })?;
                Ok(ProvisionedFilesystem {
                    tag: p.tag.clone(),
                    info: FilesystemInfo {
                        filesystem_id: device.device_name.clone(),
                        size_mib: device.size_mib,
                    },
                })
            })
            .collect();
        Ok(results)
    }

    async fn attach_filesystems(
        &self,
        params: &[FilesystemAttachmentParams],
    ) -> Result<
        Vec<Result<ProvisionedFilesystemAttachment, ProviderError>>,
        ProviderError,
    > {
        let results = params
            .iter()
            .map(|p| {
                // Attachment needs the filesystem to be provisioned
                // first; its id is the device name.
                let filesystem_id =
                    p.filesystem_id.as_ref().ok_or_else(|| {
                        ProviderError::NotReady(format!(
                            "filesystem {} not yet provisioned",
                            p.id.filesystem
                        ))
                    })?;
                let mount_point = match &p.mount_point {
                    Some(mp) => mp.clone(),
                    // Deterministic: same device, same mount point.
                    None => self.storage_dir.join(filesystem_id).into_string(),
                };
                Ok(ProvisionedFilesystemAttachment {
                    id: p.id.clone(),
                    info: FilesystemAttachmentInfo {
                        mount_point,
                        read_only: p.read_only,
                    },
                })
            })
            .collect();
        Ok(results)
    }

    async fn detach_filesystems(
        &self,
        params: &[FilesystemAttachmentParams],
    ) -> Result<Vec<Result<(), ProviderError>>, ProviderError> {
        // The unmount happens on the machine out of band; there is no
        // backend resource to release.
        Ok(params.iter().map(|_| Ok(())).collect())
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests of the reconciliation loop against an in-memory
//! store and a recording provider.

use assert_matches::assert_matches;
use async_trait::async_trait;
use slog::{o, Logger};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use storage_models::{
    BlockDevice, EnvironConfig, Filesystem, FilesystemAttachment,
    FilesystemAttachmentId, FilesystemAttachmentInfo,
    FilesystemAttachmentParams, FilesystemDependents, FilesystemInfo,
    FilesystemParams, FilesystemTag, InstanceId, ItemError, Life, MachineTag,
    ProviderType, ProvisionedFilesystem, ProvisionedFilesystemAttachment,
    ProvisionedVolume, ProvisionedVolumeAttachment, Volume, VolumeAttachment,
    VolumeAttachmentId, VolumeAttachmentInfo, VolumeAttachmentParams,
    VolumeDependents, VolumeInfo, VolumeParams, VolumeTag,
};
use storage_provider::{
    CreatedVolume, FilesystemSource, MapRegistry, Provider, ProviderError,
    VolumeSource,
};

use crate::accessors::{
    EnvironAccessor, FilesystemAccessor, ItemResults, LifecycleManager,
    MachineAccessor, VolumeAccessor,
};
use crate::config::{ProvisionerConfig, Scope};
use crate::errors::AccessorError;
use crate::handle::{spawn, ProvisionerHandle};
use crate::status::ProvisionerStatus;
use crate::ProvisionerError;

// ---------------------------------------------------------------------
// In-memory store

#[derive(Default)]
struct StoreInner {
    volumes: BTreeMap<VolumeTag, Volume>,
    volume_params: BTreeMap<VolumeTag, VolumeParams>,
    volume_attachments: BTreeMap<VolumeAttachmentId, VolumeAttachment>,
    volume_attachment_params:
        BTreeMap<VolumeAttachmentId, VolumeAttachmentParams>,
    filesystems: BTreeMap<FilesystemTag, Filesystem>,
    filesystem_params: BTreeMap<FilesystemTag, FilesystemParams>,
    filesystem_attachments:
        BTreeMap<FilesystemAttachmentId, FilesystemAttachment>,
    filesystem_attachment_params:
        BTreeMap<FilesystemAttachmentId, FilesystemAttachmentParams>,
    machines: BTreeMap<MachineTag, Option<InstanceId>>,
    machine_watchers: BTreeMap<MachineTag, mpsc::Sender<()>>,
    environ: Option<EnvironConfig>,
    block_devices: BTreeMap<MachineTag, BTreeMap<VolumeTag, BlockDevice>>,
    /// Chronological record of remove_* calls, for ordering assertions.
    removal_log: Vec<String>,
    /// When set, the next set_volume_info call fails every item.
    fail_next_set_volume_info: bool,
}

/// Receivers handed out once to the worker's watch_* calls; the
/// matching senders live on the [`Harness`].
#[derive(Default)]
struct PendingWatchers {
    volumes: Option<mpsc::Receiver<Vec<VolumeTag>>>,
    volume_attachments: Option<mpsc::Receiver<Vec<VolumeAttachmentId>>>,
    filesystems: Option<mpsc::Receiver<Vec<FilesystemTag>>>,
    filesystem_attachments:
        Option<mpsc::Receiver<Vec<FilesystemAttachmentId>>>,
    environ: Option<mpsc::Receiver<()>>,
    block_devices: Option<mpsc::Receiver<()>>,
}

#[derive(Default)]
struct MockStore {
    inner: Mutex<StoreInner>,
    watchers: Mutex<PendingWatchers>,
}

impl MockStore {
    fn put_volume(&self, volume: Volume) {
        self.inner.lock().unwrap().volumes.insert(volume.tag.clone(), volume);
    }

    fn put_volume_params(&self, params: VolumeParams) {
        self.inner
            .lock()
            .unwrap()
            .volume_params
            .insert(params.tag.clone(), params);
    }

    fn put_volume_attachment(&self, attachment: VolumeAttachment) {
        self.inner
            .lock()
            .unwrap()
            .volume_attachments
            .insert(attachment.id.clone(), attachment);
    }

    fn put_volume_attachment_params(&self, params: VolumeAttachmentParams) {
        self.inner
            .lock()
            .unwrap()
            .volume_attachment_params
            .insert(params.id.clone(), params);
    }

    fn put_filesystem(&self, filesystem: Filesystem) {
        self.inner
            .lock()
            .unwrap()
            .filesystems
            .insert(filesystem.tag.clone(), filesystem);
    }

    fn put_filesystem_params(&self, params: FilesystemParams) {
        self.inner
            .lock()
            .unwrap()
            .filesystem_params
            .insert(params.tag.clone(), params);
    }

    fn put_filesystem_attachment(&self, attachment: FilesystemAttachment) {
        self.inner
            .lock()
            .unwrap()
            .filesystem_attachments
            .insert(attachment.id.clone(), attachment);
    }

    fn put_filesystem_attachment_params(
        &self,
        params: FilesystemAttachmentParams,
    ) {
        self.inner
            .lock()
            .unwrap()
            .filesystem_attachment_params
            .insert(params.id.clone(), params);
    }

    fn set_environ(&self, config: EnvironConfig) {
        self.inner.lock().unwrap().environ = Some(config);
    }

    fn fail_next_set_volume_info(&self) {
        self.inner.lock().unwrap().fail_next_set_volume_info = true;
    }

    /// Marks a machine provisioned and pokes its watcher if the worker
    /// subscribed to one.
    async fn set_instance(&self, machine: &MachineTag, instance: InstanceId) {
        let tx = {
            let mut inner = self.inner.lock().unwrap();
            inner.machines.insert(machine.clone(), Some(instance));
            inner.machine_watchers.get(machine).cloned()
        };
        if let Some(tx) = tx {
            tx.send(()).await.unwrap();
        }
    }

    fn set_block_devices(
        &self,
        machine: &MachineTag,
        devices: BTreeMap<VolumeTag, BlockDevice>,
    ) {
        self.inner
            .lock()
            .unwrap()
            .block_devices
            .insert(machine.clone(), devices);
    }

    fn volume(&self, tag: &VolumeTag) -> Option<Volume> {
        self.inner.lock().unwrap().volumes.get(tag).cloned()
    }

    fn volume_attachment(
        &self,
        id: &VolumeAttachmentId,
    ) -> Option<VolumeAttachment> {
        self.inner.lock().unwrap().volume_attachments.get(id).cloned()
    }

    fn filesystem(&self, tag: &FilesystemTag) -> Option<Filesystem> {
        self.inner.lock().unwrap().filesystems.get(tag).cloned()
    }

    fn filesystem_attachment(
        &self,
        id: &FilesystemAttachmentId,
    ) -> Option<FilesystemAttachment> {
        self.inner.lock().unwrap().filesystem_attachments.get(id).cloned()
    }

    fn removal_log(&self) -> Vec<String> {
        self.inner.lock().unwrap().removal_log.clone()
    }
}

#[async_trait]
impl VolumeAccessor for MockStore {
    async fn watch_volumes(
        &self,
    ) -> Result<mpsc::Receiver<Vec<VolumeTag>>, AccessorError> {
        Ok(self.watchers.lock().unwrap().volumes.take().unwrap())
    }

    async fn watch_volume_attachments(
        &self,
    ) -> Result<mpsc::Receiver<Vec<VolumeAttachmentId>>, AccessorError> {
        Ok(self.watchers.lock().unwrap().volume_attachments.take().unwrap())
    }

    async fn volumes(
        &self,
        tags: &[VolumeTag],
    ) -> Result<Vec<Option<Volume>>, AccessorError> {
        let inner = self.inner.lock().unwrap();
        Ok(tags.iter().map(|t| inner.volumes.get(t).cloned()).collect())
    }

    async fn volume_params(
        &self,
        tags: &[VolumeTag],
    ) -> Result<Vec<Option<VolumeParams>>, AccessorError> {
        let inner = self.inner.lock().unwrap();
        Ok(tags.iter().map(|t| inner.volume_params.get(t).cloned()).collect())
    }

    async fn volume_attachments(
        &self,
        ids: &[VolumeAttachmentId],
    ) -> Result<Vec<Option<VolumeAttachment>>, AccessorError> {
        let inner = self.inner.lock().unwrap();
        Ok(ids
            .iter()
            .map(|id| inner.volume_attachments.get(id).cloned())
            .collect())
    }

    async fn volume_attachment_params(
        &self,
        ids: &[VolumeAttachmentId],
    ) -> Result<Vec<Option<VolumeAttachmentParams>>, AccessorError> {
        let inner = self.inner.lock().unwrap();
        Ok(ids
            .iter()
            .map(|id| inner.volume_attachment_params.get(id).cloned())
            .collect())
    }

    async fn set_volume_info(
        &self,
        volumes: &[ProvisionedVolume],
    ) -> Result<ItemResults, AccessorError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_next_set_volume_info {
            inner.fail_next_set_volume_info = false;
            return Ok(volumes
                .iter()
                .map(|_| Err(ItemError::new("store busy")))
                .collect());
        }
        Ok(volumes
            .iter()
            .map(|v| match inner.volumes.get_mut(&v.tag) {
                Some(known) => {
                    known.info = Some(v.info.clone());
                    Ok(())
                }
                None => Err(ItemError::new("volume not found")),
            })
            .collect())
    }

    async fn set_volume_attachment_info(
        &self,
        attachments: &[ProvisionedVolumeAttachment],
    ) -> Result<ItemResults, AccessorError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(attachments
            .iter()
            .map(|a| match inner.volume_attachments.get_mut(&a.id) {
                Some(known) => {
                    known.info = Some(a.info.clone());
                    Ok(())
                }
                None => Err(ItemError::new("attachment not found")),
            })
            .collect())
    }

    async fn volume_dependents(
        &self,
        tags: &[VolumeTag],
    ) -> Result<Vec<Option<VolumeDependents>>, AccessorError> {
        let inner = self.inner.lock().unwrap();
        Ok(tags
            .iter()
            .map(|tag| {
                if !inner.volumes.contains_key(tag) {
                    return None;
                }
                Some(VolumeDependents {
                    attachments: inner
                        .volume_attachments
                        .keys()
                        .filter(|id| &id.volume == tag)
                        .cloned()
                        .collect(),
                    filesystem: inner
                        .filesystems
                        .values()
                        .find(|f| f.backing_volume.as_ref() == Some(tag))
                        .map(|f| f.tag.clone()),
                })
            })
            .collect())
    }
}

#[async_trait]
impl FilesystemAccessor for MockStore {
    async fn watch_filesystems(
        &self,
    ) -> Result<mpsc::Receiver<Vec<FilesystemTag>>, AccessorError> {
        Ok(self.watchers.lock().unwrap().filesystems.take().unwrap())
    }

    async fn watch_filesystem_attachments(
        &self,
    ) -> Result<mpsc::Receiver<Vec<FilesystemAttachmentId>>, AccessorError>
    {
        Ok(self
            .watchers
            .lock()
            .unwrap()
            .filesystem_attachments
            .take()
            .unwrap())
    }

    async fn watch_block_devices(
        &self,
        _machine: &MachineTag,
    ) -> Result<mpsc::Receiver<()>, AccessorError> {
        Ok(self.watchers.lock().unwrap().block_devices.take().unwrap())
    }

    async fn filesystems(
        &self,
        tags: &[FilesystemTag],
    ) -> Result<Vec<Option<Filesystem>>, AccessorError> {
        let inner = self.inner.lock().unwrap();
        Ok(tags.iter().map(|t| inner.filesystems.get(t).cloned()).collect())
    }

    async fn filesystem_params(
        &self,
        tags: &[FilesystemTag],
    ) -> Result<Vec<Option<FilesystemParams>>, AccessorError> {
        let inner = self.inner.lock().unwrap();
        Ok(tags
            .iter()
            .map(|t| inner.filesystem_params.get(t).cloned())
            .collect())
    }

    async fn filesystem_attachments(
        &self,
        ids: &[FilesystemAttachmentId],
    ) -> Result<Vec<Option<FilesystemAttachment>>, AccessorError> {
        let inner = self.inner.lock().unwrap();
        Ok(ids
            .iter()
            .map(|id| inner.filesystem_attachments.get(id).cloned())
            .collect())
    }

    async fn filesystem_attachment_params(
        &self,
        ids: &[FilesystemAttachmentId],
    ) -> Result<Vec<Option<FilesystemAttachmentParams>>, AccessorError> {
        let inner = self.inner.lock().unwrap();
        Ok(ids
            .iter()
            .map(|id| inner.filesystem_attachment_params.get(id).cloned())
            .collect())
    }

    async fn set_filesystem_info(
        &self,
        filesystems: &[ProvisionedFilesystem],
    ) -> Result<ItemResults, AccessorError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(filesystems
            .iter()
            .map(|f| match inner.filesystems.get_mut(&f.tag) {
                Some(known) => {
                    known.info = Some(f.info.clone());
                    Ok(())
                }
                None => Err(ItemError::new("filesystem not found")),
            })
            .collect())
    }

    async fn set_filesystem_attachment_info(
        &self,
        attachments: &[ProvisionedFilesystemAttachment],
    ) -> Result<ItemResults, AccessorError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(attachments
            .iter()
            .map(|a| match inner.filesystem_attachments.get_mut(&a.id) {
                Some(known) => {
                    known.info = Some(a.info.clone());
                    Ok(())
                }
                None => Err(ItemError::new("attachment not found")),
            })
            .collect())
    }

    async fn filesystem_dependents(
        &self,
        tags: &[FilesystemTag],
    ) -> Result<Vec<Option<FilesystemDependents>>, AccessorError> {
        let inner = self.inner.lock().unwrap();
        Ok(tags
            .iter()
            .map(|tag| {
                if !inner.filesystems.contains_key(tag) {
                    return None;
                }
                Some(FilesystemDependents {
                    attachments: inner
                        .filesystem_attachments
                        .keys()
                        .filter(|id| &id.filesystem == tag)
                        .cloned()
                        .collect(),
                })
            })
            .collect())
    }

    async fn block_devices(
        &self,
        machine: &MachineTag,
    ) -> Result<BTreeMap<VolumeTag, BlockDevice>, AccessorError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.block_devices.get(machine).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl LifecycleManager for MockStore {
    async fn remove_volumes(
        &self,
        tags: &[VolumeTag],
    ) -> Result<ItemResults, AccessorError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(tags
            .iter()
            .map(|tag| {
                inner.volumes.remove(tag);
                inner.removal_log.push(format!("remove {tag}"));
                Ok(())
            })
            .collect())
    }

    async fn remove_filesystems(
        &self,
        tags: &[FilesystemTag],
    ) -> Result<ItemResults, AccessorError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(tags
            .iter()
            .map(|tag| {
                inner.filesystems.remove(tag);
                inner.removal_log.push(format!("remove {tag}"));
                Ok(())
            })
            .collect())
    }

    async fn remove_volume_attachments(
        &self,
        ids: &[VolumeAttachmentId],
    ) -> Result<ItemResults, AccessorError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(ids
            .iter()
            .map(|id| {
                inner.volume_attachments.remove(id);
                inner.removal_log.push(format!("remove {id}"));
                Ok(())
            })
            .collect())
    }

    async fn remove_filesystem_attachments(
        &self,
        ids: &[FilesystemAttachmentId],
    ) -> Result<ItemResults, AccessorError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(ids
            .iter()
            .map(|id| {
                inner.filesystem_attachments.remove(id);
                inner.removal_log.push(format!("remove {id}"));
                Ok(())
            })
            .collect())
    }
}

#[async_trait]
impl MachineAccessor for MockStore {
    async fn watch_machine(
        &self,
        machine: &MachineTag,
    ) -> Result<mpsc::Receiver<()>, AccessorError> {
        let (tx, rx) = mpsc::channel(16);
        // Initial event per the watcher contract.
        tx.send(()).await.unwrap();
        self.inner
            .lock()
            .unwrap()
            .machine_watchers
            .insert(machine.clone(), tx);
        Ok(rx)
    }

    async fn instance_id(
        &self,
        machine: &MachineTag,
    ) -> Result<Option<InstanceId>, AccessorError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.machines.get(machine).cloned().flatten())
    }
}

#[async_trait]
impl EnvironAccessor for MockStore {
    async fn watch_config(
        &self,
    ) -> Result<mpsc::Receiver<()>, AccessorError> {
        Ok(self.watchers.lock().unwrap().environ.take().unwrap())
    }

    async fn config(&self) -> Result<EnvironConfig, AccessorError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.environ.clone().expect("environ config not seeded"))
    }
}

// ---------------------------------------------------------------------
// Recording provider

#[derive(Default)]
struct ProviderCalls {
    create_volumes: Vec<Vec<VolumeParams>>,
    attach_volumes: Vec<Vec<VolumeAttachmentParams>>,
    detach_volumes: Vec<Vec<VolumeAttachmentParams>>,
    create_filesystems: Vec<Vec<FilesystemParams>>,
    attach_filesystems: Vec<Vec<FilesystemAttachmentParams>>,
    detach_filesystems: Vec<Vec<FilesystemAttachmentParams>>,
}

#[derive(Default)]
struct MockProvider {
    calls: Mutex<ProviderCalls>,
    /// When set, every whole create_volumes call fails with this error.
    fail_create_volumes: Mutex<Option<ProviderError>>,
    /// Per-item create errors inside otherwise-successful batches.
    create_item_errors: Mutex<BTreeMap<VolumeTag, ProviderError>>,
}

impl MockProvider {
    fn failing_creates(err: ProviderError) -> Self {
        Self {
            fail_create_volumes: Mutex::new(Some(err)),
            ..Self::default()
        }
    }

    fn set_create_item_error(&self, tag: VolumeTag, err: ProviderError) {
        self.create_item_errors.lock().unwrap().insert(tag, err);
    }

    fn clear_create_item_errors(&self) {
        self.create_item_errors.lock().unwrap().clear();
    }

    fn create_volume_calls(&self) -> Vec<Vec<VolumeParams>> {
        self.calls.lock().unwrap().create_volumes.clone()
    }

    fn attach_volume_calls(&self) -> Vec<Vec<VolumeAttachmentParams>> {
        self.calls.lock().unwrap().attach_volumes.clone()
    }

    fn detach_volume_calls(&self) -> Vec<Vec<VolumeAttachmentParams>> {
        self.calls.lock().unwrap().detach_volumes.clone()
    }
}

#[async_trait]
impl VolumeSource for MockProvider {
    async fn create_volumes(
        &self,
        params: &[VolumeParams],
    ) -> Result<Vec<Result<CreatedVolume, ProviderError>>, ProviderError>
    {
        self.calls.lock().unwrap().create_volumes.push(params.to_vec());
        if let Some(err) = self.fail_create_volumes.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(params
            .iter()
            .map(|p| {
                if let Some(err) =
                    self.create_item_errors.lock().unwrap().get(&p.tag)
                {
                    return Err(err.clone());
                }
                Ok(CreatedVolume {
                    volume: ProvisionedVolume {
                        tag: p.tag.clone(),
                        info: VolumeInfo {
                            volume_id: format!("id-{}", p.tag),
                            hardware_id: None,
                            size_mib: p.size_mib,
                            persistent: true,
                            pool: p.provider.clone(),
                        },
                    },
                    attachment: p.attachment.as_ref().map(|a| {
                        ProvisionedVolumeAttachment {
                            id: a.id.clone(),
                            info: VolumeAttachmentInfo {
                                device_name: "/dev/sda1".to_string(),
                                read_only: a.read_only,
                            },
                        }
                    }),
                })
            })
            .collect())
    }

    async fn attach_volumes(
        &self,
        params: &[VolumeAttachmentParams],
    ) -> Result<
        Vec<Result<ProvisionedVolumeAttachment, ProviderError>>,
        ProviderError,
    > {
        self.calls.lock().unwrap().attach_volumes.push(params.to_vec());
        Ok(params
            .iter()
            .map(|p| {
                Ok(ProvisionedVolumeAttachment {
                    id: p.id.clone(),
                    info: VolumeAttachmentInfo {
                        device_name: "/dev/sda1".to_string(),
                        read_only: p.read_only,
                    },
                })
            })
            .collect())
    }

    async fn detach_volumes(
        &self,
        params: &[VolumeAttachmentParams],
    ) -> Result<Vec<Result<(), ProviderError>>, ProviderError> {
        self.calls.lock().unwrap().detach_volumes.push(params.to_vec());
        Ok(params.iter().map(|_| Ok(())).collect())
    }
}

#[async_trait]
impl FilesystemSource for MockProvider {
    async fn create_filesystems(
        &self,
        params: &[FilesystemParams],
    ) -> Result<
        Vec<Result<ProvisionedFilesystem, ProviderError>>,
        ProviderError,
    > {
        self.calls.lock().unwrap().create_filesystems.push(params.to_vec());
        Ok(params
            .iter()
            .map(|p| {
                Ok(ProvisionedFilesystem {
                    tag: p.tag.clone(),
                    info: FilesystemInfo {
                        filesystem_id: format!("id-{}", p.tag),
                        size_mib: p.size_mib,
                    },
                })
            })
            .collect())
    }

    async fn attach_filesystems(
        &self,
        params: &[FilesystemAttachmentParams],
    ) -> Result<
        Vec<Result<ProvisionedFilesystemAttachment, ProviderError>>,
        ProviderError,
    > {
        self.calls.lock().unwrap().attach_filesystems.push(params.to_vec());
        Ok(params
            .iter()
            .map(|p| {
                Ok(ProvisionedFilesystemAttachment {
                    id: p.id.clone(),
                    info: FilesystemAttachmentInfo {
                        mount_point: p
                            .mount_point
                            .clone()
                            .unwrap_or_else(|| "/srv/data".to_string()),
                        read_only: p.read_only,
                    },
                })
            })
            .collect())
    }

    async fn detach_filesystems(
        &self,
        params: &[FilesystemAttachmentParams],
    ) -> Result<Vec<Result<(), ProviderError>>, ProviderError> {
        self.calls.lock().unwrap().detach_filesystems.push(params.to_vec());
        Ok(params.iter().map(|_| Ok(())).collect())
    }
}

// ---------------------------------------------------------------------
// Harness

struct Harness {
    store: Arc<MockStore>,
    handle: ProvisionerHandle,
    volumes_tx: mpsc::Sender<Vec<VolumeTag>>,
    volume_attachments_tx: mpsc::Sender<Vec<VolumeAttachmentId>>,
    filesystems_tx: mpsc::Sender<Vec<FilesystemTag>>,
    filesystem_attachments_tx: mpsc::Sender<Vec<FilesystemAttachmentId>>,
    environ_tx: mpsc::Sender<()>,
    block_devices_tx: mpsc::Sender<()>,
}

fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn registry_with(
    providers: Vec<(&str, Arc<MockProvider>, bool)>,
) -> MapRegistry {
    let mut registry = MapRegistry::new();
    for (pool, provider, dynamic) in providers {
        registry.register(
            ProviderType::new(pool),
            Provider {
                volume_source: provider.clone(),
                filesystem_source: provider,
                dynamic,
            },
        );
    }
    registry
}

fn start(scope: Scope, registry: MapRegistry) -> Harness {
    let (volumes_tx, volumes_rx) = mpsc::channel(16);
    let (volume_attachments_tx, volume_attachments_rx) = mpsc::channel(16);
    let (filesystems_tx, filesystems_rx) = mpsc::channel(16);
    let (filesystem_attachments_tx, filesystem_attachments_rx) =
        mpsc::channel(16);
    let (environ_tx, environ_rx) = mpsc::channel(16);
    let (block_devices_tx, block_devices_rx) = mpsc::channel(16);

    let store = Arc::new(MockStore::default());
    *store.watchers.lock().unwrap() = PendingWatchers {
        volumes: Some(volumes_rx),
        volume_attachments: Some(volume_attachments_rx),
        filesystems: Some(filesystems_rx),
        filesystem_attachments: Some(filesystem_attachments_rx),
        environ: Some(environ_rx),
        block_devices: Some(block_devices_rx),
    };

    let handle = spawn(
        ProvisionerConfig {
            scope,
            storage_dir: "/var/lib/storage".into(),
        },
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(registry),
        &test_logger(),
    );

    Harness {
        store,
        handle,
        volumes_tx,
        volume_attachments_tx,
        filesystems_tx,
        filesystem_attachments_tx,
        environ_tx,
        block_devices_tx,
    }
}

impl Harness {
    /// Seeds the environ config and delivers the initial config event.
    async fn provide_environ(&self) {
        self.store.set_environ(EnvironConfig {
            uuid: "deadbeef".to_string(),
            resource_tags: BTreeMap::from([(
                "env-uuid".to_string(),
                "deadbeef".to_string(),
            )]),
        });
        self.environ_tx.send(()).await.unwrap();
    }

    fn idle_with_no_pending(&self) -> bool {
        matches!(
            self.handle.status(),
            ProvisionerStatus::Idle { pending, .. } if pending.total() == 0
        )
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Lets in-flight events drain so "nothing happened" assertions mean
/// something.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// ---------------------------------------------------------------------
// Fixtures

fn machine() -> MachineTag {
    MachineTag::new("0")
}

fn vtag() -> VolumeTag {
    VolumeTag::new("0-0")
}

fn vatt_id() -> VolumeAttachmentId {
    VolumeAttachmentId { machine: machine(), volume: vtag() }
}

fn ftag() -> FilesystemTag {
    FilesystemTag::new("0-0")
}

fn fatt_id() -> FilesystemAttachmentId {
    FilesystemAttachmentId { machine: machine(), filesystem: ftag() }
}

fn vinfo(volume_id: &str) -> VolumeInfo {
    VolumeInfo {
        volume_id: volume_id.to_string(),
        hardware_id: None,
        size_mib: 1024,
        persistent: true,
        pool: ProviderType::new("ebs"),
    }
}

fn alive_unprovisioned_volume() -> Volume {
    Volume { tag: vtag(), life: Life::Alive, info: None }
}

fn volume_params(tag: VolumeTag, pool: &str) -> VolumeParams {
    VolumeParams {
        tag,
        size_mib: 1024,
        provider: ProviderType::new(pool),
        attributes: BTreeMap::new(),
        resource_tags: BTreeMap::new(),
        attachment: None,
    }
}

fn attachment_params(pool: &str) -> VolumeAttachmentParams {
    VolumeAttachmentParams {
        id: vatt_id(),
        instance_id: None,
        volume_id: None,
        provider: ProviderType::new(pool),
        read_only: false,
    }
}

// ---------------------------------------------------------------------
// Tests

#[tokio::test]
async fn provisioning_waits_for_environ_config() {
    let provider = Arc::new(MockProvider::default());
    let h = start(
        Scope::Machine { machine: machine() },
        registry_with(vec![("ebs", provider.clone(), true)]),
    );
    h.store.put_volume(alive_unprovisioned_volume());
    h.store.put_volume_params(volume_params(vtag(), "ebs"));

    h.volumes_tx.send(vec![vtag()]).await.unwrap();
    settle().await;
    assert!(provider.create_volume_calls().is_empty());
    assert_eq!(h.handle.status(), ProvisionerStatus::WaitingForEnvironConfig);

    h.provide_environ().await;
    wait_until("volume provisioned", || {
        h.store.volume(&vtag()).is_some_and(|v| v.is_provisioned())
    })
    .await;

    // Resource tags from the environ config are stamped onto the
    // create parameters.
    let calls = provider.create_volume_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0][0].resource_tags.get("env-uuid").map(String::as_str),
        Some("deadbeef"),
    );
}

#[tokio::test]
async fn pending_attachment_rides_along_with_creation() {
    let provider = Arc::new(MockProvider::default());
    let h = start(
        Scope::Machine { machine: machine() },
        registry_with(vec![("ebs", provider.clone(), true)]),
    );
    h.store.put_volume(alive_unprovisioned_volume());
    h.store.put_volume_params(volume_params(vtag(), "ebs"));
    h.store.put_volume_attachment(VolumeAttachment {
        id: vatt_id(),
        life: Life::Alive,
        info: None,
    });
    h.store.put_volume_attachment_params(attachment_params("ebs"));
    h.store.set_instance(&machine(), InstanceId::new("i-1234")).await;
    h.provide_environ().await;

    // The attachment becomes pending first (its volume is not yet
    // provisioned, so it cannot be attached on its own), then the
    // volume event triggers a combined create-and-attach.
    h.volume_attachments_tx.send(vec![vatt_id()]).await.unwrap();
    wait_until("attachment pending", || {
        matches!(
            h.handle.status(),
            ProvisionerStatus::Idle { pending, .. }
                if pending.attach_volumes == 1
        )
    })
    .await;
    settle().await;

    h.volumes_tx.send(vec![vtag()]).await.unwrap();
    wait_until("attachment provisioned", || {
        h.store.volume_attachment(&vatt_id()).is_some_and(|a| {
            a.is_provisioned()
        })
    })
    .await;

    let creates = provider.create_volume_calls();
    assert_eq!(creates.len(), 1);
    let embedded = creates[0][0].attachment.as_ref().unwrap();
    assert_eq!(embedded.instance_id, Some(InstanceId::new("i-1234")));
    // The attachment was realized by the create call; no separate
    // attach was needed.
    assert!(provider.attach_volume_calls().is_empty());
}

#[tokio::test]
async fn attachment_waits_for_machine_provisioning() {
    let provider = Arc::new(MockProvider::default());
    let h = start(
        Scope::Machine { machine: machine() },
        registry_with(vec![("ebs", provider.clone(), true)]),
    );
    h.store.put_volume(Volume {
        tag: vtag(),
        life: Life::Alive,
        info: Some(vinfo("vol-99")),
    });
    h.store.put_volume_attachment(VolumeAttachment {
        id: vatt_id(),
        life: Life::Alive,
        info: None,
    });
    h.store.put_volume_attachment_params(attachment_params("ebs"));
    h.provide_environ().await;

    h.volume_attachments_tx.send(vec![vatt_id()]).await.unwrap();
    settle().await;
    assert!(provider.attach_volume_calls().is_empty());

    h.store.set_instance(&machine(), InstanceId::new("i-1234")).await;
    wait_until("attachment provisioned", || {
        h.store.volume_attachment(&vatt_id()).is_some_and(|a| {
            a.is_provisioned()
        })
    })
    .await;

    let attaches = provider.attach_volume_calls();
    assert_eq!(attaches.len(), 1);
    assert_eq!(attaches[0][0].instance_id, Some(InstanceId::new("i-1234")));
    // Filled in from the provisioned volume's record.
    assert_eq!(attaches[0][0].volume_id.as_deref(), Some("vol-99"));
}

#[tokio::test]
async fn volume_backed_filesystem_waits_for_its_block_device() {
    let h = start(Scope::Machine { machine: machine() }, MapRegistry::new());
    h.store.put_filesystem(Filesystem {
        tag: ftag(),
        life: Life::Alive,
        backing_volume: Some(vtag()),
        info: None,
    });
    h.store.put_filesystem_params(FilesystemParams {
        tag: ftag(),
        size_mib: 0,
        provider: ProviderType::new("volume-backed"),
        attributes: BTreeMap::new(),
        resource_tags: BTreeMap::new(),
        backing_volume: Some(vtag()),
    });
    h.store.put_filesystem_attachment(FilesystemAttachment {
        id: fatt_id(),
        life: Life::Alive,
        info: None,
    });
    h.store.put_filesystem_attachment_params(FilesystemAttachmentParams {
        id: fatt_id(),
        instance_id: None,
        filesystem_id: None,
        provider: ProviderType::new("volume-backed"),
        mount_point: None,
        read_only: false,
    });
    h.provide_environ().await;

    h.filesystems_tx.send(vec![ftag()]).await.unwrap();
    h.filesystem_attachments_tx.send(vec![fatt_id()]).await.unwrap();
    settle().await;
    assert!(h
        .store
        .filesystem(&ftag())
        .is_some_and(|f| !f.is_provisioned()));

    // The backing volume's device appears on the machine.
    h.store.set_block_devices(
        &machine(),
        BTreeMap::from([(
            vtag(),
            BlockDevice { device_name: "xvdf1".to_string(), size_mib: 123 },
        )]),
    );
    h.block_devices_tx.send(()).await.unwrap();

    wait_until("filesystem attached", || {
        h.store.filesystem_attachment(&fatt_id()).is_some_and(|a| {
            a.is_provisioned()
        })
    })
    .await;

    let filesystem = h.store.filesystem(&ftag()).unwrap();
    assert_eq!(
        filesystem.info,
        Some(FilesystemInfo {
            filesystem_id: "xvdf1".to_string(),
            size_mib: 123,
        }),
    );
    let attachment = h.store.filesystem_attachment(&fatt_id()).unwrap();
    assert_eq!(
        attachment.info.unwrap().mount_point,
        "/var/lib/storage/xvdf1",
    );
}

#[tokio::test]
async fn dying_attachment_is_detached_before_volume_removal() {
    let provider = Arc::new(MockProvider::default());
    let h = start(
        Scope::Machine { machine: machine() },
        registry_with(vec![("ebs", provider.clone(), true)]),
    );
    h.store.put_volume(Volume {
        tag: vtag(),
        life: Life::Dying,
        info: Some(vinfo("vol-99")),
    });
    h.store.put_volume_attachment(VolumeAttachment {
        id: vatt_id(),
        life: Life::Dying,
        info: Some(VolumeAttachmentInfo {
            device_name: "xvdf".to_string(),
            read_only: false,
        }),
    });
    h.store.put_volume_attachment_params(attachment_params("ebs"));
    h.store.set_instance(&machine(), InstanceId::new("i-1234")).await;
    h.provide_environ().await;

    h.volumes_tx.send(vec![vtag()]).await.unwrap();
    h.volume_attachments_tx.send(vec![vatt_id()]).await.unwrap();

    wait_until("volume removed", || h.store.volume(&vtag()).is_none()).await;

    // Detach went through the provider with the instance id filled in.
    let detaches = provider.detach_volume_calls();
    assert_eq!(detaches.len(), 1);
    assert_eq!(detaches[0][0].instance_id, Some(InstanceId::new("i-1234")));
    // The attachment record left the store strictly before the volume.
    assert_eq!(
        h.store.removal_log(),
        vec![format!("remove {}", vatt_id()), format!("remove {}", vtag())],
    );
}

#[tokio::test]
async fn volume_removal_waits_for_dependents() {
    let provider = Arc::new(MockProvider::default());
    let h = start(
        Scope::Machine { machine: machine() },
        registry_with(vec![("ebs", provider.clone(), true)]),
    );
    // The volume is dying but its attachment is still alive: the
    // attachment has not been marked for detachment, so the volume must
    // stay put.
    h.store.put_volume(Volume {
        tag: vtag(),
        life: Life::Dying,
        info: Some(vinfo("vol-99")),
    });
    h.store.put_volume_attachment(VolumeAttachment {
        id: vatt_id(),
        life: Life::Alive,
        info: Some(VolumeAttachmentInfo {
            device_name: "xvdf".to_string(),
            read_only: false,
        }),
    });
    h.store.put_volume_attachment_params(attachment_params("ebs"));
    h.store.set_instance(&machine(), InstanceId::new("i-1234")).await;
    h.provide_environ().await;

    h.volumes_tx.send(vec![vtag()]).await.unwrap();
    settle().await;
    assert!(h.store.volume(&vtag()).is_some());
    assert!(h.store.removal_log().is_empty());

    // The attachment starts dying; the next pass detaches it and the
    // volume becomes removable.
    h.store.put_volume_attachment(VolumeAttachment {
        id: vatt_id(),
        life: Life::Dying,
        info: Some(VolumeAttachmentInfo {
            device_name: "xvdf".to_string(),
            read_only: false,
        }),
    });
    h.volume_attachments_tx.send(vec![vatt_id()]).await.unwrap();
    wait_until("volume removed", || h.store.volume(&vtag()).is_none()).await;
}

#[tokio::test]
async fn static_providers_create_but_never_attach() {
    let provider = Arc::new(MockProvider::default());
    let h = start(
        Scope::Machine { machine: machine() },
        registry_with(vec![("maas", provider.clone(), false)]),
    );
    h.store.put_volume(alive_unprovisioned_volume());
    h.store.put_volume_params(volume_params(vtag(), "maas"));
    h.store.put_volume_attachment(VolumeAttachment {
        id: vatt_id(),
        life: Life::Alive,
        info: None,
    });
    h.store.put_volume_attachment_params(attachment_params("maas"));
    h.store.set_instance(&machine(), InstanceId::new("i-1234")).await;
    h.provide_environ().await;

    h.volume_attachments_tx.send(vec![vatt_id()]).await.unwrap();
    h.volumes_tx.send(vec![vtag()]).await.unwrap();
    wait_until("pending work drained", || h.idle_with_no_pending()).await;

    // Creation is allowed through a static pool, but the attach work
    // was dropped: it happens out of band.
    assert!(h.store.volume(&vtag()).is_some_and(|v| v.is_provisioned()));
    let creates = provider.create_volume_calls();
    assert!(creates.iter().flatten().all(|p| p.attachment.is_none()));
    assert!(provider.attach_volume_calls().is_empty());
}

#[tokio::test]
async fn volume_removal_waits_for_dependent_filesystem() {
    let provider = Arc::new(MockProvider::default());
    let h = start(
        Scope::Machine { machine: machine() },
        registry_with(vec![("ebs", provider.clone(), true)]),
    );
    let volume = VolumeTag::new("102");
    let filesystem = FilesystemTag::new("101");
    h.store.put_volume(Volume {
        tag: volume.clone(),
        life: Life::Dying,
        info: Some(vinfo("vol-102")),
    });
    h.store.put_filesystem(Filesystem {
        tag: filesystem.clone(),
        life: Life::Dying,
        backing_volume: Some(volume.clone()),
        info: None,
    });
    h.provide_environ().await;

    // The volume is dying but its derived filesystem still exists.
    h.volumes_tx.send(vec![volume.clone()]).await.unwrap();
    settle().await;
    assert!(h.store.volume(&volume).is_some());

    // Once the filesystem's removal is requested it goes first, and
    // the volume follows in the same pass.
    h.filesystems_tx.send(vec![filesystem.clone()]).await.unwrap();
    wait_until("volume removed", || h.store.volume(&volume).is_none()).await;
    assert_eq!(
        h.store.removal_log(),
        vec![format!("remove {filesystem}"), format!("remove {volume}")],
    );
}

#[tokio::test]
async fn provider_failure_does_not_block_other_pools() {
    let failing = Arc::new(MockProvider::failing_creates(
        ProviderError::Throttled("synthetic outage".to_string()),
    ));
    let healthy = Arc::new(MockProvider::default());
    let h = start(
        Scope::Machine { machine: machine() },
        registry_with(vec![
            ("ebs", failing.clone(), true),
            ("gp", healthy.clone(), true),
        ]),
    );
    let stuck = VolumeTag::new("0-0");
    let fine = VolumeTag::new("0-1");
    h.store.put_volume(Volume {
        tag: stuck.clone(),
        life: Life::Alive,
        info: None,
    });
    h.store.put_volume(Volume {
        tag: fine.clone(),
        life: Life::Alive,
        info: None,
    });
    h.store.put_volume_params(volume_params(stuck.clone(), "ebs"));
    h.store.put_volume_params(volume_params(fine.clone(), "gp"));
    h.provide_environ().await;

    h.volumes_tx.send(vec![stuck.clone(), fine.clone()]).await.unwrap();
    wait_until("healthy pool's volume provisioned", || {
        h.store.volume(&fine).is_some_and(|v| v.is_provisioned())
    })
    .await;

    // The throttled pool was tried, failed, and its volume stays
    // pending without stopping the worker.
    assert!(!failing.create_volume_calls().is_empty());
    assert!(h.store.volume(&stuck).is_some_and(|v| !v.is_provisioned()));
    wait_until("worker idle with one stuck volume", || {
        matches!(
            h.handle.status(),
            ProvisionerStatus::Idle { pending, .. }
                if pending.create_volumes == 1
        )
    })
    .await;
}

#[tokio::test]
async fn failed_info_write_is_retried_with_identical_parameters() {
    let provider = Arc::new(MockProvider::default());
    let h = start(
        Scope::Machine { machine: machine() },
        registry_with(vec![("ebs", provider.clone(), true)]),
    );
    h.store.put_volume(alive_unprovisioned_volume());
    h.store.put_volume_params(volume_params(vtag(), "ebs"));
    h.store.fail_next_set_volume_info();
    h.provide_environ().await;

    // The create succeeds but recording its info does not; the volume
    // must stay pending rather than fail the batch.
    h.volumes_tx.send(vec![vtag()]).await.unwrap();
    wait_until("volume stuck pending", || {
        matches!(
            h.handle.status(),
            ProvisionerStatus::Idle { pending, .. }
                if pending.create_volumes == 1
        )
    })
    .await;
    assert!(h.store.volume(&vtag()).is_some_and(|v| !v.is_provisioned()));
    assert_eq!(provider.create_volume_calls().len(), 1);

    // The next relevant event retries the create with the same
    // parameters, and the provider returns the same volume rather than
    // a duplicate.
    h.volumes_tx.send(vec![vtag()]).await.unwrap();
    wait_until("volume provisioned", || {
        h.store.volume(&vtag()).is_some_and(|v| v.is_provisioned())
    })
    .await;
    let creates = provider.create_volume_calls();
    assert_eq!(creates.len(), 2);
    assert_eq!(creates[0], creates[1]);
    assert_eq!(
        h.store.volume(&vtag()).unwrap().info.unwrap().volume_id,
        format!("id-{}", vtag()),
    );
}

#[tokio::test]
async fn per_item_provider_error_only_blocks_that_volume() {
    let provider = Arc::new(MockProvider::default());
    let h = start(
        Scope::Machine { machine: machine() },
        registry_with(vec![("ebs", provider.clone(), true)]),
    );
    let stuck = VolumeTag::new("0-0");
    let fine = VolumeTag::new("0-1");
    provider.set_create_item_error(
        stuck.clone(),
        ProviderError::QuotaExceeded("pool full".to_string()),
    );
    h.store.put_volume(Volume {
        tag: stuck.clone(),
        life: Life::Alive,
        info: None,
    });
    h.store.put_volume(Volume {
        tag: fine.clone(),
        life: Life::Alive,
        info: None,
    });
    h.store.put_volume_params(volume_params(stuck.clone(), "ebs"));
    h.store.put_volume_params(volume_params(fine.clone(), "ebs"));
    h.provide_environ().await;

    // One batch, one bad item: the rest of the batch lands.
    h.volumes_tx.send(vec![stuck.clone(), fine.clone()]).await.unwrap();
    wait_until("healthy volume provisioned", || {
        h.store.volume(&fine).is_some_and(|v| v.is_provisioned())
    })
    .await;
    assert_eq!(provider.create_volume_calls().len(), 1);
    assert_eq!(provider.create_volume_calls()[0].len(), 2);
    assert!(h.store.volume(&stuck).is_some_and(|v| !v.is_provisioned()));
    wait_until("worker idle with one stuck volume", || {
        matches!(
            h.handle.status(),
            ProvisionerStatus::Idle { pending, .. }
                if pending.create_volumes == 1
        )
    })
    .await;

    // Quota freed: the next event converges the stuck volume.
    provider.clear_create_item_errors();
    h.volumes_tx.send(vec![stuck.clone()]).await.unwrap();
    wait_until("stuck volume provisioned", || {
        h.store.volume(&stuck).is_some_and(|v| v.is_provisioned())
    })
    .await;
}

#[tokio::test]
async fn provisioned_attachments_are_reattached_once_per_session() {
    let provider = Arc::new(MockProvider::default());
    let h = start(
        Scope::Machine { machine: machine() },
        registry_with(vec![("ebs", provider.clone(), true)]),
    );
    h.store.put_volume(Volume {
        tag: vtag(),
        life: Life::Alive,
        info: Some(vinfo("vol-99")),
    });
    h.store.put_volume_attachment(VolumeAttachment {
        id: vatt_id(),
        life: Life::Alive,
        info: Some(VolumeAttachmentInfo {
            device_name: "xvdf".to_string(),
            read_only: false,
        }),
    });
    h.store.put_volume_attachment_params(attachment_params("ebs"));
    h.store.set_instance(&machine(), InstanceId::new("i-1234")).await;
    h.provide_environ().await;

    // First sighting in this session: one repair attach goes out.
    h.volume_attachments_tx.send(vec![vatt_id()]).await.unwrap();
    wait_until("repair attach issued", || {
        provider.attach_volume_calls().len() == 1
    })
    .await;

    // Further events for the same provisioned pair are no-ops.
    h.volume_attachments_tx.send(vec![vatt_id()]).await.unwrap();
    h.volume_attachments_tx.send(vec![vatt_id()]).await.unwrap();
    settle().await;
    assert_eq!(provider.attach_volume_calls().len(), 1);
}

#[tokio::test]
async fn unknown_entities_are_forgotten() {
    let provider = Arc::new(MockProvider::default());
    let h = start(
        Scope::Machine { machine: machine() },
        registry_with(vec![("ebs", provider.clone(), true)]),
    );
    h.provide_environ().await;

    // Events for entities the store no longer has leave nothing
    // pending.
    h.volumes_tx.send(vec![vtag()]).await.unwrap();
    h.volume_attachments_tx.send(vec![vatt_id()]).await.unwrap();
    h.filesystems_tx.send(vec![ftag()]).await.unwrap();
    wait_until("pending work drained", || h.idle_with_no_pending()).await;
    assert!(provider.create_volume_calls().is_empty());
}

#[tokio::test]
async fn environ_worker_leaves_volume_backed_filesystems_alone() {
    let h = start(Scope::Environ, MapRegistry::new());
    h.store.put_filesystem(Filesystem {
        tag: ftag(),
        life: Life::Alive,
        backing_volume: Some(vtag()),
        info: None,
    });
    h.store.put_filesystem_params(FilesystemParams {
        tag: ftag(),
        size_mib: 0,
        provider: ProviderType::new("volume-backed"),
        attributes: BTreeMap::new(),
        resource_tags: BTreeMap::new(),
        backing_volume: Some(vtag()),
    });
    h.provide_environ().await;

    // Only a machine-scoped worker can see the backing volume's block
    // device; the environ worker keeps the work pending and untouched.
    h.filesystems_tx.send(vec![ftag()]).await.unwrap();
    wait_until("filesystem pending", || {
        matches!(
            h.handle.status(),
            ProvisionerStatus::Idle { pending, .. }
                if pending.create_filesystems == 1
        )
    })
    .await;
    assert!(h
        .store
        .filesystem(&ftag())
        .is_some_and(|f| !f.is_provisioned()));
}

#[tokio::test]
async fn closed_watch_stream_stops_the_worker() {
    let h = start(Scope::Machine { machine: machine() }, MapRegistry::new());
    drop(h.volumes_tx);
    // Let the worker observe the closed stream before asking it to
    // stop.
    settle().await;

    let result = h.handle.shutdown().await;
    assert_matches!(
        result,
        Err(ProvisionerError::WatcherClosed { watcher: "volumes" })
    );
}

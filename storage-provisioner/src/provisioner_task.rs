// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The reconciliation task.
//!
//! A single tokio task consumes every watch stream, so no two handlers
//! ever run concurrently and the pending sets need no locking. Each
//! event updates the in-memory caches and pending sets; the task then
//! runs one full pass over all pending work, in the order creates ->
//! attaches -> detaches -> removals, since work completed early in a
//! pass can satisfy gates checked later in the same pass.

mod filesystems;
#[cfg(test)]
mod tests;
mod volumes;

use chrono::Utc;
use slog::{debug, info, o, Logger};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};

use storage_models::{
    EnvironConfig, Filesystem, FilesystemAttachment, FilesystemAttachmentId,
    FilesystemTag, InstanceId, MachineTag, Volume, VolumeAttachment,
    VolumeAttachmentId, VolumeTag,
};
use storage_provider::ProviderRegistry;

use crate::accessors::{
    EnvironAccessor, FilesystemAccessor, LifecycleManager, MachineAccessor,
    VolumeAccessor,
};
use crate::config::ProvisionerConfig;
use crate::errors::ProvisionerError;
use crate::pending::PendingWork;
use crate::status::ProvisionerStatus;
use crate::volume_backed::{BlockDeviceMap, VolumeBackedFilesystemSource};

/// Capacity of the internal channel multiplexing all per-machine
/// watchers into the select loop.
const MACHINE_EVENT_BUFFER: usize = 16;

#[derive(Debug)]
enum MachineEvent {
    Changed(MachineTag),
    Closed(MachineTag),
}

pub(crate) struct ProvisionerTask {
    config: ProvisionerConfig,
    volume_api: Arc<dyn VolumeAccessor>,
    filesystem_api: Arc<dyn FilesystemAccessor>,
    lifecycle: Arc<dyn LifecycleManager>,
    machine_api: Arc<dyn MachineAccessor>,
    environ_api: Arc<dyn EnvironAccessor>,
    registry: Arc<dyn ProviderRegistry>,
    status_tx: watch::Sender<ProvisionerStatus>,
    log: Logger,

    // Everything below is owned exclusively by the task. Restarts
    // rebuild it from the watchers' initial events.
    environ: Option<EnvironConfig>,
    machines: BTreeMap<MachineTag, Option<InstanceId>>,
    volumes: BTreeMap<VolumeTag, Volume>,
    filesystems: BTreeMap<FilesystemTag, Filesystem>,
    volume_attachments: BTreeMap<VolumeAttachmentId, VolumeAttachment>,
    filesystem_attachments:
        BTreeMap<FilesystemAttachmentId, FilesystemAttachment>,
    pending: PendingWork,

    // Shared with the volume-backed filesystem source; only this task
    // ever touches it.
    block_devices: Arc<Mutex<BlockDeviceMap>>,
    volume_backed_source: Option<VolumeBackedFilesystemSource>,

    machine_events_tx: mpsc::Sender<MachineEvent>,
    machine_events_rx: Option<mpsc::Receiver<MachineEvent>>,
}

impl ProvisionerTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ProvisionerConfig,
        volume_api: Arc<dyn VolumeAccessor>,
        filesystem_api: Arc<dyn FilesystemAccessor>,
        lifecycle: Arc<dyn LifecycleManager>,
        machine_api: Arc<dyn MachineAccessor>,
        environ_api: Arc<dyn EnvironAccessor>,
        registry: Arc<dyn ProviderRegistry>,
        status_tx: watch::Sender<ProvisionerStatus>,
        base_log: &Logger,
    ) -> Self {
        let log = base_log.new(o!(
            "component" => "storage-provisioner",
            "scope" => match config.scope.machine() {
                Some(machine) => machine.to_string(),
                None => "environ".to_string(),
            },
        ));
        let block_devices = Arc::new(Mutex::new(BlockDeviceMap::new()));
        let volume_backed_source = config.scope.machine().map(|machine| {
            VolumeBackedFilesystemSource::new(
                machine.clone(),
                config.storage_dir.clone(),
                Arc::clone(&block_devices),
            )
        });
        let (machine_events_tx, machine_events_rx) =
            mpsc::channel(MACHINE_EVENT_BUFFER);
        Self {
            config,
            volume_api,
            filesystem_api,
            lifecycle,
            machine_api,
            environ_api,
            registry,
            status_tx,
            log,
            environ: None,
            machines: BTreeMap::new(),
            volumes: BTreeMap::new(),
            filesystems: BTreeMap::new(),
            volume_attachments: BTreeMap::new(),
            filesystem_attachments: BTreeMap::new(),
            pending: PendingWork::default(),
            block_devices,
            volume_backed_source,
            machine_events_tx,
            machine_events_rx: Some(machine_events_rx),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<(), ProvisionerError> {
        let mut volumes_w = self.volume_api.watch_volumes().await?;
        let mut volume_attachments_w =
            self.volume_api.watch_volume_attachments().await?;
        let mut filesystems_w = self.filesystem_api.watch_filesystems().await?;
        let mut filesystem_attachments_w =
            self.filesystem_api.watch_filesystem_attachments().await?;
        let mut environ_w = self.environ_api.watch_config().await?;
        let mut block_devices_w = match self.config.scope.machine() {
            Some(machine) => {
                Some(self.filesystem_api.watch_block_devices(machine).await?)
            }
            None => None,
        };
        // `machine_events_rx` is populated by `new()`; `run` is called
        // exactly once.
        let mut machine_events = self
            .machine_events_rx
            .take()
            .expect("run() called once per task");

        info!(self.log, "storage provisioner started");
        self.publish_gated_status();

        loop {
            tokio::select! {
                // Cancellation: return promptly, leaving any in-flight
                // provider operation to complete or fail on its own.
                _ = &mut shutdown => {
                    info!(self.log, "storage provisioner shutting down");
                    return Ok(());
                }

                msg = volumes_w.recv() => {
                    let tags = msg.ok_or(ProvisionerError::WatcherClosed {
                        watcher: "volumes",
                    })?;
                    self.volumes_changed(tags).await?;
                }

                msg = volume_attachments_w.recv() => {
                    let ids = msg.ok_or(ProvisionerError::WatcherClosed {
                        watcher: "volume attachments",
                    })?;
                    self.volume_attachments_changed(ids).await?;
                }

                msg = filesystems_w.recv() => {
                    let tags = msg.ok_or(ProvisionerError::WatcherClosed {
                        watcher: "filesystems",
                    })?;
                    self.filesystems_changed(tags).await?;
                }

                msg = filesystem_attachments_w.recv() => {
                    let ids = msg.ok_or(ProvisionerError::WatcherClosed {
                        watcher: "filesystem attachments",
                    })?;
                    self.filesystem_attachments_changed(ids).await?;
                }

                msg = environ_w.recv() => {
                    msg.ok_or(ProvisionerError::WatcherClosed {
                        watcher: "environ config",
                    })?;
                    self.environ_changed().await?;
                }

                msg = machine_events.recv() => {
                    // The task holds a sender, so the stream never ends.
                    if let Some(event) = msg {
                        self.machine_changed(event).await?;
                    }
                }

                msg = signal_or_pending(&mut block_devices_w) => {
                    msg.ok_or(ProvisionerError::WatcherClosed {
                        watcher: "block devices",
                    })?;
                    self.block_devices_changed().await?;
                }
            }

            self.reconcile().await?;
        }
    }

    /// One full pass over all pending work. Creates run before attaches
    /// and attaches before detaches/removals; removal candidacy is
    /// re-evaluated on every pass since a parent's own life never
    /// changes again once it is dying.
    async fn reconcile(&mut self) -> Result<(), ProvisionerError> {
        if self.environ.is_none() {
            self.publish_gated_status();
            return Ok(());
        }
        let started_at = Utc::now();
        let started = Instant::now();
        self.status_tx.send_modify(|s| {
            *s = ProvisionerStatus::Reconciling { started_at }
        });

        self.create_volumes().await?;
        self.create_filesystems().await?;
        self.attach_volumes().await?;
        self.attach_filesystems().await?;
        self.detach_filesystems().await?;
        self.detach_volumes().await?;
        self.remove_filesystems().await?;
        self.remove_volumes().await?;

        let pending = self.pending.counts();
        self.status_tx.send_modify(|s| {
            *s = ProvisionerStatus::Idle {
                completed_at: Utc::now(),
                ran_for: started.elapsed(),
                pending,
            }
        });
        Ok(())
    }

    fn publish_gated_status(&self) {
        self.status_tx.send_modify(|s| {
            *s = ProvisionerStatus::WaitingForEnvironConfig
        });
    }

    async fn environ_changed(&mut self) -> Result<(), ProvisionerError> {
        let config = self.environ_api.config().await?;
        if self.environ.as_ref() != Some(&config) {
            info!(
                self.log, "environ config received";
                "environ" => &config.uuid,
            );
        }
        self.environ = Some(config);
        Ok(())
    }

    async fn machine_changed(
        &mut self,
        event: MachineEvent,
    ) -> Result<(), ProvisionerError> {
        let machine = match event {
            MachineEvent::Changed(machine) => machine,
            MachineEvent::Closed(machine) => {
                return Err(ProvisionerError::MachineWatcherClosed { machine });
            }
        };
        let instance = self.machine_api.instance_id(&machine).await?;
        if let Some(instance) = instance {
            let known = self.machines.entry(machine.clone()).or_default();
            if known.is_none() {
                info!(
                    self.log, "machine provisioned";
                    "machine" => %machine,
                    "instance_id" => %instance,
                );
            }
            *known = Some(instance);
        }
        Ok(())
    }

    async fn block_devices_changed(&mut self) -> Result<(), ProvisionerError> {
        // The block-device watcher is only subscribed in machine scope.
        let machine = self
            .config
            .scope
            .machine()
            .expect("block-device watcher implies machine scope")
            .clone();
        let devices = self.filesystem_api.block_devices(&machine).await?;
        debug!(
            self.log, "block devices changed";
            "machine" => %machine,
            "count" => devices.len(),
        );
        *self.block_devices.lock().unwrap() = devices;
        Ok(())
    }

    /// Starts watching a machine the first time an attachment mentions
    /// it. A small forwarder task funnels the per-machine signal stream
    /// into the select loop's single machine-event channel.
    async fn ensure_machine_watched(
        &mut self,
        machine: MachineTag,
    ) -> Result<(), ProvisionerError> {
        if self.machines.contains_key(&machine) {
            return Ok(());
        }
        self.machines.insert(machine.clone(), None);
        let mut rx = self.machine_api.watch_machine(&machine).await?;
        let tx = self.machine_events_tx.clone();
        tokio::spawn(async move {
            while let Some(()) = rx.recv().await {
                if tx.send(MachineEvent::Changed(machine.clone())).await.is_err()
                {
                    // Worker gone; nothing left to notify.
                    return;
                }
            }
            let _ = tx.send(MachineEvent::Closed(machine)).await;
        });
        Ok(())
    }

    fn instance_for(&self, machine: &MachineTag) -> Option<InstanceId> {
        self.machines.get(machine).cloned().flatten()
    }
}

/// Select-friendly receive on an optional channel: a worker without a
/// block-device watcher simply never takes that branch.
async fn signal_or_pending(
    rx: &mut Option<mpsc::Receiver<()>>,
) -> Option<()> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

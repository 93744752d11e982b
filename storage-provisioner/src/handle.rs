// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Spawning the provisioner and talking to a running one.

use slog::Logger;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use storage_provider::ProviderRegistry;

use crate::accessors::{
    EnvironAccessor, FilesystemAccessor, LifecycleManager, MachineAccessor,
    VolumeAccessor,
};
use crate::config::ProvisionerConfig;
use crate::errors::ProvisionerError;
use crate::provisioner_task::ProvisionerTask;
use crate::status::ProvisionerStatus;

/// Spawns a provisioner worker for the given scope.
///
/// The worker runs until [`ProvisionerHandle::shutdown`] is called or a
/// fatal error stops it; its supervisor is expected to inspect the
/// returned error and start a fresh worker, which rebuilds all state
/// from the watchers' initial events.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    config: ProvisionerConfig,
    volume_api: Arc<dyn VolumeAccessor>,
    filesystem_api: Arc<dyn FilesystemAccessor>,
    lifecycle: Arc<dyn LifecycleManager>,
    machine_api: Arc<dyn MachineAccessor>,
    environ_api: Arc<dyn EnvironAccessor>,
    registry: Arc<dyn ProviderRegistry>,
    base_log: &Logger,
) -> ProvisionerHandle {
    let (status_tx, status_rx) =
        watch::channel(ProvisionerStatus::NotYetRunning);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = ProvisionerTask::new(
        config,
        volume_api,
        filesystem_api,
        lifecycle,
        machine_api,
        environ_api,
        registry,
        status_tx,
        base_log,
    );
    let task = tokio::spawn(task.run(shutdown_rx));
    ProvisionerHandle { status_rx, shutdown_tx: Some(shutdown_tx), task }
}

/// Owner's view of a running provisioner worker.
pub struct ProvisionerHandle {
    status_rx: watch::Receiver<ProvisionerStatus>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), ProvisionerError>>,
}

impl ProvisionerHandle {
    /// The worker's most recently published status.
    pub fn status(&self) -> ProvisionerStatus {
        self.status_rx.borrow().clone()
    }

    /// A watch channel tracking the worker's status.
    pub fn status_rx(&self) -> watch::Receiver<ProvisionerStatus> {
        self.status_rx.clone()
    }

    /// Asks the worker to stop and waits for it, reporting the fatal
    /// error if it had already stopped on its own.
    pub async fn shutdown(mut self) -> Result<(), ProvisionerError> {
        if let Some(tx) = self.shutdown_tx.take() {
            // A send error means the task already exited; join below
            // surfaces why.
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(ProvisionerError::TaskAborted(err)),
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The storage provisioner worker.
//!
//! One worker runs per scope (a single machine, or the whole
//! deployment). It is a single tokio task selecting over the watch
//! streams of the authoritative store; on every event it updates its
//! in-memory pending sets and runs one reconciliation pass, driving the
//! pluggable storage providers until backend reality matches the
//! desired state recorded centrally.
//!
//! The pending sets are owned exclusively by the task, so no handler
//! ever races another and no locking is needed; restarts rebuild them
//! from the watchers' initial events.

mod accessors;
mod config;
mod errors;
mod handle;
mod pending;
mod provisioner_task;
mod status;
mod volume_backed;

pub use accessors::EnvironAccessor;
pub use accessors::FilesystemAccessor;
pub use accessors::LifecycleManager;
pub use accessors::MachineAccessor;
pub use accessors::VolumeAccessor;
pub use config::ProvisionerConfig;
pub use config::Scope;
pub use errors::AccessorError;
pub use errors::ProvisionerError;
pub use handle::spawn;
pub use handle::ProvisionerHandle;
pub use status::PendingCounts;
pub use status::ProvisionerStatus;
pub use volume_backed::VolumeBackedFilesystemSource;

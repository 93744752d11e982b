// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// What the worker is currently doing, published on a watch channel for
/// external status reporting.
///
/// The pending counts in `Idle` are how stuck work surfaces: an entity
/// with permanently-invalid parameters is indistinguishable from a
/// transiently-failing one at this layer, so it simply stays counted
/// here across passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionerStatus {
    NotYetRunning,
    WaitingForEnvironConfig,
    Reconciling { started_at: DateTime<Utc> },
    Idle { completed_at: DateTime<Utc>, ran_for: Duration, pending: PendingCounts },
}

impl Default for ProvisionerStatus {
    fn default() -> Self {
        ProvisionerStatus::NotYetRunning
    }
}

/// Per-kind sizes of the pending sets after a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub create_volumes: usize,
    pub attach_volumes: usize,
    pub detach_volumes: usize,
    pub destroy_volumes: usize,
    pub create_filesystems: usize,
    pub attach_filesystems: usize,
    pub detach_filesystems: usize,
    pub destroy_filesystems: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.create_volumes
            + self.attach_volumes
            + self.detach_volumes
            + self.destroy_volumes
            + self.create_filesystems
            + self.attach_filesystems
            + self.detach_filesystems
            + self.destroy_filesystems
    }
}

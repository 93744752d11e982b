// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use storage_models::MachineTag;
use storage_provider::ProviderError;

/// A transport-level failure of a batched accessor RPC. Always fatal to
/// the worker; the external supervisor restarts it and the pending sets
/// are rebuilt from the watchers' initial events.
#[derive(Debug, Clone, thiserror::Error)]
#[error("accessor call {operation} failed: {message}")]
pub struct AccessorError {
    pub operation: &'static str,
    pub message: String,
}

impl AccessorError {
    pub fn new<S: Into<String>>(operation: &'static str, message: S) -> Self {
        Self { operation, message: message.into() }
    }
}

/// Fatal worker errors. Everything here stops the reconciliation loop;
/// transient per-item failures never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionerError {
    #[error("{watcher} watch stream closed unexpectedly")]
    WatcherClosed { watcher: &'static str },

    #[error("watch stream for {machine} closed unexpectedly")]
    MachineWatcherClosed { machine: MachineTag },

    #[error(transparent)]
    Accessor(#[from] AccessorError),

    #[error("{operation} returned {got} results for {expected} inputs")]
    MismatchedResults {
        operation: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{operation} failed for [{tags}]")]
    Provider {
        operation: &'static str,
        tags: String,
        #[source]
        source: ProviderError,
    },

    #[error("provisioner task aborted unexpectedly")]
    TaskAborted(#[source] tokio::task::JoinError),
}

/// Checks the one-result-per-input contract of a batched call.
pub(crate) fn check_batch_len<T>(
    operation: &'static str,
    inputs: usize,
    results: &[T],
) -> Result<(), ProvisionerError> {
    if results.len() == inputs {
        Ok(())
    } else {
        Err(ProvisionerError::MismatchedResults {
            operation,
            expected: inputs,
            got: results.len(),
        })
    }
}

/// Renders a tag list for error annotations.
pub(crate) fn join_tags<T: std::fmt::Display>(tags: &[T]) -> String {
    tags.iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Errors reported by a storage provider, either per-item inside a
/// batched result or for a whole call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("provider API throttled: {0}")]
    Throttled(String),

    /// The operation cannot proceed yet (e.g. a backing device has not
    /// appeared). Not a failure; the work stays pending.
    #[error("not ready: {0}")]
    NotReady(String),

    /// Malformed pool or attachment parameters. Indistinguishable from
    /// a transient failure at this layer, so still retried; see the
    /// status report for stuck entities.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// The provider does not support the requested operation at all.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Whether the affected work should stay pending and be retried on
    /// the next relevant event.
    pub fn retryable(&self) -> bool {
        match self {
            ProviderError::QuotaExceeded(_)
            | ProviderError::Throttled(_)
            | ProviderError::NotReady(_)
            | ProviderError::InvalidParams(_)
            | ProviderError::Other(_) => true,
            ProviderError::Unsupported(_) => false,
        }
    }
}

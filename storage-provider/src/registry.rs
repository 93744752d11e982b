// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::sync::Arc;

use storage_models::ProviderType;

use crate::{FilesystemSource, VolumeSource};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("no provider registered for pool type {pool}")]
    UnknownProvider { pool: ProviderType },
}

/// A registered provider: its sources plus whether it supports
/// API-driven attach/detach.
///
/// "Static" providers (`dynamic == false`) may be asked to create
/// volumes, but attachment happens out of band (e.g. pre-attached loop
/// devices); the provisioner never routes attach/detach work to them.
#[derive(Clone)]
pub struct Provider {
    pub volume_source: Arc<dyn VolumeSource>,
    pub filesystem_source: Arc<dyn FilesystemSource>,
    pub dynamic: bool,
}

/// Maps a pool/provider type to the backend that serves it.
pub trait ProviderRegistry: Send + Sync {
    fn lookup(&self, pool: &ProviderType) -> Result<Provider, RegistryError>;
}

/// The standard registry: an explicit map populated at process startup
/// (and by tests).
#[derive(Clone, Default)]
pub struct MapRegistry {
    providers: BTreeMap<ProviderType, Provider>,
}

impl MapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pool: ProviderType, provider: Provider) {
        self.providers.insert(pool, provider);
    }
}

impl ProviderRegistry for MapRegistry {
    fn lookup(&self, pool: &ProviderType) -> Result<Provider, RegistryError> {
        self.providers.get(pool).cloned().ok_or_else(|| {
            RegistryError::UnknownProvider { pool: pool.clone() }
        })
    }
}

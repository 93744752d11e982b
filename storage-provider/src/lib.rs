// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The pluggable storage backend contract.
//!
//! A provider turns parameter structs into real cloud resources. The
//! provisioner only ever talks to providers through the [`VolumeSource`]
//! and [`FilesystemSource`] traits, looked up by pool type through a
//! [`ProviderRegistry`]; the implementations themselves live outside
//! this workspace.

mod error;
mod registry;
mod source;

pub use error::ProviderError;
pub use registry::MapRegistry;
pub use registry::Provider;
pub use registry::ProviderRegistry;
pub use registry::RegistryError;
pub use source::CreatedVolume;
pub use source::FilesystemSource;
pub use source::VolumeSource;

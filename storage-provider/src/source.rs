// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use async_trait::async_trait;
use storage_models::{
    FilesystemAttachmentParams, FilesystemParams, ProvisionedFilesystem,
    ProvisionedFilesystemAttachment, ProvisionedVolume,
    ProvisionedVolumeAttachment, VolumeAttachmentParams, VolumeParams,
};

use crate::ProviderError;

/// A successfully created volume, with the attachment realized in the
/// same operation when the create parameters carried one and the
/// provider chose to honor it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedVolume {
    pub volume: ProvisionedVolume,
    pub attachment: Option<ProvisionedVolumeAttachment>,
}

/// Creates, attaches, and detaches volumes on some backend.
///
/// All operations are batched: one result per input, in input order.
/// `Err` on the whole call means none of the inputs were acted on.
///
/// Calls must be safe to retry with the same parameters. In particular
/// a create for an already-created volume returns the existing volume
/// rather than a duplicate or an error.
#[async_trait]
pub trait VolumeSource: Send + Sync {
    async fn create_volumes(
        &self,
        params: &[VolumeParams],
    ) -> Result<Vec<Result<CreatedVolume, ProviderError>>, ProviderError>;

    async fn attach_volumes(
        &self,
        params: &[VolumeAttachmentParams],
    ) -> Result<
        Vec<Result<ProvisionedVolumeAttachment, ProviderError>>,
        ProviderError,
    >;

    async fn detach_volumes(
        &self,
        params: &[VolumeAttachmentParams],
    ) -> Result<Vec<Result<(), ProviderError>>, ProviderError>;
}

/// Creates, attaches, and detaches filesystems on some backend.
///
/// Same batching and idempotency contract as [`VolumeSource`].
#[async_trait]
pub trait FilesystemSource: Send + Sync {
    async fn create_filesystems(
        &self,
        params: &[FilesystemParams],
    ) -> Result<
        Vec<Result<ProvisionedFilesystem, ProviderError>>,
        ProviderError,
    >;

    async fn attach_filesystems(
        &self,
        params: &[FilesystemAttachmentParams],
    ) -> Result<
        Vec<Result<ProvisionedFilesystemAttachment, ProviderError>>,
        ProviderError,
    >;

    async fn detach_filesystems(
        &self,
        params: &[FilesystemAttachmentParams],
    ) -> Result<Vec<Result<(), ProviderError>>, ProviderError>;
}

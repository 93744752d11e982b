// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Filesystem lifecycle handling, mirroring the volume passes.
//!
//! The one structural difference from volumes is routing: a filesystem
//! with a backing volume is served by the machine-local
//! [`VolumeBackedFilesystemSource`](crate::volume_backed) instead of a
//! registry provider, and only a machine-scoped worker carries that
//! source. Everything else goes through the registry exactly as volumes
//! do.

use slog::{debug, info, warn};
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;

use storage_models::{
    FilesystemAttachmentId, FilesystemAttachmentParams, FilesystemParams,
    FilesystemTag, Life, ProviderType, ProvisionedFilesystem,
    ProvisionedFilesystemAttachment,
};
use storage_provider::FilesystemSource;

use crate::errors::{check_batch_len, join_tags, ProvisionerError};

use super::ProvisionerTask;

impl ProvisionerTask {
    /// Handles a filesystem lifecycle event.
    pub(super) async fn filesystems_changed(
        &mut self,
        tags: Vec<FilesystemTag>,
    ) -> Result<(), ProvisionerError> {
        if tags.is_empty() {
            return Ok(());
        }
        let snapshots = self.filesystem_api.filesystems(&tags).await?;
        check_batch_len("filesystems", tags.len(), &snapshots)?;
        for (tag, snapshot) in tags.into_iter().zip(snapshots) {
            match snapshot {
                None => {
                    debug!(
                        self.log, "filesystem already removed";
                        "filesystem" => %tag,
                    );
                    self.pending.forget_filesystem(&tag);
                    self.filesystems.remove(&tag);
                }
                Some(filesystem) => {
                    if filesystem.life.is_dead_or_dying() {
                        self.pending.create_filesystems.remove(&tag);
                        self.pending.destroy_filesystems.insert(tag.clone());
                    } else if !filesystem.is_provisioned() {
                        self.pending.create_filesystems.insert(tag.clone());
                    }
                    self.filesystems.insert(tag, filesystem);
                }
            }
        }
        Ok(())
    }

    /// Handles a filesystem attachment lifecycle event.
    pub(super) async fn filesystem_attachments_changed(
        &mut self,
        ids: Vec<FilesystemAttachmentId>,
    ) -> Result<(), ProvisionerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let snapshots =
            self.filesystem_api.filesystem_attachments(&ids).await?;
        check_batch_len("filesystem_attachments", ids.len(), &snapshots)?;
        for (id, snapshot) in ids.into_iter().zip(snapshots) {
            match snapshot {
                None => {
                    debug!(
                        self.log, "filesystem attachment already removed";
                        "attachment" => %id,
                    );
                    self.pending.forget_filesystem_attachment(&id);
                    self.filesystem_attachments.remove(&id);
                }
                Some(attachment) => {
                    self.ensure_machine_watched(id.machine.clone()).await?;
                    match attachment.life {
                        Life::Alive => {
                            let reattach_done = attachment.is_provisioned()
                                && self
                                    .pending
                                    .fs_attached_this_session
                                    .contains(&id);
                            if !reattach_done {
                                self.pending
                                    .attach_filesystems
                                    .insert(id.clone());
                            }
                        }
                        Life::Dying | Life::Dead => {
                            self.pending.attach_filesystems.remove(&id);
                            self.pending.detach_filesystems.insert(id.clone());
                        }
                    }
                    self.filesystem_attachments.insert(id, attachment);
                }
            }
        }
        Ok(())
    }

    /// Creation pass for filesystems. Volume-backed parameters are
    /// served locally; the rest go through the registry per pool.
    pub(super) async fn create_filesystems(
        &mut self,
    ) -> Result<(), ProvisionerError> {
        if self.pending.create_filesystems.is_empty() {
            return Ok(());
        }
        let Some(environ) = self.environ.clone() else {
            return Ok(());
        };
        let tags: Vec<FilesystemTag> =
            self.pending.create_filesystems.iter().cloned().collect();
        let params = self.filesystem_api.filesystem_params(&tags).await?;
        check_batch_len("filesystem_params", tags.len(), &params)?;

        let mut volume_backed = Vec::new();
        let mut groups: BTreeMap<ProviderType, Vec<FilesystemParams>> =
            BTreeMap::new();
        for (tag, params) in tags.iter().zip(params) {
            let Some(mut params) = params else {
                self.pending.forget_filesystem(tag);
                self.filesystems.remove(tag);
                continue;
            };
            params.resource_tags = environ.resource_tags.clone();
            if params.backing_volume.is_some() {
                volume_backed.push(params);
            } else {
                groups
                    .entry(params.provider.clone())
                    .or_default()
                    .push(params);
            }
        }

        if !volume_backed.is_empty() {
            match self.volume_backed_source.clone() {
                Some(source) => {
                    self.create_filesystems_with(
                        &source,
                        "volume-backed",
                        volume_backed,
                    )
                    .await?;
                }
                // Only a machine-scoped worker can see the backing
                // volume's block device.
                None => debug!(
                    self.log,
                    "volume-backed filesystems left for machine workers";
                    "count" => volume_backed.len(),
                ),
            }
        }

        for (pool, group) in groups {
            let provider = match self.registry.lookup(&pool) {
                Ok(provider) => provider,
                Err(err) => {
                    warn!(
                        self.log,
                        "no provider for pool; \
                         filesystem creation stays pending";
                        "pool" => %pool,
                        InlineErrorChain::new(&err),
                    );
                    continue;
                }
            };
            let source = provider.filesystem_source.clone();
            self.create_filesystems_with(&*source, pool.as_str(), group)
                .await?;
        }
        Ok(())
    }

    async fn create_filesystems_with(
        &mut self,
        source: &(dyn FilesystemSource + '_),
        pool: &str,
        group: Vec<FilesystemParams>,
    ) -> Result<(), ProvisionerError> {
        let group_tags: Vec<FilesystemTag> =
            group.iter().map(|p| p.tag.clone()).collect();
        let results = match source.create_filesystems(&group).await {
            Ok(results) => results,
            Err(err) if err.retryable() => {
                warn!(
                    self.log, "creating filesystems failed; will retry";
                    "pool" => pool.to_string(),
                    "filesystems" => join_tags(&group_tags),
                    InlineErrorChain::new(&err),
                );
                return Ok(());
            }
            Err(err) => {
                return Err(ProvisionerError::Provider {
                    operation: "create_filesystems",
                    tags: join_tags(&group_tags),
                    source: err,
                });
            }
        };
        check_batch_len("create_filesystems", group.len(), &results)?;

        let mut created = Vec::new();
        for (params, result) in group.iter().zip(results) {
            match result {
                Ok(filesystem) => created.push(filesystem),
                Err(err) => warn!(
                    self.log, "creating filesystem failed; will retry";
                    "filesystem" => %params.tag,
                    InlineErrorChain::new(&err),
                ),
            }
        }
        self.record_provisioned_filesystems(&created).await
    }

    /// Attachment pass for filesystems.
    pub(super) async fn attach_filesystems(
        &mut self,
    ) -> Result<(), ProvisionerError> {
        if self.pending.attach_filesystems.is_empty() {
            return Ok(());
        }
        // A volume-backed mount is a machine-local operation; attaching
        // through a cloud provider additionally needs the instance id.
        let ready: Vec<FilesystemAttachmentId> = self
            .pending
            .attach_filesystems
            .iter()
            .filter(|id| {
                let Some(filesystem) = self.filesystems.get(&id.filesystem)
                else {
                    return false;
                };
                filesystem.is_provisioned()
                    && (filesystem.is_volume_backed()
                        || self.instance_for(&id.machine).is_some())
            })
            .cloned()
            .collect();
        if ready.is_empty() {
            return Ok(());
        }

        let params = self
            .filesystem_api
            .filesystem_attachment_params(&ready)
            .await?;
        check_batch_len("filesystem_attachment_params", ready.len(), &params)?;

        let mut volume_backed = Vec::new();
        let mut groups: BTreeMap<
            ProviderType,
            Vec<FilesystemAttachmentParams>,
        > = BTreeMap::new();
        for (id, params) in ready.into_iter().zip(params) {
            let Some(params) = params else {
                self.pending.forget_filesystem_attachment(&id);
                self.filesystem_attachments.remove(&id);
                continue;
            };
            let params =
                self.complete_filesystem_attachment_params(&id, params);
            if self
                .filesystems
                .get(&id.filesystem)
                .is_some_and(|f| f.is_volume_backed())
            {
                volume_backed.push(params);
            } else {
                groups
                    .entry(params.provider.clone())
                    .or_default()
                    .push(params);
            }
        }

        if !volume_backed.is_empty() {
            if let Some(source) = self.volume_backed_source.clone() {
                self.spend_fs_reattach_budget(&volume_backed);
                self.attach_filesystems_with(
                    &source,
                    "volume-backed",
                    volume_backed,
                )
                .await?;
            }
        }

        for (pool, group) in groups {
            let provider = match self.registry.lookup(&pool) {
                Ok(provider) => provider,
                Err(err) => {
                    warn!(
                        self.log,
                        "no provider for pool; \
                         filesystem attachment stays pending";
                        "pool" => %pool,
                        InlineErrorChain::new(&err),
                    );
                    continue;
                }
            };
            if !provider.dynamic {
                for params in &group {
                    info!(
                        self.log,
                        "attachment managed outside the control plane";
                        "attachment" => %params.id,
                        "pool" => %pool,
                    );
                    self.pending.attach_filesystems.remove(&params.id);
                }
                continue;
            }
            self.spend_fs_reattach_budget(&group);
            let source = provider.filesystem_source.clone();
            self.attach_filesystems_with(&*source, pool.as_str(), group)
                .await?;
        }
        Ok(())
    }

    /// Marks the one-per-session reattach attempt for already
    /// provisioned pairs, at call time rather than on success.
    fn spend_fs_reattach_budget(&mut self, group: &[FilesystemAttachmentParams]) {
        for params in group {
            if self
                .filesystem_attachments
                .get(&params.id)
                .is_some_and(|a| a.is_provisioned())
            {
                self.pending
                    .fs_attached_this_session
                    .insert(params.id.clone());
            }
        }
    }

    async fn attach_filesystems_with(
        &mut self,
        source: &(dyn FilesystemSource + '_),
        pool: &str,
        group: Vec<FilesystemAttachmentParams>,
    ) -> Result<(), ProvisionerError> {
        let group_ids: Vec<FilesystemAttachmentId> =
            group.iter().map(|p| p.id.clone()).collect();
        let results = match source.attach_filesystems(&group).await {
            Ok(results) => results,
            Err(err) if err.retryable() => {
                warn!(
                    self.log, "attaching filesystems failed; will retry";
                    "pool" => pool.to_string(),
                    "attachments" => join_tags(&group_ids),
                    InlineErrorChain::new(&err),
                );
                return Ok(());
            }
            Err(err) => {
                return Err(ProvisionerError::Provider {
                    operation: "attach_filesystems",
                    tags: join_tags(&group_ids),
                    source: err,
                });
            }
        };
        check_batch_len("attach_filesystems", group.len(), &results)?;

        let mut attached = Vec::new();
        for (params, result) in group.iter().zip(results) {
            match result {
                Ok(attachment) => attached.push(attachment),
                Err(err) => warn!(
                    self.log, "attaching filesystem failed; will retry";
                    "attachment" => %params.id,
                    InlineErrorChain::new(&err),
                ),
            }
        }
        self.record_filesystem_attachments(&attached).await
    }

    /// Detachment pass for filesystems.
    pub(super) async fn detach_filesystems(
        &mut self,
    ) -> Result<(), ProvisionerError> {
        if self.pending.detach_filesystems.is_empty() {
            return Ok(());
        }
        let ids: Vec<FilesystemAttachmentId> =
            self.pending.detach_filesystems.iter().cloned().collect();

        let mut removable = Vec::new();
        let mut provisioned = Vec::new();
        for id in ids {
            let is_provisioned = self
                .filesystem_attachments
                .get(&id)
                .is_some_and(|a| a.is_provisioned());
            if !is_provisioned {
                removable.push(id);
                continue;
            }
            let volume_backed = self
                .filesystems
                .get(&id.filesystem)
                .is_some_and(|f| f.is_volume_backed());
            if volume_backed || self.instance_for(&id.machine).is_some() {
                provisioned.push((id, volume_backed));
            }
        }

        let mut volume_backed_group = Vec::new();
        if !provisioned.is_empty() {
            let provisioned_ids: Vec<FilesystemAttachmentId> =
                provisioned.iter().map(|(id, _)| id.clone()).collect();
            let params = self
                .filesystem_api
                .filesystem_attachment_params(&provisioned_ids)
                .await?;
            check_batch_len(
                "filesystem_attachment_params",
                provisioned_ids.len(),
                &params,
            )?;

            let mut groups: BTreeMap<
                ProviderType,
                Vec<FilesystemAttachmentParams>,
            > = BTreeMap::new();
            for ((id, volume_backed), params) in
                provisioned.into_iter().zip(params)
            {
                let Some(params) = params else {
                    self.pending.forget_filesystem_attachment(&id);
                    self.filesystem_attachments.remove(&id);
                    continue;
                };
                let params =
                    self.complete_filesystem_attachment_params(&id, params);
                if volume_backed {
                    volume_backed_group.push(params);
                } else {
                    groups
                        .entry(params.provider.clone())
                        .or_default()
                        .push(params);
                }
            }

            if !volume_backed_group.is_empty() {
                if let Some(source) = self.volume_backed_source.clone() {
                    self.detach_filesystems_with(
                        &source,
                        "volume-backed",
                        volume_backed_group,
                        &mut removable,
                    )
                    .await?;
                }
            }

            for (pool, group) in groups {
                let provider = match self.registry.lookup(&pool) {
                    Ok(provider) => provider,
                    Err(err) => {
                        warn!(
                            self.log,
                            "no provider for pool; \
                             filesystem detachment stays pending";
                            "pool" => %pool,
                            InlineErrorChain::new(&err),
                        );
                        continue;
                    }
                };
                if !provider.dynamic {
                    removable.extend(group.iter().map(|p| p.id.clone()));
                    continue;
                }
                let source = provider.filesystem_source.clone();
                self.detach_filesystems_with(
                    &*source,
                    pool.as_str(),
                    group,
                    &mut removable,
                )
                .await?;
            }
        }

        self.remove_filesystem_attachment_records(&removable).await
    }

    async fn detach_filesystems_with(
        &mut self,
        source: &(dyn FilesystemSource + '_),
        pool: &str,
        group: Vec<FilesystemAttachmentParams>,
        removable: &mut Vec<FilesystemAttachmentId>,
    ) -> Result<(), ProvisionerError> {
        let group_ids: Vec<FilesystemAttachmentId> =
            group.iter().map(|p| p.id.clone()).collect();
        let results = match source.detach_filesystems(&group).await {
            Ok(results) => results,
            Err(err) if err.retryable() => {
                warn!(
                    self.log, "detaching filesystems failed; will retry";
                    "pool" => pool.to_string(),
                    "attachments" => join_tags(&group_ids),
                    InlineErrorChain::new(&err),
                );
                return Ok(());
            }
            Err(err) => {
                return Err(ProvisionerError::Provider {
                    operation: "detach_filesystems",
                    tags: join_tags(&group_ids),
                    source: err,
                });
            }
        };
        check_batch_len("detach_filesystems", group.len(), &results)?;
        for (params, result) in group.iter().zip(results) {
            match result {
                Ok(()) => removable.push(params.id.clone()),
                Err(err) => warn!(
                    self.log, "detaching filesystem failed; will retry";
                    "attachment" => %params.id,
                    InlineErrorChain::new(&err),
                ),
            }
        }
        Ok(())
    }

    /// Removal pass: dying filesystems leave the store once no
    /// attachments reference them.
    pub(super) async fn remove_filesystems(
        &mut self,
    ) -> Result<(), ProvisionerError> {
        if self.pending.destroy_filesystems.is_empty() {
            return Ok(());
        }
        let tags: Vec<FilesystemTag> =
            self.pending.destroy_filesystems.iter().cloned().collect();
        let dependents =
            self.filesystem_api.filesystem_dependents(&tags).await?;
        check_batch_len("filesystem_dependents", tags.len(), &dependents)?;

        let mut removable = Vec::new();
        for (tag, dependents) in tags.into_iter().zip(dependents) {
            match dependents {
                None => {
                    self.pending.forget_filesystem(&tag);
                    self.filesystems.remove(&tag);
                }
                Some(d) if d.is_empty() => removable.push(tag),
                Some(d) => debug!(
                    self.log, "filesystem not yet removable";
                    "filesystem" => %tag,
                    "attachments" => d.attachments.len(),
                ),
            }
        }
        if removable.is_empty() {
            return Ok(());
        }

        let results = self.lifecycle.remove_filesystems(&removable).await?;
        check_batch_len("remove_filesystems", removable.len(), &results)?;
        for (tag, result) in removable.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    info!(
                        self.log, "filesystem removed";
                        "filesystem" => %tag,
                    );
                    self.pending.forget_filesystem(&tag);
                    self.filesystems.remove(&tag);
                }
                Err(err) => warn!(
                    self.log, "removing filesystem failed; will retry";
                    "filesystem" => %tag,
                    InlineErrorChain::new(&err),
                ),
            }
        }
        Ok(())
    }

    async fn record_provisioned_filesystems(
        &mut self,
        created: &[ProvisionedFilesystem],
    ) -> Result<(), ProvisionerError> {
        if created.is_empty() {
            return Ok(());
        }
        let results =
            self.filesystem_api.set_filesystem_info(created).await?;
        check_batch_len("set_filesystem_info", created.len(), &results)?;
        for (filesystem, result) in created.iter().zip(results) {
            match result {
                Ok(()) => {
                    info!(
                        self.log, "filesystem provisioned";
                        "filesystem" => %filesystem.tag,
                        "filesystem_id" => &filesystem.info.filesystem_id,
                    );
                    self.pending.create_filesystems.remove(&filesystem.tag);
                    if let Some(known) =
                        self.filesystems.get_mut(&filesystem.tag)
                    {
                        known.info = Some(filesystem.info.clone());
                    }
                }
                Err(err) => warn!(
                    self.log, "recording filesystem info failed; will retry";
                    "filesystem" => %filesystem.tag,
                    InlineErrorChain::new(&err),
                ),
            }
        }
        Ok(())
    }

    async fn record_filesystem_attachments(
        &mut self,
        attached: &[ProvisionedFilesystemAttachment],
    ) -> Result<(), ProvisionerError> {
        if attached.is_empty() {
            return Ok(());
        }
        let results = self
            .filesystem_api
            .set_filesystem_attachment_info(attached)
            .await?;
        check_batch_len(
            "set_filesystem_attachment_info",
            attached.len(),
            &results,
        )?;
        for (attachment, result) in attached.iter().zip(results) {
            match result {
                Ok(()) => {
                    info!(
                        self.log, "filesystem attached";
                        "attachment" => %attachment.id,
                        "mount_point" => &attachment.info.mount_point,
                    );
                    self.pending.attach_filesystems.remove(&attachment.id);
                    self.pending
                        .fs_attached_this_session
                        .insert(attachment.id.clone());
                    if let Some(known) =
                        self.filesystem_attachments.get_mut(&attachment.id)
                    {
                        known.info = Some(attachment.info.clone());
                    }
                }
                Err(err) => warn!(
                    self.log,
                    "recording filesystem attachment info failed; will retry";
                    "attachment" => %attachment.id,
                    InlineErrorChain::new(&err),
                ),
            }
        }
        Ok(())
    }

    async fn remove_filesystem_attachment_records(
        &mut self,
        ids: &[FilesystemAttachmentId],
    ) -> Result<(), ProvisionerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let results =
            self.lifecycle.remove_filesystem_attachments(ids).await?;
        check_batch_len("remove_filesystem_attachments", ids.len(), &results)?;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(()) => {
                    info!(
                        self.log, "filesystem attachment removed";
                        "attachment" => %id,
                    );
                    self.pending.forget_filesystem_attachment(id);
                    self.filesystem_attachments.remove(id);
                }
                Err(err) => warn!(
                    self.log,
                    "removing filesystem attachment failed; will retry";
                    "attachment" => %id,
                    InlineErrorChain::new(&err),
                ),
            }
        }
        Ok(())
    }

    /// Fills in the fields the store does not track: the machine's
    /// instance id and the provider-assigned filesystem id.
    fn complete_filesystem_attachment_params(
        &self,
        id: &FilesystemAttachmentId,
        mut params: FilesystemAttachmentParams,
    ) -> FilesystemAttachmentParams {
        params.instance_id = self.instance_for(&id.machine);
        if params.filesystem_id.is_none() {
            params.filesystem_id = self
                .filesystems
                .get(&id.filesystem)
                .and_then(|f| f.info.as_ref())
                .map(|info| info.filesystem_id.clone());
        }
        params
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Volume lifecycle handling: watcher events, creation/attachment
//! passes, and detachment/removal passes.

use slog::{debug, info, warn};
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;

use storage_models::{
    Life, ProviderType, ProvisionedVolume, ProvisionedVolumeAttachment,
    VolumeAttachmentId, VolumeAttachmentParams, VolumeParams, VolumeTag,
};

use crate::errors::{check_batch_len, join_tags, ProvisionerError};

use super::ProvisionerTask;

impl ProvisionerTask {
    /// Handles a volume lifecycle event: fetch the named volumes and
    /// sort each into pending-create or pending-destroy.
    pub(super) async fn volumes_changed(
        &mut self,
        tags: Vec<VolumeTag>,
    ) -> Result<(), ProvisionerError> {
        if tags.is_empty() {
            return Ok(());
        }
        let snapshots = self.volume_api.volumes(&tags).await?;
        check_batch_len("volumes", tags.len(), &snapshots)?;
        for (tag, snapshot) in tags.into_iter().zip(snapshots) {
            match snapshot {
                None => {
                    debug!(
                        self.log, "volume already removed";
                        "volume" => %tag,
                    );
                    self.pending.forget_volume(&tag);
                    self.volumes.remove(&tag);
                }
                Some(volume) => {
                    if volume.life.is_dead_or_dying() {
                        self.pending.create_volumes.remove(&tag);
                        self.pending.destroy_volumes.insert(tag.clone());
                    } else if !volume.is_provisioned() {
                        self.pending.create_volumes.insert(tag.clone());
                    }
                    self.volumes.insert(tag, volume);
                }
            }
        }
        Ok(())
    }

    /// Handles a volume attachment lifecycle event.
    pub(super) async fn volume_attachments_changed(
        &mut self,
        ids: Vec<VolumeAttachmentId>,
    ) -> Result<(), ProvisionerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let snapshots = self.volume_api.volume_attachments(&ids).await?;
        check_batch_len("volume_attachments", ids.len(), &snapshots)?;
        for (id, snapshot) in ids.into_iter().zip(snapshots) {
            match snapshot {
                None => {
                    debug!(
                        self.log, "volume attachment already removed";
                        "attachment" => %id,
                    );
                    self.pending.forget_volume_attachment(&id);
                    self.volume_attachments.remove(&id);
                }
                Some(attachment) => {
                    // Both attach and detach calls need the machine's
                    // instance id eventually.
                    self.ensure_machine_watched(id.machine.clone()).await?;
                    match attachment.life {
                        Life::Alive => {
                            // A provisioned pair is re-attached once per
                            // session to repair operations lost across a
                            // restart; after that, events are no-ops.
                            let reattach_done = attachment.is_provisioned()
                                && self
                                    .pending
                                    .attached_this_session
                                    .contains(&id);
                            if !reattach_done {
                                self.pending.attach_volumes.insert(id.clone());
                            }
                        }
                        Life::Dying | Life::Dead => {
                            self.pending.attach_volumes.remove(&id);
                            self.pending.detach_volumes.insert(id.clone());
                        }
                    }
                    self.volume_attachments.insert(id, attachment);
                }
            }
        }
        Ok(())
    }

    /// Creation pass: provision all pending volumes whose gates are met,
    /// one batched provider call per pool. When a pending attachment for
    /// the same volume is also ready, its parameters ride along so the
    /// provider can create and attach in one operation.
    pub(super) async fn create_volumes(
        &mut self,
    ) -> Result<(), ProvisionerError> {
        if self.pending.create_volumes.is_empty() {
            return Ok(());
        }
        let Some(environ) = self.environ.clone() else {
            return Ok(());
        };
        let tags: Vec<VolumeTag> =
            self.pending.create_volumes.iter().cloned().collect();
        let params = self.volume_api.volume_params(&tags).await?;
        check_batch_len("volume_params", tags.len(), &params)?;

        let attach_along = self.ready_attachments_for(&tags).await?;

        let mut groups: BTreeMap<ProviderType, Vec<VolumeParams>> =
            BTreeMap::new();
        for (tag, params) in tags.iter().zip(params) {
            let Some(mut params) = params else {
                self.pending.forget_volume(tag);
                self.volumes.remove(tag);
                continue;
            };
            params.resource_tags = environ.resource_tags.clone();
            params.attachment = attach_along
                .iter()
                .find(|p| &p.id.volume == tag)
                .cloned();
            groups.entry(params.provider.clone()).or_default().push(params);
        }

        for (pool, mut group) in groups {
            let provider = match self.registry.lookup(&pool) {
                Ok(provider) => provider,
                Err(err) => {
                    warn!(
                        self.log,
                        "no provider for pool; volume creation stays pending";
                        "pool" => %pool,
                        InlineErrorChain::new(&err),
                    );
                    continue;
                }
            };
            // Static pools still create volumes, but never see attach
            // work, not even embedded in the create parameters.
            if !provider.dynamic {
                for params in &mut group {
                    if let Some(attachment) = params.attachment.take() {
                        info!(
                            self.log,
                            "attachment managed outside the control plane";
                            "attachment" => %attachment.id,
                            "pool" => %pool,
                        );
                        self.pending.attach_volumes.remove(&attachment.id);
                    }
                }
            }
            let group_tags: Vec<VolumeTag> =
                group.iter().map(|p| p.tag.clone()).collect();
            let results =
                match provider.volume_source.create_volumes(&group).await {
                    Ok(results) => results,
                    Err(err) if err.retryable() => {
                        warn!(
                            self.log, "creating volumes failed; will retry";
                            "pool" => %pool,
                            "volumes" => join_tags(&group_tags),
                            InlineErrorChain::new(&err),
                        );
                        continue;
                    }
                    Err(err) => {
                        return Err(ProvisionerError::Provider {
                            operation: "create_volumes",
                            tags: join_tags(&group_tags),
                            source: err,
                        });
                    }
                };
            check_batch_len("create_volumes", group.len(), &results)?;

            let mut created = Vec::new();
            let mut attached = Vec::new();
            for (params, result) in group.iter().zip(results) {
                match result {
                    Ok(volume) => {
                        created.push(volume.volume);
                        if let Some(attachment) = volume.attachment {
                            attached.push(attachment);
                        }
                    }
                    Err(err) => warn!(
                        self.log, "creating volume failed; will retry";
                        "volume" => %params.tag,
                        InlineErrorChain::new(&err),
                    ),
                }
            }
            self.record_provisioned_volumes(&created).await?;
            self.record_volume_attachments(&attached).await?;
        }
        Ok(())
    }

    /// Attachment pass: attach all pending attachments whose volume is
    /// provisioned and whose machine has an instance id.
    pub(super) async fn attach_volumes(
        &mut self,
    ) -> Result<(), ProvisionerError> {
        if self.pending.attach_volumes.is_empty() {
            return Ok(());
        }
        let ready: Vec<VolumeAttachmentId> = self
            .pending
            .attach_volumes
            .iter()
            .filter(|id| {
                self.volumes
                    .get(&id.volume)
                    .is_some_and(|v| v.is_provisioned())
                    && self.instance_for(&id.machine).is_some()
            })
            .cloned()
            .collect();
        if ready.is_empty() {
            return Ok(());
        }

        let params = self.volume_api.volume_attachment_params(&ready).await?;
        check_batch_len("volume_attachment_params", ready.len(), &params)?;

        let mut groups: BTreeMap<ProviderType, Vec<VolumeAttachmentParams>> =
            BTreeMap::new();
        for (id, params) in ready.into_iter().zip(params) {
            let Some(params) = params else {
                self.pending.forget_volume_attachment(&id);
                self.volume_attachments.remove(&id);
                continue;
            };
            let params = self.complete_volume_attachment_params(&id, params);
            groups.entry(params.provider.clone()).or_default().push(params);
        }

        for (pool, group) in groups {
            let provider = match self.registry.lookup(&pool) {
                Ok(provider) => provider,
                Err(err) => {
                    warn!(
                        self.log,
                        "no provider for pool; attachment stays pending";
                        "pool" => %pool,
                        InlineErrorChain::new(&err),
                    );
                    continue;
                }
            };
            if !provider.dynamic {
                // Static pools attach out of band; this worker must not
                // route attach work to them.
                for params in &group {
                    info!(
                        self.log,
                        "attachment managed outside the control plane";
                        "attachment" => %params.id,
                        "pool" => %pool,
                    );
                    self.pending.attach_volumes.remove(&params.id);
                }
                continue;
            }

            // The reattach budget is spent at call time, not on success:
            // one repair attempt per session, however it turns out.
            for params in &group {
                if self
                    .volume_attachments
                    .get(&params.id)
                    .is_some_and(|a| a.is_provisioned())
                {
                    self.pending
                        .attached_this_session
                        .insert(params.id.clone());
                }
            }

            let group_ids: Vec<VolumeAttachmentId> =
                group.iter().map(|p| p.id.clone()).collect();
            let results =
                match provider.volume_source.attach_volumes(&group).await {
                    Ok(results) => results,
                    Err(err) if err.retryable() => {
                        warn!(
                            self.log, "attaching volumes failed; will retry";
                            "pool" => %pool,
                            "attachments" => join_tags(&group_ids),
                            InlineErrorChain::new(&err),
                        );
                        continue;
                    }
                    Err(err) => {
                        return Err(ProvisionerError::Provider {
                            operation: "attach_volumes",
                            tags: join_tags(&group_ids),
                            source: err,
                        });
                    }
                };
            check_batch_len("attach_volumes", group.len(), &results)?;

            let mut attached = Vec::new();
            for (params, result) in group.iter().zip(results) {
                match result {
                    Ok(attachment) => attached.push(attachment),
                    Err(err) => warn!(
                        self.log, "attaching volume failed; will retry";
                        "attachment" => %params.id,
                        InlineErrorChain::new(&err),
                    ),
                }
            }
            self.record_volume_attachments(&attached).await?;
        }
        Ok(())
    }

    /// Detachment pass. Never-provisioned dying attachments are removed
    /// outright; provisioned ones are detached through their (dynamic)
    /// provider first.
    pub(super) async fn detach_volumes(
        &mut self,
    ) -> Result<(), ProvisionerError> {
        if self.pending.detach_volumes.is_empty() {
            return Ok(());
        }
        let ids: Vec<VolumeAttachmentId> =
            self.pending.detach_volumes.iter().cloned().collect();

        let mut removable = Vec::new();
        let mut provisioned = Vec::new();
        for id in ids {
            let is_provisioned = self
                .volume_attachments
                .get(&id)
                .is_some_and(|a| a.is_provisioned());
            if is_provisioned {
                // Detach calls carry the instance id, so an attachment
                // to a machine we cannot resolve stays pending.
                if self.instance_for(&id.machine).is_some() {
                    provisioned.push(id);
                }
            } else {
                removable.push(id);
            }
        }

        if !provisioned.is_empty() {
            let params = self
                .volume_api
                .volume_attachment_params(&provisioned)
                .await?;
            check_batch_len(
                "volume_attachment_params",
                provisioned.len(),
                &params,
            )?;

            let mut groups: BTreeMap<
                ProviderType,
                Vec<VolumeAttachmentParams>,
            > = BTreeMap::new();
            for (id, params) in provisioned.into_iter().zip(params) {
                let Some(params) = params else {
                    self.pending.forget_volume_attachment(&id);
                    self.volume_attachments.remove(&id);
                    continue;
                };
                let params =
                    self.complete_volume_attachment_params(&id, params);
                groups
                    .entry(params.provider.clone())
                    .or_default()
                    .push(params);
            }

            for (pool, group) in groups {
                let provider = match self.registry.lookup(&pool) {
                    Ok(provider) => provider,
                    Err(err) => {
                        warn!(
                            self.log,
                            "no provider for pool; detachment stays pending";
                            "pool" => %pool,
                            InlineErrorChain::new(&err),
                        );
                        continue;
                    }
                };
                if !provider.dynamic {
                    // Detached out of band; just drop the record.
                    removable.extend(group.iter().map(|p| p.id.clone()));
                    continue;
                }
                let group_ids: Vec<VolumeAttachmentId> =
                    group.iter().map(|p| p.id.clone()).collect();
                let results =
                    match provider.volume_source.detach_volumes(&group).await {
                        Ok(results) => results,
                        Err(err) if err.retryable() => {
                            warn!(
                                self.log,
                                "detaching volumes failed; will retry";
                                "pool" => %pool,
                                "attachments" => join_tags(&group_ids),
                                InlineErrorChain::new(&err),
                            );
                            continue;
                        }
                        Err(err) => {
                            return Err(ProvisionerError::Provider {
                                operation: "detach_volumes",
                                tags: join_tags(&group_ids),
                                source: err,
                            });
                        }
                    };
                check_batch_len("detach_volumes", group.len(), &results)?;
                for (params, result) in group.iter().zip(results) {
                    match result {
                        Ok(()) => removable.push(params.id.clone()),
                        Err(err) => warn!(
                            self.log, "detaching volume failed; will retry";
                            "attachment" => %params.id,
                            InlineErrorChain::new(&err),
                        ),
                    }
                }
            }
        }

        self.remove_volume_attachment_records(&removable).await
    }

    /// Removal pass: dying volumes leave the store only once the
    /// dependents query comes back empty. Dependents shrink through
    /// events on *other* entities, which is why this runs every pass.
    pub(super) async fn remove_volumes(
        &mut self,
    ) -> Result<(), ProvisionerError> {
        if self.pending.destroy_volumes.is_empty() {
            return Ok(());
        }
        let tags: Vec<VolumeTag> =
            self.pending.destroy_volumes.iter().cloned().collect();
        let dependents = self.volume_api.volume_dependents(&tags).await?;
        check_batch_len("volume_dependents", tags.len(), &dependents)?;

        let mut removable = Vec::new();
        for (tag, dependents) in tags.into_iter().zip(dependents) {
            match dependents {
                None => {
                    self.pending.forget_volume(&tag);
                    self.volumes.remove(&tag);
                }
                Some(d) if d.is_empty() => removable.push(tag),
                Some(d) => debug!(
                    self.log, "volume not yet removable";
                    "volume" => %tag,
                    "attachments" => d.attachments.len(),
                    "filesystem" => ?d.filesystem,
                ),
            }
        }
        if removable.is_empty() {
            return Ok(());
        }

        let results = self.lifecycle.remove_volumes(&removable).await?;
        check_batch_len("remove_volumes", removable.len(), &results)?;
        for (tag, result) in removable.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    info!(self.log, "volume removed"; "volume" => %tag);
                    self.pending.forget_volume(&tag);
                    self.volumes.remove(&tag);
                }
                Err(err) => warn!(
                    self.log, "removing volume failed; will retry";
                    "volume" => %tag,
                    InlineErrorChain::new(&err),
                ),
            }
        }
        Ok(())
    }

    /// Writes provider-assigned volume info back to the store.
    pub(super) async fn record_provisioned_volumes(
        &mut self,
        created: &[ProvisionedVolume],
    ) -> Result<(), ProvisionerError> {
        if created.is_empty() {
            return Ok(());
        }
        let results = self.volume_api.set_volume_info(created).await?;
        check_batch_len("set_volume_info", created.len(), &results)?;
        for (volume, result) in created.iter().zip(results) {
            match result {
                Ok(()) => {
                    info!(
                        self.log, "volume provisioned";
                        "volume" => %volume.tag,
                        "volume_id" => &volume.info.volume_id,
                    );
                    self.pending.create_volumes.remove(&volume.tag);
                    if let Some(known) = self.volumes.get_mut(&volume.tag) {
                        known.info = Some(volume.info.clone());
                    }
                }
                Err(err) => warn!(
                    self.log, "recording volume info failed; will retry";
                    "volume" => %volume.tag,
                    InlineErrorChain::new(&err),
                ),
            }
        }
        Ok(())
    }

    /// Writes provider-assigned attachment info back to the store.
    pub(super) async fn record_volume_attachments(
        &mut self,
        attached: &[ProvisionedVolumeAttachment],
    ) -> Result<(), ProvisionerError> {
        if attached.is_empty() {
            return Ok(());
        }
        let results =
            self.volume_api.set_volume_attachment_info(attached).await?;
        check_batch_len("set_volume_attachment_info", attached.len(), &results)?;
        for (attachment, result) in attached.iter().zip(results) {
            match result {
                Ok(()) => {
                    info!(
                        self.log, "volume attached";
                        "attachment" => %attachment.id,
                        "device_name" => &attachment.info.device_name,
                    );
                    self.pending.attach_volumes.remove(&attachment.id);
                    self.pending
                        .attached_this_session
                        .insert(attachment.id.clone());
                    if let Some(known) =
                        self.volume_attachments.get_mut(&attachment.id)
                    {
                        known.info = Some(attachment.info.clone());
                    }
                }
                Err(err) => warn!(
                    self.log,
                    "recording volume attachment info failed; will retry";
                    "attachment" => %attachment.id,
                    InlineErrorChain::new(&err),
                ),
            }
        }
        Ok(())
    }

    /// Bookkeeping removal of attachment records, after any provider
    /// detach has succeeded (or was never needed).
    async fn remove_volume_attachment_records(
        &mut self,
        ids: &[VolumeAttachmentId],
    ) -> Result<(), ProvisionerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let results = self.lifecycle.remove_volume_attachments(ids).await?;
        check_batch_len("remove_volume_attachments", ids.len(), &results)?;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(()) => {
                    info!(
                        self.log, "volume attachment removed";
                        "attachment" => %id,
                    );
                    self.pending.forget_volume_attachment(id);
                    self.volume_attachments.remove(id);
                }
                Err(err) => warn!(
                    self.log,
                    "removing volume attachment failed; will retry";
                    "attachment" => %id,
                    InlineErrorChain::new(&err),
                ),
            }
        }
        Ok(())
    }

    /// Pending attachments of the given volumes that could be satisfied
    /// in the same pass as creation, with parameters completed.
    async fn ready_attachments_for(
        &mut self,
        tags: &[VolumeTag],
    ) -> Result<Vec<VolumeAttachmentParams>, ProvisionerError> {
        let ids: Vec<VolumeAttachmentId> = self
            .pending
            .attach_volumes
            .iter()
            .filter(|id| {
                tags.contains(&id.volume)
                    && self.instance_for(&id.machine).is_some()
            })
            .cloned()
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let params = self.volume_api.volume_attachment_params(&ids).await?;
        check_batch_len("volume_attachment_params", ids.len(), &params)?;
        Ok(ids
            .into_iter()
            .zip(params)
            .filter_map(|(id, params)| {
                params
                    .map(|p| self.complete_volume_attachment_params(&id, p))
            })
            .collect())
    }

    /// Fills in the fields the store does not track: the machine's
    /// instance id and the provider's volume id.
    fn complete_volume_attachment_params(
        &self,
        id: &VolumeAttachmentId,
        mut params: VolumeAttachmentParams,
    ) -> VolumeAttachmentParams {
        params.instance_id = self.instance_for(&id.machine);
        if params.volume_id.is_none() {
            params.volume_id = self
                .volumes
                .get(&id.volume)
                .and_then(|v| v.info.as_ref())
                .map(|info| info.volume_id.clone());
        }
        params
    }
}

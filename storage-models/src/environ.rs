// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The slice of the environment configuration the provisioner cares
/// about. Provisioning work is gated on having received this at least
/// once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironConfig {
    /// Unique id of the deployment.
    pub uuid: String,
    /// Key/value tags stamped onto every resource provisioned on the
    /// deployment's behalf.
    pub resource_tags: BTreeMap<String, String>,
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use storage_models::MachineTag;

/// Which slice of the deployment this worker reconciles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    /// Storage scoped to one machine. Only machine-scoped workers serve
    /// volume-backed filesystems, since those derive from block devices
    /// local to the machine.
    Machine { machine: MachineTag },
    /// Deployment-wide storage.
    Environ,
}

impl Scope {
    pub(crate) fn machine(&self) -> Option<&MachineTag> {
        match self {
            Scope::Machine { machine } => Some(machine),
            Scope::Environ => None,
        }
    }
}

/// Worker configuration, handed in by the process manifold. No
/// user-facing flags map onto this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    pub scope: Scope,
    /// Root under which mount points for volume-backed filesystems are
    /// derived.
    pub storage_dir: Utf8PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_serialization_round_trips() {
        let config = ProvisionerConfig {
            scope: Scope::Machine { machine: MachineTag::new("12") },
            storage_dir: "/var/lib/storage".into(),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(
            serde_json::from_str::<ProvisionerConfig>(&json).unwrap(),
            config,
        );

        // The scope tag is stable; agents on older releases parse it.
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["scope"]["kind"], "machine");
        let environ = ProvisionerConfig {
            scope: Scope::Environ,
            storage_dir: "/var/lib/storage".into(),
        };
        let json = serde_json::to_value(&environ).unwrap();
        assert_eq!(json["scope"]["kind"], "environ");
    }
}

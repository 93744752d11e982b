// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a storage entity or attachment.
///
/// Life only ever moves forward: `Alive` -> `Dying` -> `Dead`. Removal
/// of the backing-store record happens out of band once an entity is
/// `Dying`/`Dead` and its dependents are gone; there is no explicit
/// "removed" state here, the entity simply stops being found.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    Alive,
    Dying,
    Dead,
}

impl Life {
    /// True for entities on their way out (`Dying` or `Dead`).
    pub fn is_dead_or_dying(&self) -> bool {
        match self {
            Life::Alive => false,
            Life::Dying | Life::Dead => true,
        }
    }
}

impl fmt::Display for Life {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Life::Alive => "alive",
            Life::Dying => "dying",
            Life::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

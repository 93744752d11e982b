// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed entity tags.
//!
//! Every entity in the authoritative store is named by an opaque,
//! namespaced tag (`volume-<id>`, `filesystem-<id>`, `machine-<id>`).
//! The tag types here keep the bare id internally; `Display` renders the
//! namespaced form and `FromStr` parses it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TagParseError {
    #[error("tag {tag:?} does not carry the {prefix:?} prefix")]
    WrongPrefix { tag: String, prefix: &'static str },
    #[error("tag {tag:?} has an empty id")]
    EmptyId { tag: String },
}

macro_rules! tag_type {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            Hash,
            Ord,
            PartialOrd,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new<S: Into<String>>(id: S) -> Self {
                Self(id.into())
            }

            /// The bare id, without the namespace prefix.
            pub fn id(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }

        impl FromStr for $name {
            type Err = TagParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let id = s.strip_prefix(concat!($prefix, "-")).ok_or_else(
                    || TagParseError::WrongPrefix {
                        tag: s.to_string(),
                        prefix: $prefix,
                    },
                )?;
                if id.is_empty() {
                    return Err(TagParseError::EmptyId { tag: s.to_string() });
                }
                Ok(Self(id.to_string()))
            }
        }
    };
}

tag_type!(VolumeTag, "volume");
tag_type!(FilesystemTag, "filesystem");
tag_type!(MachineTag, "machine");

/// Names a volume attachment: the (machine, volume) pair.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct VolumeAttachmentId {
    pub machine: MachineTag,
    pub volume: VolumeTag,
}

impl fmt::Display for VolumeAttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.machine, self.volume)
    }
}

/// Names a filesystem attachment: the (machine, filesystem) pair.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct FilesystemAttachmentId {
    pub machine: MachineTag,
    pub filesystem: FilesystemTag,
}

impl fmt::Display for FilesystemAttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.machine, self.filesystem)
    }
}

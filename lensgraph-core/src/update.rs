// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Event updates
//!
//! An [`Update`] describes one change to the graph store. It is what a work
//! queue message ultimately carries and what the dispatcher tests for
//! relevance against each analyzer's registered query.

use crate::ids::Uid;
use crate::names::{EdgeName, PropertyName};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar type of a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    String,
    Int64,
    UInt64,
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarKind::String => f.write_str("string"),
            ScalarKind::Int64 => f.write_str("int64"),
            ScalarKind::UInt64 => f.write_str("uint64"),
        }
    }
}

/// A property of an existing node changed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyUpdate {
    pub uid: Uid,
    pub property_name: PropertyName,
}

/// An edge was added between two existing nodes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeUpdate {
    pub src_uid: Uid,
    pub dst_uid: Uid,
    pub forward_edge_name: EdgeName,
    pub reverse_edge_name: EdgeName,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Update {
    StringProperty(PropertyUpdate),
    Int64Property(PropertyUpdate),
    #[serde(rename = "uint64_property")]
    UInt64Property(PropertyUpdate),
    Edge(EdgeUpdate),
}

impl Update {
    /// The uid the graph query is anchored at: the property owner, or the
    /// source of an edge.
    pub fn root_uid(&self) -> Uid {
        match self {
            Update::StringProperty(p) | Update::Int64Property(p) | Update::UInt64Property(p) => {
                p.uid
            }
            Update::Edge(e) => e.src_uid,
        }
    }

    /// Shared view over the three property variants.
    pub fn as_property(&self) -> Option<(ScalarKind, &PropertyUpdate)> {
        match self {
            Update::StringProperty(p) => Some((ScalarKind::String, p)),
            Update::Int64Property(p) => Some((ScalarKind::Int64, p)),
            Update::UInt64Property(p) => Some((ScalarKind::UInt64, p)),
            Update::Edge(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Update::StringProperty(_) => "string_property",
            Update::Int64Property(_) => "int64_property",
            Update::UInt64Property(_) => "uint64_property",
            Update::Edge(_) => "edge",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(raw: u64) -> Uid {
        Uid::new(raw).unwrap()
    }

    #[test]
    fn test_root_uid() {
        let prop = Update::StringProperty(PropertyUpdate {
            uid: uid(42),
            property_name: PropertyName::new("process_name").unwrap(),
        });
        assert_eq!(prop.root_uid(), uid(42));

        let edge = Update::Edge(EdgeUpdate {
            src_uid: uid(1),
            dst_uid: uid(2),
            forward_edge_name: EdgeName::new("children").unwrap(),
            reverse_edge_name: EdgeName::new("parent").unwrap(),
        });
        assert_eq!(edge.root_uid(), uid(1));
        assert!(edge.as_property().is_none());
    }

    #[test]
    fn test_json_shape() {
        let update = Update::UInt64Property(PropertyUpdate {
            uid: uid(7),
            property_name: PropertyName::new("pid").unwrap(),
        });
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "uint64_property");
        assert_eq!(json["uid"], 7);

        let back: Update = serde_json::from_value(json).unwrap();
        assert_eq!(back, update);
    }
}

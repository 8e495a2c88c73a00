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

//! Validated name types
//!
//! Property and edge names are snake_case, node types are PascalCase, both
//! capped at [`MAX_NAME_LEN`] characters. Analyzer names are also used as
//! object-store path segments, so they are restricted to `[A-Za-z0-9_-]`.

use crate::error::CoreError;
use crate::{MAX_ANALYZER_NAME_LEN, MAX_NAME_LEN};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

fn is_snake_case(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    !s.ends_with('_')
        && !s.contains("__")
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn is_pascal_case(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric())
}

fn is_analyzer_name(s: &str) -> bool {
    s.len() <= MAX_ANALYZER_NAME_LEN
        && !s.starts_with('-')
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

macro_rules! validated_name {
    ($(#[$meta:meta])* $name:ident, $kind:literal, $check:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
                let value = value.into();
                let check: fn(&str) -> bool = $check;
                if value.is_empty() || !check(&value) {
                    return Err(CoreError::InvalidName {
                        kind: $kind,
                        value,
                    });
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = CoreError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = CoreError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(name: $name) -> String {
                name.0
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

validated_name!(
    /// Name of a node property, e.g. `process_name`.
    PropertyName,
    "property name",
    |s| s.len() <= MAX_NAME_LEN && is_snake_case(s)
);

validated_name!(
    /// Name of a directed edge, e.g. `children`.
    EdgeName,
    "edge name",
    |s| s.len() <= MAX_NAME_LEN && is_snake_case(s)
);

validated_name!(
    /// Node type label, e.g. `Process`.
    NodeType,
    "node type",
    |s| s.len() <= MAX_NAME_LEN && is_pascal_case(s)
);

validated_name!(
    /// Stable identity of a registered analyzer.
    AnalyzerName,
    "analyzer name",
    is_analyzer_name
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_names() {
        assert!(PropertyName::new("process_name").is_ok());
        assert!(PropertyName::new("pid").is_ok());
        assert!(PropertyName::new("ipv4_addr").is_ok());
        assert!(PropertyName::new("").is_err());
        assert!(PropertyName::new("ProcessName").is_err());
        assert!(PropertyName::new("_leading").is_err());
        assert!(PropertyName::new("trailing_").is_err());
        assert!(PropertyName::new("double__underscore").is_err());
        assert!(PropertyName::new("a".repeat(33)).is_err());
        assert!(PropertyName::new("a".repeat(32)).is_ok());
    }

    #[test]
    fn test_node_types() {
        assert!(NodeType::new("Process").is_ok());
        assert!(NodeType::new("IpConnection").is_ok());
        assert!(NodeType::new("process").is_err());
        assert!(NodeType::new("Ip_Connection").is_err());
    }

    #[test]
    fn test_analyzer_names() {
        assert!(AnalyzerName::new("suspicious-svchost").is_ok());
        assert!(AnalyzerName::new("rare_parent_v2").is_ok());
        assert!(AnalyzerName::new("../escape").is_err());
        assert!(AnalyzerName::new("with/slash").is_err());
        assert!(AnalyzerName::new("-flag").is_err());
    }

    #[test]
    fn test_serde_validates() {
        let name: PropertyName = serde_json::from_str("\"process_name\"").unwrap();
        assert_eq!(name.as_str(), "process_name");
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"process_name\"");
        assert!(serde_json::from_str::<NodeType>("\"lower\"").is_err());
    }
}

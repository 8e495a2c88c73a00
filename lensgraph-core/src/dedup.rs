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

//! Dedup key derivation
//!
//! Keys are part of the persisted cache format. A key is the lowercase hex
//! SHA-256 of:
//!
//! ```text
//! tag || for each field: u64_be(len(field)) || field
//! ```
//!
//! where `tag` is `lensgraph.msg.v1` or `lensgraph.hit.v1`. Length prefixes
//! keep `("ab", "c")` and `("a", "bc")` apart. Integers are hashed as their
//! big-endian bytes.

use crate::ids::Uid;
use crate::names::AnalyzerName;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const MESSAGE_TAG: &[u8] = b"lensgraph.msg.v1";
const HIT_TAG: &[u8] = b"lensgraph.hit.v1";

/// The two logical sets kept by the dedup cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupNamespace {
    MessageSeen,
    HitSeen,
}

impl DedupNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupNamespace::MessageSeen => "message_seen",
            DedupNamespace::HitSeen => "hit_seen",
        }
    }
}

impl fmt::Display for DedupNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    /// `msg_key = hash(analyzer_name, message_id, event_body)`
    pub fn message(analyzer: &AnalyzerName, message_id: &str, body: &[u8]) -> Self {
        Self::digest(
            MESSAGE_TAG,
            &[analyzer.as_str().as_bytes(), message_id.as_bytes(), body],
        )
    }

    /// `hit_key = hash(analyzer_name, idempotency_key, root_uid)`
    pub fn hit(analyzer: &AnalyzerName, idempotency_key: u64, root_uid: Uid) -> Self {
        let idempotency_key = idempotency_key.to_be_bytes();
        let root_uid = root_uid.get().to_be_bytes();
        Self::digest(
            HIT_TAG,
            &[
                analyzer.as_str().as_bytes(),
                idempotency_key.as_slice(),
                root_uid.as_slice(),
            ],
        )
    }

    fn digest(tag: &[u8], fields: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(tag);
        for field in fields {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> AnalyzerName {
        AnalyzerName::new(s).unwrap()
    }

    #[test]
    fn test_message_key_is_stable() {
        let a = DedupKey::message(&name("svchost"), "m-1", b"{}");
        let b = DedupKey::message(&name("svchost"), "m-1", b"{}");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fields_are_length_prefixed() {
        let a = DedupKey::message(&name("ab"), "c", b"");
        let b = DedupKey::message(&name("a"), "bc", b"");
        assert_ne!(a, b);
    }

    #[test]
    fn test_keys_vary_by_every_input() {
        let uid = Uid::new(42).unwrap();
        let base = DedupKey::hit(&name("svchost"), 1, uid);
        assert_ne!(base, DedupKey::hit(&name("other"), 1, uid));
        assert_ne!(base, DedupKey::hit(&name("svchost"), 2, uid));
        assert_ne!(base, DedupKey::hit(&name("svchost"), 1, Uid::new(43).unwrap()));
        assert_ne!(
            DedupKey::message(&name("svchost"), "m-1", b"a"),
            DedupKey::message(&name("svchost"), "m-1", b"b")
        );
    }

    #[test]
    fn test_namespaces_use_distinct_tags() {
        // same raw bytes under both derivations still differ
        let msg = DedupKey::digest(MESSAGE_TAG, &[b"x".as_slice()]);
        let hit = DedupKey::digest(HIT_TAG, &[b"x".as_slice()]);
        assert_ne!(msg, hit);
    }
}

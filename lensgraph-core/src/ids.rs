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

//! Graph node and tenant identifiers

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU64;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a node in the graph store. Zero is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Uid(NonZeroU64);

impl Uid {
    /// Create a uid, rejecting the reserved value `0`.
    pub fn new(raw: u64) -> Result<Self, CoreError> {
        NonZeroU64::new(raw).map(Uid).ok_or(CoreError::ZeroUid)
    }

    /// Raw integer value
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl TryFrom<u64> for Uid {
    type Error = CoreError;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        Uid::new(raw)
    }
}

impl From<Uid> for u64 {
    fn from(uid: Uid) -> u64 {
        uid.get()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tenant identifier carried on every graph and analyzer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Split into the (most, least) significant halves used on the wire.
    pub fn as_u64_pair(&self) -> (u64, u64) {
        self.0.as_u64_pair()
    }

    pub fn from_u64_pair(msb: u64, lsb: u64) -> Self {
        Self(Uuid::from_u64_pair(msb, lsb))
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for TenantId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(TenantId)
            .map_err(|e| CoreError::InvalidTenantId(format!("{}: {}", s, e)))
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_uid_rejected() {
        assert_eq!(Uid::new(0), Err(CoreError::ZeroUid));
        assert_eq!(Uid::new(42).unwrap().get(), 42);
    }

    #[test]
    fn test_uid_serde_rejects_zero() {
        let uid: Uid = serde_json::from_str("7").unwrap();
        assert_eq!(uid.get(), 7);
        assert!(serde_json::from_str::<Uid>("0").is_err());
    }

    #[test]
    fn test_tenant_u64_pair() {
        let tenant = TenantId::new(Uuid::new_v4());
        let (msb, lsb) = tenant.as_u64_pair();
        assert_eq!(TenantId::from_u64_pair(msb, lsb), tenant);
    }

    #[test]
    fn test_tenant_parse() {
        let parsed: TenantId = "7c9e6679-7425-40de-944b-e07fc1f90ae7".parse().unwrap();
        assert_eq!(parsed.to_string(), "7c9e6679-7425-40de-944b-e07fc1f90ae7");
        assert!("not-a-uuid".parse::<TenantId>().is_err());
    }
}

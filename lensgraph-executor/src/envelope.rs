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

//! Work-queue message envelope
//!
//! Message bodies are S3 event notifications; each record points at an
//! object holding one encoded graph update.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Envelope has no records")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Records")]
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Record {
    pub s3: S3Entity,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct S3Object {
    pub key: String,
}

/// Where one update payload lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl Envelope {
    pub fn parse(body: &str) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_str(body)?;
        if envelope.records.is_empty() {
            return Err(EnvelopeError::Empty);
        }
        Ok(envelope)
    }

    pub fn locations(&self) -> impl Iterator<Item = ObjectLocation> + '_ {
        self.records.iter().map(|r| ObjectLocation {
            bucket: r.s3.bucket.name.clone(),
            key: r.s3.object.key.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_notification() {
        let body = r#"{
            "Records": [
                {
                    "eventVersion": "2.1",
                    "eventName": "ObjectCreated:Put",
                    "s3": {
                        "bucket": {"name": "updates", "arn": "arn:aws:s3:::updates"},
                        "object": {"key": "2025/01/01/u-1", "size": 42}
                    }
                }
            ]
        }"#;
        let envelope = Envelope::parse(body).unwrap();
        let locations: Vec<_> = envelope.locations().collect();
        assert_eq!(
            locations,
            vec![ObjectLocation {
                bucket: "updates".into(),
                key: "2025/01/01/u-1".into()
            }]
        );
    }

    #[test]
    fn test_rejects_bad_bodies() {
        assert!(matches!(Envelope::parse("not json"), Err(EnvelopeError::Malformed(_))));
        assert!(matches!(Envelope::parse("{}"), Err(EnvelopeError::Malformed(_))));
        assert!(matches!(
            Envelope::parse(r#"{"Records": []}"#),
            Err(EnvelopeError::Empty)
        ));
    }
}

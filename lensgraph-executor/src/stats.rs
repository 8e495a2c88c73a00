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

//! Pipeline counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineStats {
    messages_received: AtomicU64,
    messages_deleted: AtomicU64,
    messages_timed_out: AtomicU64,
    poison_messages: AtomicU64,
    hits_emitted: AtomicU64,
    misses: AtomicU64,
    analyzer_failures: AtomicU64,
    duplicate_messages: AtomicU64,
    duplicate_hits: AtomicU64,
    emit_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub messages_received: u64,
    pub messages_deleted: u64,
    pub messages_timed_out: u64,
    pub poison_messages: u64,
    pub hits_emitted: u64,
    pub misses: u64,
    pub analyzer_failures: u64,
    pub duplicate_messages: u64,
    pub duplicate_hits: u64,
    pub emit_failures: u64,
}

macro_rules! counters {
    ($($field:ident => $method:ident),* $(,)?) => {
        impl PipelineStats {
            $(
                pub fn $method(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    messages_received => record_received,
    messages_deleted => record_deleted,
    messages_timed_out => record_timeout,
    poison_messages => record_poison,
    hits_emitted => record_hit,
    misses => record_miss,
    analyzer_failures => record_analyzer_failure,
    duplicate_messages => record_duplicate_message,
    duplicate_hits => record_duplicate_hit,
    emit_failures => record_emit_failure,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = PipelineStats::new();
        stats.record_received();
        stats.record_hit();
        stats.record_hit();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.hits_emitted, 2);
        assert_eq!(snapshot.misses, 0);
    }
}

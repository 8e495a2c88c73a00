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

use crate::lease::ScheduleError;
use crate::queue::QueueError;
use lensgraph_plugins::PluginError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required variable {0}")]
    MissingVariable(&'static str),

    #[error("Invalid {variable}: {reason}")]
    Invalid {
        variable: &'static str,
        reason: String,
    },

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Process-level failures, each mapped to an exit code
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid keep-alive schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("Analyzer registry failed to load: {0}")]
    Registry(#[from] PluginError),

    #[error("Work queue failed: {0}")]
    Queue(#[from] QueueError),
}

impl ExecutorError {
    /// `2` for registry load failures, `1` for everything else.
    pub fn exit_code(&self) -> u8 {
        match self {
            ExecutorError::Registry(_) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            ExecutorError::Registry(PluginError::DuplicateAnalyzer("a".into())).exit_code(),
            2
        );
        assert_eq!(
            ExecutorError::Config(ConfigError::MissingVariable("LENSGRAPH_QUEUE_URL")).exit_code(),
            1
        );
        assert_eq!(
            ExecutorError::Queue(QueueError::Fatal("AccessDenied".into())).exit_code(),
            1
        );
    }
}

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

use anyhow::{Context, Result};
use clap::Parser;
use lensgraph_executor::{init_tracing, run, shutdown_signal, ExecutorConfig, ExecutorError, LogFormat};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long, env = "LENSGRAPH_CONFIG")]
    config: Option<PathBuf>,

    /// Work queue URL (overrides config file)
    #[arg(long)]
    queue_url: Option<String>,

    /// Graph query service endpoint (overrides config file)
    #[arg(long)]
    graph_endpoint: Option<String>,

    /// In-flight message limit (overrides config file)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let config = load_config(args);
    init_tracing(config.as_ref().map_or_else(|_| LogFormat::default(), |c| c.runtime.log_format));

    match try_main(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<ExecutorError>()
                .map_or(1, ExecutorError::exit_code);
            tracing::error!(error = %format!("{:#}", e), exit_code = code, "Executor failed");
            ExitCode::from(code)
        }
    }
}

fn load_config(args: Args) -> Result<ExecutorConfig, ExecutorError> {
    let mut config = ExecutorConfig::load(args.config.as_deref())?;

    // Apply CLI overrides
    if let Some(url) = args.queue_url {
        config.queue.url = url;
    }
    if let Some(endpoint) = args.graph_endpoint {
        config.graph.endpoint = endpoint;
    }
    if let Some(concurrency) = args.concurrency {
        config.runtime.concurrency = concurrency;
    }
    if let Some(format) = args.log_format {
        config.runtime.log_format = format;
    }
    Ok(config)
}

fn try_main(config: Result<ExecutorConfig, ExecutorError>) -> Result<()> {
    let config = config?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(run(config, shutdown_signal()))?;
    Ok(())
}

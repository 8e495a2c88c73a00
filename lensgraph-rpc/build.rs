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

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Vendored protoc so builds do not depend on a system install.
    let protoc = protoc_bin_vendored::protoc_bin_path()
        .map_err(|e| format!("vendored protoc not found: {e:?}"))?;
    std::env::set_var("PROTOC", protoc);

    println!("cargo:rerun-if-changed=proto");
    tonic_build::configure().compile(
        &[
            "proto/lensgraph/v1/graph.proto",
            "proto/lensgraph/v1/analyzer.proto",
        ],
        &["proto/"],
    )?;
    Ok(())
}

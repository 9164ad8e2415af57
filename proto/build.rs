/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    generate_grpc_code()?;
    Ok(())
}

fn generate_grpc_code() -> Result<(), Box<dyn Error>> {
    // Generated services use unwrap; suppress the workspace lint there.
    // Message types additionally derive serde so pod and container configs
    // can be persisted as metadata labels and recovered after a restart.
    let tonic_builder = tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .server_mod_attribute("runtime.v1", "#[allow(clippy::unwrap_used)]")
        .client_mod_attribute("runtime.v1", "#[allow(clippy::unwrap_used)]")
        .type_attribute(
            ".runtime.v1",
            "#[derive(serde::Serialize, serde::Deserialize)]",
        );

    tonic_builder
        .compile_protos(&["vendor/runtime/v1/api.proto"], &["vendor/"])?;

    Ok(())
}

/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

use clap::Parser;
use tracing::error;
use vesseld::{logging, run, VesseldOptions};

/// Exit code for successful termination.
const EXIT_OKAY: i32 = 0;
/// Exit code for a runtime error.
const EXIT_ERROR: i32 = 1;

#[tokio::main]
async fn main() {
    let options = VesseldOptions::parse();
    logging::init(options.verbose);

    let code = match run(options).await {
        Ok(()) => EXIT_OKAY,
        Err(e) => {
            error!("{e:?}");
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}

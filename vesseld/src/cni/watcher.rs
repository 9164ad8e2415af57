/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Background sync of the CNI conf directory.

use super::Cni;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, trace, warn};

/// How often the conf directory is polled for changes.
const SYNC_PERIOD: Duration = Duration::from_secs(5);

/// Keep the loaded CNI configuration in sync with the conf directory until
/// shutdown is signalled. Load failures are quiet: an empty or syntactically
/// broken directory simply leaves the network not ready until an operator
/// fixes it.
pub async fn run(cni: Arc<Cni>, mut shutdown: watch::Receiver<()>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("cni conf watcher shutting down");
                return;
            }
            _ = tokio::time::sleep(SYNC_PERIOD) => {}
        }

        match cni.reload() {
            Ok(true) => info!(
                "reloaded cni networks from '{}'",
                cni.conf_dir().display()
            ),
            Ok(false) => trace!("cni conf unchanged"),
            Err(e) => warn!("cni conf reload failed: {e}"),
        }
    }
}

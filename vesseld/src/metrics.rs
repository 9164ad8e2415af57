/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Stats syncer: periodic sweep of snapshot usage into the snapshot store.

use crate::cri::CriService;
use crate::store::snapshot::SnapshotStats;
use crate::store::unix_nanos;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, trace, warn};

/// Sweep snapshot usage every `stats_collect_period_secs` until shutdown.
/// A failed sweep is quiet; the next cycle retries.
pub async fn run(service: Arc<CriService>, mut shutdown: watch::Receiver<()>) {
    let period =
        Duration::from_secs(service.config.stats_collect_period_secs.max(1));
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("stats syncer shutting down");
                return;
            }
            _ = tokio::time::sleep(period) => {}
        }

        sweep(&service).await;
    }
}

/// One snapshot usage sweep. Failures are quiet; the next cycle retries.
pub async fn sweep(service: &CriService) {
    match service.engine.list_snapshot_usage().await {
        Ok(usage) => {
            let now = unix_nanos();
            let entries: HashMap<String, SnapshotStats> = usage
                .into_iter()
                .map(|u| {
                    (
                        u.key,
                        SnapshotStats {
                            size: u.size,
                            inodes_used: u.inodes,
                            timestamp: now,
                        },
                    )
                })
                .collect();
            trace!("snapshot sweep collected {} entries", entries.len());
            service.snapshot_store.replace(entries);
        }
        Err(e) => warn!("snapshot usage sweep failed: {e}"),
    }
}

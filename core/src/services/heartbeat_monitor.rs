use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::coordinator::Coordinator;
use crate::services::election::ElectionState;
use crate::types::now_ms;

/// Background task that marks nodes unreachable once they have been silent
/// for longer than the liveness window
pub async fn heartbeat_monitor(coordinator: Arc<Coordinator>, cancel: CancellationToken) -> Result<()> {
    info!("Starting heartbeat monitor");
    let period = coordinator.config.heartbeat_interval;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }

        match coordinator.mark_stale_nodes().await {
            Ok(count) if count > 0 => {
                info!("Marked {} node(s) as unreachable due to missing heartbeats", count);
            }
            Err(e) => {
                error!("Heartbeat monitor error: {:#}", e);
            }
            _ => {}
        }
    }

    info!("Heartbeat monitor stopped");
    Ok(())
}

impl Coordinator {
    /// Sweep the registry once and persist the result
    pub async fn mark_stale_nodes(&self) -> Result<usize> {
        let Some(local) = self.local().await else {
            return Ok(0);
        };

        let window = self.config.liveness_window().as_millis() as i64;
        let flipped = self.registry.sweep(now_ms(), window, Some(local.uuid)).await;

        let leader = self.elector.current_leader().map(|l| l.uuid);
        if flipped.iter().any(|n| Some(n.uuid) == leader) {
            warn!("Lost contact with the cluster leader, re-electing");
            self.elector.begin_election();
        }
        if !flipped.is_empty()
            || matches!(self.elector.state(), ElectionState::Unknown | ElectionState::Electing)
        {
            self.elector.trigger();
        }

        self.persist_registry().await?;
        Ok(flipped.len())
    }
}

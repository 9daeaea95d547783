use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::info;

use super::ServerPool;
use dashmap::DashMap;

/// Background tick: probes every http pool's unhealthy instances on
/// `health_check_path`, re-marking them healthy on a 2xx. Grounded on the
/// ping-and-recover loop the backend health checker runs, minus the
/// restart/circuit-breaker machinery an HTTP instance the gateway doesn't
/// own can't use — recovery here is entirely the remote instance's doing.
pub async fn run_gateway_health_checker(
    pools: Arc<DashMap<String, ServerPool>>,
    interval: Duration,
    shutdown: Arc<Notify>,
) {
    info!(interval_secs = interval.as_secs(), "gateway health checker started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = shutdown.notified() => {
                info!("gateway health checker shutting down");
                return;
            }
        }

        for entry in pools.iter() {
            if let ServerPool::Http(pool) = entry.value() {
                pool.probe_unhealthy().await;
            }
        }
    }
}

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::modules::jobs::service::JobManager;

/// Periodically purges expired jobs until `shutdown` fires.
pub fn start_sweeper(jobs: JobManager, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    info!(interval_secs = every.as_secs(), "🧹 Starting TTL sweeper");

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("🧹 TTL sweeper stopped");
                    break;
                }
                _ = interval.tick() => {
                    let jobs = jobs.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || jobs.sweep_expired()).await {
                        error!(error = %e, "TTL sweep panicked");
                    }
                }
            }
        }
    })
}

//! Server startup utilities.

use meridian_jobs::{JobServer, WorkerPoolStats};
use tracing::info;

/// Prints the startup banner.
pub fn print_banner() {
    info!(r#"
    __  ___          _     ___
   /  |/  /__  _____(_)___/ (_)___ _____
  / /|_/ / _ \/ ___/ / __  / / __ `/ __ \
 / /  / /  __/ /  / / /_/ / / /_/ / / / /
/_/  /_/\___/_/  /_/\__,_/_/\__,_/_/ /_/

                   Job Server
    "#);
}

/// Formats one line per worker pool.
pub fn pool_summary(stats: &[WorkerPoolStats]) -> Vec<String> {
    stats
        .iter()
        .map(|pool| {
            format!(
                "Pool {:<10} x{:<3} {}",
                pool.id,
                pool.concurrency,
                pool.queues.join(" > ")
            )
        })
        .collect()
}

/// Prints queue and pool layout.
pub fn print_startup_info(server: &JobServer) {
    let separator = "=".repeat(60);
    info!("{}", separator);
    for def in server.registry().definitions() {
        info!("Queue {:<16} tier {:<13} rank {}", def.name, def.tier, def.rank);
    }
    for line in pool_summary(&server.stats()) {
        info!("{}", line);
    }
    info!(
        "Recurring scheduler: {}",
        if server.scheduler().is_some() { "enabled" } else { "disabled" }
    );
    info!("{}", separator);
}

//! Node load figures published under `stats` for placement scoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use hive_state::{ClusterState, NodeStats};

/// 15-minute load average from `/proc/loadavg` content.
pub fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().nth(2)?.parse().ok()
}

/// Fill the memory and swap figures of `stats` from `/proc/meminfo`
/// content. A host without swap reports all of it available.
pub fn parse_meminfo(content: &str, stats: &mut NodeStats) -> Option<()> {
    let field = |name: &str| -> Option<u64> {
        content
            .lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|kb| kb.parse().ok())
    };
    let total = field("MemTotal")?;
    let avail = field("MemAvailable")?;
    let swap_total = field("SwapTotal").unwrap_or(0);
    let swap_free = field("SwapFree").unwrap_or(0);
    stats.mem_total_mb = total / 1024;
    stats.mem_avail = percent(avail, total);
    stats.swap_avail = if swap_total == 0 { 100.0 } else { percent(swap_free, swap_total) };
    Some(())
}

/// Percentage rounded to one decimal, so small jitter does not produce a
/// new generation every interval.
fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 * 1000.0 / whole as f64).round() / 10.0
}

fn read() -> std::io::Result<NodeStats> {
    let mut stats = NodeStats::default();
    let loadavg = std::fs::read_to_string("/proc/loadavg")?;
    stats.load_15m = parse_loadavg(&loadavg).unwrap_or_default();
    let meminfo = std::fs::read_to_string("/proc/meminfo")?;
    if parse_meminfo(&meminfo, &mut stats).is_none() {
        debug!("incomplete /proc/meminfo");
    }
    Ok(stats)
}

/// Refresh the local `stats` record every `interval` until shutdown. The
/// monitor commits it with its next pass.
pub async fn run(cluster: Arc<ClusterState>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        match read() {
            Ok(stats) => {
                if let Err(e) = cluster.local_tree().set_as(&["stats"], &stats) {
                    warn!(error = %e, "cannot publish node stats");
                }
            }
            Err(e) => debug!(error = %e, "node stats unavailable"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
    }
}

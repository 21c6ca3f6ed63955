use std::time::Duration;

use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::debug;

use crate::matchmaking::Matchmaker;

/// Pings every registered connection once per `period`. A connection that
/// has not answered the previous ping by the next tick is evicted.
pub fn spawn_liveness_monitor(matchmaker: Matchmaker, period: Duration) -> JoinHandle<()> {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::spawn(async move {
        loop {
            ticker.tick().await;
            let report = matchmaker.sweep();
            debug!(
                pinged = report.pinged,
                evicted = report.evicted.len(),
                "liveness sweep complete"
            );
        }
    })
}

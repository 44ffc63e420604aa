//! Transport byte counters and the periodic bandwidth sampler

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};

use super::session::MetricsSession;

/// Cumulative bytes moved by the transport layer.
#[derive(Default)]
pub struct ByteCounters {
    sent: CachePadded<AtomicU64>,
    received: CachePadded<AtomicU64>,
}

impl ByteCounters {
    pub fn add_sent(&self, bytes: u64) {
        self.sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: u64) {
        self.received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// `(sent, received)`
    pub fn totals(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.received.load(Ordering::Relaxed),
        )
    }
}

pub fn kbps(delta_bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    delta_bytes as f64 * 8.0 / 1000.0 / secs
}

/// Diff the counters every `period` and append uplink/downlink kbps to the
/// session while it runs. Runs until aborted.
pub(crate) async fn run_sampler(
    counters: Arc<ByteCounters>,
    session: Arc<Mutex<MetricsSession>>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = counters.totals();
    let mut last_at = Instant::now();

    loop {
        ticker.tick().await;
        let now = Instant::now();
        let totals = counters.totals();
        let elapsed = now - last_at;
        let uplink = kbps(totals.0.saturating_sub(last.0), elapsed);
        let downlink = kbps(totals.1.saturating_sub(last.1), elapsed);
        last = totals;
        last_at = now;

        ::metrics::gauge!("argus_uplink_kbps").set(uplink);
        ::metrics::gauge!("argus_downlink_kbps").set(downlink);

        let mut session = session.lock();
        if session.running {
            session.uplink_kbps.push(uplink);
            session.downlink_kbps.push(downlink);
        }
    }
}

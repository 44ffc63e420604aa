//! Measurement sessions: sample arrays, summary statistics and export

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::bandwidth::{run_sampler, ByteCounters};
use crate::inference::InferenceTiming;
use crate::utils::SessionClock;
use crate::{InferenceMode, MetricsConfig};

/// Raw samples collected while a session runs.
#[derive(Debug, Default)]
pub struct MetricsSession {
    pub running: bool,
    /// Bumped by every start
    pub generation: u64,
    pub started_ms: f64,
    pub e2e_ms: Vec<f64>,
    pub network_ms: Vec<f64>,
    pub server_ms: Vec<f64>,
    pub processed_fps: Vec<f64>,
    pub uplink_kbps: Vec<f64>,
    pub downlink_kbps: Vec<f64>,
}

impl MetricsSession {
    fn reset(&mut self, started_ms: f64) {
        *self = Self {
            running: true,
            generation: self.generation.wrapping_add(1),
            started_ms,
            ..Self::default()
        };
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Stat {
    pub median: f64,
    pub p95: f64,
}

impl Stat {
    /// `median = sorted[n/2]`, `p95 = sorted[floor(0.95n) - 1]` falling back
    /// to the last element. Empty input gives zeros.
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        let last = sorted[n - 1];
        let p95 = ((0.95 * n as f64).floor() as usize)
            .checked_sub(1)
            .and_then(|i| sorted.get(i).copied())
            .unwrap_or(last);
        Self {
            median: sorted[n / 2],
            p95,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SampleCounts {
    pub e2e: usize,
    pub network: usize,
    pub server: usize,
    pub fps: usize,
    pub bandwidth: usize,
}

/// One record per session, written as JSON on stop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub mode: InferenceMode,
    pub duration_s: f64,
    pub samples: SampleCounts,
    pub e2e_latency_ms: Stat,
    pub network_latency_ms: Stat,
    pub server_latency_ms: Stat,
    pub processed_fps: Stat,
    pub uplink_kbps: Stat,
    pub downlink_kbps: Stat,
}

impl MetricsSummary {
    pub fn empty(mode: InferenceMode) -> Self {
        Self::from_session(mode, &MetricsSession::default(), 0.0)
    }

    fn from_session(mode: InferenceMode, session: &MetricsSession, duration_s: f64) -> Self {
        Self {
            mode,
            duration_s,
            samples: SampleCounts {
                e2e: session.e2e_ms.len(),
                network: session.network_ms.len(),
                server: session.server_ms.len(),
                fps: session.processed_fps.len(),
                bandwidth: session.uplink_kbps.len(),
            },
            e2e_latency_ms: Stat::from_samples(&session.e2e_ms),
            network_latency_ms: Stat::from_samples(&session.network_ms),
            server_latency_ms: Stat::from_samples(&session.server_ms),
            processed_fps: Stat::from_samples(&session.processed_fps),
            uplink_kbps: Stat::from_samples(&session.uplink_kbps),
            downlink_kbps: Stat::from_samples(&session.downlink_kbps),
        }
    }
}

struct Tasks {
    sampler: Option<JoinHandle<()>>,
    auto_stop: Option<JoinHandle<()>>,
}

struct Inner {
    mode: InferenceMode,
    bandwidth_interval: Duration,
    output: Option<PathBuf>,
    clock: SessionClock,
    counters: Arc<ByteCounters>,
    session: Arc<Mutex<MetricsSession>>,
    tasks: Mutex<Tasks>,
}

/// `Idle -> Running -> Idle` measurement window shared by the render loop,
/// the dispatcher and the bandwidth sampler.
#[derive(Clone)]
pub struct MetricsAggregator {
    inner: Arc<Inner>,
}

impl MetricsAggregator {
    pub fn new(
        mode: InferenceMode,
        config: &MetricsConfig,
        counters: Arc<ByteCounters>,
        clock: SessionClock,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                mode,
                bandwidth_interval: Duration::from_millis(config.bandwidth_interval_ms.max(1)),
                output: config.output.clone(),
                clock,
                counters,
                session: Arc::new(Mutex::new(MetricsSession::default())),
                tasks: Mutex::new(Tasks {
                    sampler: None,
                    auto_stop: None,
                }),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.session.lock().running
    }

    pub fn counters(&self) -> &Arc<ByteCounters> {
        &self.inner.counters
    }

    /// Reset all arrays and begin sampling. A running session is restarted.
    /// With `duration` set the session stops itself.
    pub fn start(&self, duration: Option<Duration>) {
        let mut tasks = self.inner.tasks.lock();
        abort_tasks(&mut tasks);

        let generation = {
            let mut session = self.inner.session.lock();
            session.reset(self.inner.clock.now_ms());
            session.generation
        };
        tasks.sampler = Some(tokio::spawn(run_sampler(
            self.inner.counters.clone(),
            self.inner.session.clone(),
            self.inner.bandwidth_interval,
        )));
        if let Some(duration) = duration {
            let this = self.clone();
            tasks.auto_stop = Some(tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                this.finish(Some(generation));
            }));
        }
        info!(
            mode = %self.inner.mode,
            ?duration,
            "Metrics session started"
        );
    }

    /// End the session and emit its summary. Idle sessions log an all-zero
    /// summary and leave the arrays and the output file untouched.
    pub fn stop(&self) -> MetricsSummary {
        self.finish(None)
    }

    /// Stop the running session, or only generation `expected` when given.
    /// A superseded auto-stop finds a newer generation and does nothing.
    fn finish(&self, expected: Option<u64>) -> MetricsSummary {
        let mut tasks = self.inner.tasks.lock();
        let summary = {
            let mut session = self.inner.session.lock();
            if expected.is_some_and(|generation| generation != session.generation) {
                return MetricsSummary::empty(self.inner.mode);
            }
            if !session.running {
                None
            } else {
                session.running = false;
                let duration_s = (self.inner.clock.now_ms() - session.started_ms).max(0.0) / 1000.0;
                Some(MetricsSummary::from_session(self.inner.mode, &session, duration_s))
            }
        };
        abort_tasks(&mut tasks);
        drop(tasks);

        match summary {
            Some(summary) => {
                self.emit(&summary, true);
                summary
            }
            None => {
                info!("Metrics session was not running");
                let summary = MetricsSummary::empty(self.inner.mode);
                self.emit(&summary, false);
                summary
            }
        }
    }

    fn emit(&self, summary: &MetricsSummary, export: bool) {
        let json = match serde_json::to_string_pretty(summary) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize metrics summary: {}", e);
                return;
            }
        };
        info!("Metrics summary:\n{}", json);
        if !export {
            return;
        }
        if let Some(path) = &self.inner.output {
            match std::fs::write(path, &json) {
                Ok(()) => info!("Metrics written to {}", path.display()),
                Err(e) => warn!("Failed to write {}: {}", path.display(), e),
            }
        }
    }

    /// Per-render-tick samples.
    pub fn record_render(&self, e2e_ms: Option<f64>, processed_fps: f64) {
        let mut session = self.inner.session.lock();
        if !session.running {
            return;
        }
        if let Some(e2e) = e2e_ms {
            session.e2e_ms.push(e2e);
        }
        session.processed_fps.push(processed_fps);
    }

    /// Latency split of one completed round trip.
    pub fn record_inference(&self, timing: &InferenceTiming) {
        let mut session = self.inner.session.lock();
        if !session.running {
            return;
        }
        if let Some(server) = timing.server_ms() {
            session.server_ms.push(server);
        }
        if let Some(network) = timing.network_ms() {
            session.network_ms.push(network);
        }
    }

    #[cfg(test)]
    pub(crate) fn push_e2e(&self, sample: f64) {
        self.inner.session.lock().e2e_ms.push(sample);
    }
}

fn abort_tasks(tasks: &mut Tasks) {
    if let Some(task) = tasks.sampler.take() {
        task.abort();
    }
    if let Some(task) = tasks.auto_stop.take() {
        task.abort();
    }
}

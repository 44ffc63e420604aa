//! Argus: live video with frame-aligned object detection overlays

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use argus::capture::{synthetic, FrameSlot, MetadataSlot};
use argus::inference::{InferenceBackend, LabelMap, RemoteBackend};
use argus::metrics::{ByteCounters, MetricsAggregator};
use argus::pipeline::Pipeline;
use argus::utils::SessionClock;
use argus::{Config, InferenceMode, SourceKind};
use clap::{Parser, ValueEnum};
use color_eyre::Result;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "argus", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Inference backend
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Run a metrics session of this many seconds, then exit
    #[arg(long)]
    metrics_seconds: Option<u64>,

    /// Remote inference endpoint
    #[arg(long)]
    remote_url: Option<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Local,
    Remote,
}

impl From<Mode> for InferenceMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Local => InferenceMode::Local,
            Mode::Remote => InferenceMode::Remote,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("argus=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(mode) = args.mode {
        config.inference.mode = mode.into();
    }
    if let Some(url) = args.remote_url {
        config.inference.remote_url = url;
    }

    info!("Argus launching in {} mode", config.inference.mode);

    let clock = SessionClock::new();
    let frames = Arc::new(FrameSlot::new());
    let metadata = Arc::new(MetadataSlot::new());
    let capture = start_capture(&config, frames.clone(), metadata.clone(), clock)?;

    // Only the remote transport feeds these; local sessions report zero bandwidth.
    let counters = Arc::new(ByteCounters::default());
    let backend = build_backend(&config, &counters, clock)?;
    let metrics = MetricsAggregator::new(config.inference.mode, &config.metrics, counters, clock);

    let pipeline = Pipeline::new(&config, clock, frames, metadata, backend, metrics);
    let (mut handle, rendered) = pipeline.spawn();

    // Stand-in for a display: report what would be drawn
    let overlay = tokio::spawn(async move {
        while let Ok(frame) = rendered.recv_async().await {
            if frame.matched {
                debug!(
                    frame_id = frame.frame_id,
                    boxes = frame.boxes.len(),
                    "Overlay: {}",
                    frame
                        .boxes
                        .iter()
                        .map(|b| b.text.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            if frame.hud_updated {
                debug!(
                    e2e_ms = frame.hud.e2e_latency_ms,
                    fps = frame.hud.processed_fps,
                    "HUD"
                );
            }
        }
    });

    let session = args.metrics_seconds.map(Duration::from_secs);
    if session.is_some() {
        handle.metrics().start(None);
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted");
        }
        _ = wait_for(session) => {
            handle.metrics().stop();
        }
    }

    handle.shutdown().await;
    capture.stop().await;
    overlay.abort();

    let stats = handle.alignment_stats();
    info!(
        inserted = stats.inserted,
        taken = stats.taken,
        superseded = stats.superseded,
        evicted = stats.evicted,
        "Alignment buffer"
    );
    info!("Argus stopped");
    Ok(())
}

async fn wait_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Running capture producer.
struct Capture {
    task: JoinHandle<()>,
    #[cfg(feature = "v4l2")]
    stop: Option<Arc<std::sync::atomic::AtomicBool>>,
}

impl Capture {
    async fn stop(self) {
        #[cfg(feature = "v4l2")]
        {
            if let Some(stop) = &self.stop {
                stop.store(true, std::sync::atomic::Ordering::Release);
            }
        }
        self.task.abort();
        let _ = self.task.await;
    }
}

fn start_capture(
    config: &Config,
    frames: Arc<FrameSlot>,
    metadata: Arc<MetadataSlot>,
    clock: SessionClock,
) -> Result<Capture> {
    match config.capture.source {
        SourceKind::Synthetic => Ok(Capture {
            task: tokio::spawn(synthetic::run_test_pattern(
                config.capture.clone(),
                frames,
                metadata,
                clock,
            )),
            #[cfg(feature = "v4l2")]
            stop: None,
        }),
        #[cfg(feature = "v4l2")]
        SourceKind::V4l2 => {
            let mut capture_config = config.capture.clone();
            if capture_config.device.is_empty() {
                let (device, format) = argus::utils::auto_detect_device()?;
                capture_config.device = device;
                capture_config.format = format;
            }
            info!("Using capture device: {}", capture_config.device);

            let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let flag = stop.clone();
            let task = tokio::task::spawn_blocking(move || {
                if let Err(e) =
                    argus::capture::v4l2::run_capture(capture_config, frames, metadata, clock, flag)
                {
                    tracing::error!("Capture stopped: {}", e);
                }
            });
            Ok(Capture {
                task,
                stop: Some(stop),
            })
        }
        #[cfg(not(feature = "v4l2"))]
        SourceKind::V4l2 => Err(color_eyre::eyre::eyre!(
            "built without the `v4l2` feature"
        )),
    }
}

fn build_backend(
    config: &Config,
    counters: &Arc<ByteCounters>,
    clock: SessionClock,
) -> Result<Box<dyn InferenceBackend>> {
    match config.inference.mode {
        InferenceMode::Remote => {
            info!("Remote inference via {}", config.inference.remote_url);
            let labels = LabelMap::from_config(config.decode.labels.as_deref());
            Ok(Box::new(RemoteBackend::new(
                &config.inference,
                labels,
                counters.clone(),
                clock,
            )))
        }
        #[cfg(feature = "onnx")]
        InferenceMode::Local => {
            use argus::inference::onnx::OrtRunner;
            use argus::inference::{LocalBackend, ModelHandle};

            let model = ModelHandle::new(OrtRunner::loader(
                config.inference.model_path.clone(),
                config.inference.model_size,
            ));
            if model.load().is_none() {
                tracing::warn!("Model load already in progress");
            }
            Ok(Box::new(LocalBackend::new(
                model,
                config.decode.clone(),
                clock,
            )))
        }
        #[cfg(not(feature = "onnx"))]
        InferenceMode::Local => Err(color_eyre::eyre::eyre!(
            "built without the `onnx` feature"
        )),
    }
}

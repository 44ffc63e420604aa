//! Standalone inference server for remote mode

use std::path::PathBuf;
use std::sync::Arc;

use argus::inference::onnx::OrtRunner;
use argus::server::InferenceServer;
use argus::Config;
use clap::Parser;
use color_eyre::Result;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "argus-server", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:8000
    #[arg(short, long)]
    listen: Option<String>,

    /// ONNX model file
    #[arg(short, long)]
    model: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("argus=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(model) = args.model {
        config.inference.model_path = model;
    }

    let model_path = config.inference.model_path.clone();
    let model_size = config.inference.model_size;
    let runner =
        tokio::task::spawn_blocking(move || OrtRunner::load(&model_path, model_size)).await??;
    let model_name = config
        .inference
        .model_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let server = Arc::new(
        InferenceServer::new(Box::new(runner), config.decode.clone()).with_model_name(model_name),
    );

    let listener = TcpListener::bind(&config.server.listen).await?;
    tokio::select! {
        result = server.serve(listener) => result?,
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted");
        }
    }
    Ok(())
}

//! Pipeline error types

use thiserror::Error;

use crate::inference::ModelStatus;

pub type Result<T> = std::result::Result<T, ArgusError>;

/// How a failure is treated by the pipeline. None of these are fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Backpressure or a not-yet-available resource; never surfaced.
    TransientDrop,
    /// Model load or inference failure.
    Backend,
    /// Remote channel closed, errored or timed out.
    Transport,
    /// Reply payload could not be understood.
    Malformed,
}

#[derive(Debug, Error)]
pub enum ArgusError {
    #[error("model not ready ({0:?})")]
    ModelNotReady(ModelStatus),

    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("unsupported model output shape {0:?}")]
    UnsupportedShape(Vec<usize>),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("inference channel closed")]
    ChannelClosed,

    #[error("no reply within {0:?}")]
    ReplyTimeout(std::time::Duration),

    #[error("malformed reply: {0}")]
    Malformed(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("frame decode: {0}")]
    FrameDecode(String),

    #[error("video source: {0}")]
    Source(String),

    #[error("config: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ArgusError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ArgusError::ModelNotReady(_) => FailureKind::TransientDrop,
            ArgusError::ModelLoad(_)
            | ArgusError::Inference(_)
            | ArgusError::UnsupportedShape(_)
            | ArgusError::Image(_)
            | ArgusError::FrameDecode(_)
            | ArgusError::Source(_)
            | ArgusError::Config(_)
            | ArgusError::Io(_) => FailureKind::Backend,
            ArgusError::WebSocket(_) | ArgusError::ChannelClosed | ArgusError::ReplyTimeout(_) => {
                FailureKind::Transport
            }
            ArgusError::Malformed(_) | ArgusError::Json(_) | ArgusError::Base64(_) => {
                FailureKind::Malformed
            }
        }
    }
}

//! WebSocket inference server answering the remote wire contract

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::SampledFrame;
use crate::inference::local::detect;
use crate::inference::wire::{DetectReply, DetectRequest, ErrorReply, WireDetection};
use crate::inference::{LabelMap, ModelRunner};
use crate::utils::SessionClock;
use crate::{DecodeConfig, Result};

/// Runs one model for every connected client. Requests are served one at a time.
pub struct InferenceServer {
    runner: Mutex<Box<dyn ModelRunner>>,
    tensor: Mutex<Vec<f32>>,
    decode: DecodeConfig,
    labels: LabelMap,
    clock: SessionClock,
    model_name: String,
}

/// Bytes of a request head inspected before choosing health check or handshake.
const MAX_PEEK: usize = 2048;

impl InferenceServer {
    pub fn new(runner: Box<dyn ModelRunner>, decode: DecodeConfig) -> Self {
        let labels = LabelMap::from_config(decode.labels.as_deref());
        Self {
            runner: Mutex::new(runner),
            tensor: Mutex::new(Vec::new()),
            decode,
            labels,
            clock: SessionClock::new(),
            model_name: String::new(),
        }
    }

    /// Name reported by the health endpoint.
    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    pub fn health(&self) -> serde_json::Value {
        serde_json::json!({ "ok": true, "model": self.model_name })
    }

    /// Answer one text message. `None` for messages that are not requests.
    ///
    /// Blocks for the duration of inference.
    pub fn handle_text(&self, text: &str) -> Option<String> {
        let recv_ts = self.clock.now_ms();
        let request: DetectRequest = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                debug!("Ignoring message: {}", e);
                return None;
            }
        };

        let reply = match request.image_bytes() {
            Ok(None) => serde_json::to_string(&ErrorReply {
                frame_id: None,
                error: "missing image_b64".into(),
            }),
            Ok(Some(bytes)) => match self.process(&request, &bytes, recv_ts) {
                Ok(reply) => serde_json::to_string(&reply),
                Err(e) => {
                    warn!(frame_id = request.frame_id, "Request failed: {}", e);
                    serde_json::to_string(&ErrorReply {
                        frame_id: Some(request.frame_id as i64),
                        error: e.to_string(),
                    })
                }
            },
            Err(e) => serde_json::to_string(&ErrorReply {
                frame_id: Some(request.frame_id as i64),
                error: e.to_string(),
            }),
        };

        match reply {
            Ok(json) => Some(json),
            Err(e) => {
                error!("Failed to serialize reply: {}", e);
                None
            }
        }
    }

    fn process(&self, request: &DetectRequest, jpeg: &[u8], recv_ts: f64) -> Result<DetectReply> {
        let image = image::load_from_memory(jpeg)?.to_rgb8();
        let frame = SampledFrame {
            width: image.width(),
            height: image.height(),
            data: image.into_raw(),
        };

        let (detections, inference_ms) = {
            let mut runner = self.runner.lock();
            let mut tensor = self.tensor.lock();
            detect(
                &mut **runner,
                &frame,
                &mut tensor,
                &self.decode,
                &self.labels,
            )?
        };
        ::metrics::histogram!("argus_server_inference_ms").record(inference_ms);

        Ok(DetectReply {
            frame_id: request.frame_id as i64,
            capture_ts: request.capture_ts,
            server_recv_ts: Some(recv_ts),
            recv_ts: Some(recv_ts),
            inference_ts: self.clock.now_ms(),
            inference_ms,
            detections: detections.iter().map(WireDetection::from).collect(),
        })
    }

    /// Accept clients until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Inference server listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.connection(stream, peer).await {
                    warn!(%peer, "Connection ended: {}", e);
                }
            });
        }
    }

    #[instrument(skip(self, stream))]
    async fn connection(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if !wants_upgrade(&stream).await? {
            return self.answer_health(&mut stream).await;
        }
        let mut ws = tokio_tungstenite::accept_async(stream).await?;
        info!("Client connected");

        while let Some(message) = ws.next().await {
            let text = match message? {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            let server = self.clone();
            let reply = tokio::task::spawn_blocking(move || server.handle_text(&text))
                .await
                .map_err(|e| crate::ArgusError::Inference(e.to_string()))?;
            if let Some(reply) = reply {
                ws.send(Message::Text(reply)).await?;
            }
        }
        info!("Client disconnected");
        Ok(())
    }

    /// Plain HTTP liveness reply for anything that is not a WebSocket upgrade.
    async fn answer_health(&self, stream: &mut TcpStream) -> Result<()> {
        let mut head = [0u8; MAX_PEEK];
        let n = stream.peek(&mut head).await?;
        stream.read_exact(&mut head[..n]).await?;

        let body = self.health().to_string();
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        debug!("Answered health check");
        Ok(())
    }
}

/// Peek at the request head until it is complete and report whether it asks
/// for a WebSocket upgrade. Nothing is consumed.
async fn wants_upgrade(stream: &TcpStream) -> Result<bool> {
    let mut head = [0u8; MAX_PEEK];
    for _ in 0..100 {
        let n = stream.peek(&mut head).await?;
        let seen = &head[..n];
        if n == 0 {
            return Ok(false);
        }
        if n == MAX_PEEK || seen.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(is_upgrade(seen));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(is_upgrade(&head))
}

fn is_upgrade(head: &[u8]) -> bool {
    String::from_utf8_lossy(head)
        .lines()
        .filter_map(|line| line.split_once(':'))
        .any(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
        })
}

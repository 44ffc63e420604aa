//! Remote inference over one persistent WebSocket channel

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, warn};

use super::labels::LabelMap;
use super::wire::{parse_server_message, DetectReply, DetectRequest, ServerMessage};
use super::{AlignedResult, BackendKind, InferenceBackend, InferenceTiming};
use crate::capture::{CaptureMetadata, SampledFrame};
use crate::metrics::ByteCounters;
use crate::utils::SessionClock;
use crate::{ArgusError, FailureKind, InferenceConfig, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Remote variant. The channel is opened on first use and re-opened lazily
/// after a transport failure.
pub struct RemoteBackend {
    url: String,
    jpeg_quality: u8,
    reply_timeout: Duration,
    labels: LabelMap,
    channel: Option<WsStream>,
    counters: Arc<ByteCounters>,
    clock: SessionClock,
}

impl RemoteBackend {
    pub fn new(
        config: &InferenceConfig,
        labels: LabelMap,
        counters: Arc<ByteCounters>,
        clock: SessionClock,
    ) -> Self {
        Self {
            url: config.remote_url.clone(),
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
            reply_timeout: Duration::from_millis(config.reply_timeout_ms.max(1)),
            labels,
            channel: None,
            counters,
            clock,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    async fn open(&self) -> Result<WsStream> {
        let (ws, _) = tokio::time::timeout(self.reply_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| ArgusError::ReplyTimeout(self.reply_timeout))??;
        info!("Inference channel open: {}", self.url);
        Ok(ws)
    }

    async fn round_trip(&self, ws: &mut WsStream, request: String, frame_id: u64) -> Result<DetectReply> {
        let sent = request.len() as u64;
        ws.send(Message::Text(request)).await?;
        self.counters.add_sent(sent);

        let deadline = tokio::time::Instant::now() + self.reply_timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, ws.next())
                .await
                .map_err(|_| ArgusError::ReplyTimeout(self.reply_timeout))?;
            let text = match next {
                None | Some(Ok(Message::Close(_))) => return Err(ArgusError::ChannelClosed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(data))) => {
                    self.counters.add_received(data.len() as u64);
                    continue;
                }
                Some(Ok(_)) => continue,
            };
            self.counters.add_received(text.len() as u64);

            match parse_server_message(&text)? {
                ServerMessage::Detections(reply) if reply.frame_id == frame_id as i64 => {
                    return Ok(reply)
                }
                ServerMessage::Detections(reply) => {
                    debug!("Skipping reply for frame {}", reply.frame_id);
                }
                ServerMessage::Error(err) if err.frame_id.map_or(true, |id| id == frame_id as i64) => {
                    return Err(ArgusError::Inference(err.error));
                }
                ServerMessage::Error(_) => {}
            }
        }
    }
}

/// JSON request carrying the frame as base64 JPEG.
pub fn encode_request(frame: &SampledFrame, meta: CaptureMetadata, quality: u8) -> Result<String> {
    let mut jpeg = Vec::with_capacity(frame.data.len() / 8);
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, quality).encode(
        &frame.data,
        frame.width,
        frame.height,
        image::ExtendedColorType::Rgb8,
    )?;
    let request = DetectRequest {
        frame_id: meta.frame_id,
        capture_ts: meta.capture_ts,
        image_b64: Some(STANDARD.encode(&jpeg)),
    };
    Ok(serde_json::to_string(&request)?)
}

#[async_trait]
impl InferenceBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    #[instrument(skip(self, frame), fields(frame_id = meta.frame_id))]
    async fn submit(
        &mut self,
        frame: Arc<SampledFrame>,
        meta: CaptureMetadata,
    ) -> Result<AlignedResult> {
        let request = encode_request(&frame, meta, self.jpeg_quality)?;
        drop(frame);

        let mut ws = match self.channel.take() {
            Some(ws) => ws,
            None => self.open().await?,
        };

        let dispatched_ts = self.clock.now_ms();
        let outcome = self.round_trip(&mut ws, request, meta.frame_id).await;
        match &outcome {
            Err(e) if e.kind() == FailureKind::Transport => {
                warn!("Inference channel dropped: {}", e);
            }
            _ => self.channel = Some(ws),
        }
        let reply = outcome?;

        let completed_ts = self.clock.now_ms();
        Ok(AlignedResult {
            frame_id: meta.frame_id,
            detections: reply.detections(&self.labels),
            inference_ts: reply.inference_ts,
            timing: InferenceTiming {
                capture_ts: meta.capture_ts,
                dispatched_ts,
                server_recv_ts: reply.received_at(),
                server_inference_ts: Some(reply.inference_ts),
                inference_ms: reply.inference_ms,
                completed_ts,
            },
        })
    }

    async fn close(&mut self) {
        if let Some(mut ws) = self.channel.take() {
            if let Err(e) = ws.close(None).await {
                debug!("Closing inference channel: {}", e);
            }
            info!("Inference channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal server: answers each request with the messages from `replies(frame_id)`;
    /// `None` closes the socket.
    async fn serve(
        replies: impl Fn(u64) -> Option<Vec<String>> + Send + Sync + 'static,
    ) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/detect", listener.local_addr().unwrap());
        let replies = Arc::new(replies);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let replies = replies.clone();
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    while let Some(Ok(Message::Text(text))) = ws.next().await {
                        let req: DetectRequest = serde_json::from_str(&text).unwrap();
                        assert!(req.image_bytes().unwrap().is_some());
                        let Some(messages) = replies(req.frame_id) else {
                            return;
                        };
                        for message in messages {
                            ws.send(Message::Text(message)).await.unwrap();
                        }
                    }
                });
            }
        });
        (url, task)
    }

    fn backend(url: String, timeout_ms: u64) -> RemoteBackend {
        let config = InferenceConfig {
            remote_url: url,
            reply_timeout_ms: timeout_ms,
            ..InferenceConfig::default()
        };
        RemoteBackend::new(
            &config,
            LabelMap::coco(),
            Arc::new(ByteCounters::default()),
            SessionClock::new(),
        )
    }

    fn meta(frame_id: u64) -> CaptureMetadata {
        CaptureMetadata {
            frame_id,
            capture_ts: 100.0,
        }
    }

    fn frame() -> Arc<SampledFrame> {
        Arc::new(SampledFrame::new(32, 24))
    }

    #[tokio::test]
    async fn round_trip_reuses_one_channel() {
        let (url, _server) = serve(|id| {
            Some(vec![format!(
                r#"{{"frame_id": {id}, "capture_ts": 100.0, "server_recv_ts": 10.0, "inference_ts": 25.0,
                    "inference_ms": 12.0,
                    "detections": [{{"label": 0, "score": 0.8, "xmin": 0.1, "ymin": 0.1, "xmax": 0.3, "ymax": 0.4}}]}}"#
            )])
        })
        .await;
        let mut remote = backend(url, 2000);
        let counters = remote.counters.clone();

        for id in [1, 2] {
            let result = remote.submit(frame(), meta(id)).await.unwrap();
            assert_eq!(result.frame_id, id);
            assert_eq!(result.detections[0].label, "person");
            assert_eq!(result.timing.server_ms(), Some(15.0));
            assert!(remote.is_connected());
        }
        let (sent, received) = counters.totals();
        assert!(sent > 0 && received > 0);

        remote.close().await;
        remote.close().await;
        assert!(!remote.is_connected());
    }

    #[tokio::test]
    async fn stale_replies_are_skipped() {
        let (url, _server) = serve(|id| {
            Some(vec![
                format!(
                    r#"{{"frame_id": {}, "server_recv_ts": 1.0, "inference_ts": 2.0,
                        "detections": [{{"label": "cat", "score": 0.9, "xmin": 0.1, "ymin": 0.1, "xmax": 0.2, "ymax": 0.2}}]}}"#,
                    id - 1
                ),
                r#"{"error": "overloaded", "frame_id": 1}"#.to_string(),
                format!(r#"{{"frame_id": {id}, "server_recv_ts": 1.0, "inference_ts": 2.0}}"#),
            ])
        })
        .await;
        let mut remote = backend(url, 2000);
        let result = remote.submit(frame(), meta(9)).await.unwrap();
        assert_eq!(result.frame_id, 9);
        assert!(result.detections.is_empty());
    }

    #[tokio::test]
    async fn malformed_reply_keeps_channel() {
        let (url, _server) = serve(|_| Some(vec!["{oops".to_string()])).await;
        let mut remote = backend(url, 2000);
        let err = remote.submit(frame(), meta(1)).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Malformed);
        assert!(remote.is_connected());
    }

    #[tokio::test]
    async fn closed_channel_is_reopened_lazily() {
        let (url, _server) = serve(|id| {
            (id != 1).then(|| {
                vec![format!(
                    r#"{{"frame_id": {id}, "server_recv_ts": 1.0, "inference_ts": 2.0}}"#
                )]
            })
        })
        .await;
        let mut remote = backend(url, 2000);

        let err = remote.submit(frame(), meta(1)).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Transport);
        assert!(!remote.is_connected());

        let result = remote.submit(frame(), meta(2)).await.unwrap();
        assert_eq!(result.frame_id, 2);
        assert!(remote.is_connected());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let (url, _server) = serve(|_| {
            Some(vec![
                r#"{"frame_id": 999, "server_recv_ts": 1.0, "inference_ts": 2.0}"#.to_string(),
            ])
        })
        .await;
        let mut remote = backend(url, 200);
        let err = remote.submit(frame(), meta(1)).await.unwrap_err();
        assert!(matches!(err, ArgusError::ReplyTimeout(_)));
        assert!(!remote.is_connected());
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/detect", listener.local_addr().unwrap());
        drop(listener);
        let mut remote = backend(url, 500);
        let err = remote.submit(frame(), meta(1)).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Transport);
    }
}

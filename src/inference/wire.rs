//! JSON messages of the remote inference channel

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::labels::LabelMap;
use super::Detection;
use crate::{ArgusError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectRequest {
    pub frame_id: u64,
    pub capture_ts: f64,
    #[serde(default)]
    pub image_b64: Option<String>,
}

impl DetectRequest {
    /// Image bytes; accepts plain base64 or a `data:` URL.
    pub fn image_bytes(&self) -> Result<Option<Vec<u8>>> {
        let Some(encoded) = self.image_b64.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let payload = match encoded.split_once(',') {
            Some((_, b64)) => b64,
            None => encoded,
        };
        Ok(Some(STANDARD.decode(payload.trim())?))
    }
}

/// Servers may send class names or numeric class ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireLabel {
    Name(String),
    ClassId(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireDetection {
    pub label: WireLabel,
    pub score: f32,
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl From<&Detection> for WireDetection {
    fn from(d: &Detection) -> Self {
        Self {
            label: WireLabel::Name(d.label.clone()),
            score: d.score,
            xmin: d.xmin,
            ymin: d.ymin,
            xmax: d.xmax,
            ymax: d.ymax,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectReply {
    pub frame_id: i64,
    #[serde(default)]
    pub capture_ts: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_recv_ts: Option<f64>,
    /// Older servers only send this name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recv_ts: Option<f64>,
    pub inference_ts: f64,
    #[serde(default)]
    pub inference_ms: f64,
    #[serde(default)]
    pub detections: Vec<WireDetection>,
}

impl DetectReply {
    pub fn received_at(&self) -> Option<f64> {
        self.server_recv_ts.or(self.recv_ts)
    }

    /// Relative detections; boxes that violate the unit-square invariants are dropped.
    pub fn detections(&self, labels: &LabelMap) -> Vec<Detection> {
        self.detections
            .iter()
            .filter_map(|d| {
                let label = match &d.label {
                    WireLabel::Name(name) => name.clone(),
                    WireLabel::ClassId(id) => labels.label(*id as usize),
                };
                Detection::clamped(label, d.score, d.xmin, d.ymin, d.xmax, d.ymax)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<i64>,
    pub error: String,
}

/// Anything the server may send back.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Detections(DetectReply),
    Error(ErrorReply),
}

pub fn parse_server_message(text: &str) -> Result<ServerMessage> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("error").is_some() {
        return Ok(ServerMessage::Error(serde_json::from_value(value)?));
    }
    serde_json::from_value(value)
        .map(ServerMessage::Detections)
        .map_err(|e| ArgusError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reply_with_numeric_and_named_labels() {
        let text = r#"{
            "frame_id": 5, "capture_ts": 1000.0, "recv_ts": 1010.0, "server_recv_ts": 1010.0,
            "inference_ts": 1030.0, "inference_ms": 18.5,
            "detections": [
                {"label": 16, "score": 0.9, "xmin": 0.1, "ymin": 0.1, "xmax": 0.4, "ymax": 0.5},
                {"label": "cup", "score": 0.6, "xmin": 0.5, "ymin": 0.5, "xmax": 0.7, "ymax": 0.9},
                {"label": "cup", "score": 0.6, "xmin": 0.5, "ymin": 0.5, "xmax": 0.5, "ymax": 0.9}
            ]
        }"#;
        let ServerMessage::Detections(reply) = parse_server_message(text).unwrap() else {
            panic!("expected detections");
        };
        assert_eq!(reply.frame_id, 5);
        assert_eq!(reply.received_at(), Some(1010.0));
        let dets = reply.detections(&LabelMap::coco());
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].label, "dog");
        assert_eq!(dets[1].label, "cup");
    }

    #[test]
    fn recv_ts_alias_alone_is_enough() {
        let text = r#"{"frame_id": 1, "recv_ts": 3.0, "inference_ts": 4.0}"#;
        let ServerMessage::Detections(reply) = parse_server_message(text).unwrap() else {
            panic!("expected detections");
        };
        assert_eq!(reply.received_at(), Some(3.0));
    }

    #[test]
    fn error_and_malformed_messages() {
        assert!(matches!(
            parse_server_message(r#"{"frame_id": 3, "error": "bad image"}"#).unwrap(),
            ServerMessage::Error(ErrorReply {
                frame_id: Some(3),
                ..
            })
        ));
        let err = parse_server_message("not json").unwrap_err();
        assert_eq!(err.kind(), crate::FailureKind::Malformed);
        let err = parse_server_message(r#"{"frame_id": "x"}"#).unwrap_err();
        assert_eq!(err.kind(), crate::FailureKind::Malformed);
    }

    #[test]
    fn request_image_accepts_data_urls() {
        let mut req = DetectRequest {
            frame_id: 1,
            capture_ts: 0.0,
            image_b64: Some(format!("data:image/jpeg;base64,{}", STANDARD.encode([1u8, 2, 3]))),
        };
        assert_eq!(req.image_bytes().unwrap().unwrap(), vec![1, 2, 3]);
        req.image_b64 = Some(STANDARD.encode([9u8]));
        assert_eq!(req.image_bytes().unwrap().unwrap(), vec![9]);
        req.image_b64 = Some(String::new());
        assert!(req.image_bytes().unwrap().is_none());
    }
}

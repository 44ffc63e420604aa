//! Raw model output to relative-coordinate detections

use super::labels::LabelMap;
use super::letterbox::Letterbox;
use super::{Detection, RawInferenceOutput};
use crate::{ArgusError, Result};

/// Output tensor layouts we know how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    /// `[1, 4+C, N]`: rows are cx, cy, w, h, then C class scores
    ChannelsFirst { classes: usize, candidates: usize },
    /// `[1, N, 4+C]`
    ChannelsLast { classes: usize, candidates: usize },
    /// `[N, 6]` or `[1, N, 6]`: x1, y1, x2, y2, score, class
    Flat { candidates: usize },
}

impl OutputLayout {
    pub fn detect(shape: &[usize]) -> Result<Self> {
        match *shape {
            [n, 6] | [1, n, 6] => Ok(OutputLayout::Flat { candidates: n }),
            [1, a, b] if a >= 5 && b > a => Ok(OutputLayout::ChannelsFirst {
                classes: a - 4,
                candidates: b,
            }),
            [1, a, b] if b >= 5 => Ok(OutputLayout::ChannelsLast {
                classes: b - 4,
                candidates: a,
            }),
            _ => Err(ArgusError::UnsupportedShape(shape.to_vec())),
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Decode `raw` into unfiltered detections.
///
/// Candidates scoring below `score_floor` and boxes that collapse after
/// clamping are discarded. Class scores outside [0, 1] are treated as logits.
pub fn decode(
    raw: &RawInferenceOutput,
    letterbox: &Letterbox,
    score_floor: f32,
    labels: &LabelMap,
) -> Result<Vec<Detection>> {
    let layout = OutputLayout::detect(&raw.shape)?;
    let expected = raw.shape.iter().product::<usize>();
    if raw.data.len() < expected {
        return Err(ArgusError::Inference(format!(
            "output has {} values, shape {:?} needs {}",
            raw.data.len(),
            raw.shape,
            expected
        )));
    }

    let data = &raw.data;
    let mut out = Vec::new();
    match layout {
        OutputLayout::ChannelsFirst {
            classes,
            candidates,
        } => {
            let at = |row: usize, i: usize| data[row * candidates + i];
            let logits = (0..classes)
                .flat_map(|c| (0..candidates).map(move |i| (c, i)))
                .any(|(c, i)| !(0.0..=1.0).contains(&at(4 + c, i)));
            for i in 0..candidates {
                let scores = (0..classes).map(|c| at(4 + c, i));
                push_candidate(
                    &mut out,
                    [at(0, i), at(1, i), at(2, i), at(3, i)],
                    scores,
                    logits,
                    letterbox,
                    score_floor,
                    labels,
                );
            }
        }
        OutputLayout::ChannelsLast {
            classes,
            candidates,
        } => {
            let stride = 4 + classes;
            let logits = (0..candidates).any(|i| {
                data[i * stride + 4..(i + 1) * stride]
                    .iter()
                    .any(|s| !(0.0..=1.0).contains(s))
            });
            for i in 0..candidates {
                let row = &data[i * stride..(i + 1) * stride];
                push_candidate(
                    &mut out,
                    [row[0], row[1], row[2], row[3]],
                    row[4..].iter().copied(),
                    logits,
                    letterbox,
                    score_floor,
                    labels,
                );
            }
        }
        OutputLayout::Flat { candidates } => {
            for row in data.chunks_exact(6).take(candidates) {
                let score = row[4];
                if !(score >= score_floor) {
                    continue;
                }
                let class = row[5].max(0.0).round() as usize;
                let (xmin, ymin) = letterbox.to_relative(row[0], row[1]);
                let (xmax, ymax) = letterbox.to_relative(row[2], row[3]);
                if let Some(d) =
                    Detection::clamped(labels.label(class), score, xmin, ymin, xmax, ymax)
                {
                    out.push(d);
                }
            }
        }
    }
    Ok(out)
}

fn push_candidate(
    out: &mut Vec<Detection>,
    [cx, cy, w, h]: [f32; 4],
    scores: impl Iterator<Item = f32>,
    logits: bool,
    letterbox: &Letterbox,
    score_floor: f32,
    labels: &LabelMap,
) {
    let Some((class, score)) = scores
        .map(|s| if logits { sigmoid(s) } else { s })
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (c, s)| match best {
            Some((_, bs)) if bs >= s => best,
            _ => Some((c, s)),
        })
    else {
        return;
    };
    if !(score >= score_floor) {
        return;
    }

    let (xmin, ymin) = letterbox.to_relative(cx - w / 2.0, cy - h / 2.0);
    let (xmax, ymax) = letterbox.to_relative(cx + w / 2.0, cy + h / 2.0);
    if let Some(d) = Detection::clamped(labels.label(class), score, xmin, ymin, xmax, ymax) {
        out.push(d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn channels_first(boxes: &[[f32; 4]], scores: &[Vec<f32>]) -> RawInferenceOutput {
        let n = boxes.len();
        let c = scores[0].len();
        let mut data = vec![0.0; (4 + c) * n];
        for (i, b) in boxes.iter().enumerate() {
            for r in 0..4 {
                data[r * n + i] = b[r];
            }
            for (k, s) in scores[i].iter().enumerate() {
                data[(4 + k) * n + i] = *s;
            }
        }
        RawInferenceOutput {
            shape: vec![1, 4 + c, n],
            data,
        }
    }

    #[test]
    fn layout_detection() {
        assert_eq!(
            OutputLayout::detect(&[1, 84, 2100]).unwrap(),
            OutputLayout::ChannelsFirst {
                classes: 80,
                candidates: 2100
            }
        );
        assert_eq!(
            OutputLayout::detect(&[1, 2100, 84]).unwrap(),
            OutputLayout::ChannelsLast {
                classes: 80,
                candidates: 2100
            }
        );
        assert_eq!(
            OutputLayout::detect(&[300, 6]).unwrap(),
            OutputLayout::Flat { candidates: 300 }
        );
        assert!(OutputLayout::detect(&[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn channels_first_inverts_letterbox() {
        // 640x480 source in a 320 model: scale 0.5, dy = 40
        let lb = Letterbox::new(320, 640, 480);
        // candidate 0 box covers source (160..480, 120..360), class 1 wins.
        // candidate 1 is below the floor. Both rows padded out to N > 4+C.
        let raw = channels_first(
            &[
                [160.0, 160.0, 160.0, 120.0],
                [10.0, 10.0, 5.0, 5.0],
                [0.0; 4],
                [0.0; 4],
                [0.0; 4],
                [0.0; 4],
                [0.0; 4],
            ],
            &[
                vec![0.1, 0.9],
                vec![0.2, 0.1],
                vec![0.0, 0.0],
                vec![0.0, 0.0],
                vec![0.0, 0.0],
                vec![0.0, 0.0],
                vec![0.0, 0.0],
            ],
        );
        let dets = decode(&raw, &lb, 0.25, &LabelMap::coco()).unwrap();
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!(d.label, "bicycle");
        assert!((d.score - 0.9).abs() < 1e-6);
        assert!((d.xmin - 0.25).abs() < 1e-6);
        assert!((d.xmax - 0.75).abs() < 1e-6);
        assert!((d.ymin - 0.25).abs() < 1e-6);
        assert!((d.ymax - 0.75).abs() < 1e-6);
    }

    #[test]
    fn logits_go_through_sigmoid() {
        let lb = Letterbox::new(100, 100, 100);
        let mut boxes = vec![[50.0, 50.0, 20.0, 20.0]];
        let mut scores = vec![vec![3.0, -2.0]];
        for _ in 0..6 {
            boxes.push([0.0; 4]);
            scores.push(vec![-9.0, -9.0]);
        }
        let raw = channels_first(&boxes, &scores);
        let dets = decode(&raw, &lb, 0.25, &LabelMap::coco()).unwrap();
        assert_eq!(dets.len(), 1);
        assert!((dets[0].score - sigmoid(3.0)).abs() < 1e-6);
        assert_eq!(dets[0].label, "person");
    }

    #[test]
    fn channels_last_matches_channels_first() {
        let lb = Letterbox::new(100, 100, 100);
        let raw = RawInferenceOutput {
            shape: vec![1, 10, 7],
            data: {
                let mut d = vec![0.0; 10 * 7];
                d[..7].copy_from_slice(&[50.0, 50.0, 20.0, 40.0, 0.3, 0.8, 0.1]);
                d
            },
        };
        let dets = decode(&raw, &lb, 0.25, &LabelMap::coco()).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].label, "bicycle");
        assert!((dets[0].ymin - 0.3).abs() < 1e-6);
    }

    #[test]
    fn flat_layout_and_degenerate_boxes() {
        let lb = Letterbox::new(100, 200, 100);
        // scale 0.5, dy = 25
        let raw = RawInferenceOutput {
            shape: vec![3, 6],
            data: vec![
                0.0, 25.0, 50.0, 75.0, 0.9, 2.0, // left half of the source
                10.0, 30.0, 10.0, 60.0, 0.9, 0.0, // zero width
                0.0, 25.0, 50.0, 75.0, 0.1, 0.0, // below floor
            ],
        };
        let dets = decode(&raw, &lb, 0.25, &LabelMap::coco()).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].label, "car");
        assert_eq!(
            (dets[0].xmin, dets[0].ymin, dets[0].xmax, dets[0].ymax),
            (0.0, 0.0, 0.5, 1.0)
        );
    }

    #[test]
    fn short_buffer_is_an_error() {
        let lb = Letterbox::new(100, 100, 100);
        let raw = RawInferenceOutput {
            shape: vec![4, 6],
            data: vec![0.0; 6],
        };
        assert!(decode(&raw, &lb, 0.25, &LabelMap::coco()).is_err());
    }

    proptest! {
        #[test]
        fn decoded_coordinates_are_valid(
            values in prop::collection::vec(-50.0f32..400.0, 6 * 40),
            src_w in 1u32..2000,
            src_h in 1u32..2000,
        ) {
            let lb = Letterbox::new(320, src_w, src_h);
            let raw = RawInferenceOutput { shape: vec![1, 6, 40], data: values };
            let dets = decode(&raw, &lb, 0.25, &LabelMap::coco()).unwrap();
            for d in dets {
                prop_assert!(0.0 <= d.xmin && d.xmin < d.xmax && d.xmax <= 1.0);
                prop_assert!(0.0 <= d.ymin && d.ymin < d.ymax && d.ymax <= 1.0);
                prop_assert!(0.0 <= d.score && d.score <= 1.0);
            }
        }
    }
}

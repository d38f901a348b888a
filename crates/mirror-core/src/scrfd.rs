//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides followed by NMS. Only boxes are
//! decoded; presence detection has no use for landmarks.

use crate::detector::{DetectorError, FaceDetector};
use crate::types::BoundingBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: usize = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Detection in frame coordinates before integer conversion.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &Candidate) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 { inter / union } else { 0.0 }
    }

    /// Clamp to the frame and round to whole pixels.
    fn to_box(self, width: u32, height: u32) -> BoundingBox {
        let x1 = self.x1.clamp(0.0, width as f32).round();
        let y1 = self.y1.clamp(0.0, height as f32).round();
        let x2 = self.x2.clamp(0.0, width as f32).round();
        let y2 = self.y2.clamp(0.0, height as f32).round();
        BoundingBox {
            x: x1 as i32,
            y: y1 as i32,
            width: (x2 - x1).max(0.0) as u32,
            height: (y2 - y1).max(0.0) as u32,
        }
    }
}

/// Scale and padding applied when fitting a frame into the square input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (INPUT_SIZE as f32 - new_w) / 2.0,
            pad_y: (INPUT_SIZE as f32 - new_h) / 2.0,
        }
    }

    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride: (scores, boxes).
type StrideOutputs = (usize, usize);

/// SCRFD detector session.
pub struct ScrfdDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from `model_path`.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }

        let outputs = map_outputs(&names);
        tracing::info!(path = %model_path.display(), ?outputs, "loaded SCRFD model");

        Ok(Self { session, outputs })
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
        min_size: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let (w, h) = (width as usize, height as usize);
        if w == 0 || h == 0 || gray.len() < w * h {
            return Err(DetectorError::InferenceFailed(format!(
                "frame buffer too short for {width}x{height}"
            )));
        }

        let letterbox = Letterbox::fit(w, h);
        let input = to_tensor(gray, w, h, &letterbox);
        let results = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.outputs[slot];
            let (_, scores) = results[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = results[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            decode_stride(scores, boxes, stride, &letterbox, &mut candidates);
        }

        Ok(suppress(candidates)
            .into_iter()
            .map(|c| c.to_box(width, height))
            .filter(|b| b.reaches(min_size))
            .collect())
    }
}

/// Find score/bbox outputs by name ("score_8", "bbox_8", ...), falling back
/// to the standard export order [scores 8/16/32, boxes 8/16/32, ...].
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let by_name: Option<Vec<StrideOutputs>> = STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?)))
        .collect();

    match by_name {
        Some(found) => [found[0], found[1], found[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Bilinear letterbox resize into a normalized NCHW tensor; gray is
/// replicated into all three channels.
fn to_tensor(gray: &[u8], width: usize, height: usize, letterbox: &Letterbox) -> Array4<f32> {
    let new_w = (width as f32 * letterbox.scale).round() as usize;
    let new_h = (height as f32 * letterbox.scale).round() as usize;
    let x0 = letterbox.pad_x.floor() as usize;
    let y0 = letterbox.pad_y.floor() as usize;
    let inv = 1.0 / letterbox.scale;

    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    for ty in 0..new_h {
        let sy = ((ty as f32 + 0.5) * inv - 0.5).max(0.0);
        let r0 = (sy as usize).min(height - 1);
        let r1 = (r0 + 1).min(height - 1);
        let fy = sy - r0 as f32;
        for tx in 0..new_w {
            let sx = ((tx as f32 + 0.5) * inv - 0.5).max(0.0);
            let c0 = (sx as usize).min(width - 1);
            let c1 = (c0 + 1).min(width - 1);
            let fx = sx - c0 as f32;

            let top = gray[r0 * width + c0] as f32 * (1.0 - fx) + gray[r0 * width + c1] as f32 * fx;
            let bottom = gray[r1 * width + c0] as f32 * (1.0 - fx) + gray[r1 * width + c1] as f32 * fx;
            let value = (top * (1.0 - fy) + bottom * fy - PIXEL_MEAN) / PIXEL_STD;

            let (y, x) = (y0 + ty, x0 + tx);
            if y < INPUT_SIZE && x < INPUT_SIZE {
                for c in 0..3 {
                    tensor[[0, c, y, x]] = value;
                }
            }
        }
    }
    // Padding stays 0.0, which is the mean pixel after normalization.
    tensor
}

fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    out: &mut Vec<Candidate>,
) {
    let grid_w = INPUT_SIZE / stride;
    let anchors = (INPUT_SIZE / stride) * grid_w * ANCHORS_PER_CELL;
    let s = stride as f32;

    for idx in 0..anchors.min(scores.len()) {
        let score = scores[idx];
        if score <= SCORE_THRESHOLD {
            continue;
        }
        let Some(d) = boxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let cell = idx / ANCHORS_PER_CELL;
        let ax = (cell % grid_w) as f32 * s;
        let ay = (cell / grid_w) as f32 * s;

        let (x1, y1) = letterbox.to_frame(ax - d[0] * s, ay - d[1] * s);
        let (x2, y2) = letterbox.to_frame(ax + d[2] * s, ay + d[3] * s);
        out.push(Candidate { x1, y1, x2, y2, score });
    }
}

/// Greedy non-maximum suppression, highest score first.
fn suppress(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::new();
    for c in candidates {
        if kept.iter().all(|k| k.iou(&c) <= NMS_THRESHOLD) {
            kept.push(c);
        }
    }
    kept
}

use crate::runtime::{self, RuntimeError};
use image::{imageops, RgbImage};
use ort::session::Session;
use ort::value::Value;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Failed to load detection model: {0}")]
    Model(#[from] RuntimeError),
    #[error("Detection inference failed: {0}")]
    Inference(String),
}

/// SCRFD input resolution
const INPUT_SIZE: u32 = 640;

/// Feature pyramid strides; outputs are grouped as [scores.., boxes.., keypoints..]
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const NMS_IOU: f32 = 0.4;

/// Axis-aligned face box in source pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &FaceBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Five facial keypoints: eyes, nose tip, mouth corners
pub type Keypoints = [(f32, f32); 5];

#[derive(Debug, Clone)]
pub struct Detection {
    pub face: FaceBox,
    pub keypoints: Keypoints,
    pub confidence: f32,
}

impl Detection {
    /// Ranking key favouring confident, large faces
    fn prominence(&self) -> f32 {
        self.confidence * self.face.area().sqrt()
    }
}

pub struct FaceDetector {
    session: Session,
    min_confidence: f32,
}

impl FaceDetector {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        min_confidence: f32,
        intra_threads: usize,
    ) -> Result<Self, DetectionError> {
        let session = runtime::load_session(model_path, intra_threads)?;
        Ok(Self {
            session,
            min_confidence,
        })
    }

    /// Detect faces, most prominent first. An empty list means no face.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectionError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }
        let scale = (
            INPUT_SIZE as f32 / width as f32,
            INPUT_SIZE as f32 / height as f32,
        );

        let input = Value::from_array(to_tensor(image))
            .map_err(|e| DetectionError::Inference(format!("Failed to create input tensor: {}", e)))?;
        let outputs = self
            .session
            .run(ort::inputs!["input.1" => input])
            .map_err(|e| DetectionError::Inference(e.to_string()))?;

        if outputs.len() < STRIDES.len() * 3 {
            return Err(DetectionError::Inference(format!(
                "expected {} detector outputs, got {}",
                STRIDES.len() * 3,
                outputs.len()
            )));
        }

        let mut detections = Vec::new();
        for (level, &stride) in STRIDES.iter().enumerate() {
            let extract = |idx: usize| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectionError::Inference(format!("stride {}: {}", stride, e)))
            };
            let scores = extract(level)?;
            let boxes = extract(level + STRIDES.len())?;
            let kps = extract(level + STRIDES.len() * 2)?;

            decode_level(stride, scores, boxes, kps, self.min_confidence, scale, &mut detections);
        }

        log::debug!("Found {} raw detections", detections.len());

        let mut faces = suppress(detections);
        faces.sort_by(|a, b| b.prominence().total_cmp(&a.prominence()));
        Ok(faces)
    }
}

/// Resize to the model resolution, NCHW, RGB scaled to [0, 1]
fn to_tensor(image: &RgbImage) -> ([usize; 4], Vec<f32>) {
    let resized = imageops::resize(image, INPUT_SIZE, INPUT_SIZE, imageops::FilterType::Triangle);
    let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
    let mut data = vec![0.0f32; plane * 3];

    for (i, pixel) in resized.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = pixel[c] as f32 / 255.0;
        }
    }

    ([1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize], data)
}

/// Decode one pyramid level into detections in source coordinates
fn decode_level(
    stride: usize,
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    min_confidence: f32,
    (sx, sy): (f32, f32),
    out: &mut Vec<Detection>,
) {
    let cells = INPUT_SIZE as usize / stride;
    let step = stride as f32;

    for idx in 0..cells * cells * ANCHORS_PER_CELL {
        let Some(&logit) = scores.get(idx) else { break };
        let confidence = 1.0 / (1.0 + (-logit).exp());
        if confidence < min_confidence {
            continue;
        }
        let (Some(b), Some(k)) = (boxes.get(idx * 4..idx * 4 + 4), kps.get(idx * 10..idx * 10 + 10)) else {
            break;
        };

        let cell = idx / ANCHORS_PER_CELL;
        let cx = ((cell % cells) as f32 + 0.5) * step;
        let cy = ((cell / cells) as f32 + 0.5) * step;

        let face = FaceBox {
            x1: (cx - b[0].abs()) / sx,
            y1: (cy - b[1].abs()) / sy,
            x2: (cx + b[2].abs()) / sx,
            y2: (cy + b[3].abs()) / sy,
        };

        let mut keypoints = [(0.0, 0.0); 5];
        for (p, point) in keypoints.iter_mut().enumerate() {
            *point = (
                (cx + k[p * 2] * step) / sx,
                (cy + k[p * 2 + 1] * step) / sy,
            );
        }

        log::trace!("stride {} cell ({:.0},{:.0}) confidence {:.3}", stride, cx, cy, confidence);
        out.push(Detection {
            face,
            keypoints,
            confidence,
        });
    }
}

/// Greedy non-maximum suppression by confidence
fn suppress(mut detections: Vec<Detection>) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        if kept.iter().all(|k| k.face.iou(&candidate.face) <= NMS_IOU) {
            kept.push(candidate);
        }
    }
    kept
}

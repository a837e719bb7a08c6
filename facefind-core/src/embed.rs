use crate::align::ALIGNED_SIZE;
use crate::runtime::{self, RuntimeError};
use crate::vector;
use image::RgbImage;
use ort::session::Session;
use ort::value::Value;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("Failed to load embedding model: {0}")]
    Model(#[from] RuntimeError),
    #[error("Embedding inference failed: {0}")]
    Inference(String),
    #[error("Expected a {expected}x{expected} face crop, got {width}x{height}")]
    InputSize { expected: u32, width: u32, height: u32 },
}

/// ArcFace-style embedder producing L2-normalized descriptors
pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    pub fn new<P: AsRef<Path>>(model_path: P, intra_threads: usize) -> Result<Self, EmbedError> {
        let session = runtime::load_session(model_path, intra_threads)?;
        Ok(Self { session })
    }

    /// Embed an aligned face crop
    pub fn embed(&mut self, aligned: &RgbImage) -> Result<Vec<f32>, EmbedError> {
        let (width, height) = aligned.dimensions();
        if width != ALIGNED_SIZE || height != ALIGNED_SIZE {
            return Err(EmbedError::InputSize {
                expected: ALIGNED_SIZE,
                width,
                height,
            });
        }

        let input = Value::from_array(to_tensor(aligned))
            .map_err(|e| EmbedError::Inference(format!("Failed to create input tensor: {}", e)))?;
        let outputs = self
            .session
            .run(ort::inputs![input])
            .map_err(|e| EmbedError::Inference(e.to_string()))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::Inference(format!("Failed to extract embedding: {}", e)))?;

        // One row of output per input face
        let dim = shape.last().copied().unwrap_or(0) as usize;
        if dim == 0 || data.len() < dim {
            return Err(EmbedError::Inference(format!(
                "unexpected embedding shape {:?}",
                shape
            )));
        }

        let mut embedding = data[..dim].to_vec();
        vector::l2_normalize(&mut embedding);
        Ok(embedding)
    }
}

/// NCHW tensor normalized as (pixel - 127.5) / 128
fn to_tensor(face: &RgbImage) -> ([usize; 4], Vec<f32>) {
    let side = ALIGNED_SIZE as usize;
    let plane = side * side;
    let mut data = vec![0.0f32; plane * 3];

    for (i, pixel) in face.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (pixel[c] as f32 - 127.5) / 128.0;
        }
    }

    ([1, 3, side, side], data)
}

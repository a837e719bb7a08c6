use crate::align;
use crate::config::LocalConfig;
use crate::descriptor::{DescriptorError, EmbeddingBackend, FaceEmbedding};
use crate::detect::{DetectionError, FaceDetector};
use crate::embed::{EmbedError, FaceEmbedder};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocalError {
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error(transparent)]
    Embedding(#[from] EmbedError),
}

struct Models {
    detector: FaceDetector,
    embedder: FaceEmbedder,
}

/// On-device embedding backend: detect, align and embed with ONNX Runtime
///
/// Inference runs on the blocking pool, one image at a time. Faces are
/// reported most prominent first; only faces up to and including the
/// first one that embeds successfully carry an embedding.
#[derive(Clone)]
pub struct LocalEmbedder {
    models: Arc<Mutex<Models>>,
}

impl LocalEmbedder {
    pub fn new(config: &LocalConfig) -> Result<Self, LocalError> {
        log::info!("Loading face detection model...");
        let detector = FaceDetector::new(
            &config.detection_model,
            config.confidence_threshold,
            config.intra_threads,
        )?;

        log::info!("Loading face embedding model...");
        let embedder = FaceEmbedder::new(&config.embedding_model, config.intra_threads)?;

        Ok(Self {
            models: Arc::new(Mutex::new(Models { detector, embedder })),
        })
    }
}

impl Models {
    fn run(&mut self, payload: &[u8]) -> Result<Vec<FaceEmbedding>, DescriptorError> {
        let image = image::load_from_memory(payload)
            .map_err(|e| DescriptorError::InvalidInput(format!("Undecodable image: {}", e)))?
            .to_rgb8();

        let detect_start = std::time::Instant::now();
        let detections = self
            .detector
            .detect(&image)
            .map_err(|e| DescriptorError::Transport(e.to_string()))?;
        log::debug!(
            "⏱️  Detection: {}ms, {} faces",
            detect_start.elapsed().as_millis(),
            detections.len()
        );

        let mut embedded = false;
        let mut faces = Vec::with_capacity(detections.len());
        for detection in detections {
            let embedding = if embedded {
                None
            } else {
                match align::align_face(&image, &detection.keypoints) {
                    Ok(aligned) => match self.embedder.embed(&aligned) {
                        Ok(embedding) => {
                            embedded = true;
                            Some(embedding)
                        }
                        Err(e) => {
                            log::warn!("Embedding generation failed: {}", e);
                            None
                        }
                    },
                    Err(e) => {
                        log::debug!("Face alignment failed: {}", e);
                        None
                    }
                }
            };

            let b = detection.face;
            faces.push(FaceEmbedding {
                bbox: Some([b.x1, b.y1, b.x2, b.y2]),
                det_score: detection.confidence,
                embedding,
            });
        }

        Ok(faces)
    }
}

#[async_trait]
impl EmbeddingBackend for LocalEmbedder {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn detect(&self, payload: Vec<u8>) -> Result<Vec<FaceEmbedding>, DescriptorError> {
        let models = Arc::clone(&self.models);
        tokio::task::spawn_blocking(move || {
            let mut models = models
                .lock()
                .map_err(|_| DescriptorError::Transport("inference state poisoned".to_string()))?;
            models.run(&payload)
        })
        .await
        .map_err(|e| DescriptorError::Transport(format!("Inference task failed: {}", e)))?
    }
}

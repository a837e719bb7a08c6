use async_trait::async_trait;
use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DescriptorError {
    #[error("No usable face found in image")]
    NoFace,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Descriptor resolution timed out after {0:?}")]
    Timeout(Duration),
    #[error("Invalid image input: {0}")]
    InvalidInput(String),
}

impl DescriptorError {
    /// Whether this failure came from the call itself rather than the image content
    pub fn is_transport(&self) -> bool {
        !matches!(self, DescriptorError::NoFace)
    }
}

/// Immutable face descriptor shared between the session and its workers
#[derive(Clone, PartialEq)]
pub struct Descriptor(Arc<[f32]>);

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values.into())
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.0.to_vec()
    }
}

impl Deref for Descriptor {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.0
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Descriptor(dim={})", self.0.len())
    }
}

/// An image in any of the forms the adapter accepts
#[derive(Debug, Clone, PartialEq)]
pub enum ImageInput {
    /// Encoded image bytes already in memory
    Bytes(Vec<u8>),
    /// Remote image fetched over HTTP(S)
    Url(String),
    /// Image file on the local filesystem
    File(PathBuf),
}

impl fmt::Display for ImageInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageInput::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            ImageInput::Url(url) => write!(f, "{}", url),
            ImageInput::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// One face as reported by an embedding backend, in provider order
#[derive(Debug, Clone, Default)]
pub struct FaceEmbedding {
    /// Bounding box as (x1, y1, x2, y2) in source pixels
    pub bbox: Option<[f32; 4]>,
    pub det_score: f32,
    pub embedding: Option<Vec<f32>>,
}

/// A face detection + embedding provider
///
/// Implementations receive the normalized image payload and report every
/// detected face. An empty list means the provider succeeded but saw no
/// face; provider or transport failures must be returned as errors.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn detect(&self, payload: Vec<u8>) -> Result<Vec<FaceEmbedding>, DescriptorError>;
}

/// Pick the descriptor to use from a provider response.
///
/// Policy: the first face, in provider order, carrying a non-empty
/// embedding. Remaining faces are discarded.
pub fn pick_face(faces: Vec<FaceEmbedding>) -> Result<Descriptor, DescriptorError> {
    let total = faces.len();
    let picked = faces
        .into_iter()
        .enumerate()
        .find_map(|(idx, face)| match face.embedding {
            Some(embedding) if !embedding.is_empty() => Some((idx, embedding)),
            _ => None,
        });

    match picked {
        Some((idx, embedding)) => {
            if total > 1 {
                log::trace!("Picked face {} of {} reported faces", idx, total);
            }
            Ok(Descriptor::new(embedding))
        }
        None => Err(DescriptorError::NoFace),
    }
}

/// Resolves descriptors for arbitrary image inputs through one backend
pub struct DescriptorSource {
    backend: Arc<dyn EmbeddingBackend>,
    http: reqwest::Client,
    timeout: Duration,
}

impl DescriptorSource {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            http: reqwest::Client::new(),
            timeout,
        }
    }

    /// Resolve a descriptor using the source's default timeout
    pub async fn resolve(&self, input: &ImageInput) -> Result<Descriptor, DescriptorError> {
        self.resolve_with_timeout(input, self.timeout).await
    }

    /// Resolve a descriptor, failing with `Timeout` once `timeout` elapses.
    ///
    /// The deadline covers both fetching the payload and the backend call.
    /// Expiry drops the pending work at its next suspension point.
    pub async fn resolve_with_timeout(
        &self,
        input: &ImageInput,
        timeout: Duration,
    ) -> Result<Descriptor, DescriptorError> {
        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, self.resolve_inner(input)).await {
            Ok(result) => result,
            Err(_) => Err(DescriptorError::Timeout(timeout)),
        };
        log::debug!(
            "⏱️  Resolve {} via {}: {}ms",
            input,
            self.backend.name(),
            start.elapsed().as_millis()
        );
        result
    }

    async fn resolve_inner(&self, input: &ImageInput) -> Result<Descriptor, DescriptorError> {
        let payload = self.load_payload(input).await?;
        let faces = self.backend.detect(payload).await?;
        pick_face(faces)
    }

    /// Normalize any accepted input form into the transport payload
    async fn load_payload(&self, input: &ImageInput) -> Result<Vec<u8>, DescriptorError> {
        let payload = match input {
            ImageInput::Bytes(bytes) => bytes.clone(),
            ImageInput::File(path) => tokio::fs::read(path).await.map_err(|e| {
                DescriptorError::InvalidInput(format!("Failed to read {}: {}", path.display(), e))
            })?,
            ImageInput::Url(url) => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(DescriptorError::InvalidInput(format!(
                        "Unsupported URL scheme: {}",
                        url
                    )));
                }
                let resp = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| DescriptorError::Transport(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(DescriptorError::Transport(format!(
                        "Image fetch failed: {}",
                        resp.status()
                    )));
                }
                resp.bytes()
                    .await
                    .map_err(|e| DescriptorError::Transport(e.to_string()))?
                    .to_vec()
            }
        };

        if payload.is_empty() {
            return Err(DescriptorError::InvalidInput("empty image payload".to_string()));
        }
        Ok(payload)
    }
}

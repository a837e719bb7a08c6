use crate::descriptor::{DescriptorError, EmbeddingBackend, FaceEmbedding};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    faces: Vec<FaceEntry>,
}

#[derive(Debug, Deserialize)]
struct FaceEntry {
    #[serde(default)]
    bbox: Option<Vec<f32>>,
    #[serde(default)]
    det_score: f32,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    ok: bool,
}

/// Embedding backend calling a face server over HTTP
///
/// `POST {base}/embed` with a multipart `file` field; the server answers
/// `{"faces": [{"bbox": [..], "det_score": .., "embedding": [..]}]}`.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    base_url: String,
    client: Client,
}

impl HttpEmbedder {
    pub fn new(url: &str) -> Self {
        Self {
            base_url: url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    /// Build with a transport-level request timeout on top of the adapter deadline
    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self, DescriptorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DescriptorError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Probe `GET {base}/health`
    pub async fn health(&self) -> Result<bool, DescriptorError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DescriptorError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(DescriptorError::Transport(format!(
                "Health check failed: {}",
                resp.status()
            )));
        }

        let health: HealthResponse = resp
            .json()
            .await
            .map_err(|e| DescriptorError::Transport(format!("Malformed health response: {}", e)))?;
        Ok(health.ok)
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbedder {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn detect(&self, payload: Vec<u8>) -> Result<Vec<FaceEmbedding>, DescriptorError> {
        let url = format!("{}/embed", self.base_url);
        let form = Form::new().part("file", Part::bytes(payload).file_name("image.jpg"));

        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| DescriptorError::Transport(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| DescriptorError::Transport(e.to_string()))?;

        if status == StatusCode::BAD_REQUEST {
            return Err(DescriptorError::InvalidInput(
                String::from_utf8_lossy(&body).into_owned(),
            ));
        }
        if !status.is_success() {
            return Err(DescriptorError::Transport(format!("Embed request failed: {}", status)));
        }

        parse_embed_response(&body)
    }
}

/// Decode an `/embed` body; anything undecodable is a transport failure
fn parse_embed_response(body: &[u8]) -> Result<Vec<FaceEmbedding>, DescriptorError> {
    let parsed: EmbedResponse = serde_json::from_slice(body)
        .map_err(|e| DescriptorError::Transport(format!("Malformed embed response: {}", e)))?;

    log::trace!("Face server reported {} faces", parsed.faces.len());

    parsed
        .faces
        .into_iter()
        .map(|face| {
            let bbox = match face.bbox {
                None => None,
                Some(b) if b.len() == 4 => Some([b[0], b[1], b[2], b[3]]),
                Some(b) => {
                    return Err(DescriptorError::Transport(format!(
                        "Malformed embed response: bbox has {} values",
                        b.len()
                    )))
                }
            };
            Ok(FaceEmbedding {
                bbox,
                det_score: face.det_score,
                embedding: face.embedding,
            })
        })
        .collect()
}

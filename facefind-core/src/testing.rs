//! Scripted embedding backend and a canned HTTP server shared by unit tests.

use crate::descriptor::{DescriptorError, EmbeddingBackend, FaceEmbedding};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Default)]
pub struct ScriptedBackend {
    responses: HashMap<Vec<u8>, Result<Vec<FaceEmbedding>, DescriptorError>>,
    delays: HashMap<Vec<u8>, Duration>,
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn face(mut self, payload: &[u8], embedding: Vec<f32>) -> Self {
        let face = FaceEmbedding {
            bbox: Some([0.0, 0.0, 10.0, 10.0]),
            det_score: 0.9,
            embedding: Some(embedding),
        };
        self.responses.insert(payload.to_vec(), Ok(vec![face]));
        self
    }

    pub fn no_face(mut self, payload: &[u8]) -> Self {
        self.responses.insert(payload.to_vec(), Ok(Vec::new()));
        self
    }

    pub fn error(mut self, payload: &[u8], error: DescriptorError) -> Self {
        self.responses.insert(payload.to_vec(), Err(error));
        self
    }

    pub fn delay(mut self, payload: &[u8], delay: Duration) -> Self {
        self.delays.insert(payload.to_vec(), delay);
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn peak_in_flight(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peak_in_flight)
    }
}

#[async_trait]
impl EmbeddingBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn detect(&self, payload: Vec<u8>) -> Result<Vec<FaceEmbedding>, DescriptorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delays.get(&payload) {
            tokio::time::sleep(*delay).await;
        } else {
            tokio::task::yield_now().await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.responses
            .get(&payload)
            .cloned()
            .unwrap_or_else(|| Err(DescriptorError::Transport("unscripted payload".to_string())))
    }
}

/// Serve `status` with `body` to every request on a loopback port.
///
/// Returns the base URL, e.g. `http://127.0.0.1:41234`.
pub async fn http_stub(status: u16, body: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_request(&mut stream).await;
                let head = format!(
                    "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(body).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    format!("http://{}", addr)
}

/// Consume one request, headers and body, so the client sees a clean reply
async fn read_request(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }

        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
        let body_len = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok());

        let complete = match body_len {
            Some(len) => buf.len() >= end + 4 + len,
            None if head.contains("transfer-encoding: chunked") => buf.ends_with(b"0\r\n\r\n"),
            None => true,
        };
        if complete {
            return;
        }
    }
}

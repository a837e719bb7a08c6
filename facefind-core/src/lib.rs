pub mod align;
pub mod config;
pub mod descriptor;
pub mod detect;
pub mod embed;
pub mod local;
pub mod matcher;
pub mod pool;
pub mod remote;
pub mod runtime;
pub mod session;
pub mod store;
pub mod threshold;
pub mod vector;

#[cfg(test)]
mod testing;

pub use descriptor::{Descriptor, DescriptorError, DescriptorSource, EmbeddingBackend, ImageInput};
pub use matcher::{MatchConfig, MatchError, MatchOutcome, Matcher, ScoredCandidate};
pub use pool::{Candidate, CandidatePool, MemoryPool};
pub use session::{CancelHandle, MatchHandle, MatchSnapshot, MatchState, Progress, SessionSlot};
pub use threshold::{Fallback, ResultKind};

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] descriptor::DescriptorError),
    #[error("Match error: {0}")]
    Match(#[from] matcher::MatchError),
    #[error("Storage error: {0}")]
    Storage(#[from] store::StorageError),
    #[error("Local model error: {0}")]
    Local(#[from] local::LocalError),
}

/// Wires the configured backend, the event index and one session slot
pub struct FaceFinder {
    config: config::Config,
    source: Arc<DescriptorSource>,
    remote: Option<remote::HttpEmbedder>,
    index: store::EventIndex,
    slot: SessionSlot,
}

impl FaceFinder {
    /// Create a face finder with the backend named in the configuration
    pub fn new(config: config::Config) -> Result<Self, Error> {
        config.validate()?;

        let (backend, probe) = match config.provider.backend {
            config::Backend::Remote => {
                let embedder = remote::HttpEmbedder::with_timeout(
                    &config.provider.url,
                    Duration::from_millis(config.provider.timeout_ms),
                )?;
                log::info!("Using face server at {}", embedder.base_url());
                (Arc::new(embedder.clone()) as Arc<dyn EmbeddingBackend>, Some(embedder))
            }
            config::Backend::Local => {
                let embedder = local::LocalEmbedder::new(&config.local)?;
                (Arc::new(embedder) as Arc<dyn EmbeddingBackend>, None)
            }
        };

        let mut finder = Self::with_backend(config, backend);
        finder.remote = probe;
        Ok(finder)
    }

    /// Create a face finder around an already constructed backend
    pub fn with_backend(config: config::Config, backend: Arc<dyn EmbeddingBackend>) -> Self {
        let timeout = Duration::from_millis(config.matching.timeout_ms);
        let index = store::EventIndex::new(&config.storage.index_path);

        Self {
            source: Arc::new(DescriptorSource::new(backend, timeout)),
            remote: None,
            index,
            config,
            slot: SessionSlot::new(),
        }
    }

    pub fn config(&self) -> &config::Config {
        &self.config
    }

    pub fn index(&self) -> &store::EventIndex {
        &self.index
    }

    /// Start matching `selfie` against an event using the configured options
    pub fn find(&mut self, event: &str, selfie: ImageInput) -> Result<MatchHandle, Error> {
        let options = self.config.matching.to_match_config();
        self.find_with(event, selfie, options)
    }

    /// Start matching with explicit options; any previous session is retired
    pub fn find_with(
        &mut self,
        event: &str,
        selfie: ImageInput,
        options: MatchConfig,
    ) -> Result<MatchHandle, Error> {
        let pool = self.index.load_pool(event)?;
        log::info!("Searching {} photos of event {}", pool.len(), event);

        let matcher = Matcher::new(Arc::clone(&self.source), Arc::new(pool));
        Ok(self.slot.start(&matcher, selfie, options))
    }

    /// Cancel the active session, if any
    pub fn cancel(&mut self) -> bool {
        self.slot.retire()
    }

    /// Embed a photo and store it with its descriptor.
    ///
    /// A photo without a face is rejected with `NoFace`, unless
    /// `storage.keep_faceless` is set; then it is stored without a
    /// descriptor and embedded again from `url` during matching.
    pub async fn index_photo(
        &self,
        event: &str,
        photo_id: &str,
        url: &str,
        image: &ImageInput,
    ) -> Result<store::PhotoRecord, Error> {
        let descriptor = match self.source.resolve(image).await {
            Ok(descriptor) => descriptor,
            Err(DescriptorError::NoFace) if self.config.storage.keep_faceless => {
                log::info!("No face in photo {}, storing it as deferred", photo_id);
                return Ok(self.index.add_photo(event, photo_id, url, None)?);
            }
            Err(e) => return Err(e.into()),
        };
        log::debug!("Photo {} embedded ({} dims)", photo_id, descriptor.len());
        Ok(self.index.add_photo(event, photo_id, url, Some(&descriptor))?)
    }

    /// Probe the face server; the local backend is always ready once loaded
    pub async fn health(&self) -> Result<bool, Error> {
        match &self.remote {
            Some(embedder) => Ok(embedder.health().await?),
            None => Ok(true),
        }
    }
}

use crate::descriptor::{Descriptor, ImageInput};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PoolError {
    #[error("Candidate enumeration failed: {0}")]
    Enumeration(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Duplicate candidate id: {0}")]
    DuplicateId(String),
}

impl From<std::io::Error> for PoolError {
    fn from(e: std::io::Error) -> Self {
        PoolError::Io(e.to_string())
    }
}

/// Where a candidate's descriptor comes from
#[derive(Debug, Clone, PartialEq)]
pub enum DescriptorSlot {
    /// Precomputed alongside the photo
    Ready(Descriptor),
    /// Must be embedded from this image the first time it is scored
    Deferred(ImageInput),
}

/// One searchable event photo
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Stable photo reference, e.g. its storage path
    pub id: String,
    /// Displayable URL
    pub url: String,
    pub descriptor: DescriptorSlot,
}

impl Candidate {
    pub fn ready(id: impl Into<String>, url: impl Into<String>, descriptor: Descriptor) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            descriptor: DescriptorSlot::Ready(descriptor),
        }
    }

    /// A candidate embedded on demand from its own URL
    pub fn deferred(id: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: id.into(),
            descriptor: DescriptorSlot::Deferred(ImageInput::Url(url.clone())),
            url,
        }
    }

    /// Whether the descriptor is available without calling the provider
    pub fn is_resolved(&self) -> bool {
        matches!(self.descriptor, DescriptorSlot::Ready(_))
    }
}

/// Ordered, read-only collection of candidates to search.
///
/// The enumeration order must not change while a session is scanning:
/// two `slice` calls with the same window return the same candidates.
#[async_trait]
pub trait CandidatePool: Send + Sync {
    /// Total candidates currently enumerable
    async fn size(&self) -> Result<usize, PoolError>;

    /// Up to `count` candidates starting at `offset`, in enumeration order
    async fn slice(&self, offset: usize, count: usize) -> Result<Vec<Candidate>, PoolError>;
}

/// In-memory pool with a fixed enumeration order
#[derive(Debug, Clone, Default)]
pub struct MemoryPool {
    candidates: Vec<Candidate>,
}

impl MemoryPool {
    /// Build a pool that enumerates `candidates` in the given order
    pub fn new(candidates: Vec<Candidate>) -> Result<Self, PoolError> {
        let mut seen = HashSet::with_capacity(candidates.len());
        for candidate in &candidates {
            if !seen.insert(candidate.id.as_str()) {
                return Err(PoolError::DuplicateId(candidate.id.clone()));
            }
        }
        Ok(Self { candidates })
    }

    /// Build a pool enumerated newest-first.
    ///
    /// Candidates uploaded at the same instant are ordered by id,
    /// descending, so the order never depends on input order.
    pub fn newest_first(mut entries: Vec<(Candidate, DateTime<Utc>)>) -> Result<Self, PoolError> {
        entries.sort_by(|(a, a_time), (b, b_time)| b_time.cmp(a_time).then_with(|| b.id.cmp(&a.id)));
        Self::new(entries.into_iter().map(|(candidate, _)| candidate).collect())
    }

    /// Number of candidates, before any pool ceiling is applied
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Candidates in enumeration order
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }
}

#[async_trait]
impl CandidatePool for MemoryPool {
    async fn size(&self) -> Result<usize, PoolError> {
        Ok(self.candidates.len())
    }

    /// Clamped to the pool; a window past the end is empty, never an error
    async fn slice(&self, offset: usize, count: usize) -> Result<Vec<Candidate>, PoolError> {
        let start = offset.min(self.candidates.len());
        let end = offset.saturating_add(count).min(self.candidates.len());
        Ok(self.candidates[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candidate(id: &str) -> Candidate {
        Candidate::ready(id, format!("https://cdn.example.com/{}", id), Descriptor::new(vec![1.0]))
    }

    #[tokio::test]
    async fn test_slice_windows() {
        let pool = MemoryPool::new((0..5).map(|i| candidate(&format!("p{}", i))).collect()).unwrap();
        assert_eq!(pool.size().await.unwrap(), 5);

        let first = pool.slice(0, 2).await.unwrap();
        assert_eq!(first.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), ["p0", "p1"]);

        let tail = pool.slice(4, 10).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert!(pool.slice(9, 3).await.unwrap().is_empty());
        assert!(pool.slice(usize::MAX, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slice_idempotent() {
        let pool = MemoryPool::new((0..8).map(|i| candidate(&format!("p{}", i))).collect()).unwrap();
        let a = pool.slice(3, 4).await.unwrap();
        let b = pool.slice(3, 4).await.unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = MemoryPool::new(vec![candidate("a"), candidate("b"), candidate("a")]);
        assert_eq!(result.unwrap_err(), PoolError::DuplicateId("a".to_string()));
    }

    #[test]
    fn test_newest_first_order() {
        let t = |s| Utc.timestamp_opt(s, 0).unwrap();
        let pool = MemoryPool::newest_first(vec![
            (candidate("old"), t(100)),
            (candidate("new"), t(300)),
            (candidate("mid-a"), t(200)),
            (candidate("mid-b"), t(200)),
        ])
        .unwrap();

        let ids: Vec<_> = pool.candidates().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["new", "mid-b", "mid-a", "old"]);
    }

    #[test]
    fn test_deferred_candidate_uses_url() {
        let c = Candidate::deferred("events/e1/p.jpg", "https://cdn.example.com/p.jpg");
        assert!(!c.is_resolved());
        assert_eq!(
            c.descriptor,
            DescriptorSlot::Deferred(ImageInput::Url("https://cdn.example.com/p.jpg".into()))
        );
    }
}

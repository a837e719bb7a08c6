use crate::descriptor::Descriptor;
use crate::pool::{Candidate, MemoryPool, PoolError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Invalid event id: {0:?}")]
    InvalidEvent(String),
    #[error("Event not found: {0}")]
    EventNotFound(String),
    #[error("Photo not found: {0}")]
    PhotoNotFound(String),
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Index entry for one event photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub id: String,
    pub url: String,
    pub uploaded_at: DateTime<Utc>,
    /// Whether a precomputed descriptor is stored for this photo
    pub has_descriptor: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EventManifest {
    photos: Vec<PhotoRecord>,
}

/// On-disk photo index, one directory per event
///
/// ```text
/// <base>/<event>/index.toml      photo records
/// <base>/<event>/<sha256>.bin    bincode descriptor per photo
/// ```
pub struct EventIndex {
    base_path: PathBuf,
}

impl EventIndex {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Directory of one event; ids that could escape the base path are rejected
    fn event_dir(&self, event: &str) -> Result<PathBuf, StorageError> {
        let valid = !event.is_empty()
            && event != "."
            && event != ".."
            && !event.contains(['/', '\\']);
        if !valid {
            return Err(StorageError::InvalidEvent(event.to_string()));
        }
        Ok(self.base_path.join(event))
    }

    fn manifest_path(&self, event: &str) -> Result<PathBuf, StorageError> {
        Ok(self.event_dir(event)?.join("index.toml"))
    }

    /// Photo ids are storage paths; hash them into flat file names
    fn descriptor_path(&self, event: &str, photo_id: &str) -> Result<PathBuf, StorageError> {
        let digest = Sha256::digest(photo_id.as_bytes());
        Ok(self.event_dir(event)?.join(format!("{:x}.bin", digest)))
    }

    /// Read the event manifest; a missing file is an empty event
    fn load_manifest(&self, event: &str) -> Result<EventManifest, StorageError> {
        let path = self.manifest_path(event)?;
        if !path.exists() {
            return Ok(EventManifest::default());
        }

        let contents = fs::read_to_string(&path)?;
        toml::from_str(&contents).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn save_manifest(&self, event: &str, manifest: &EventManifest) -> Result<(), StorageError> {
        let contents = toml::to_string_pretty(manifest)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        fs::write(self.manifest_path(event)?, contents)?;
        Ok(())
    }

    /// Add or replace a photo, optionally with its precomputed descriptor
    pub fn add_photo(
        &self,
        event: &str,
        photo_id: &str,
        url: &str,
        descriptor: Option<&Descriptor>,
    ) -> Result<PhotoRecord, StorageError> {
        // Create the event directory on first use, owner-only
        let event_dir = self.event_dir(event)?;
        if !event_dir.exists() {
            fs::create_dir_all(&event_dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&event_dir, fs::Permissions::from_mode(0o700))?;
            }
        }

        // Write the descriptor, or drop a stale one when re-adding as deferred
        let descriptor_path = self.descriptor_path(event, photo_id)?;
        match descriptor {
            Some(descriptor) => {
                let data = bincode::serialize(descriptor.as_slice())
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                fs::write(&descriptor_path, data)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(&descriptor_path, fs::Permissions::from_mode(0o600))?;
                }
            }
            None if descriptor_path.exists() => fs::remove_file(&descriptor_path)?,
            None => {}
        }

        let record = PhotoRecord {
            id: photo_id.to_string(),
            url: url.to_string(),
            uploaded_at: Utc::now(),
            has_descriptor: descriptor.is_some(),
        };

        // Replace any previous record for this id
        let mut manifest = self.load_manifest(event)?;
        manifest.photos.retain(|p| p.id != photo_id);
        manifest.photos.push(record.clone());
        self.save_manifest(event, &manifest)?;

        log::debug!("Indexed photo {} in event {}", photo_id, event);
        Ok(record)
    }

    /// Remove a photo and its descriptor
    pub fn remove_photo(&self, event: &str, photo_id: &str) -> Result<(), StorageError> {
        if !self.event_dir(event)?.exists() {
            return Err(StorageError::EventNotFound(event.to_string()));
        }

        let mut manifest = self.load_manifest(event)?;
        let before = manifest.photos.len();
        manifest.photos.retain(|p| p.id != photo_id);
        if manifest.photos.len() == before {
            return Err(StorageError::PhotoNotFound(photo_id.to_string()));
        }

        let descriptor_path = self.descriptor_path(event, photo_id)?;
        if descriptor_path.exists() {
            fs::remove_file(&descriptor_path)?;
        }

        self.save_manifest(event, &manifest)
    }

    /// All photos of an event, newest first
    pub fn list_photos(&self, event: &str) -> Result<Vec<PhotoRecord>, StorageError> {
        if !self.event_dir(event)?.exists() {
            return Ok(Vec::new());
        }

        let mut photos = self.load_manifest(event)?.photos;
        photos.sort_by(|a, b| {
            b.uploaded_at
                .cmp(&a.uploaded_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(photos)
    }

    /// Read a photo's stored descriptor
    pub fn load_descriptor(&self, event: &str, photo_id: &str) -> Result<Descriptor, StorageError> {
        let data = fs::read(self.descriptor_path(event, photo_id)?)?;
        let values: Vec<f32> =
            bincode::deserialize(&data).map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Descriptor::new(values))
    }

    /// Snapshot an event as a candidate pool, enumerated newest-first.
    ///
    /// Photos without a stored descriptor become deferred candidates
    /// resolved from their URL during the scan.
    pub fn load_pool(&self, event: &str) -> Result<MemoryPool, StorageError> {
        if !self.event_dir(event)?.exists() {
            return Err(StorageError::EventNotFound(event.to_string()));
        }

        let manifest = self.load_manifest(event)?;
        let mut entries = Vec::with_capacity(manifest.photos.len());
        for photo in manifest.photos {
            let candidate = if photo.has_descriptor {
                match self.load_descriptor(event, &photo.id) {
                    Ok(descriptor) => Candidate::ready(&photo.id, &photo.url, descriptor),
                    Err(e) => {
                        log::warn!("Descriptor for {} unreadable ({}), deferring", photo.id, e);
                        Candidate::deferred(&photo.id, &photo.url)
                    }
                }
            } else {
                Candidate::deferred(&photo.id, &photo.url)
            };
            entries.push((candidate, photo.uploaded_at));
        }

        Ok(MemoryPool::newest_first(entries)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{CandidatePool, DescriptorSlot};

    #[test]
    fn test_add_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let index = EventIndex::new(dir.path());

        let d = Descriptor::new(vec![0.6, 0.8]);
        index
            .add_photo("wedding", "events/wedding/a.jpg", "https://cdn/a.jpg", Some(&d))
            .unwrap();
        index
            .add_photo("wedding", "events/wedding/b.jpg", "https://cdn/b.jpg", None)
            .unwrap();

        let photos = index.list_photos("wedding").unwrap();
        assert_eq!(photos.len(), 2);
        assert_eq!(photos[0].id, "events/wedding/b.jpg");
        assert!(photos[1].has_descriptor);

        assert_eq!(
            index.load_descriptor("wedding", "events/wedding/a.jpg").unwrap(),
            d
        );

        index.remove_photo("wedding", "events/wedding/a.jpg").unwrap();
        assert_eq!(index.list_photos("wedding").unwrap().len(), 1);
        assert!(index.load_descriptor("wedding", "events/wedding/a.jpg").is_err());
        assert!(matches!(
            index.remove_photo("wedding", "events/wedding/a.jpg"),
            Err(StorageError::PhotoNotFound(_))
        ));
    }

    #[test]
    fn test_readd_replaces_record() {
        let dir = tempfile::tempdir().unwrap();
        let index = EventIndex::new(dir.path());

        index.add_photo("e", "p.jpg", "https://cdn/p.jpg", None).unwrap();
        index
            .add_photo("e", "p.jpg", "https://cdn/p.jpg", Some(&Descriptor::new(vec![1.0])))
            .unwrap();

        let photos = index.list_photos("e").unwrap();
        assert_eq!(photos.len(), 1);
        assert!(photos[0].has_descriptor);
    }

    #[test]
    fn test_invalid_event_ids() {
        let dir = tempfile::tempdir().unwrap();
        let index = EventIndex::new(dir.path());
        for bad in ["", "..", "a/b", "a\\b"] {
            assert!(matches!(
                index.add_photo(bad, "p", "u", None),
                Err(StorageError::InvalidEvent(_))
            ));
        }
    }

    #[test]
    fn test_missing_event() {
        let dir = tempfile::tempdir().unwrap();
        let index = EventIndex::new(dir.path());
        assert!(index.list_photos("nope").unwrap().is_empty());
        assert!(matches!(index.load_pool("nope"), Err(StorageError::EventNotFound(_))));
    }

    #[tokio::test]
    async fn test_load_pool() {
        let dir = tempfile::tempdir().unwrap();
        let index = EventIndex::new(dir.path());
        index
            .add_photo("e", "a.jpg", "https://cdn/a.jpg", Some(&Descriptor::new(vec![1.0, 0.0])))
            .unwrap();
        index.add_photo("e", "b.jpg", "https://cdn/b.jpg", None).unwrap();

        let pool = index.load_pool("e").unwrap();
        assert_eq!(pool.size().await.unwrap(), 2);

        let all = pool.slice(0, 2).await.unwrap();
        let a = all.iter().find(|c| c.id == "a.jpg").unwrap();
        let b = all.iter().find(|c| c.id == "b.jpg").unwrap();
        assert!(matches!(a.descriptor, DescriptorSlot::Ready(_)));
        assert!(!b.is_resolved());
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let index = EventIndex::new(dir.path());
        index
            .add_photo("e", "a.jpg", "u", Some(&Descriptor::new(vec![1.0])))
            .unwrap();

        let mode = fs::metadata(dir.path().join("e")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        let mode = fs::metadata(index.descriptor_path("e", "a.jpg").unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

//! Filesystem blob store for note audio.
//!
//! Blobs are content-addressed: the reference is the SHA256 of the bytes
//! plus the original extension, which is also where the declared MIME type
//! comes from.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;

use super::{AudioPayload, BlobStore, ProviderError};
use crate::domain::AudioRef;

/// Blob store rooted at a local directory
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy a local audio file into the store
    pub async fn import_file(&self, path: &Path) -> Result<(AudioRef, u64), ProviderError> {
        let bytes = fs::read(path)
            .await
            .map_err(|e| ProviderError::invalid_file(format!("{}: {}", path.display(), e)))?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_ascii_lowercase();

        let size = bytes.len() as u64;
        let audio_ref = self.put(&bytes, &extension).await?;
        Ok((audio_ref, size))
    }

    /// Store bytes under their content hash (idempotent)
    pub async fn put(&self, bytes: &[u8], extension: &str) -> Result<AudioRef, ProviderError> {
        let name = format!("{}.{}", content_hash(bytes), extension);
        let path = self.root.join(&name);

        if !path.exists() {
            fs::create_dir_all(&self.root)
                .await
                .map_err(|e| ProviderError::storage(e.to_string()))?;
            fs::write(&path, bytes)
                .await
                .map_err(|e| ProviderError::storage(e.to_string()))?;
        }

        Ok(AudioRef::new(name))
    }

    fn resolve(&self, audio_ref: &AudioRef) -> Result<PathBuf, ProviderError> {
        let name = audio_ref.as_str();
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(ProviderError::invalid_file(format!(
                "Invalid audio reference: {}",
                name
            )));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn fetch_audio(&self, audio_ref: &AudioRef) -> Result<AudioPayload, ProviderError> {
        let path = self.resolve(audio_ref)?;

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::invalid_file(format!(
                    "Audio not found: {}",
                    audio_ref
                )));
            }
            Err(e) => return Err(ProviderError::storage(e.to_string())),
        };

        Ok(AudioPayload::new(bytes, mime_for_path(&path)))
    }
}

/// SHA256 of the content, hex encoded
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Declared MIME type from the file extension
pub fn mime_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("webm") => "audio/webm",
        Some("m4a") | Some("mp4") => "audio/mp4",
        Some("mp3") | Some("mpga") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") | Some("oga") | Some("opus") => "audio/ogg",
        Some("flac") => "audio/flac",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ErrorKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_and_fetch() {
        let temp = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp.path());

        let audio_ref = store.put(b"fake audio", "m4a").await.unwrap();
        assert!(audio_ref.as_str().ends_with(".m4a"));

        let payload = store.fetch_audio(&audio_ref).await.unwrap();
        assert_eq!(payload.bytes, b"fake audio");
        assert_eq!(payload.mime_type, "audio/mp4");
    }

    #[tokio::test]
    async fn test_put_is_content_addressed() {
        let temp = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp.path());

        let a = store.put(b"same", "webm").await.unwrap();
        let b = store.put(b"same", "webm").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_missing_blob_is_invalid_file() {
        let temp = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp.path());

        let err = store
            .fetch_audio(&AudioRef::new("missing.webm"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidFile);
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let temp = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp.path());

        let err = store
            .fetch_audio(&AudioRef::new("../etc/passwd"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidFile);
    }

    #[test]
    fn test_mime_mapping() {
        assert_eq!(mime_for_path(Path::new("a.WAV")), "audio/wav");
        assert_eq!(mime_for_path(Path::new("a.opus")), "audio/ogg");
        assert_eq!(mime_for_path(Path::new("a.txt")), "application/octet-stream");
    }
}

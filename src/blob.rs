//! Content-addressed blob storage for binary file bodies.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::error::{FsError, Result};

/// Bucket used for digests too short to split into prefix and remainder.
const SHORT_HASH_BUCKET: &str = "00";

/// A lowercase-hex SHA-256 digest addressing one blob.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BlobId(String);

impl BlobId {
    /// Computes the blob ID for `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        BlobId(hex::encode(Sha256::digest(bytes)))
    }

    /// Returns the hex digest as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the digest into its bucket directory and file name.
    ///
    /// SHA-256 digests always have two characters to spare, but the store
    /// tolerates shorter hashes by filing them under a fixed bucket.
    fn split(&self) -> (&str, &str) {
        if self.0.len() < 2 {
            (SHORT_HASH_BUCKET, &self.0)
        } else {
            (&self.0[..2], &self.0[2..])
        }
    }
}

impl Debug for BlobId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}({})", stringify!(BlobId), self.0)
    }
}

impl Display for BlobId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BlobId {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
            return Err(FsError::StorageFault(format!("invalid blob hash: {:?}", s)));
        }
        Ok(BlobId(s.to_owned()))
    }
}

/// A content-addressed store of opaque byte blobs.
///
/// Implementations only need to be safe from the single engine task; the
/// engine never calls them concurrently with themselves.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Retrieves the bytes stored under `id`, if present.
    ///
    /// Absence is not an error; it is reported as `Ok(None)`.
    async fn get(&self, id: &BlobId) -> Result<Option<Bytes>>;

    /// Stores `bytes` under `id`. Idempotent; overwriting is permitted.
    async fn put(&self, id: &BlobId, bytes: &[u8]) -> Result<()>;

    /// Returns `true` if a blob is stored under `id`.
    async fn contains(&self, id: &BlobId) -> Result<bool>;

    /// Deletes the blob under `id`. Deleting an absent blob is a no-op.
    async fn delete(&self, id: &BlobId) -> Result<()>;

    /// Enumerates every stored blob ID. Empty when the store is fresh.
    async fn list(&self) -> Result<Vec<BlobId>>;
}

/// A blob store backed by the local filesystem.
///
/// Blobs live at `<base>/<aa>/<rest>` where `aa` is the first two characters
/// of the digest. Bucket directories are created on demand; writes go through
/// a temporary file renamed into place so readers never observe a partial
/// blob.
#[derive(Debug)]
pub struct FsBlobStore {
    base: PathBuf,
}

impl FsBlobStore {
    /// Opens the store rooted at `base`. The directory is created lazily on
    /// the first write.
    pub fn open<P: Into<PathBuf>>(base: P) -> Self {
        FsBlobStore { base: base.into() }
    }

    fn blob_path(&self, id: &BlobId) -> PathBuf {
        let (bucket, rest) = id.split();
        self.base.join(bucket).join(rest)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, id: &BlobId) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.blob_path(id)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, id: &BlobId, bytes: &[u8]) -> Result<()> {
        let path = self.blob_path(id);
        let bucket = path.parent().expect("blob path always has a bucket directory");
        tokio::fs::create_dir_all(bucket).await?;

        // Stage next to the final location so the rename stays on one
        // filesystem and lands atomically.
        let staging = bucket.join(format!(".tmp-{}", id.as_str()));
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn contains(&self, id: &BlobId) -> Result<bool> {
        match tokio::fs::metadata(self.blob_path(id)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &BlobId) -> Result<()> {
        match tokio::fs::remove_file(self.blob_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<BlobId>> {
        let mut out = Vec::new();
        let mut buckets = match tokio::fs::read_dir(&self.base).await {
            Ok(iter) => iter,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };

        while let Some(bucket) = buckets.next_entry().await? {
            if !bucket.file_type().await?.is_dir() {
                continue;
            }
            let prefix = bucket.file_name().to_string_lossy().into_owned();
            let mut files = tokio::fs::read_dir(bucket.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name().to_string_lossy().into_owned();
                if name.starts_with(".tmp-") {
                    continue;
                }
                let digest = if prefix == SHORT_HASH_BUCKET && name.len() < 2 {
                    name
                } else {
                    format!("{}{}", prefix, name)
                };
                out.push(digest.parse()?);
            }
        }

        Ok(out)
    }
}

/// A blob store kept in memory, useful for testing.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<BlobId, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<BlobId, Bytes>> {
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, id: &BlobId) -> Result<Option<Bytes>> {
        Ok(self.lock().get(id).cloned())
    }

    async fn put(&self, id: &BlobId, bytes: &[u8]) -> Result<()> {
        self.lock().insert(id.clone(), Bytes::copy_from_slice(bytes));
        Ok(())
    }

    async fn contains(&self, id: &BlobId) -> Result<bool> {
        Ok(self.lock().contains_key(id))
    }

    async fn delete(&self, id: &BlobId) -> Result<()> {
        self.lock().remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BlobId>> {
        Ok(self.lock().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_id_is_the_sha256_hex_digest() {
        let id = BlobId::of(b"");
        assert_eq!(
            id.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn short_hashes_file_under_the_fixed_bucket() {
        let id: BlobId = "a".parse().unwrap();
        assert_eq!(id.split(), ("00", "a"));

        let full = BlobId::of(b"x");
        let (bucket, rest) = full.split();
        assert_eq!(bucket.len(), 2);
        assert_eq!(rest.len(), 62);
    }

    #[test]
    fn blob_id_rejects_non_hex_input() {
        assert!("".parse::<BlobId>().is_err());
        assert!("XYZ".parse::<BlobId>().is_err());
        assert!("abc123".parse::<BlobId>().is_ok());
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryBlobStore::new();
        let id = BlobId::of(b"hello");

        assert!(store.get(&id).await.unwrap().is_none());
        store.put(&id, b"hello").await.unwrap();
        assert!(store.contains(&id).await.unwrap());
        assert_eq!(store.get(&id).await.unwrap().unwrap().as_ref(), b"hello");
        assert_eq!(store.list().await.unwrap(), vec![id.clone()]);

        store.delete(&id).await.unwrap();
        store.delete(&id).await.unwrap();
        assert!(!store.contains(&id).await.unwrap());
    }

    #[tokio::test]
    async fn fs_store_round_trips_through_the_bucket_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path());
        let id = BlobId::of(&[0x00, 0xff, 0xfe]);

        store.put(&id, &[0x00, 0xff, 0xfe]).await.unwrap();
        let on_disk = dir.path().join(&id.as_str()[..2]).join(&id.as_str()[2..]);
        assert!(on_disk.is_file());

        assert_eq!(
            store.get(&id).await.unwrap().unwrap().as_ref(),
            &[0x00, 0xff, 0xfe]
        );
        assert_eq!(store.list().await.unwrap(), vec![id.clone()]);

        store.delete(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fs_store_lists_empty_before_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path().join("blobs"));
        assert!(store.list().await.unwrap().is_empty());
    }
}

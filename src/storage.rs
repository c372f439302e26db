//! Opaque persistence backends for CRDT document chunks.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::repo::DocId;

/// A durable sink and source for CRDT document chunks.
///
/// The backend never interprets chunk content. `append` must be durable by
/// the time it returns; `load` reassembles everything appended for a
/// document, in append order, which is exactly the shape the CRDT library
/// accepts back.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Appends one chunk to the document's log.
    async fn append(&self, id: &DocId, chunk: &[u8]) -> Result<()>;

    /// Loads the concatenation of every chunk stored for `id`, or `None` if
    /// the backend has never seen the document.
    async fn load(&self, id: &DocId) -> Result<Option<Vec<u8>>>;
}

/// A backend storing chunks as numbered files under one directory per
/// document: `<base>/<doc-id>/<seq>.bin`.
#[derive(Debug)]
pub struct FsBackend {
    base: PathBuf,
}

impl FsBackend {
    /// Opens the backend rooted at `base`. Directories are created lazily on
    /// the first append.
    pub fn open<P: Into<PathBuf>>(base: P) -> Self {
        FsBackend { base: base.into() }
    }

    fn doc_dir(&self, id: &DocId) -> PathBuf {
        self.base.join(id.as_str())
    }

    async fn chunk_names(&self, id: &DocId) -> Result<Option<Vec<String>>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.doc_dir(id)).await {
            Ok(iter) => iter,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".bin") {
                names.push(name);
            }
        }

        // Fixed-width sequence numbers make lexicographic order the append
        // order.
        names.sort();
        Ok(Some(names))
    }
}

#[async_trait]
impl StorageBackend for FsBackend {
    async fn append(&self, id: &DocId, chunk: &[u8]) -> Result<()> {
        let dir = self.doc_dir(id);
        tokio::fs::create_dir_all(&dir).await?;

        let seq = match self.chunk_names(id).await? {
            Some(names) => names.len() as u64,
            None => 0,
        };
        let path = dir.join(format!("{:08}.bin", seq));
        let staging = dir.join(format!(".tmp-{:08}", seq));

        let mut file = tokio::fs::File::create(&staging).await?;
        file.write_all(chunk).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn load(&self, id: &DocId) -> Result<Option<Vec<u8>>> {
        let names = match self.chunk_names(id).await? {
            Some(names) if !names.is_empty() => names,
            _ => return Ok(None),
        };

        let dir = self.doc_dir(id);
        let mut bytes = Vec::new();
        for name in names {
            bytes.extend(tokio::fs::read(dir.join(name)).await?);
        }
        Ok(Some(bytes))
    }
}

/// A backend kept in memory, useful for testing.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    chunks: Mutex<HashMap<DocId, Vec<Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DocId, Vec<Vec<u8>>>> {
        self.chunks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn append(&self, id: &DocId, chunk: &[u8]) -> Result<()> {
        self.lock().entry(id.clone()).or_default().push(chunk.to_vec());
        Ok(())
    }

    async fn load(&self, id: &DocId) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().get(id).map(|chunks| chunks.concat()))
    }
}

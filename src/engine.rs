//! The public versioned filesystem engine.
//!
//! A `VersionedFs` holds one root document describing the directory tree,
//! routes file bodies to per-file text documents or the blob store, and
//! answers history queries against the per-file documents. All operations
//! run on one logical task; the `&mut self` receivers are what make the
//! single-writer model hold.

use std::io;
use std::path::PathBuf;

use automerge::{ChangeHash, Patch};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tracing::{debug, trace};

use crate::blob::{BlobStore, FsBlobStore};
use crate::body::{self, WriteContent};
use crate::error::{FsError, Result};
use crate::path;
use crate::repo::{unix_time, ChangeSummary, DocId, DocumentRepo};
use crate::storage::FsBackend;
use crate::tree::{self, EntryKind, EntryMeta, FileBody, TreeEntry};

const DEFAULT_DIR_MODE: u32 = 0o755;
const DEFAULT_FILE_MODE: u32 = 0o644;

/// Name of the file under the data directory holding the root handle.
const ROOT_ID_FILE: &str = "root-doc-id";

/// Metadata returned by `stat`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct FileStat {
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    pub ctime: i64,
}

/// One row of a directory listing.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct DirEntry {
    pub name: SmolStr,
    pub kind: EntryKind,
    pub size: u64,
}

/// A labeled point in the root document's history.
///
/// The label is an annotation for the caller to store; the engine does not
/// persist it.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub heads: Vec<ChangeHash>,
    pub label: Option<String>,
    pub timestamp: i64,
}

/// The multi-document versioned filesystem.
pub struct VersionedFs {
    repo: DocumentRepo,
    blobs: Box<dyn BlobStore>,
    root: DocId,
    closed: bool,
}

impl VersionedFs {
    /// Allocates a fresh filesystem: a new root document whose tree holds
    /// only the root directory.
    pub async fn open_new(mut repo: DocumentRepo, blobs: Box<dyn BlobStore>) -> Result<Self> {
        let root = repo.create().await?;
        let now = unix_time();
        repo.change(&root, None, |tx| {
            tree::init_tree(tx, DEFAULT_DIR_MODE, now)?;
            Ok(())
        })
        .await?;
        debug!(root = %root, "created filesystem");
        Ok(VersionedFs {
            repo,
            blobs,
            root,
            closed: false,
        })
    }

    /// Reopens the filesystem identified by `root`. No tree mutation.
    ///
    /// Returns `Err(DocumentNotFound)` if the backend does not know the
    /// handle, `Err(StorageFault)` if the loaded document has no tree.
    pub async fn open_existing(
        mut repo: DocumentRepo,
        blobs: Box<dyn BlobStore>,
        root: DocId,
    ) -> Result<Self> {
        repo.find(&root).await?;
        tree::tree_root(repo.document(&root)?)?;
        debug!(root = %root, "opened filesystem");
        Ok(VersionedFs {
            repo,
            blobs,
            root,
            closed: false,
        })
    }

    /// Opens a filesystem persisted under `data_dir`, creating it on first
    /// use.
    ///
    /// Wires up the on-disk layout: `automerge/` for document chunks,
    /// `blobs/` for blob files, and the `root-doc-id` file that records the
    /// handle across restarts.
    pub async fn open_dir<P: Into<PathBuf>>(data_dir: P) -> Result<Self> {
        let base = data_dir.into();
        let repo = DocumentRepo::new(Box::new(FsBackend::open(base.join("automerge"))));
        let blobs = Box::new(FsBlobStore::open(base.join("blobs")));

        let id_path = base.join(ROOT_ID_FILE);
        match tokio::fs::read_to_string(&id_path).await {
            Ok(text) => {
                let root: DocId = text.trim().parse()?;
                Self::open_existing(repo, blobs, root).await
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let engine = Self::open_new(repo, blobs).await?;
                tokio::fs::create_dir_all(&base).await?;
                tokio::fs::write(&id_path, engine.root_handle().as_str()).await?;
                Ok(engine)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The durable identifier callers persist to reopen this filesystem.
    pub fn root_handle(&self) -> &DocId {
        &self.root
    }

    /// Closes the engine. Every later operation fails with `EngineClosed`.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Read access to the blob store, mainly for inspection and tests.
    pub fn blob_store(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    // Filesystem operations

    /// Reads the full content of the file at `path`.
    ///
    /// Text bodies come back UTF-8 encoded; binary bodies come back as the
    /// raw blob bytes.
    pub async fn read(&mut self, p: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let p = path::normalize(p);
        let entry = self.require_entry(&p)?;
        trace!(path = %p, "read");
        match entry.body {
            None => Err(FsError::IsADirectory(p)),
            Some(FileBody::Blob(id)) => {
                let bytes = self.blobs.get(&id).await?.ok_or_else(|| {
                    FsError::StorageFault(format!("blob {} missing for {}", id, p))
                })?;
                Ok(bytes.to_vec())
            }
            Some(FileBody::Text(id)) => {
                self.repo.find(&id).await?;
                Ok(body::text_content(&self.repo, &id)?.into_bytes())
            }
        }
    }

    /// Reads the file at `path` as text.
    ///
    /// Returns `Err(InvalidUtf8)` if a binary body does not decode.
    pub async fn read_text(&mut self, p: &str) -> Result<String> {
        let p = path::normalize(p);
        let bytes = self.read(&p).await?;
        String::from_utf8(bytes).map_err(|_| FsError::InvalidUtf8(p))
    }

    /// Writes `content` to the file at `path`, creating it if absent.
    ///
    /// The parent must already exist as a directory. Body routing follows
    /// UTF-8 validity; `mtime` is set to now, `ctime` and `mode` are
    /// preserved for existing entries.
    pub async fn write(&mut self, p: &str, content: impl Into<WriteContent>) -> Result<()> {
        self.ensure_open()?;
        let p = path::normalize(p);
        self.require_parent_dir(&p)?;

        let existing = self.entry(&p)?;
        if let Some(entry) = &existing {
            if entry.is_dir() {
                return Err(FsError::IsADirectory(p));
            }
        }

        let routed = body::route_write(
            &mut self.repo,
            self.blobs.as_ref(),
            existing.as_ref().and_then(|e| e.body.as_ref()),
            content.into(),
        )
        .await?;

        let now = unix_time();
        let (mode, ctime) = match &existing {
            Some(entry) => (entry.meta.mode, entry.meta.ctime),
            None => (DEFAULT_FILE_MODE, now),
        };
        let entry = TreeEntry {
            kind: EntryKind::File,
            parent: Some(path::parent(&p)),
            name: SmolStr::new(path::basename(&p)),
            meta: EntryMeta {
                size: routed.size,
                mode,
                mtime: now,
                ctime,
            },
            body: Some(routed.body),
        };
        self.commit_tree(|tx, tree_obj| tree::put_entry(tx, tree_obj, &p, &entry))
            .await?;

        // The old blob is unreferenced as of the commit above.
        if let Some(stale) = routed.stale_blob {
            self.blobs.delete(&stale).await?;
        }
        debug!(path = %p, size = entry.meta.size, "write");
        Ok(())
    }

    /// Appends `text` to the file at `path`, creating it if absent.
    ///
    /// Routed through the character-level merge, so only the suffix is a
    /// real insertion in the file's history.
    pub async fn append(&mut self, p: &str, text: &str) -> Result<()> {
        self.ensure_open()?;
        let p = path::normalize(p);
        if self.entry(&p)?.is_none() {
            return self.write(&p, text).await;
        }
        let mut content = self.read_text(&p).await?;
        content.push_str(text);
        self.write(&p, content).await
    }

    /// Returns metadata for the entry at `path`.
    pub fn stat(&self, p: &str) -> Result<FileStat> {
        self.ensure_open()?;
        let p = path::normalize(p);
        let entry = self.require_entry(&p)?;
        Ok(FileStat {
            kind: entry.kind,
            size: entry.meta.size,
            mode: entry.meta.mode,
            mtime: entry.meta.mtime,
            ctime: entry.meta.ctime,
        })
    }

    /// Returns `true` if an entry exists at `path`. Only a closed engine
    /// makes this fail.
    pub fn exists(&self, p: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.entry(&path::normalize(p)).map(|e| e.is_some()).unwrap_or(false))
    }

    /// Lists the entries of the directory at `path`. Order is the tree
    /// map's key order.
    pub fn readdir(&self, p: &str) -> Result<Vec<DirEntry>> {
        self.ensure_open()?;
        let p = path::normalize(p);
        let entry = self.require_entry(&p)?;
        if !entry.is_dir() {
            return Err(FsError::NotADirectory(p));
        }
        let doc = self.repo.document(&self.root)?;
        let tree_obj = tree::tree_root(doc)?;
        Ok(tree::children(doc, &tree_obj, &p)?
            .into_iter()
            .map(|(_, child)| DirEntry {
                name: child.name.clone(),
                kind: child.kind,
                size: child.meta.size,
            })
            .collect())
    }

    /// Creates the directory at `path`.
    ///
    /// Idempotent when the target already is a directory. With `recursive`,
    /// missing ancestors are created in the same commit.
    pub async fn mkdir(&mut self, p: &str, recursive: bool) -> Result<()> {
        self.ensure_open()?;
        let p = path::normalize(p);
        match self.entry(&p)? {
            Some(entry) if entry.is_dir() => return Ok(()),
            Some(_) => return Err(FsError::AlreadyExists(p)),
            None => {}
        }

        let mut missing = vec![p.clone()];
        if recursive {
            let mut cursor = path::parent(&p);
            while self.entry(&cursor)?.is_none() {
                missing.push(cursor.clone());
                cursor = path::parent(&cursor);
            }
            if !self.entry(&cursor)?.map_or(false, |e| e.is_dir()) {
                return Err(FsError::NotADirectory(cursor));
            }
        } else {
            let parent = path::parent(&p);
            match self.entry(&parent)? {
                None => return Err(FsError::FileNotFound(parent)),
                Some(entry) if !entry.is_dir() => return Err(FsError::NotADirectory(parent)),
                _ => {}
            }
        }

        let now = unix_time();
        missing.reverse();
        self.commit_tree(|tx, tree_obj| {
            for dir in &missing {
                tree::put_entry(
                    tx,
                    tree_obj,
                    dir,
                    &TreeEntry::directory(dir, DEFAULT_DIR_MODE, now),
                )?;
            }
            Ok(())
        })
        .await?;
        debug!(path = %p, recursive, "mkdir");
        Ok(())
    }

    /// Removes the entry at `path`.
    ///
    /// Directories require `recursive` and are removed depth first. File
    /// bodies are reclaimed: blobs are deleted from the store, text handles
    /// are evicted (the documents themselves are orphaned, not destroyed).
    pub async fn rm(&mut self, p: &str, recursive: bool) -> Result<()> {
        self.ensure_open()?;
        let p = path::normalize(p);
        let entry = self.require_entry(&p)?;
        if p == "/" {
            return Err(FsError::IsADirectory(p));
        }
        if entry.is_dir() && !recursive {
            return Err(FsError::IsADirectory(p));
        }

        let mut doomed = Vec::new();
        self.collect_subtree(&p, &entry, &mut doomed)?;

        self.commit_tree(|tx, tree_obj| {
            for (victim, _) in &doomed {
                tree::remove_entry(tx, tree_obj, victim)?;
            }
            Ok(())
        })
        .await?;

        for (_, victim) in &doomed {
            match &victim.body {
                Some(FileBody::Text(id)) => self.repo.evict(id),
                Some(FileBody::Blob(id)) => self.blobs.delete(id).await?,
                None => {}
            }
        }
        debug!(path = %p, entries = doomed.len(), "rm");
        Ok(())
    }

    /// Moves the file at `src` to `dst`, preserving its body pointer and
    /// with it the file's entire history.
    ///
    /// Directory moves are refused with `NotSupported`. An existing file at
    /// `dst` is overwritten; an existing directory fails `IsADirectory`.
    pub async fn mv(&mut self, src: &str, dst: &str) -> Result<()> {
        self.ensure_open()?;
        let src = path::normalize(src);
        let dst = path::normalize(dst);

        let entry = self.require_entry(&src)?;
        if entry.is_dir() {
            return Err(FsError::NotSupported("directory moves"));
        }
        self.require_parent_dir(&dst)?;

        let overwritten = self.entry(&dst)?;
        if let Some(target) = &overwritten {
            if target.is_dir() {
                return Err(FsError::IsADirectory(dst));
            }
        }
        if src == dst {
            return Ok(());
        }

        let moved = TreeEntry {
            kind: EntryKind::File,
            parent: Some(path::parent(&dst)),
            name: SmolStr::new(path::basename(&dst)),
            meta: EntryMeta {
                mtime: unix_time(),
                ..entry.meta
            },
            body: entry.body.clone(),
        };
        self.commit_tree(|tx, tree_obj| {
            tree::remove_entry(tx, tree_obj, &src)?;
            tree::put_entry(tx, tree_obj, &dst, &moved)
        })
        .await?;

        if let Some(old_body) = overwritten.and_then(|t| t.body) {
            match old_body {
                FileBody::Text(id) => self.repo.evict(&id),
                FileBody::Blob(id) => {
                    // Identical content at src and dst shares one blob; keep
                    // it when the moved entry still points there.
                    if entry.blob() != Some(&id) {
                        self.blobs.delete(&id).await?;
                    }
                }
            }
        }
        debug!(%src, %dst, "mv");
        Ok(())
    }

    /// Copies `src` to `dst` by re-reading and re-writing content, so the
    /// copy starts a fresh history. Directories require `recursive`.
    pub async fn cp(&mut self, src: &str, dst: &str, recursive: bool) -> Result<()> {
        self.ensure_open()?;
        let src = path::normalize(src);
        let dst = path::normalize(dst);

        let entry = self.require_entry(&src)?;
        if entry.is_file() {
            return self.cp_file(&src, &dst).await;
        }
        if !recursive {
            return Err(FsError::IsADirectory(src));
        }
        if dst == src || dst.starts_with(&format!("{}/", src)) {
            return Err(FsError::NotSupported("copying a directory into itself"));
        }

        self.mkdir(&dst, false).await?;
        let mut queue = vec![(src.clone(), dst.clone())];
        while let Some((from, to)) = queue.pop() {
            let kids = {
                let doc = self.repo.document(&self.root)?;
                let tree_obj = tree::tree_root(doc)?;
                tree::children(doc, &tree_obj, &from)?
            };
            for (child_path, child) in kids {
                let child_dst = path::join(&to, child.name.as_str());
                if child.is_dir() {
                    self.mkdir(&child_dst, false).await?;
                    queue.push((child_path, child_dst));
                } else {
                    self.cp_file(&child_path, &child_dst).await?;
                }
            }
        }
        debug!(%src, %dst, "cp");
        Ok(())
    }

    /// Sets the mode bits of the entry at `path`. Metadata only; the engine
    /// never enforces them.
    pub async fn chmod(&mut self, p: &str, mode: u32) -> Result<()> {
        self.ensure_open()?;
        let p = path::normalize(p);
        let mut entry = self.require_entry(&p)?;
        entry.meta.mode = mode;
        self.commit_tree(|tx, tree_obj| tree::put_entry(tx, tree_obj, &p, &entry))
            .await
    }

    /// Sets timestamps on the entry at `path`. Only `mtime` is persisted.
    pub async fn utimes(&mut self, p: &str, _atime: i64, mtime: i64) -> Result<()> {
        self.ensure_open()?;
        let p = path::normalize(p);
        let mut entry = self.require_entry(&p)?;
        entry.meta.mtime = mtime;
        self.commit_tree(|tx, tree_obj| tree::put_entry(tx, tree_obj, &p, &entry))
            .await
    }

    // History operations

    /// Current heads of the root document.
    pub fn root_heads(&self) -> Result<Vec<ChangeHash>> {
        self.ensure_open()?;
        self.repo.heads(&self.root)
    }

    /// Change log of the root document: every structural mutation of the
    /// tree, in causal order.
    pub fn root_history(&self) -> Result<Vec<ChangeSummary>> {
        self.ensure_open()?;
        self.repo.history(&self.root)
    }

    /// Current heads of the file's text document; empty if the path is
    /// absent or binary.
    pub async fn file_heads(&mut self, p: &str) -> Result<Vec<ChangeHash>> {
        self.ensure_open()?;
        match self.text_doc_at(p).await? {
            Some(id) => self.repo.heads(&id),
            None => Ok(Vec::new()),
        }
    }

    /// Change log of the file's text document in causal order; empty if the
    /// path is absent or binary.
    pub async fn file_history(&mut self, p: &str) -> Result<Vec<ChangeSummary>> {
        self.ensure_open()?;
        match self.text_doc_at(p).await? {
            Some(id) => self.repo.history(&id),
            None => Ok(Vec::new()),
        }
    }

    /// Content of the file's text document at `heads`; empty string if the
    /// path is absent or binary or any head is unknown.
    pub async fn view_at(&mut self, p: &str, heads: &[ChangeHash]) -> Result<String> {
        self.ensure_open()?;
        let id = match self.text_doc_at(p).await? {
            Some(id) => id,
            None => return Ok(String::new()),
        };
        match self.repo.view(&id, heads)? {
            Some(view) => Ok(view.text(body::CONTENT_FIELD)?.unwrap_or_default()),
            None => Ok(String::new()),
        }
    }

    /// Structural patches of the file's text document between two version
    /// points; empty if the path is absent or binary or any head is
    /// unknown.
    pub async fn diff(
        &mut self,
        p: &str,
        from: &[ChangeHash],
        to: &[ChangeHash],
    ) -> Result<Vec<Patch>> {
        self.ensure_open()?;
        let id = match self.text_doc_at(p).await? {
            Some(id) => id,
            None => return Ok(Vec::new()),
        };
        self.repo.diff(&id, from, to)
    }

    /// Records the current root heads together with an optional label. The
    /// label is for the caller to store; it is not persisted here.
    pub fn snapshot(&self, label: Option<&str>) -> Result<Snapshot> {
        self.ensure_open()?;
        Ok(Snapshot {
            heads: self.repo.heads(&self.root)?,
            label: label.map(str::to_owned),
            timestamp: unix_time(),
        })
    }

    // Internals

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(FsError::EngineClosed)
        } else {
            Ok(())
        }
    }

    fn entry(&self, p: &str) -> Result<Option<TreeEntry>> {
        let doc = self.repo.document(&self.root)?;
        let tree_obj = tree::tree_root(doc)?;
        tree::get_entry(doc, &tree_obj, p)
    }

    fn require_entry(&self, p: &str) -> Result<TreeEntry> {
        self.entry(p)?
            .ok_or_else(|| FsError::FileNotFound(p.to_owned()))
    }

    fn require_parent_dir(&self, p: &str) -> Result<()> {
        let parent = path::parent(p);
        match self.entry(&parent)? {
            None => Err(FsError::FileNotFound(parent)),
            Some(entry) if !entry.is_dir() => Err(FsError::NotADirectory(parent)),
            _ => Ok(()),
        }
    }

    /// Resolves the path to its text document handle and makes it resident.
    async fn text_doc_at(&mut self, p: &str) -> Result<Option<DocId>> {
        let p = path::normalize(p);
        let id = match self.entry(&p)? {
            Some(entry) => match entry.text_doc() {
                Some(id) => id.clone(),
                None => return Ok(None),
            },
            None => return Ok(None),
        };
        self.repo.find(&id).await?;
        Ok(Some(id))
    }

    fn collect_subtree(
        &self,
        p: &str,
        entry: &TreeEntry,
        out: &mut Vec<(String, TreeEntry)>,
    ) -> Result<()> {
        if entry.is_dir() {
            let kids = {
                let doc = self.repo.document(&self.root)?;
                let tree_obj = tree::tree_root(doc)?;
                tree::children(doc, &tree_obj, p)?
            };
            for (child_path, child) in kids {
                self.collect_subtree(&child_path, &child, out)?;
            }
        }
        out.push((p.to_owned(), entry.clone()));
        Ok(())
    }

    async fn cp_file(&mut self, src: &str, dst: &str) -> Result<()> {
        let bytes = self.read(src).await?;
        self.write(dst, bytes).await
    }

    async fn commit_tree<O>(
        &mut self,
        mutate: impl FnOnce(&mut automerge::transaction::Transaction<'_>, &automerge::ObjId) -> Result<O>,
    ) -> Result<O> {
        let root = self.root.clone();
        self.repo
            .change(&root, None, |tx| {
                let tree_obj = tree::tree_root(tx)?;
                mutate(tx, &tree_obj)
            })
            .await
    }
}

impl std::fmt::Debug for VersionedFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(VersionedFs))
            .field("root", &self.root)
            .field("closed", &self.closed)
            .finish()
    }
}

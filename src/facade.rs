//! The filesystem interface handed to the in-process bash interpreter.
//!
//! A pure translation layer over [`VersionedFs`]: it owns no state and adds
//! no behavior beyond the path helpers and the explicit refusal of link
//! operations, which this filesystem does not model.

use crate::body::WriteContent;
use crate::engine::{DirEntry, FileStat, VersionedFs};
use crate::error::{FsError, Result};
use crate::path;

/// Adapter exposing the operation set a shell expects.
#[derive(Debug)]
pub struct FsFacade<'a> {
    engine: &'a mut VersionedFs,
}

impl<'a> FsFacade<'a> {
    pub fn new(engine: &'a mut VersionedFs) -> Self {
        FsFacade { engine }
    }

    pub async fn read_text(&mut self, p: &str) -> Result<String> {
        self.engine.read_text(p).await
    }

    pub async fn read_bytes(&mut self, p: &str) -> Result<Vec<u8>> {
        self.engine.read(p).await
    }

    pub async fn write(&mut self, p: &str, content: impl Into<WriteContent>) -> Result<()> {
        self.engine.write(p, content).await
    }

    pub async fn append(&mut self, p: &str, text: &str) -> Result<()> {
        self.engine.append(p, text).await
    }

    pub fn exists(&self, p: &str) -> Result<bool> {
        self.engine.exists(p)
    }

    pub fn stat(&self, p: &str) -> Result<FileStat> {
        self.engine.stat(p)
    }

    /// Identical to `stat`: there are no symlinks to not follow.
    pub fn lstat(&self, p: &str) -> Result<FileStat> {
        self.engine.stat(p)
    }

    pub async fn mkdir(&mut self, p: &str, recursive: bool) -> Result<()> {
        self.engine.mkdir(p, recursive).await
    }

    pub fn readdir(&self, p: &str) -> Result<Vec<DirEntry>> {
        self.engine.readdir(p)
    }

    pub async fn rm(&mut self, p: &str, recursive: bool) -> Result<()> {
        self.engine.rm(p, recursive).await
    }

    pub async fn cp(&mut self, src: &str, dst: &str, recursive: bool) -> Result<()> {
        self.engine.cp(src, dst, recursive).await
    }

    pub async fn mv(&mut self, src: &str, dst: &str) -> Result<()> {
        self.engine.mv(src, dst).await
    }

    pub async fn chmod(&mut self, p: &str, mode: u32) -> Result<()> {
        self.engine.chmod(p, mode).await
    }

    pub async fn utimes(&mut self, p: &str, atime: i64, mtime: i64) -> Result<()> {
        self.engine.utimes(p, atime, mtime).await
    }

    /// Resolves `rel` against `base` the way a shell would.
    pub fn resolve_path(&self, base: &str, rel: &str) -> String {
        path::join(base, rel)
    }

    /// Returns the normalized form of `p` without probing existence.
    pub fn realpath(&self, p: &str) -> String {
        path::normalize(p)
    }

    pub fn symlink(&mut self, _target: &str, _link: &str) -> Result<()> {
        Err(FsError::NotSupported("symlinks"))
    }

    pub fn link(&mut self, _target: &str, _link: &str) -> Result<()> {
        Err(FsError::NotSupported("hard links"))
    }

    pub fn readlink(&self, _p: &str) -> Result<String> {
        Err(FsError::NotSupported("symlinks"))
    }
}

//! Versioned virtual filesystem engine for agent tooling.
//!
//! Replaces a physical working tree with an in-memory hierarchy whose every
//! mutation is recorded by a CRDT engine, so any prior state of any file can
//! be reconstructed, diffed, and restored. Storage is three-tiered: one root
//! document holds the path → entry tree, each text file gets its own CRDT
//! document with character-level merge semantics, and binary bodies live in
//! a content-addressed blob store keyed by SHA-256.
//!
//! [`VersionedFs`] is the engine; [`FsFacade`] is the thin projection handed
//! to the external bash interpreter. Hosts that want the standard on-disk
//! layout use [`VersionedFs::open_dir`]; everything else composes a
//! [`DocumentRepo`] over a [`StorageBackend`] with a [`BlobStore`].

pub use self::blob::{BlobId, BlobStore, FsBlobStore, MemoryBlobStore};
pub use self::body::WriteContent;
pub use self::engine::{DirEntry, FileStat, Snapshot, VersionedFs};
pub use self::error::{FsError, Result};
pub use self::facade::FsFacade;
pub use self::repo::{ChangeSummary, DocId, DocView, DocumentRepo};
pub use self::storage::{FsBackend, MemoryBackend, StorageBackend};
pub use self::tree::{EntryKind, EntryMeta, FileBody, TreeEntry};

pub use automerge::{ChangeHash, Patch};

pub mod path;

mod blob;
mod body;
mod engine;
mod error;
mod facade;
mod repo;
mod storage;
mod tree;

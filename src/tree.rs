//! Tree entries and operations over the root document's path map.
//!
//! The root document has a single logical field, a map called `tree` keyed by
//! normalized path. Everything here runs either against a read-only document
//! or inside one transaction on it, so post-conditions are atomic with
//! respect to readers.

use automerge::transaction::Transactable;
use automerge::{ObjId, ObjType, ReadDoc, ScalarValue, Value};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::blob::BlobId;
use crate::error::{FsError, Result};
use crate::path;
use crate::repo::DocId;

const TREE_FIELD: &str = "tree";

const KIND_FIELD: &str = "kind";
const PARENT_FIELD: &str = "parent";
const NAME_FIELD: &str = "name";
const SIZE_FIELD: &str = "size";
const MODE_FIELD: &str = "mode";
const MTIME_FIELD: &str = "mtime";
const CTIME_FIELD: &str = "ctime";
const TEXT_DOC_FIELD: &str = "text_doc_id";
const BLOB_HASH_FIELD: &str = "blob_hash";

const FILE_KIND: &str = "file";
const DIRECTORY_KIND: &str = "directory";

/// Whether a tree entry is a file or a directory.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            EntryKind::File => FILE_KIND,
            EntryKind::Directory => DIRECTORY_KIND,
        }
    }
}

/// The body of a file entry: exactly one of a text document or a blob.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FileBody {
    /// Handle to the per-file CRDT text document.
    Text(DocId),
    /// Digest of the blob holding raw bytes.
    Blob(BlobId),
}

/// Stored-but-unenforced file metadata.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct EntryMeta {
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    pub ctime: i64,
}

/// The record stored at each normalized path.
#[derive(Clone, Debug, PartialEq)]
pub struct TreeEntry {
    pub kind: EntryKind,
    /// Normalized parent path; absent only for the root.
    pub parent: Option<String>,
    /// Basename, stored so listings need not re-parse the key.
    pub name: SmolStr,
    pub meta: EntryMeta,
    /// Present exactly for files.
    pub body: Option<FileBody>,
}

impl TreeEntry {
    /// Builds a directory entry for `dir_path`.
    pub fn directory(dir_path: &str, mode: u32, now: i64) -> Self {
        let parent = if dir_path == "/" {
            None
        } else {
            Some(path::parent(dir_path))
        };
        TreeEntry {
            kind: EntryKind::Directory,
            parent,
            name: SmolStr::new(path::basename(dir_path)),
            meta: EntryMeta {
                size: 0,
                mode,
                mtime: now,
                ctime: now,
            },
            body: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// Returns the text document handle, if this is a text file.
    pub fn text_doc(&self) -> Option<&DocId> {
        match &self.body {
            Some(FileBody::Text(id)) => Some(id),
            _ => None,
        }
    }

    /// Returns the blob digest, if this is a binary file.
    pub fn blob(&self) -> Option<&BlobId> {
        match &self.body {
            Some(FileBody::Blob(id)) => Some(id),
            _ => None,
        }
    }
}

/// Locates the `tree` map in the root document.
pub(crate) fn tree_root<R: ReadDoc>(doc: &R) -> Result<ObjId> {
    match doc.get(automerge::ROOT, TREE_FIELD)? {
        Some((Value::Object(ObjType::Map), obj)) => Ok(obj),
        _ => Err(FsError::StorageFault(
            "root document has no tree map".to_owned(),
        )),
    }
}

/// Creates the `tree` map and its root directory entry in a fresh document.
pub(crate) fn init_tree<T: Transactable>(tx: &mut T, mode: u32, now: i64) -> Result<ObjId> {
    let tree = tx.put_object(automerge::ROOT, TREE_FIELD, ObjType::Map)?;
    put_entry(tx, &tree, "/", &TreeEntry::directory("/", mode, now))?;
    Ok(tree)
}

/// Reads the entry at `key`, or `None` if the path is absent.
///
/// Returns `Err(StorageFault)` if the stored record violates the entry
/// invariants, which only happens on corruption.
pub(crate) fn get_entry<R: ReadDoc>(doc: &R, tree: &ObjId, key: &str) -> Result<Option<TreeEntry>> {
    let entry = match doc.get(tree, key)? {
        Some((Value::Object(ObjType::Map), obj)) => obj,
        Some(_) => {
            return Err(FsError::StorageFault(format!(
                "malformed tree entry at {}",
                key
            )))
        }
        None => return Ok(None),
    };

    let kind = match scalar_str(doc, &entry, KIND_FIELD)?.as_deref() {
        Some(FILE_KIND) => EntryKind::File,
        Some(DIRECTORY_KIND) => EntryKind::Directory,
        _ => {
            return Err(FsError::StorageFault(format!(
                "tree entry at {} has no kind",
                key
            )))
        }
    };

    let parent = scalar_str(doc, &entry, PARENT_FIELD)?;
    let name = scalar_str(doc, &entry, NAME_FIELD)?.unwrap_or_else(|| path::basename(key));
    let meta = EntryMeta {
        size: scalar_u64(doc, &entry, SIZE_FIELD)?.unwrap_or(0),
        mode: scalar_u64(doc, &entry, MODE_FIELD)?.unwrap_or(0) as u32,
        mtime: scalar_i64(doc, &entry, MTIME_FIELD)?.unwrap_or(0),
        ctime: scalar_i64(doc, &entry, CTIME_FIELD)?.unwrap_or(0),
    };

    let text_doc = scalar_str(doc, &entry, TEXT_DOC_FIELD)?;
    let blob_hash = scalar_str(doc, &entry, BLOB_HASH_FIELD)?;
    let body = match (kind, text_doc, blob_hash) {
        (EntryKind::Directory, None, None) => None,
        (EntryKind::File, Some(id), None) => Some(FileBody::Text(id.parse()?)),
        (EntryKind::File, None, Some(hash)) => Some(FileBody::Blob(hash.parse()?)),
        _ => {
            return Err(FsError::StorageFault(format!(
                "tree entry at {} violates the body invariant",
                key
            )))
        }
    };

    Ok(Some(TreeEntry {
        kind,
        parent,
        name: SmolStr::new(name),
        meta,
        body,
    }))
}

/// Inserts or replaces the entry at `key`.
///
/// The caller guarantees the path/tree invariants; this only encodes the
/// record.
pub(crate) fn put_entry<T: Transactable>(
    tx: &mut T,
    tree: &ObjId,
    key: &str,
    entry: &TreeEntry,
) -> Result<()> {
    let obj = tx.put_object(tree, key, ObjType::Map)?;
    tx.put(&obj, KIND_FIELD, entry.kind.as_str())?;
    if let Some(parent) = &entry.parent {
        tx.put(&obj, PARENT_FIELD, parent.as_str())?;
    }
    tx.put(&obj, NAME_FIELD, entry.name.as_str())?;
    tx.put(&obj, SIZE_FIELD, entry.meta.size)?;
    tx.put(&obj, MODE_FIELD, entry.meta.mode as u64)?;
    tx.put(&obj, MTIME_FIELD, entry.meta.mtime)?;
    tx.put(&obj, CTIME_FIELD, entry.meta.ctime)?;
    match &entry.body {
        Some(FileBody::Text(id)) => tx.put(&obj, TEXT_DOC_FIELD, id.as_str())?,
        Some(FileBody::Blob(id)) => tx.put(&obj, BLOB_HASH_FIELD, id.as_str())?,
        None => {}
    }
    Ok(())
}

/// Removes the entry at `key` only; recursion is the caller's concern.
pub(crate) fn remove_entry<T: Transactable>(tx: &mut T, tree: &ObjId, key: &str) -> Result<()> {
    tx.delete(tree, key)?;
    Ok(())
}

/// Scans the map for entries whose parent is `dir_path`.
///
/// Order follows the map's key order, which is stable within one snapshot.
pub(crate) fn children<R: ReadDoc>(
    doc: &R,
    tree: &ObjId,
    dir_path: &str,
) -> Result<Vec<(String, TreeEntry)>> {
    let mut out = Vec::new();
    for key in doc.keys(tree) {
        if let Some(entry) = get_entry(doc, tree, &key)? {
            if entry.parent.as_deref() == Some(dir_path) {
                out.push((key, entry));
            }
        }
    }
    Ok(out)
}

/// Returns every key in the map.
pub(crate) fn all_paths<R: ReadDoc>(doc: &R, tree: &ObjId) -> Vec<String> {
    doc.keys(tree).collect()
}

fn scalar<R: ReadDoc>(doc: &R, obj: &ObjId, key: &str) -> Result<Option<ScalarValue>> {
    match doc.get(obj, key)? {
        Some((Value::Scalar(s), _)) => Ok(Some(s.into_owned())),
        Some(_) => Err(FsError::StorageFault(format!(
            "tree entry field {} is not a scalar",
            key
        ))),
        None => Ok(None),
    }
}

fn scalar_str<R: ReadDoc>(doc: &R, obj: &ObjId, key: &str) -> Result<Option<String>> {
    Ok(match scalar(doc, obj, key)? {
        Some(ScalarValue::Str(s)) => Some(s.to_string()),
        _ => None,
    })
}

fn scalar_u64<R: ReadDoc>(doc: &R, obj: &ObjId, key: &str) -> Result<Option<u64>> {
    Ok(match scalar(doc, obj, key)? {
        Some(ScalarValue::Uint(n)) => Some(n),
        Some(ScalarValue::Int(n)) if n >= 0 => Some(n as u64),
        _ => None,
    })
}

fn scalar_i64<R: ReadDoc>(doc: &R, obj: &ObjId, key: &str) -> Result<Option<i64>> {
    Ok(match scalar(doc, obj, key)? {
        Some(ScalarValue::Int(n)) => Some(n),
        Some(ScalarValue::Uint(n)) => Some(n as i64),
        Some(ScalarValue::Timestamp(n)) => Some(n),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use automerge::{ActorId, Automerge};

    fn with_tree(f: impl FnOnce(&mut automerge::transaction::Transaction<'_>, &ObjId) -> Result<()>) -> Automerge {
        let mut doc = Automerge::new().with_actor(ActorId::random());
        doc.transact(|tx| {
            let tree = init_tree(tx, 0o755, 1_700_000_000)?;
            f(tx, &tree)
        })
        .map_err(|failure| failure.error)
        .expect("transaction failed");
        doc
    }

    fn file_entry(file_path: &str, body: FileBody, size: u64) -> TreeEntry {
        TreeEntry {
            kind: EntryKind::File,
            parent: Some(path::parent(file_path)),
            name: SmolStr::new(path::basename(file_path)),
            meta: EntryMeta {
                size,
                mode: 0o644,
                mtime: 1_700_000_001,
                ctime: 1_700_000_000,
            },
            body: Some(body),
        }
    }

    #[test]
    fn root_entry_is_a_directory_with_no_parent() {
        let doc = with_tree(|_, _| Ok(()));
        let tree = tree_root(&doc).unwrap();
        let root = get_entry(&doc, &tree, "/").unwrap().unwrap();
        assert!(root.is_dir());
        assert_eq!(root.parent, None);
        assert_eq!(root.name.as_str(), "/");
        assert!(root.body.is_none());
    }

    #[test]
    fn entries_round_trip_through_the_document() {
        let text = file_entry("/a.txt", FileBody::Text(DocId::random()), 5);
        let blob = file_entry("/b.bin", FileBody::Blob(BlobId::of(&[0, 1, 2])), 3);

        let doc = with_tree(|tx, tree| {
            put_entry(tx, tree, "/a.txt", &text)?;
            put_entry(tx, tree, "/b.bin", &blob)?;
            Ok(())
        });

        let tree = tree_root(&doc).unwrap();
        assert_eq!(get_entry(&doc, &tree, "/a.txt").unwrap().unwrap(), text);
        assert_eq!(get_entry(&doc, &tree, "/b.bin").unwrap().unwrap(), blob);
        assert!(get_entry(&doc, &tree, "/missing").unwrap().is_none());
    }

    #[test]
    fn children_filters_on_the_parent_field() {
        let doc = with_tree(|tx, tree| {
            put_entry(tx, tree, "/d", &TreeEntry::directory("/d", 0o755, 0))?;
            put_entry(tx, tree, "/d/x", &file_entry("/d/x", FileBody::Text(DocId::random()), 1))?;
            put_entry(tx, tree, "/d/y", &file_entry("/d/y", FileBody::Text(DocId::random()), 1))?;
            put_entry(tx, tree, "/top", &file_entry("/top", FileBody::Text(DocId::random()), 1))?;
            Ok(())
        });

        let tree = tree_root(&doc).unwrap();
        let mut names: Vec<_> = children(&doc, &tree, "/d")
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        names.sort();
        assert_eq!(names, vec!["/d/x", "/d/y"]);

        let top: Vec<_> = children(&doc, &tree, "/").unwrap();
        assert_eq!(top.len(), 3);
    }

    #[test]
    fn remove_entry_deletes_only_the_given_key() {
        let mut doc = with_tree(|tx, tree| {
            put_entry(tx, tree, "/d", &TreeEntry::directory("/d", 0o755, 0))?;
            put_entry(tx, tree, "/d/x", &file_entry("/d/x", FileBody::Text(DocId::random()), 1))?;
            Ok(())
        });

        doc.transact(|tx| {
            let tree = tree_root(tx)?;
            remove_entry(tx, &tree, "/d/x")
        })
        .map_err(|failure| failure.error)
        .unwrap();

        let tree = tree_root(&doc).unwrap();
        assert!(get_entry(&doc, &tree, "/d/x").unwrap().is_none());
        assert!(get_entry(&doc, &tree, "/d").unwrap().is_some());
        assert_eq!(all_paths(&doc, &tree).len(), 2);
    }
}

//! Text-versus-binary classification and routing of file bodies.
//!
//! Text bodies live in per-file CRDT documents so edits merge at character
//! granularity; anything that is not valid UTF-8 goes to the blob store as
//! raw bytes. The router never touches tree entries itself; it hands the
//! finished body back to the engine, which commits the tree write.

use automerge::transaction::Transactable;
use automerge::{ObjId, ObjType, ReadDoc, Value};

use crate::blob::{BlobId, BlobStore};
use crate::error::Result;
use crate::repo::{DocId, DocumentRepo};
use crate::tree::FileBody;

/// Name of the single text field inside each per-file document.
pub(crate) const CONTENT_FIELD: &str = "content";

/// Content accepted by a write: already-text, or bytes to be classified.
#[derive(Clone, Debug)]
pub enum WriteContent {
    Text(String),
    Bytes(Vec<u8>),
}

impl From<String> for WriteContent {
    fn from(text: String) -> Self {
        WriteContent::Text(text)
    }
}

impl From<&str> for WriteContent {
    fn from(text: &str) -> Self {
        WriteContent::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for WriteContent {
    fn from(bytes: Vec<u8>) -> Self {
        WriteContent::Bytes(bytes)
    }
}

impl From<&[u8]> for WriteContent {
    fn from(bytes: &[u8]) -> Self {
        WriteContent::Bytes(bytes.to_vec())
    }
}

enum Classified {
    Text(String),
    Binary(Vec<u8>),
}

/// Classifies content: strings are text by construction, bytes are text
/// exactly when they decode as strict UTF-8.
fn classify(content: WriteContent) -> Classified {
    match content {
        WriteContent::Text(text) => Classified::Text(text),
        WriteContent::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Classified::Text(text),
            Err(err) => Classified::Binary(err.into_bytes()),
        },
    }
}

/// The outcome of routing one write.
pub(crate) struct RoutedBody {
    /// The body pointer the tree entry should carry.
    pub body: FileBody,
    /// Byte length of the body, for the entry's size field.
    pub size: u64,
    /// A blob the path no longer references. Deleted by the engine after the
    /// tree commit, so readers never see a dangling reference.
    pub stale_blob: Option<BlobId>,
}

/// Routes `content` to the right body store for a path whose current body is
/// `existing`.
///
/// Binary bodies are written to the blob store *before* this returns, so the
/// tree entry that references them is always committed second. Text bodies
/// reuse the path's existing text document, rewriting its content through a
/// character-level diff so concurrent edits still merge; a fresh document is
/// allocated only when the path has none, including when it is switching
/// over from a blob.
pub(crate) async fn route_write(
    repo: &mut DocumentRepo,
    blobs: &dyn BlobStore,
    existing: Option<&FileBody>,
    content: WriteContent,
) -> Result<RoutedBody> {
    match classify(content) {
        Classified::Binary(bytes) => {
            let id = BlobId::of(&bytes);
            blobs.put(&id, &bytes).await?;

            if let Some(FileBody::Text(doc_id)) = existing {
                // The text document is orphaned, not destroyed; only the
                // resident handle goes away.
                repo.evict(doc_id);
            }
            let stale_blob = match existing {
                Some(FileBody::Blob(old)) if *old != id => Some(old.clone()),
                _ => None,
            };

            Ok(RoutedBody {
                size: bytes.len() as u64,
                body: FileBody::Blob(id),
                stale_blob,
            })
        }
        Classified::Text(text) => {
            let size = text.len() as u64;
            let doc_id = match existing {
                Some(FileBody::Text(id)) => {
                    let id = id.clone();
                    repo.find(&id).await?;
                    repo.change(&id, None, |tx| {
                        let content_obj = content_field(tx)?;
                        tx.update_text(&content_obj, &text)?;
                        Ok(())
                    })
                    .await?;
                    id
                }
                _ => {
                    let id = repo.create().await?;
                    repo.change(&id, None, |tx| {
                        let content_obj =
                            tx.put_object(automerge::ROOT, CONTENT_FIELD, ObjType::Text)?;
                        if !text.is_empty() {
                            tx.splice_text(&content_obj, 0, 0, &text)?;
                        }
                        Ok(())
                    })
                    .await?;
                    id
                }
            };

            let stale_blob = match existing {
                Some(FileBody::Blob(old)) => Some(old.clone()),
                _ => None,
            };

            Ok(RoutedBody {
                body: FileBody::Text(doc_id),
                size,
                stale_blob,
            })
        }
    }
}

/// Reads the text content of a resident per-file document. An absent or
/// malformed field reads as the empty string.
pub(crate) fn text_content(repo: &DocumentRepo, id: &DocId) -> Result<String> {
    let doc = repo.document(id)?;
    match doc.get(automerge::ROOT, CONTENT_FIELD)? {
        Some((Value::Object(ObjType::Text), obj)) => Ok(doc.text(&obj)?),
        _ => Ok(String::new()),
    }
}

fn content_field<T: Transactable + ReadDoc>(tx: &mut T) -> Result<ObjId> {
    match tx.get(automerge::ROOT, CONTENT_FIELD)? {
        Some((Value::Object(ObjType::Text), obj)) => Ok(obj),
        _ => Ok(tx.put_object(automerge::ROOT, CONTENT_FIELD, ObjType::Text)?),
    }
}

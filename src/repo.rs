//! Ownership, mutation, and history of CRDT documents.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use automerge::transaction::{CommitOptions, Transaction};
use automerge::{ActorId, Automerge, ChangeHash, ObjType, Patch, ReadDoc, Value};
use uuid::Uuid;

use crate::error::{FsError, Result};
use crate::storage::StorageBackend;

/// Seconds since the Unix epoch, used to tag commits and tree metadata.
pub(crate) fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A durable identifier for one CRDT document.
///
/// The root document's ID is the public handle of a whole filesystem; text
/// document IDs only ever appear inside tree entries.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DocId(String);

impl DocId {
    pub(crate) fn random() -> Self {
        DocId(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for DocId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}({})", stringify!(DocId), self.0)
    }
}

impl Display for DocId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DocId {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        let valid = !s.is_empty()
            && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(FsError::StorageFault(format!("invalid document id: {:?}", s)));
        }
        Ok(DocId(s.to_owned()))
    }
}

/// One entry of a document's change log, in causal order.
#[derive(Clone, Debug)]
pub struct ChangeSummary {
    pub hash: ChangeHash,
    pub actor: String,
    pub seq: u64,
    pub timestamp: i64,
    pub message: Option<String>,
}

/// A read-only projection of a document at a fixed set of heads.
#[derive(Debug)]
pub struct DocView {
    doc: Automerge,
}

impl DocView {
    /// Returns the content of the named text field, or `None` if the field
    /// is absent or not a text object at these heads.
    pub fn text(&self, field: &str) -> Result<Option<String>> {
        match self.doc.get(automerge::ROOT, field)? {
            Some((Value::Object(ObjType::Text), obj)) => Ok(Some(self.doc.text(&obj)?)),
            _ => Ok(None),
        }
    }
}

/// Owns every CRDT document the engine touches and persists their chunks
/// through a [`StorageBackend`].
///
/// Documents are resident once created or found; `evict` drops the in-memory
/// state without touching what the backend has stored.
pub struct DocumentRepo {
    backend: Box<dyn StorageBackend>,
    docs: HashMap<DocId, Automerge>,
}

impl Debug for DocumentRepo {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct(stringify!(DocumentRepo))
            .field("resident", &self.docs.len())
            .finish()
    }
}

impl DocumentRepo {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        DocumentRepo {
            backend,
            docs: HashMap::new(),
        }
    }

    /// Allocates a fresh document with empty state and persists it.
    pub async fn create(&mut self) -> Result<DocId> {
        let id = DocId::random();
        let doc = Automerge::new().with_actor(ActorId::random());
        let bytes = doc.save();
        self.backend.append(&id, &bytes).await?;
        self.docs.insert(id.clone(), doc);
        Ok(id)
    }

    /// Ensures the document is resident, loading it from the backend if
    /// necessary.
    ///
    /// Returns `Err(DocumentNotFound)` if the backend has never stored it.
    pub async fn find(&mut self, id: &DocId) -> Result<()> {
        if self.docs.contains_key(id) {
            return Ok(());
        }
        let bytes = self
            .backend
            .load(id)
            .await?
            .ok_or_else(|| FsError::DocumentNotFound(id.to_string()))?;
        let doc = Automerge::load(&bytes)?.with_actor(ActorId::random());
        self.docs.insert(id.clone(), doc);
        Ok(())
    }

    /// Applies `mutator` to the document inside one transaction.
    ///
    /// The commit is tagged with the wall clock and the optional message. A
    /// mutator that fails rolls the transaction back, leaving the document
    /// unchanged. On success the incremental chunk is persisted before this
    /// returns.
    pub async fn change<O>(
        &mut self,
        id: &DocId,
        message: Option<&str>,
        mutator: impl FnOnce(&mut Transaction<'_>) -> Result<O>,
    ) -> Result<O> {
        let now = unix_time();
        let msg = message.map(str::to_owned);
        let doc = self.doc_mut(id)?;
        let before = doc.get_heads();

        let out = doc
            .transact_with(
                |_| {
                    let opts = CommitOptions::default().with_time(now);
                    match msg {
                        Some(m) => opts.with_message(m),
                        None => opts,
                    }
                },
                mutator,
            )
            .map(|success| success.result)
            .map_err(|failure| failure.error)?;

        let chunk = doc.save_after(&before);
        if !chunk.is_empty() {
            self.backend.append(id, &chunk).await?;
        }
        Ok(out)
    }

    /// Returns the current frontier of the document's change graph.
    pub fn heads(&self, id: &DocId) -> Result<Vec<ChangeHash>> {
        Ok(self.doc(id)?.get_heads())
    }

    /// Returns the document's change log in causal order.
    pub fn history(&self, id: &DocId) -> Result<Vec<ChangeSummary>> {
        let doc = self.doc(id)?;
        let mut out = Vec::new();
        for change in doc.get_changes(&[]) {
            out.push(ChangeSummary {
                hash: change.hash(),
                actor: change.actor_id().to_hex_string(),
                seq: change.seq(),
                timestamp: change.timestamp(),
                message: change.message().map(|m| m.to_string()),
            });
        }
        Ok(out)
    }

    /// Returns a read-only view of the document at `heads`, or `None` if any
    /// of the heads is unknown to this document.
    pub fn view(&self, id: &DocId, heads: &[ChangeHash]) -> Result<Option<DocView>> {
        if !self.knows_heads(id, heads)? {
            return Ok(None);
        }
        let fork = self.doc(id)?.fork_at(heads)?;
        Ok(Some(DocView { doc: fork }))
    }

    /// Returns the structural patches between two version points, or an
    /// empty list if either set of heads is unknown.
    pub fn diff(&mut self, id: &DocId, from: &[ChangeHash], to: &[ChangeHash]) -> Result<Vec<Patch>> {
        if !self.knows_heads(id, from)? || !self.knows_heads(id, to)? {
            return Ok(Vec::new());
        }
        Ok(self.doc_mut(id)?.diff(from, to))
    }

    /// Drops the resident state for `id`. Persisted chunks are untouched; a
    /// later `find` brings the document back.
    pub fn evict(&mut self, id: &DocId) {
        self.docs.remove(id);
    }

    /// Returns `true` if the document is currently resident in memory.
    pub fn is_resident(&self, id: &DocId) -> bool {
        self.docs.contains_key(id)
    }

    pub(crate) fn document(&self, id: &DocId) -> Result<&Automerge> {
        self.doc(id)
    }

    fn knows_heads(&self, id: &DocId, heads: &[ChangeHash]) -> Result<bool> {
        let doc = self.doc(id)?;
        let known: HashSet<ChangeHash> =
            doc.get_changes(&[]).iter().map(|c| c.hash()).collect();
        Ok(heads.iter().all(|h| known.contains(h)))
    }

    fn doc(&self, id: &DocId) -> Result<&Automerge> {
        self.docs
            .get(id)
            .ok_or_else(|| FsError::DocumentNotFound(id.to_string()))
    }

    fn doc_mut(&mut self, id: &DocId) -> Result<&mut Automerge> {
        self.docs
            .get_mut(id)
            .ok_or_else(|| FsError::DocumentNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automerge::transaction::Transactable;

    use crate::storage::MemoryBackend;

    fn repo() -> DocumentRepo {
        DocumentRepo::new(Box::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn create_change_and_read_back() {
        let mut repo = repo();
        let id = repo.create().await.unwrap();

        repo.change(&id, None, |tx| {
            let content = tx.put_object(automerge::ROOT, "content", ObjType::Text)?;
            tx.splice_text(&content, 0, 0, "hello")?;
            Ok(())
        })
        .await
        .unwrap();

        let heads = repo.heads(&id).unwrap();
        assert_eq!(heads.len(), 1);

        let view = repo.view(&id, &heads).unwrap().expect("heads are known");
        assert_eq!(view.text("content").unwrap().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn failed_mutator_rolls_back() {
        let mut repo = repo();
        let id = repo.create().await.unwrap();

        let before = repo.heads(&id).unwrap();
        let result: Result<()> = repo
            .change(&id, None, |tx| {
                tx.put(automerge::ROOT, "doomed", "value")?;
                Err(FsError::StorageFault("boom".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(repo.heads(&id).unwrap(), before);
        let doc = repo.document(&id).unwrap();
        assert!(doc.get(automerge::ROOT, "doomed").unwrap().is_none());
    }

    #[tokio::test]
    async fn history_carries_message_and_order() {
        let mut repo = repo();
        let id = repo.create().await.unwrap();

        repo.change(&id, Some("first"), |tx| {
            tx.put(automerge::ROOT, "k", 1_i64)?;
            Ok(())
        })
        .await
        .unwrap();
        repo.change(&id, Some("second"), |tx| {
            tx.put(automerge::ROOT, "k", 2_i64)?;
            Ok(())
        })
        .await
        .unwrap();

        let history = repo.history(&id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message.as_deref(), Some("first"));
        assert_eq!(history[1].message.as_deref(), Some("second"));
        assert!(history[0].seq < history[1].seq);
    }

    #[tokio::test]
    async fn unknown_heads_are_forgiven() {
        let mut repo = repo();
        let id = repo.create().await.unwrap();
        repo.change(&id, None, |tx| {
            tx.put(automerge::ROOT, "k", 1_i64)?;
            Ok(())
        })
        .await
        .unwrap();

        let bogus = [ChangeHash([0u8; 32])];
        assert!(repo.view(&id, &bogus).unwrap().is_none());
        assert!(repo.diff(&id, &bogus, &bogus).unwrap().is_empty());
    }

    #[tokio::test]
    async fn evicted_documents_reload_from_the_backend() {
        let mut repo = repo();
        let id = repo.create().await.unwrap();
        repo.change(&id, None, |tx| {
            let content = tx.put_object(automerge::ROOT, "content", ObjType::Text)?;
            tx.splice_text(&content, 0, 0, "persisted")?;
            Ok(())
        })
        .await
        .unwrap();

        repo.evict(&id);
        assert!(!repo.is_resident(&id));

        repo.find(&id).await.unwrap();
        let heads = repo.heads(&id).unwrap();
        let view = repo.view(&id, &heads).unwrap().unwrap();
        assert_eq!(view.text("content").unwrap().as_deref(), Some("persisted"));
    }

    #[tokio::test]
    async fn find_reports_unknown_documents() {
        let mut repo = repo();
        let missing = DocId::random();
        assert!(matches!(
            repo.find(&missing).await,
            Err(FsError::DocumentNotFound(_))
        ));
    }
}

//! Local replica store.
//!
//! Two layers per entity kind: the confirmed copy of the primary's state and
//! a local overlay of unsynced edits that shadows it on read. Both are
//! mirrored in memory for synchronous reads and written through to libsql.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::blobs::{content_id, hash_file, infer_mime_type, BlobStore};
use crate::conflicts::DocumentConflict;
use crate::db::{Database, EntityRepository, Table};
use crate::error::{Error, Result};
use crate::models::{
    Attachment, Changeset, ChangesetResult, ChangesetStatus, Document, Id, Revision, STAGING_REV,
};
use crate::reactive::{Cell, Observable};
use crate::util::now_millis;

#[derive(Default)]
struct Mirror {
    rev: Revision,
    documents: BTreeMap<Id, Document>,
    local_documents: BTreeMap<Id, Document>,
    attachments: BTreeMap<Id, Attachment>,
    local_attachments: BTreeMap<Id, Attachment>,
}

impl Mirror {
    fn document(&self, id: &Id) -> Option<&Document> {
        self.local_documents
            .get(id)
            .or_else(|| self.documents.get(id))
    }

    fn attachment(&self, id: &Id) -> Option<&Attachment> {
        self.local_attachments
            .get(id)
            .or_else(|| self.attachments.get(id))
    }

    fn has_attachment(&self, id: &Id) -> bool {
        self.attachment(id).is_some()
    }

    fn list_documents(&self, include_deleted: bool) -> Vec<Document> {
        let ids: BTreeSet<&Id> = self
            .documents
            .keys()
            .chain(self.local_documents.keys())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.document(id))
            .filter(|document| include_deleted || !document.deleted)
            .cloned()
            .collect()
    }
}

/// Confirmed changes written in one transaction
#[derive(Default)]
struct BaseUpdate {
    rev: Option<Revision>,
    documents: Vec<Document>,
    attachments: Vec<Attachment>,
    drop_local_documents: Vec<Id>,
    drop_local_attachments: Vec<Id>,
    restamped_local_documents: Vec<Document>,
}

struct PendingMerge {
    rev: Revision,
    remote: HashMap<Id, Document>,
}

/// Local changes ready for submission
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChanges {
    pub changeset: Changeset,
    /// Blob files of attachments the primary doesn't have yet
    pub blobs: Vec<(Id, PathBuf)>,
}

/// What a changeset result did to the replica
#[derive(Debug)]
pub enum ApplyOutcome {
    /// The submitted changes are confirmed at `rev`
    Accepted { rev: Revision },
    /// The replica caught up with the primary; local changes still pending
    FastForwarded { rev: Revision },
    /// Local edits overlap remote changes; the merge must be completed
    Conflicts(Vec<DocumentConflict>),
}

/// Offline-capable local copy of documents and attachments
pub struct Replica {
    db: Database,
    blobs: BlobStore,
    mirror: Rc<RefCell<Mirror>>,
    updates: Cell<u64>,
    merge: RefCell<Option<PendingMerge>>,
}

impl Replica {
    /// Open `replica.db` and `blobs/` inside `data_dir`
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let db = Database::open(data_dir.join("replica.db")).await?;
        let blobs = BlobStore::open(data_dir.join("blobs"))?;
        Self::new(db, blobs).await
    }

    pub async fn new(db: Database, blobs: BlobStore) -> Result<Self> {
        let mirror = {
            let repo = EntityRepository::new(db.connection());
            Mirror {
                rev: repo.revision().await?,
                documents: by_id(repo.load_all(Table::Documents).await?),
                local_documents: by_id(repo.load_all(Table::LocalDocuments).await?),
                attachments: by_id(repo.load_all(Table::Attachments).await?),
                local_attachments: by_id(repo.load_all(Table::LocalAttachments).await?),
            }
        };
        tracing::debug!(
            rev = mirror.rev,
            documents = mirror.documents.len(),
            pending = mirror.local_documents.len() + mirror.local_attachments.len(),
            "Loaded replica"
        );

        Ok(Self {
            db,
            blobs,
            mirror: Rc::new(RefCell::new(mirror)),
            updates: Cell::new(0),
            merge: RefCell::new(None),
        })
    }

    fn repo(&self) -> EntityRepository<'_> {
        EntityRepository::new(self.db.connection())
    }

    /// Last primary revision this replica has caught up with
    pub fn revision(&self) -> Revision {
        self.mirror.borrow().rev
    }

    pub const fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Bumped after every change to either layer
    pub fn updates(&self) -> Cell<u64> {
        self.updates.clone()
    }

    fn notify(&self) {
        self.updates.update(|count| count + 1);
    }

    pub fn get_document(&self, id: &Id) -> Option<Document> {
        self.mirror.borrow().document(id).cloned()
    }

    pub fn get_attachment(&self, id: &Id) -> Option<Attachment> {
        self.mirror.borrow().attachment(id).cloned()
    }

    /// Documents with local edits applied, deleted ones only on request
    pub fn list_documents(&self, include_deleted: bool) -> Vec<Document> {
        self.mirror.borrow().list_documents(include_deleted)
    }

    pub fn list_attachments(&self) -> Vec<Attachment> {
        let mirror = self.mirror.borrow();
        let ids: BTreeSet<&Id> = mirror
            .attachments
            .keys()
            .chain(mirror.local_attachments.keys())
            .collect();
        ids.into_iter()
            .filter_map(|id| mirror.attachment(id).cloned())
            .collect()
    }

    /// Live document snapshots, re-emitted on every change
    pub fn documents_stream(&self) -> Observable<Vec<Document>> {
        let mirror = self.mirror.clone();
        self.updates
            .stream()
            .map(move |_| mirror.borrow().list_documents(false))
    }

    pub fn document_stream(&self, id: &Id) -> Observable<Option<Document>> {
        let mirror = self.mirror.clone();
        let id = id.clone();
        self.updates
            .stream()
            .map(move |_| mirror.borrow().document(&id).cloned())
    }

    pub fn is_document_pending(&self, id: &Id) -> bool {
        self.mirror.borrow().local_documents.contains_key(id)
    }

    pub fn has_pending_changes(&self) -> bool {
        let mirror = self.mirror.borrow();
        !mirror.local_documents.is_empty() || !mirror.local_attachments.is_empty()
    }

    /// Ids of documents with unsynced edits
    pub fn pending_document_ids(&self) -> Vec<Id> {
        self.mirror.borrow().local_documents.keys().cloned().collect()
    }

    pub fn is_merge_pending(&self) -> bool {
        self.merge.borrow().is_some()
    }

    fn ensure_no_merge(&self) -> Result<()> {
        if self.is_merge_pending() {
            return Err(Error::MergePending);
        }
        Ok(())
    }

    /// Stage a new or edited document.
    ///
    /// References are recomputed from `data`, `updatedAt` is stamped and
    /// `prevRev` records the confirmed revision the edit is based on.
    pub async fn save_document(&self, mut document: Document) -> Result<Document> {
        self.ensure_no_merge()?;
        {
            let mirror = self.mirror.borrow();
            let confirmed = mirror.documents.get(&document.id);
            document.rev = confirmed.map_or(STAGING_REV, |confirmed| confirmed.rev);
            document.prev_rev = confirmed.map(|confirmed| confirmed.rev);
            if let Some(existing) = mirror.document(&document.id) {
                if existing.document_type != document.document_type {
                    return Err(Error::InvalidInput(format!(
                        "Can't change type of document {}",
                        document.id
                    )));
                }
                document.created_at = existing.created_at;
            }
            document.update_refs(|id| mirror.has_attachment(id));
        }
        document.updated_at = now_millis();

        self.repo().put(Table::LocalDocuments, &document).await?;
        self.mirror
            .borrow_mut()
            .local_documents
            .insert(document.id.clone(), document.clone());

        tracing::debug!(id = %document.id, "Saved document");
        self.notify();
        Ok(document)
    }

    /// Soft-delete a document
    pub async fn delete_document(&self, id: &Id) -> Result<Document> {
        let mut document = self
            .get_document(id)
            .ok_or_else(|| Error::NotFound(format!("Document {id}")))?;
        document.deleted = true;
        self.save_document(document).await
    }

    /// Stage a file as an attachment, copied into the blob cache.
    ///
    /// The id is the content hash, so saving the same content twice returns
    /// the existing attachment.
    pub async fn save_attachment(&self, source: &Path) -> Result<Attachment> {
        self.ensure_no_merge()?;
        let (id, size) = hash_file(source).await?;
        if let Some(existing) = self.existing_attachment(&id)? {
            return Ok(existing);
        }

        let file_name = source
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        tokio::fs::copy(source, self.blobs.path(&id)).await?;
        let attachment = Attachment::new(id, infer_mime_type(None, &file_name), size);
        self.stage_attachment(attachment).await
    }

    /// Stage in-memory bytes as an attachment
    pub async fn save_attachment_bytes(&self, bytes: &[u8], file_name: &str) -> Result<Attachment> {
        self.ensure_no_merge()?;
        let id = content_id(bytes);
        if let Some(existing) = self.existing_attachment(&id)? {
            return Ok(existing);
        }

        self.blobs.write(&id, bytes).await?;
        let attachment = Attachment::new(id, infer_mime_type(None, file_name), bytes.len() as u64);
        self.stage_attachment(attachment).await
    }

    fn existing_attachment(&self, id: &Id) -> Result<Option<Attachment>> {
        match self.get_attachment(id) {
            Some(existing) if existing.deleted => Err(Error::InvalidInput(format!(
                "Attachment {id} was deleted and can't be added again"
            ))),
            existing => Ok(existing),
        }
    }

    async fn stage_attachment(&self, attachment: Attachment) -> Result<Attachment> {
        self.repo().put(Table::LocalAttachments, &attachment).await?;
        self.mirror
            .borrow_mut()
            .local_attachments
            .insert(attachment.id.clone(), attachment.clone());

        tracing::debug!(id = %attachment.id, size = attachment.size, "Saved attachment");
        self.notify();
        Ok(attachment)
    }

    /// Cached blob of an attachment, if present locally
    pub async fn attachment_blob(&self, id: &Id) -> Result<Option<PathBuf>> {
        if self.get_attachment(id).is_none() || !self.blobs.exists(id).await? {
            return Ok(None);
        }
        Ok(Some(self.blobs.path(id)))
    }

    /// Snapshot the local overlay into a changeset
    pub fn pending_changes(&self) -> PendingChanges {
        let mirror = self.mirror.borrow();
        let changeset = Changeset {
            base_rev: mirror.rev,
            documents: mirror.local_documents.values().cloned().collect(),
            attachments: mirror.local_attachments.values().cloned().collect(),
        };
        let blobs = mirror
            .local_attachments
            .keys()
            .filter(|id| !mirror.attachments.contains_key(*id))
            .map(|id| (id.clone(), self.blobs.path(id)))
            .collect();
        PendingChanges { changeset, blobs }
    }

    /// Merge the primary's answer to `submitted` into the replica
    pub async fn apply_result(
        &self,
        submitted: &Changeset,
        result: ChangesetResult,
    ) -> Result<ApplyOutcome> {
        self.ensure_no_merge()?;
        if result.base_rev != submitted.base_rev {
            tracing::error!(
                submitted = submitted.base_rev,
                answered = result.base_rev,
                "Changeset result doesn't match the submitted changeset"
            );
            return Err(Error::Invariant(format!(
                "Result for base rev {} doesn't match submitted base rev {}",
                result.base_rev, submitted.base_rev
            )));
        }
        if result.current_rev < self.revision() {
            return Err(Error::Invariant(format!(
                "Primary revision {} is older than the replica revision {}",
                result.current_rev,
                self.revision()
            )));
        }

        match result.status {
            ChangesetStatus::Accepted => self.apply_accepted(submitted, result).await,
            ChangesetStatus::Outdated => self.apply_outdated(result).await,
        }
    }

    async fn apply_accepted(
        &self,
        submitted: &Changeset,
        result: ChangesetResult,
    ) -> Result<ApplyOutcome> {
        let rev = result.current_rev;
        let update = {
            let mirror = self.mirror.borrow();
            // edits made while the changeset was in flight stay pending
            let drop_local_documents: Vec<Id> = submitted
                .documents
                .iter()
                .filter(|sent| mirror.local_documents.get(&sent.id) == Some(*sent))
                .map(|sent| sent.id.clone())
                .collect();
            // and are rebased onto the copy confirmed by this round
            let restamped_local_documents = result
                .documents
                .iter()
                .filter(|confirmed| !drop_local_documents.contains(&confirmed.id))
                .filter_map(|confirmed| {
                    let mut local = mirror.local_documents.get(&confirmed.id)?.clone();
                    local.rev = confirmed.rev;
                    local.prev_rev = Some(confirmed.rev);
                    Some(local)
                })
                .collect();
            let drop_local_attachments = submitted
                .attachments
                .iter()
                .filter(|sent| mirror.local_attachments.get(&sent.id) == Some(*sent))
                .map(|sent| sent.id.clone())
                .collect();
            BaseUpdate {
                rev: Some(rev),
                documents: result.documents,
                attachments: result.attachments,
                drop_local_documents,
                drop_local_attachments,
                restamped_local_documents,
            }
        };

        self.commit(update).await?;
        tracing::info!(rev, "Changeset accepted");
        Ok(ApplyOutcome::Accepted { rev })
    }

    async fn apply_outdated(&self, result: ChangesetResult) -> Result<ApplyOutcome> {
        let rev = result.current_rev;
        let mut conflicts = Vec::new();
        let mut remote = HashMap::new();
        let update = {
            let mirror = self.mirror.borrow();
            let mut documents = Vec::with_capacity(result.documents.len());
            for document in result.documents {
                match mirror.local_documents.get(&document.id) {
                    Some(local) => {
                        let base = mirror.documents.get(&document.id).cloned();
                        conflicts.push(DocumentConflict::new(
                            base,
                            document.clone(),
                            local.clone(),
                        ));
                        remote.insert(document.id.clone(), document);
                    }
                    None => documents.push(document),
                }
            }

            // content-addressed: the primary already holds identical blobs
            let drop_local_attachments = result
                .attachments
                .iter()
                .filter(|attachment| {
                    mirror.local_attachments.contains_key(&attachment.id)
                        && !mirror.attachments.contains_key(&attachment.id)
                })
                .map(|attachment| attachment.id.clone())
                .collect();

            BaseUpdate {
                rev: conflicts.is_empty().then_some(rev),
                documents,
                attachments: result.attachments,
                drop_local_documents: Vec::new(),
                drop_local_attachments,
                restamped_local_documents: Vec::new(),
            }
        };

        self.commit(update).await?;
        if conflicts.is_empty() {
            tracing::info!(rev, "Fast-forwarded replica");
            return Ok(ApplyOutcome::FastForwarded { rev });
        }

        tracing::info!(rev, conflicts = conflicts.len(), "Merge conflicts detected");
        *self.merge.borrow_mut() = Some(PendingMerge { rev, remote });
        Ok(ApplyOutcome::Conflicts(conflicts))
    }

    /// Finish a pending merge with the resolved documents.
    ///
    /// The remote versions become the confirmed layer, the resolutions stay
    /// pending for the next round, and the replica revision advances.
    pub async fn complete_merge(&self, resolved: Vec<Document>) -> Result<()> {
        let Some(merge) = self.merge.borrow_mut().take() else {
            return Err(Error::Invariant("No merge is pending".into()));
        };

        if let Err(error) = check_resolution(&merge, &resolved) {
            *self.merge.borrow_mut() = Some(merge);
            return Err(error);
        }

        let mut finals = Vec::with_capacity(resolved.len());
        {
            let mirror = self.mirror.borrow();
            for mut document in resolved {
                document.update_refs(|id| mirror.has_attachment(id));
                finals.push(document);
            }
        }

        let rev = merge.rev;
        let update = BaseUpdate {
            rev: Some(rev),
            documents: merge.remote.values().cloned().collect(),
            ..BaseUpdate::default()
        };

        let committed = async {
            self.db.begin().await?;
            let written = async {
                self.write_base(&update).await?;
                for document in &finals {
                    self.repo().put(Table::LocalDocuments, document).await?;
                }
                Ok::<(), Error>(())
            }
            .await;
            match written {
                Ok(()) => self.db.commit().await,
                Err(error) => {
                    self.db.rollback().await;
                    Err(error)
                }
            }
        }
        .await;
        if let Err(error) = committed {
            *self.merge.borrow_mut() = Some(merge);
            return Err(error);
        }

        {
            let mut mirror = self.mirror.borrow_mut();
            apply_to_mirror(&mut mirror, update);
            for document in finals {
                mirror.local_documents.insert(document.id.clone(), document);
            }
        }
        tracing::info!(rev, "Merge completed");
        self.notify();
        Ok(())
    }

    /// Drop attachments that no document references.
    ///
    /// Pending attachments disappear with their blob; confirmed ones are
    /// marked deleted locally so the next changeset carries the deletion.
    pub async fn compact(&self) -> Result<usize> {
        self.ensure_no_merge()?;
        let (discard, delete) = {
            let mirror = self.mirror.borrow();
            let referenced: BTreeSet<&Id> = mirror
                .documents
                .values()
                .chain(mirror.local_documents.values())
                .filter(|document| !document.deleted)
                .flat_map(|document| document.attachment_refs.iter())
                .collect();

            let mut discard = Vec::new();
            let mut delete = Vec::new();
            for attachment in mirror
                .local_attachments
                .values()
                .filter(|attachment| !mirror.attachments.contains_key(&attachment.id))
            {
                if !referenced.contains(&attachment.id) {
                    discard.push(attachment.id.clone());
                }
            }
            for confirmed in mirror.attachments.values() {
                let current = mirror.attachment(&confirmed.id).unwrap_or(confirmed);
                if !current.deleted && !referenced.contains(&confirmed.id) {
                    delete.push(Attachment {
                        deleted: true,
                        ..current.clone()
                    });
                }
            }
            (discard, delete)
        };

        if discard.is_empty() && delete.is_empty() {
            return Ok(0);
        }

        self.db.begin().await?;
        let written = async {
            for id in &discard {
                self.repo().remove(Table::LocalAttachments, id).await?;
            }
            for attachment in &delete {
                self.repo().put(Table::LocalAttachments, attachment).await?;
            }
            Ok::<(), Error>(())
        }
        .await;
        match written {
            Ok(()) => self.db.commit().await?,
            Err(error) => {
                self.db.rollback().await;
                return Err(error);
            }
        }

        {
            let mut mirror = self.mirror.borrow_mut();
            for id in &discard {
                mirror.local_attachments.remove(id);
            }
            for attachment in &delete {
                mirror
                    .local_attachments
                    .insert(attachment.id.clone(), attachment.clone());
            }
        }
        for id in discard.iter().chain(delete.iter().map(|attachment| &attachment.id)) {
            if let Err(error) = self.blobs.remove(id).await {
                tracing::warn!(%error, %id, "Failed to purge cached blob");
            }
        }

        let removed = discard.len() + delete.len();
        tracing::info!(removed, "Compacted replica");
        self.notify();
        Ok(removed)
    }

    async fn commit(&self, update: BaseUpdate) -> Result<()> {
        self.db.begin().await?;
        match self.write_base(&update).await {
            Ok(()) => self.db.commit().await?,
            Err(error) => {
                self.db.rollback().await;
                return Err(error);
            }
        }
        apply_to_mirror(&mut self.mirror.borrow_mut(), update);
        self.notify();
        Ok(())
    }

    async fn write_base(&self, update: &BaseUpdate) -> Result<()> {
        let repo = self.repo();
        for document in &update.documents {
            repo.put(Table::Documents, document).await?;
        }
        for attachment in &update.attachments {
            repo.put(Table::Attachments, attachment).await?;
        }
        for id in &update.drop_local_documents {
            repo.remove(Table::LocalDocuments, id).await?;
        }
        for id in &update.drop_local_attachments {
            repo.remove(Table::LocalAttachments, id).await?;
        }
        for document in &update.restamped_local_documents {
            repo.put(Table::LocalDocuments, document).await?;
        }
        if let Some(rev) = update.rev {
            repo.set_revision(rev).await?;
        }
        Ok(())
    }
}

fn apply_to_mirror(mirror: &mut Mirror, update: BaseUpdate) {
    for document in update.documents {
        mirror.documents.insert(document.id.clone(), document);
    }
    for attachment in update.attachments {
        mirror.attachments.insert(attachment.id.clone(), attachment);
    }
    for id in &update.drop_local_documents {
        mirror.local_documents.remove(id);
    }
    for id in &update.drop_local_attachments {
        mirror.local_attachments.remove(id);
    }
    for document in update.restamped_local_documents {
        mirror.local_documents.insert(document.id.clone(), document);
    }
    if let Some(rev) = update.rev {
        mirror.rev = rev;
    }
}

/// Every conflicted document must be resolved exactly once
fn check_resolution(merge: &PendingMerge, resolved: &[Document]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for document in resolved {
        if !merge.remote.contains_key(&document.id) {
            return Err(Error::InvalidInput(format!(
                "Document {} is not part of the merge",
                document.id
            )));
        }
        if !seen.insert(&document.id) {
            return Err(Error::InvalidInput(format!(
                "Document {} is resolved more than once",
                document.id
            )));
        }
    }
    if let Some(missing) = merge.remote.keys().find(|id| !seen.contains(id)) {
        return Err(Error::InvalidInput(format!(
            "Document {missing} has no resolution"
        )));
    }
    Ok(())
}

fn by_id<T: crate::db::Entity>(entities: Vec<T>) -> BTreeMap<Id, T> {
    entities
        .into_iter()
        .map(|entity| (entity.id().clone(), entity))
        .collect()
}

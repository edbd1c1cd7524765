//! Primary store: the authoritative revision log.
//!
//! Changesets are applied as one atomic unit. The store revision advances by
//! exactly one per accepted non-empty changeset, and every entity written by
//! it carries that revision.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::blobs::{infer_mime_type, BlobStore};
use crate::db::{Database, EntityRepository, Table};
use crate::error::{Error, Result};
use crate::models::{
    Attachment, Changeset, ChangesetResult, ChangesetStatus, Document, Id, Revision,
};
use crate::multipart::FilePart;

/// Server-side store of confirmed documents and attachments
pub struct PrimaryStore {
    db: Database,
    blobs: BlobStore,
}

impl PrimaryStore {
    pub const fn new(db: Database, blobs: BlobStore) -> Self {
        Self { db, blobs }
    }

    /// Open `primary.db` and `blobs/` inside `data_dir`
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let db = Database::open(data_dir.join("primary.db")).await?;
        let blobs = BlobStore::open(data_dir.join("blobs"))?;
        Ok(Self::new(db, blobs))
    }

    fn repo(&self) -> EntityRepository<'_> {
        EntityRepository::new(self.db.connection())
    }

    pub async fn revision(&self) -> Result<Revision> {
        self.repo().revision().await
    }

    pub async fn get_document(&self, id: &Id) -> Result<Option<Document>> {
        self.repo().get(Table::Documents, id).await
    }

    pub async fn get_attachment(&self, id: &Id) -> Result<Option<Attachment>> {
        self.repo().get(Table::Attachments, id).await
    }

    /// Location of a live attachment's blob
    pub async fn attachment_blob(&self, id: &Id) -> Result<Option<(Attachment, PathBuf)>> {
        let Some(attachment) = self.get_attachment(id).await? else {
            return Ok(None);
        };
        if attachment.deleted || !self.blobs.exists(id).await? {
            return Ok(None);
        }
        Ok(Some((attachment, self.blobs.path(id))))
    }

    /// Everything confirmed after `rev`
    pub async fn changes_since(&self, rev: Revision) -> Result<(Vec<Document>, Vec<Attachment>)> {
        let current = self.revision().await?;
        if rev > current {
            return Err(Error::FutureRevision {
                requested: rev,
                current,
            });
        }
        let repo = self.repo();
        let documents = repo.load_since(Table::Documents, rev).await?;
        let attachments = repo.load_since(Table::Attachments, rev).await?;
        Ok((documents, attachments))
    }

    /// Validate and apply a changeset with the blobs uploaded alongside it.
    ///
    /// Blob parts are keyed by attachment id; the files are moved into the
    /// blob store when the changeset is accepted.
    pub async fn apply_changeset(
        &self,
        changeset: Changeset,
        blobs: &[FilePart],
    ) -> Result<ChangesetResult> {
        let current = self.revision().await?;
        let base_rev = changeset.base_rev;

        if base_rev > current {
            tracing::error!(base_rev, current, "Changeset references a future revision");
            return Err(Error::FutureRevision {
                requested: base_rev,
                current,
            });
        }

        if changeset.is_empty() {
            if let Some(blob) = blobs.first() {
                return Err(unexpected_blob(&blob.field));
            }
            tracing::debug!(base_rev, current, "Empty changeset");
            return self.result(ChangesetStatus::Accepted, base_rev, current).await;
        }

        if base_rev < current {
            tracing::info!(base_rev, current, "Changeset is outdated");
            return self.result(ChangesetStatus::Outdated, base_rev, current).await;
        }

        let new_rev = current + 1;
        let plan = match self.plan(changeset, blobs, new_rev).await {
            Ok(plan) => plan,
            Err(error) => {
                tracing::error!(%error, base_rev, "Rejected changeset");
                return Err(error);
            }
        };

        let mut imported = Vec::with_capacity(plan.new_blobs.len());
        for (id, path) in &plan.new_blobs {
            if let Err(error) = self.blobs.import(id, path).await {
                self.discard_blobs(&imported).await;
                return Err(error);
            }
            imported.push(id.clone());
        }

        if let Err(error) = self.write(&plan, new_rev).await {
            tracing::error!(%error, new_rev, "Failed to apply changeset");
            self.discard_blobs(&imported).await;
            return Err(error);
        }

        tracing::info!(
            rev = new_rev,
            documents = plan.documents.len(),
            attachments = plan.attachments.len(),
            "Applied changeset"
        );
        self.result(ChangesetStatus::Accepted, base_rev, new_rev)
            .await
    }

    async fn plan(
        &self,
        changeset: Changeset,
        blobs: &[FilePart],
        new_rev: Revision,
    ) -> Result<Plan> {
        let mut parts: HashMap<&str, &FilePart> = HashMap::with_capacity(blobs.len());
        for blob in blobs {
            if parts.insert(blob.field.as_str(), blob).is_some() {
                return Err(Error::Invariant(format!(
                    "Duplicate file part {}",
                    blob.field
                )));
            }
        }

        let declared: HashSet<&str> = changeset
            .attachments
            .iter()
            .map(|attachment| attachment.id.as_str())
            .collect();
        if declared.len() != changeset.attachments.len() {
            return Err(Error::Invariant("Duplicate attachment in changeset".into()));
        }
        if let Some(blob) = blobs
            .iter()
            .find(|blob| !declared.contains(blob.field.as_str()))
        {
            return Err(unexpected_blob(&blob.field));
        }

        let mut seen = HashSet::with_capacity(changeset.documents.len());
        let mut documents = Vec::with_capacity(changeset.documents.len());
        for mut document in changeset.documents {
            if !seen.insert(document.id.clone()) {
                return Err(Error::Invariant(format!(
                    "Duplicate document {} in changeset",
                    document.id
                )));
            }
            document.rev = new_rev;
            documents.push(document);
        }

        let repo = self.repo();
        let mut attachments = Vec::with_capacity(changeset.attachments.len());
        let mut new_blobs = Vec::new();
        for declared in changeset.attachments {
            let part = parts.get(declared.id.as_str());
            let existing: Option<Attachment> = repo.get(Table::Attachments, &declared.id).await?;
            let attachment = match (existing, part) {
                (Some(_), Some(_)) => return Err(Error::AttachmentImmutable(declared.id)),
                // A deleted attachment has lost its blob; it stays deleted.
                (Some(existing), None) if existing.deleted && !declared.deleted => {
                    return Err(Error::AttachmentImmutable(declared.id))
                }
                (Some(existing), None) => Attachment {
                    rev: new_rev,
                    deleted: declared.deleted,
                    ..existing
                },
                (None, None) => return Err(Error::MissingBlob(declared.id)),
                (None, Some(part)) => {
                    let mime_type = infer_mime_type(
                        part.content_type.as_deref().or(Some(declared.mime_type.as_str())),
                        &part.filename,
                    );
                    new_blobs.push((declared.id.clone(), part.path.clone()));
                    Attachment {
                        id: declared.id,
                        rev: new_rev,
                        mime_type,
                        size: part.size,
                        deleted: declared.deleted,
                    }
                }
            };
            attachments.push(attachment);
        }

        Ok(Plan {
            documents,
            attachments,
            new_blobs,
        })
    }

    async fn write(&self, plan: &Plan, new_rev: Revision) -> Result<()> {
        self.db.begin().await?;
        let repo = self.repo();
        let written = async {
            for document in &plan.documents {
                repo.put(Table::Documents, document).await?;
            }
            for attachment in &plan.attachments {
                repo.put(Table::Attachments, attachment).await?;
            }
            repo.set_revision(new_rev).await
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

    async fn discard_blobs(&self, ids: &[Id]) {
        for id in ids {
            if let Err(error) = self.blobs.remove(id).await {
                tracing::warn!(%error, %id, "Failed to remove blob of a rejected changeset");
            }
        }
    }

    async fn result(
        &self,
        status: ChangesetStatus,
        base_rev: Revision,
        current_rev: Revision,
    ) -> Result<ChangesetResult> {
        let (documents, attachments) = self.changes_since(base_rev).await?;
        Ok(ChangesetResult {
            status,
            base_rev,
            current_rev,
            documents,
            attachments,
        })
    }

    /// Mark attachments no live document references as deleted and purge
    /// their blobs. Returns the number of attachments removed.
    pub async fn compact(&self) -> Result<usize> {
        let repo = self.repo();
        let documents: Vec<Document> = repo.load_all(Table::Documents).await?;
        let attachments: Vec<Attachment> = repo.load_all(Table::Attachments).await?;

        let referenced: BTreeSet<&Id> = documents
            .iter()
            .filter(|document| !document.deleted)
            .flat_map(|document| document.attachment_refs.iter())
            .collect();

        let unused: Vec<&Attachment> = attachments
            .iter()
            .filter(|attachment| !attachment.deleted && !referenced.contains(&attachment.id))
            .collect();
        if unused.is_empty() {
            tracing::debug!("Nothing to compact");
            return Ok(0);
        }

        let new_rev = repo.revision().await? + 1;
        self.db.begin().await?;
        let written = async {
            for attachment in &unused {
                let deleted = Attachment {
                    rev: new_rev,
                    deleted: true,
                    ..(*attachment).clone()
                };
                repo.put(Table::Attachments, &deleted).await?;
            }
            repo.set_revision(new_rev).await
        }
        .await;
        match written {
            Ok(()) => self.db.commit().await?,
            Err(error) => {
                self.db.rollback().await;
                return Err(error);
            }
        }

        for attachment in &unused {
            if let Err(error) = self.blobs.remove(&attachment.id).await {
                tracing::warn!(%error, id = %attachment.id, "Failed to purge blob");
            }
        }

        tracing::info!(rev = new_rev, removed = unused.len(), "Compacted primary store");
        Ok(unused.len())
    }
}

struct Plan {
    documents: Vec<Document>,
    attachments: Vec<Attachment>,
    new_blobs: Vec<(Id, PathBuf)>,
}

fn unexpected_blob(field: &str) -> Error {
    match Id::parse(field) {
        Ok(id) => Error::UnexpectedBlob(id),
        Err(_) => Error::Invariant(format!("File part with an invalid id: {field}")),
    }
}

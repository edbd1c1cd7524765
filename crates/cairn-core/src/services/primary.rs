//! Shared primary store service used by the HTTP host and in-process replicas.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::blobs::BlobStore;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{Attachment, Changeset, ChangesetResult, Id, Revision};
use crate::multipart::MultipartBody;
use crate::primary::PrimaryStore;

/// Name of the multipart field carrying the changeset JSON
pub const CHANGESET_FIELD: &str = "changeset";

/// Thread-safe handle to a [`PrimaryStore`]; changesets apply one at a time.
#[derive(Clone)]
pub struct PrimaryService {
    store: Arc<Mutex<PrimaryStore>>,
}

impl PrimaryService {
    pub fn new(store: PrimaryStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    /// Open the store inside `data_dir`
    pub async fn open_path(data_dir: impl AsRef<Path>) -> Result<Self> {
        let store = PrimaryStore::open(data_dir).await?;
        tracing::info!(rev = store.revision().await?, "Opened primary store");
        Ok(Self::new(store))
    }

    /// In-memory metadata with blobs under `blobs_dir` (primarily for tests).
    pub async fn open_in_memory(blobs_dir: impl Into<PathBuf>) -> Result<Self> {
        let db = Database::open_in_memory().await?;
        let blobs = BlobStore::open(blobs_dir)?;
        Ok(Self::new(PrimaryStore::new(db, blobs)))
    }

    pub async fn revision(&self) -> Result<Revision> {
        self.store.lock().await.revision().await
    }

    pub async fn apply_changeset(
        &self,
        changeset: Changeset,
        body: &MultipartBody,
    ) -> Result<ChangesetResult> {
        let store = self.store.lock().await;
        store.apply_changeset(changeset, &body.files).await
    }

    /// Apply a decoded upload: the changeset field plus one file per new attachment
    pub async fn apply_upload(&self, body: &MultipartBody) -> Result<ChangesetResult> {
        let raw = body.field(CHANGESET_FIELD).ok_or_else(|| {
            Error::InvalidInput(format!("Missing multipart field {CHANGESET_FIELD}"))
        })?;
        let changeset: Changeset = serde_json::from_str(raw)?;
        self.apply_changeset(changeset, body).await
    }

    pub async fn attachment_blob(&self, id: &Id) -> Result<Option<(Attachment, PathBuf)>> {
        self.store.lock().await.attachment_blob(id).await
    }

    pub async fn compact(&self) -> Result<usize> {
        self.store.lock().await.compact().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Document;
    use crate::multipart::Field;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_upload_reads_the_changeset_field() {
        let dir = tempdir().unwrap();
        let service = PrimaryService::open_in_memory(dir.path()).await.unwrap();

        let mut changeset = Changeset::new(0);
        changeset.documents.push(Document::new("note", json!({})));
        let body = MultipartBody {
            fields: vec![Field {
                name: CHANGESET_FIELD.to_string(),
                value: serde_json::to_string(&changeset).unwrap(),
            }],
            files: vec![],
        };

        let result = service.apply_upload(&body).await.unwrap();
        assert!(result.is_accepted());
        assert_eq!(service.revision().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_upload_requires_the_changeset_field() {
        let dir = tempdir().unwrap();
        let service = PrimaryService::open_in_memory(dir.path()).await.unwrap();
        let err = service
            .apply_upload(&MultipartBody::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_path_persists_between_opens() {
        let dir = tempdir().unwrap();
        {
            let service = PrimaryService::open_path(dir.path()).await.unwrap();
            let mut changeset = Changeset::new(0);
            changeset.documents.push(Document::new("note", json!({})));
            service
                .apply_changeset(changeset, &MultipartBody::default())
                .await
                .unwrap();
        }
        let service = PrimaryService::open_path(dir.path()).await.unwrap();
        assert_eq!(service.revision().await.unwrap(), 1);
    }
}

//! In-process transport to an embedded primary.
//!
//! Requests still travel through the multipart encoder and the streaming
//! decoder, so an embedded primary sees exactly what the HTTP host sees.

use std::cell::Cell;
use std::path::{Path, PathBuf};

use serde_json::json;

use super::{Exchange, ExchangeResponse};
use crate::error::{Error, Result};
use crate::models::Id;
use crate::multipart::{decode_stream, extract_boundary, MultipartEncoder, DEFAULT_MAX_FIELD_BYTES};
use crate::services::PrimaryService;

/// [`Exchange`] calling a [`PrimaryService`] directly
pub struct LoopbackExchange {
    service: PrimaryService,
    password: String,
    uploads_dir: PathBuf,
    session: Cell<bool>,
}

impl LoopbackExchange {
    /// Multipart uploads are decoded into temporary directories under `uploads_dir`.
    pub fn new(
        service: PrimaryService,
        password: impl Into<String>,
        uploads_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let uploads_dir = uploads_dir.into();
        std::fs::create_dir_all(&uploads_dir)?;
        Ok(Self {
            service,
            password: password.into(),
            uploads_dir,
            session: Cell::new(false),
        })
    }

    pub const fn service(&self) -> &PrimaryService {
        &self.service
    }

    /// Expire the session; later requests answer 403
    pub fn revoke_session(&self) {
        self.session.set(false);
    }

    fn forbidden() -> ExchangeResponse {
        ExchangeResponse::new(403, "Not authorized")
    }

    async fn receive(&self, body: MultipartEncoder) -> Result<ExchangeResponse> {
        let boundary = extract_boundary(&body.content_type())
            .ok_or_else(|| Error::Multipart("Missing multipart boundary".into()))?;
        let uploads = tempfile::TempDir::new_in(&self.uploads_dir)?;
        let stream = Box::pin(body.into_stream());
        let decoded =
            decode_stream(stream, &boundary, uploads.path(), DEFAULT_MAX_FIELD_BYTES).await;

        let outcome = match decoded {
            Ok(decoded) => self.service.apply_upload(&decoded).await,
            Err(error) => Err(error),
        };
        match outcome {
            Ok(result) => Ok(ExchangeResponse::new(200, serde_json::to_vec(&result)?)),
            Err(error) => {
                let status = status_for(&error);
                if status == 500 {
                    tracing::error!(%error, "Embedded primary failed to apply changeset");
                }
                let body = json!({ "error": error.to_string() }).to_string();
                Ok(ExchangeResponse::new(status, body))
            }
        }
    }
}

fn status_for(error: &Error) -> u16 {
    match error {
        _ if error.is_invariant_violation() => 409,
        Error::PartTooLarge { .. } => 413,
        Error::InvalidInput(_) | Error::Serialization(_) | Error::Multipart(_) => 400,
        Error::NotFound(_) => 404,
        _ => 500,
    }
}

impl Exchange for LoopbackExchange {
    async fn post_auth(&self, password: &str) -> Result<ExchangeResponse> {
        if password != self.password {
            return Ok(ExchangeResponse::new(401, "Wrong password"));
        }
        self.session.set(true);
        Ok(ExchangeResponse::new(200, ""))
    }

    async fn post_changeset(&self, body: MultipartEncoder) -> Result<ExchangeResponse> {
        if !self.session.get() {
            return Ok(Self::forbidden());
        }
        self.receive(body).await
    }

    async fn get_file(&self, id: &Id, dest: &Path) -> Result<ExchangeResponse> {
        if !self.session.get() {
            return Ok(Self::forbidden());
        }
        let Some((_, path)) = self.service.attachment_blob(id).await? else {
            return Ok(ExchangeResponse::new(404, "Not found"));
        };
        tokio::fs::copy(&path, dest).await?;
        Ok(ExchangeResponse::new(200, ""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Attachment, Changeset, Document};
    use crate::network::NetworkAgent;
    use serde_json::json;
    use tempfile::tempdir;

    async fn agent(dir: &Path) -> NetworkAgent<LoopbackExchange> {
        let service = PrimaryService::open_in_memory(dir.join("primary-blobs"))
            .await
            .unwrap();
        let exchange = LoopbackExchange::new(service, "secret", dir.join("uploads")).unwrap();
        NetworkAgent::new(exchange)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn requires_a_session() {
        let dir = tempdir().unwrap();
        let agent = agent(dir.path()).await;

        let err = agent
            .sync_changes(&Changeset::new(0), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http { status: 403 }));

        assert!(matches!(
            agent.authorize("wrong").await,
            Err(Error::Http { status: 401 })
        ));
        agent.authorize("secret").await.unwrap();
        assert!(agent.sync_changes(&Changeset::new(0), &[]).await.is_ok());

        agent.exchange().revoke_session();
        assert!(agent.sync_changes(&Changeset::new(0), &[]).await.is_err());
        assert!(!agent.is_authorized());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn uploads_and_downloads_attachments() {
        let dir = tempdir().unwrap();
        let agent = agent(dir.path()).await;
        agent.authorize("secret").await.unwrap();

        let blob = dir.path().join("photo.png");
        tokio::fs::write(&blob, b"not really a png").await.unwrap();
        let id = Id::from_static("a1");
        let mut changeset = Changeset::new(0);
        changeset
            .attachments
            .push(Attachment::new(id.clone(), "image/png", 16));
        changeset.documents.push(Document::new(
            "note",
            json!({"image": "ref:a1"}),
        ));

        let result = agent
            .sync_changes(&changeset, &[(id.clone(), blob)])
            .await
            .unwrap();
        assert!(result.is_accepted());
        assert_eq!(result.attachments[0].mime_type, "image/png");
        assert_eq!(result.attachments[0].size, 16);

        let dest = dir.path().join("downloaded");
        agent.download_attachment(&id, &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"not really a png");

        let missing = agent
            .download_attachment(&Id::from_static("nope"), &dest)
            .await
            .unwrap_err();
        assert!(matches!(missing, Error::Http { status: 404 }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn integrity_errors_map_to_conflict_status() {
        let dir = tempdir().unwrap();
        let agent = agent(dir.path()).await;
        agent.authorize("secret").await.unwrap();

        let mut changeset = Changeset::new(0);
        changeset
            .attachments
            .push(Attachment::new(Id::from_static("a1"), "text/plain", 1));
        let err = agent.sync_changes(&changeset, &[]).await.unwrap_err();
        assert!(matches!(err, Error::Http { status: 409 }));
        assert!(agent.is_authorized());
    }
}

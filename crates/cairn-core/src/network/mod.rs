//! Network agent: the replica's boundary to the primary store.
//!
//! Tracks connectivity and authorization as reactive cells. Every outbound
//! call fails fast while offline; retrying is up to the sync manager.

mod http;
mod loopback;

use std::future::Future;
use std::path::{Path, PathBuf};

use bytes::Bytes;

pub use http::HttpExchange;
pub use loopback::LoopbackExchange;

use crate::error::{Error, Result};
use crate::models::{Changeset, ChangesetResult, Id};
use crate::multipart::MultipartEncoder;
use crate::reactive::Cell;
use crate::services::CHANGESET_FIELD;
use crate::util::compact_text;

/// Raw answer of the primary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeResponse {
    pub status: u16,
    pub body: Bytes,
}

impl ExchangeResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Request transport to a primary.
///
/// Implementations only move bytes; status handling lives in [`NetworkAgent`].
pub trait Exchange {
    /// `POST /api/auth` with the password as the body
    fn post_auth(&self, password: &str) -> impl Future<Output = Result<ExchangeResponse>>;

    /// `POST /api/changeset` with a multipart body
    fn post_changeset(
        &self,
        body: MultipartEncoder,
    ) -> impl Future<Output = Result<ExchangeResponse>>;

    /// `GET /api/file?id=`, writing the blob to `dest` on success
    fn get_file(&self, id: &Id, dest: &Path) -> impl Future<Output = Result<ExchangeResponse>>;
}

/// Connectivity and session state in front of an [`Exchange`]
pub struct NetworkAgent<E> {
    exchange: E,
    online: Cell<bool>,
    authorized: Cell<bool>,
}

impl<E: Exchange> NetworkAgent<E> {
    /// Agent that starts online and unauthorized
    pub fn new(exchange: E) -> Self {
        Self {
            exchange,
            online: Cell::new(true),
            authorized: Cell::new(false),
        }
    }

    pub const fn exchange(&self) -> &E {
        &self.exchange
    }

    pub fn online(&self) -> Cell<bool> {
        self.online.clone()
    }

    pub fn authorized(&self) -> Cell<bool> {
        self.authorized.clone()
    }

    pub fn is_online(&self) -> bool {
        self.online.value()
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized.value()
    }

    /// Report a platform connectivity change
    pub fn set_online(&self, online: bool) {
        if self.online.set_if_changed(online) {
            tracing::info!(online, "Network connectivity changed");
        }
    }

    pub fn deauthorize(&self) {
        if self.authorized.set_if_changed(false) {
            tracing::info!("Session is no longer authorized");
        }
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::Offline)
        }
    }

    /// Open a session with the primary
    pub async fn authorize(&self, password: &str) -> Result<()> {
        self.ensure_online()?;
        let response = self.send(self.exchange.post_auth(password)).await?;
        self.check(&response)?;
        if self.authorized.set_if_changed(true) {
            tracing::info!("Authorized with the primary");
        }
        Ok(())
    }

    /// Submit a changeset with the blobs of its new attachments
    pub async fn sync_changes(
        &self,
        changeset: &Changeset,
        blobs: &[(Id, PathBuf)],
    ) -> Result<ChangesetResult> {
        self.ensure_online()?;

        let mut encoder = MultipartEncoder::new();
        encoder.add_field(
            CHANGESET_FIELD,
            "application/json",
            serde_json::to_string(changeset)?,
        );
        for (id, path) in blobs {
            let mime_type = changeset
                .attachments
                .iter()
                .find(|attachment| attachment.id == *id)
                .map_or("application/octet-stream", |attachment| {
                    attachment.mime_type.as_str()
                });
            encoder.add_file(id.as_str(), id.as_str(), mime_type, path);
        }

        tracing::debug!(
            base_rev = changeset.base_rev,
            documents = changeset.documents.len(),
            attachments = changeset.attachments.len(),
            blobs = blobs.len(),
            "Submitting changeset"
        );
        let response = self.send(self.exchange.post_changeset(encoder)).await?;
        self.check(&response)?;
        Ok(serde_json::from_slice(&response.body)?)
    }

    /// Fetch an attachment blob into `dest`
    pub async fn download_attachment(&self, id: &Id, dest: &Path) -> Result<()> {
        self.ensure_online()?;
        let response = self.send(self.exchange.get_file(id, dest)).await?;
        self.check(&response)?;
        tracing::debug!(%id, "Downloaded attachment");
        Ok(())
    }

    async fn send(
        &self,
        request: impl Future<Output = Result<ExchangeResponse>>,
    ) -> Result<ExchangeResponse> {
        request.await.inspect_err(|error| {
            tracing::warn!(%error, "Request to the primary failed");
        })
    }

    fn check(&self, response: &ExchangeResponse) -> Result<()> {
        if response.is_success() {
            return Ok(());
        }
        let body = String::from_utf8_lossy(&response.body);
        tracing::warn!(
            status = response.status,
            body = %compact_text(&body),
            "Primary rejected request"
        );
        if response.status == 403 {
            self.deauthorize();
        }
        Err(Error::Http {
            status: response.status,
        })
    }
}

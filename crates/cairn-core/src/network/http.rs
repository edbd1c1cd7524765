//! HTTP transport to a remote primary

use std::path::Path;

use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Body, Client};
use tokio::io::AsyncWriteExt;

use super::{Exchange, ExchangeResponse};
use crate::error::{Error, Result};
use crate::models::Id;
use crate::multipart::MultipartEncoder;
use crate::util::is_http_url;

/// [`Exchange`] over HTTP; the session cookie lives in the client's cookie store.
#[derive(Debug, Clone)]
pub struct HttpExchange {
    base_url: String,
    client: Client,
}

impl HttpExchange {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        if !is_http_url(&base_url) {
            return Err(Error::InvalidInput(format!(
                "Primary URL must start with http:// or https://: {base_url}"
            )));
        }
        let client = Client::builder().cookie_store(true).build()?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn into_response(response: reqwest::Response) -> Result<ExchangeResponse> {
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(ExchangeResponse { status, body })
    }
}

impl Exchange for HttpExchange {
    async fn post_auth(&self, password: &str) -> Result<ExchangeResponse> {
        let response = self
            .client
            .post(self.url("/api/auth"))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(password.to_string())
            .send()
            .await?;
        Self::into_response(response).await
    }

    async fn post_changeset(&self, body: MultipartEncoder) -> Result<ExchangeResponse> {
        let content_type = body.content_type();
        let response = self
            .client
            .post(self.url("/api/changeset"))
            .header(CONTENT_TYPE, content_type)
            .body(Body::wrap_stream(body.into_stream()))
            .send()
            .await?;
        Self::into_response(response).await
    }

    async fn get_file(&self, id: &Id, dest: &Path) -> Result<ExchangeResponse> {
        let response = self
            .client
            .get(self.url("/api/file"))
            .query(&[("id", id.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Self::into_response(response).await;
        }

        let status = response.status().as_u16();
        let partial = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    drop(file);
                    tokio::fs::remove_file(&partial).await.ok();
                    return Err(error.into());
                }
            };
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, dest).await?;
        Ok(ExchangeResponse::new(status, bytes::Bytes::new()))
    }
}

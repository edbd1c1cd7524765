//! Streaming multipart encoder

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, TryStreamExt};
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use super::headers::quote;
use crate::error::Result;

const READ_CHUNK_BYTES: usize = 64 * 1024;

enum PartBody {
    Text(String),
    Bytes(Bytes),
    File(PathBuf),
}

struct Part {
    name: String,
    filename: Option<String>,
    content_type: String,
    body: PartBody,
}

impl Part {
    fn head(&self, boundary: &str) -> String {
        let mut head = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name={}",
            quote(&self.name)
        );
        if let Some(filename) = &self.filename {
            head.push_str("; filename=");
            head.push_str(&quote(filename));
        }
        head.push_str("\r\nContent-Type: ");
        head.push_str(&self.content_type);
        head.push_str("\r\n\r\n");
        head
    }
}

/// Builds a `multipart/form-data` body whose file parts are read lazily.
pub struct MultipartEncoder {
    boundary: String,
    parts: Vec<Part>,
}

impl Default for MultipartEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartEncoder {
    /// Encoder with a random boundary
    pub fn new() -> Self {
        Self::with_boundary(format!("cairn-{}", Uuid::now_v7().simple()))
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            parts: Vec::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value for the request's Content-Type header
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn add_field(&mut self, name: impl Into<String>, content_type: &str, value: String) {
        self.parts.push(Part {
            name: name.into(),
            filename: None,
            content_type: content_type.to_string(),
            body: PartBody::Text(value),
        });
    }

    /// Add a file part read from disk while streaming
    pub fn add_file(
        &mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: &str,
        path: impl Into<PathBuf>,
    ) {
        self.parts.push(Part {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: content_type.to_string(),
            body: PartBody::File(path.into()),
        });
    }

    /// Add a file part from memory
    pub fn add_bytes(
        &mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: &str,
        bytes: impl Into<Bytes>,
    ) {
        self.parts.push(Part {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: content_type.to_string(),
            body: PartBody::Bytes(bytes.into()),
        });
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Stream the encoded body
    pub fn into_stream(self) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
        let state = EncoderState {
            boundary: self.boundary,
            parts: self.parts.into(),
            file: None,
            finished: false,
        };
        stream::unfold(state, EncoderState::next_chunk)
    }

    /// Encode the whole body into memory
    pub async fn into_bytes(self) -> Result<Bytes> {
        let body = self
            .into_stream()
            .try_fold(BytesMut::new(), |mut body, chunk| async move {
                body.extend_from_slice(&chunk);
                Ok(body)
            })
            .await?;
        Ok(body.freeze())
    }
}

struct EncoderState {
    boundary: String,
    parts: VecDeque<Part>,
    file: Option<File>,
    finished: bool,
}

impl EncoderState {
    async fn next_chunk(mut self) -> Option<(std::io::Result<Bytes>, Self)> {
        if let Some(file) = self.file.as_mut() {
            let mut buffer = vec![0; READ_CHUNK_BYTES];
            return match file.read(&mut buffer).await {
                Ok(0) => {
                    self.file = None;
                    Some((Ok(Bytes::from_static(b"\r\n")), self))
                }
                Ok(read) => {
                    buffer.truncate(read);
                    Some((Ok(Bytes::from(buffer)), self))
                }
                Err(error) => Some((Err(error), self.abort())),
            };
        }
        if self.finished {
            return None;
        }

        let Some(part) = self.parts.pop_front() else {
            self.finished = true;
            let closing = format!("--{}--\r\n", self.boundary);
            return Some((Ok(Bytes::from(closing)), self));
        };

        let head = part.head(&self.boundary);
        match part.body {
            PartBody::Text(text) => {
                let chunk = format!("{head}{text}\r\n");
                Some((Ok(Bytes::from(chunk)), self))
            }
            PartBody::Bytes(bytes) => {
                let mut chunk = BytesMut::with_capacity(head.len() + bytes.len() + 2);
                chunk.extend_from_slice(head.as_bytes());
                chunk.extend_from_slice(&bytes);
                chunk.extend_from_slice(b"\r\n");
                Some((Ok(chunk.freeze()), self))
            }
            PartBody::File(path) => match File::open(&path).await {
                Ok(file) => {
                    self.file = Some(file);
                    Some((Ok(Bytes::from(head)), self))
                }
                Err(error) => Some((Err(error), self.abort())),
            },
        }
    }

    fn abort(mut self) -> Self {
        self.file = None;
        self.parts.clear();
        self.finished = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multipart::{extract_boundary, MultipartDecoder};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn encodes_fields_and_files() {
        let mut encoder = MultipartEncoder::with_boundary("B");
        encoder.add_field("changeset", "application/json", "{}".to_string());
        encoder.add_bytes("a1", "a1", "text/plain", &b"hello"[..]);
        let body = encoder.into_bytes().await.unwrap();

        let expected = concat!(
            "--B\r\nContent-Disposition: form-data; name=\"changeset\"\r\n",
            "Content-Type: application/json\r\n\r\n{}\r\n",
            "--B\r\nContent-Disposition: form-data; name=\"a1\"; filename=\"a1\"\r\n",
            "Content-Type: text/plain\r\n\r\nhello\r\n",
            "--B--\r\n",
        );
        assert_eq!(String::from_utf8(body.to_vec()).unwrap(), expected);
    }

    #[tokio::test]
    async fn content_type_carries_boundary() {
        let encoder = MultipartEncoder::new();
        assert_eq!(
            extract_boundary(&encoder.content_type()).as_deref(),
            Some(encoder.boundary())
        );
    }

    #[tokio::test]
    async fn round_trips_files_containing_the_boundary() {
        let dir = tempdir().unwrap();
        let boundary = "cairn-boundary";
        let tricky = format!("start\r\n--{boundary}x\r\nmiddle--{boundary}--\r\nend").into_bytes();
        let large: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let large_path = dir.path().join("large.bin");
        tokio::fs::write(&large_path, &large).await.unwrap();

        let mut encoder = MultipartEncoder::with_boundary(boundary);
        encoder.add_field("changeset", "application/json", r#"{"baseRev":1}"#.to_string());
        encoder.add_bytes("tricky", "tricky", "application/octet-stream", tricky.clone());
        encoder.add_file("large", "large", "application/octet-stream", &large_path);
        let body = encoder.into_bytes().await.unwrap();

        let uploads = tempdir().unwrap();
        let mut decoder = MultipartDecoder::new(boundary, uploads.path());
        for chunk in body.chunks(4093) {
            decoder.feed(chunk).await.unwrap();
        }
        let decoded = decoder.finish().await.unwrap();

        assert_eq!(decoded.field("changeset"), Some(r#"{"baseRev":1}"#));
        let tricky_part = decoded.file("tricky").unwrap();
        assert_eq!(tokio::fs::read(&tricky_part.path).await.unwrap(), tricky);
        let large_part = decoded.file("large").unwrap();
        assert_eq!(large_part.size, large.len() as u64);
        assert_eq!(tokio::fs::read(&large_part.path).await.unwrap(), large);
    }

    #[tokio::test]
    async fn missing_file_fails_the_stream() {
        let mut encoder = MultipartEncoder::with_boundary("B");
        encoder.add_file("x", "x", "text/plain", "/nonexistent/cairn/file");
        assert!(encoder.into_bytes().await.is_err());
    }
}

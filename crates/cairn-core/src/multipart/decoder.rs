//! Streaming multipart decoder

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::headers::{parse_part_headers, PartHeaders};
use super::state::{Boundary, ParserState};
use crate::error::{Error, Result};

/// Maximum size of one part's header block
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Default limit for in-memory text fields
pub const DEFAULT_MAX_FIELD_BYTES: usize = 16 * 1024 * 1024;

/// A text field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub value: String,
}

/// A file part streamed to temporary storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    /// Form field name
    pub field: String,
    pub filename: String,
    pub content_type: Option<String>,
    /// Location of the received bytes
    pub path: PathBuf,
    pub size: u64,
}

/// Decoded multipart body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartBody {
    pub fields: Vec<Field>,
    pub files: Vec<FilePart>,
}

impl MultipartBody {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| field.value.as_str())
    }

    pub fn file(&self, field: &str) -> Option<&FilePart> {
        self.files.iter().find(|file| file.field == field)
    }
}

enum Stage {
    Preamble,
    Headers,
    Field { name: String, value: Vec<u8> },
    File { part: FilePart, file: File },
    Complete,
}

/// Incremental decoder: feed chunks as they arrive, then `finish`.
///
/// Text fields are collected in memory; file parts are written to numbered
/// files inside `temp_dir` as their bytes arrive. Either kind of part is
/// limited to `max_field_bytes`.
pub struct MultipartDecoder {
    state: ParserState,
    stage: Stage,
    temp_dir: PathBuf,
    file_counter: u64,
    max_field_bytes: usize,
    body: MultipartBody,
}

impl MultipartDecoder {
    pub fn new(boundary: &str, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            state: ParserState::new(boundary),
            stage: Stage::Preamble,
            temp_dir: temp_dir.into(),
            file_counter: 0,
            max_field_bytes: DEFAULT_MAX_FIELD_BYTES,
            body: MultipartBody::default(),
        }
    }

    #[must_use]
    pub const fn with_max_field_bytes(mut self, max_field_bytes: usize) -> Self {
        self.max_field_bytes = max_field_bytes;
        self
    }

    pub const fn is_complete(&self) -> bool {
        matches!(self.stage, Stage::Complete)
    }

    /// Process the next chunk of the body
    pub async fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        self.state.push(chunk);
        self.process().await
    }

    /// Finish decoding; fails if the terminal boundary never arrived
    pub async fn finish(mut self) -> Result<MultipartBody> {
        self.process().await?;
        if !self.is_complete() {
            return Err(Error::Multipart("Unexpected end of multipart body".into()));
        }
        Ok(self.body)
    }

    async fn process(&mut self) -> Result<()> {
        loop {
            match &mut self.stage {
                Stage::Preamble => match self.state.consume_till_boundary().0 {
                    Some(Boundary::Delimiter) => self.stage = Stage::Headers,
                    Some(Boundary::Terminal) => self.stage = Stage::Complete,
                    None => return Ok(()),
                },
                Stage::Headers => {
                    let Some(raw) = self.state.consume_headers() else {
                        if self.state.buffered() > MAX_HEADER_BYTES {
                            return Err(Error::PartTooLarge {
                                limit: MAX_HEADER_BYTES,
                            });
                        }
                        return Ok(());
                    };
                    let headers = parse_part_headers(&raw)?;
                    self.stage = self.start_part(headers).await?;
                }
                Stage::Field { value, .. } => {
                    let (found, data) = self.state.consume_till_boundary();
                    if value.len() + data.len() > self.max_field_bytes {
                        return Err(Error::PartTooLarge {
                            limit: self.max_field_bytes,
                        });
                    }
                    value.extend_from_slice(&data);
                    let Some(boundary) = found else {
                        return Ok(());
                    };
                    self.finish_part(boundary).await?;
                }
                Stage::File { part, file } => {
                    let (found, data) = self.state.consume_till_boundary();
                    if part.size + data.len() as u64 > self.max_field_bytes as u64 {
                        return Err(Error::PartTooLarge {
                            limit: self.max_field_bytes,
                        });
                    }
                    write_chunk(file, &data).await?;
                    part.size += data.len() as u64;
                    let Some(boundary) = found else {
                        return Ok(());
                    };
                    self.finish_part(boundary).await?;
                }
                Stage::Complete => {
                    self.state.discard();
                    return Ok(());
                }
            }
        }
    }

    async fn start_part(&mut self, headers: PartHeaders) -> Result<Stage> {
        let PartHeaders {
            name,
            filename,
            content_type,
        } = headers;
        let Some(filename) = filename else {
            return Ok(Stage::Field {
                name,
                value: Vec::new(),
            });
        };

        self.file_counter += 1;
        let path = self.temp_dir.join(self.file_counter.to_string());
        let file = File::create(&path).await?;
        tracing::trace!(field = %name, path = %path.display(), "Receiving file part");
        Ok(Stage::File {
            part: FilePart {
                field: name,
                filename,
                content_type,
                path,
                size: 0,
            },
            file,
        })
    }

    async fn finish_part(&mut self, boundary: Boundary) -> Result<()> {
        let next = match boundary {
            Boundary::Delimiter => Stage::Headers,
            Boundary::Terminal => Stage::Complete,
        };
        match std::mem::replace(&mut self.stage, next) {
            Stage::Field { name, value } => {
                let value = String::from_utf8(value)
                    .map_err(|_| Error::Multipart(format!("Field {name} is not valid UTF-8")))?;
                self.body.fields.push(Field { name, value });
            }
            Stage::File { part, mut file } => {
                file.flush().await?;
                file.sync_all().await?;
                self.body.files.push(part);
            }
            Stage::Preamble | Stage::Headers | Stage::Complete => {}
        }
        Ok(())
    }
}

async fn write_chunk(file: &mut File, data: &Bytes) -> Result<()> {
    if !data.is_empty() {
        file.write_all(data).await?;
    }
    Ok(())
}

/// Decode a complete body stream into fields and files under `temp_dir`
pub async fn decode_stream<S, E>(
    mut stream: S,
    boundary: &str,
    temp_dir: &Path,
    max_field_bytes: usize,
) -> Result<MultipartBody>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut decoder =
        MultipartDecoder::new(boundary, temp_dir).with_max_field_bytes(max_field_bytes);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|error| Error::Multipart(format!("Body stream failed: {error}")))?;
        decoder.feed(&chunk).await?;
    }
    decoder.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn crlf(text: &str) -> Vec<u8> {
        text.replace('\n', "\r\n").into_bytes()
    }

    async fn decode_in_chunks(data: &[u8], boundary: &str, dir: &Path, size: usize) -> MultipartBody {
        let mut decoder = MultipartDecoder::new(boundary, dir);
        for chunk in data.chunks(size) {
            decoder.feed(chunk).await.unwrap();
        }
        decoder.finish().await.unwrap()
    }

    const FAKE_BOUNDARY: &str = "---------------------------735323031399963166993862150";

    fn fake_body() -> Vec<u8> {
        crlf(
            "\n\n-----------------------------735323031399963166993862150
Content-Disposition: form-data; name=\"text1\"

text default
-----------------------------735323031399963166993862150
Content-Disposition: form-data; name=\"text2\"

a\u{3c9}b
-----------------------------735323031399963166993862150
Content-Disposition: form-data; name=\"file1\"; filename=\"a.txt\"
Content-Type: text/plain

Content of a.txt.

-----------------------------735323031399963166993862150
Content-Disposition: form-data; name=\"file2\"; filename=\"a.html\"
Content-Type: text/html

<!DOCTYPE html><title>Content of a.html.</title>

-----------------------------735323031399963166993862150
Content-Disposition: form-data; name=\"file3\"; filename=\"binary\"
Content-Type: application/octet-stream

a\u{3c9}b
-----------------------------735323031399963166993862150--
",
        )
    }

    #[tokio::test]
    async fn decodes_fields_and_files() {
        let dir = tempdir().unwrap();
        let body = decode_in_chunks(&fake_body(), FAKE_BOUNDARY, dir.path(), 1 << 20).await;

        assert_eq!(body.fields.len(), 2);
        assert_eq!(body.files.len(), 3);
        assert_eq!(body.field("text1"), Some("text default"));
        assert_eq!(body.field("text2"), Some("a\u{3c9}b"));

        let file2 = body.file("file2").unwrap();
        assert_eq!(file2.filename, "a.html");
        assert_eq!(file2.content_type.as_deref(), Some("text/html"));
        let content = tokio::fs::read_to_string(&file2.path).await.unwrap();
        assert_eq!(content, "<!DOCTYPE html><title>Content of a.html.</title>\r\n");
    }

    #[tokio::test]
    async fn chunk_size_does_not_matter() {
        let data = fake_body();
        let dir = tempdir().unwrap();
        let whole = decode_in_chunks(&data, FAKE_BOUNDARY, dir.path(), data.len()).await;
        for size in [1, 2, 3, 7, 64] {
            let dir = tempdir().unwrap();
            let body = decode_in_chunks(&data, FAKE_BOUNDARY, dir.path(), size).await;
            assert_eq!(body.fields, whole.fields, "chunk size {size}");
            for (file, expected) in body.files.iter().zip(&whole.files) {
                assert_eq!(file.size, expected.size, "chunk size {size}");
                let left = tokio::fs::read(&file.path).await.unwrap();
                let right = tokio::fs::read(&expected.path).await.unwrap();
                assert_eq!(left, right, "chunk size {size}");
            }
        }
    }

    #[tokio::test]
    async fn decodes_browser_changeset_body() {
        let data = crlf(
            "------WebKitFormBoundaryBLSQ8Zcpc0iEjn7h
Content-Disposition: form-data; name=\"changeset\"

{\"schemaVersion\":1,\"baseRev\":3,\"documents\":[],\"attachments\":[]}
------WebKitFormBoundaryBLSQ8Zcpc0iEjn7h--",
        );
        let dir = tempdir().unwrap();
        let body =
            decode_in_chunks(&data, "----WebKitFormBoundaryBLSQ8Zcpc0iEjn7h", dir.path(), 5).await;

        assert_eq!(body.files.len(), 0);
        assert_eq!(
            body.field("changeset"),
            Some(r#"{"schemaVersion":1,"baseRev":3,"documents":[],"attachments":[]}"#)
        );
    }

    #[tokio::test]
    async fn truncated_body_fails() {
        let data = fake_body();
        let dir = tempdir().unwrap();
        let mut decoder = MultipartDecoder::new(FAKE_BOUNDARY, dir.path());
        decoder.feed(&data[..data.len() / 2]).await.unwrap();
        assert!(matches!(decoder.finish().await, Err(Error::Multipart(_))));
    }

    #[tokio::test]
    async fn oversized_field_is_rejected() {
        let data = crlf("--B\nContent-Disposition: form-data; name=\"big\"\n\n0123456789\n--B--");
        let dir = tempdir().unwrap();
        let mut decoder = MultipartDecoder::new("B", dir.path()).with_max_field_bytes(4);
        let result = decoder.feed(&data).await;
        assert!(matches!(result, Err(Error::PartTooLarge { limit: 4 })));
    }

    #[tokio::test]
    async fn oversized_file_is_rejected() {
        let data = crlf(
            "--B\nContent-Disposition: form-data; name=\"a1\"; filename=\"a1\"\n\n0123456789\n--B--",
        );
        let dir = tempdir().unwrap();
        let mut decoder = MultipartDecoder::new("B", dir.path()).with_max_field_bytes(4);
        let result = decoder.feed(&data).await;
        assert!(matches!(result, Err(Error::PartTooLarge { limit: 4 })));
    }

    #[tokio::test]
    async fn decode_stream_reads_every_chunk() {
        let data = fake_body();
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = data
            .chunks(11)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        let dir = tempdir().unwrap();
        let body = decode_stream(
            futures::stream::iter(chunks),
            FAKE_BOUNDARY,
            dir.path(),
            DEFAULT_MAX_FIELD_BYTES,
        )
        .await
        .unwrap();
        assert_eq!(body.files.len(), 3);
    }
}

//! Attachment model

use serde::{Deserialize, Serialize};

use super::{Id, Revision, STAGING_REV};

/// Attachment metadata; the blob itself lives in a `BlobStore`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Content identifier (hex SHA-256 of the blob)
    pub id: Id,
    /// Revision assigned by the primary store (0 until confirmed)
    pub rev: Revision,
    /// Content MIME type
    pub mime_type: String,
    /// Blob size in bytes
    pub size: u64,
    /// Soft delete flag
    #[serde(default)]
    pub deleted: bool,
}

impl Attachment {
    /// Create unconfirmed metadata for a blob.
    pub fn new(id: Id, mime_type: impl Into<String>, size: u64) -> Self {
        Self {
            id,
            rev: STAGING_REV,
            mime_type: mime_type.into(),
            size,
            deleted: false,
        }
    }

    pub const fn is_staged(&self) -> bool {
        self.rev == STAGING_REV
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_camel_case() {
        let attachment = Attachment::new(Id::from_static("abc"), "image/png", 12);
        let value = serde_json::to_value(&attachment).unwrap();
        assert_eq!(value["mimeType"], "image/png");
        assert_eq!(value["size"], 12);
        assert_eq!(value["rev"], 0);
        assert!(attachment.is_staged());
    }
}

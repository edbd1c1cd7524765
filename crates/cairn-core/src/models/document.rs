//! Document model

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::OnceLock;

use super::{Id, Revision};
use crate::util::now_millis;

/// Revision of entities that were never confirmed by the primary store.
pub const STAGING_REV: Revision = 0;

/// A document in the replicated store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Unique identifier, immutable once created
    pub id: Id,
    /// Revision assigned by the primary store (0 until confirmed)
    pub rev: Revision,
    /// Confirmed revision this local edit was based on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_rev: Option<Revision>,
    /// Caller-defined document type
    #[serde(rename = "type")]
    pub document_type: String,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
    /// Ids of other documents linked from `data`
    #[serde(default)]
    pub refs: Vec<Id>,
    /// Ids of attachments linked from `data`
    #[serde(default)]
    pub attachment_refs: Vec<Id>,
    /// Soft delete flag
    #[serde(default)]
    pub deleted: bool,
    /// Opaque payload
    #[serde(default)]
    pub data: Value,
}

impl Document {
    /// Create a new unconfirmed document
    #[must_use]
    pub fn new(document_type: impl Into<String>, data: Value) -> Self {
        let now = now_millis();
        Self {
            id: Id::generate(),
            rev: STAGING_REV,
            prev_rev: None,
            document_type: document_type.into(),
            created_at: now,
            updated_at: now,
            refs: Vec::new(),
            attachment_refs: Vec::new(),
            deleted: false,
            data,
        }
    }

    /// Whether the primary store has assigned this document a revision
    pub const fn is_staged(&self) -> bool {
        self.rev == STAGING_REV
    }

    /// Recompute `refs` and `attachment_refs` from the links in `data`.
    ///
    /// `is_attachment` decides which bucket a linked id belongs to.
    pub fn update_refs(&mut self, is_attachment: impl Fn(&Id) -> bool) {
        let mut refs = BTreeSet::new();
        let mut attachment_refs = BTreeSet::new();
        for id in extract_refs(&self.data) {
            if id == self.id {
                continue;
            }
            if is_attachment(&id) {
                attachment_refs.insert(id);
            } else {
                refs.insert(id);
            }
        }
        self.refs = refs.into_iter().collect();
        self.attachment_refs = attachment_refs.into_iter().collect();
    }
}

fn ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"ref:([A-Za-z0-9_-]+)").expect("Invalid regex"))
}

/// Extract `ref:<id>` links from every string inside a JSON value
///
/// Links are deduplicated; order is unspecified.
#[must_use]
pub fn extract_refs(value: &Value) -> Vec<Id> {
    let mut found = HashSet::new();
    collect_refs(value, &mut found);
    found.into_iter().collect()
}

fn collect_refs(value: &Value, found: &mut HashSet<Id>) {
    match value {
        Value::String(text) => {
            for capture in ref_pattern().captures_iter(text) {
                if let Ok(id) = Id::parse(&capture[1]) {
                    found.insert(id);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_refs(item, found)),
        Value::Object(map) => map.values().for_each(|item| collect_refs(item, found)),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_document_is_staged() {
        let doc = Document::new("note", json!({"name": "A"}));
        assert!(doc.is_staged());
        assert_eq!(doc.created_at, doc.updated_at);
        assert!(!doc.deleted);
    }

    #[test]
    fn serializes_camel_case_with_type_field() {
        let mut doc = Document::new("note", json!({}));
        doc.prev_rev = Some(2);
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["type"], "note");
        assert_eq!(value["prevRev"], 2);
        assert!(value.get("attachmentRefs").is_some());
        assert!(value.get("createdAt").is_some());
    }

    #[test]
    fn extract_refs_walks_nested_values() {
        let value = json!({
            "title": "see ref:abc and ref:abc",
            "items": [{"body": "ref:def"}, 42, null],
        });
        let mut refs = extract_refs(&value);
        refs.sort();
        assert_eq!(refs, vec![Id::from_static("abc"), Id::from_static("def")]);
    }

    #[test]
    fn update_refs_splits_attachments_and_skips_self() {
        let mut doc = Document::new("note", json!({}));
        doc.data = json!({
            "text": format!("ref:{} ref:other ref:file1", doc.id),
        });
        doc.update_refs(|id| id.as_str() == "file1");
        assert_eq!(doc.refs, vec![Id::from_static("other")]);
        assert_eq!(doc.attachment_refs, vec![Id::from_static("file1")]);
    }
}

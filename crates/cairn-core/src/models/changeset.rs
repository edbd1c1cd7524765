//! Changeset wire types

use serde::{Deserialize, Serialize};

use super::{Attachment, Document, Revision};

/// Local edits tagged with the revision they were built against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Changeset {
    pub base_rev: Revision,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Changeset {
    pub const fn new(base_rev: Revision) -> Self {
        Self {
            base_rev,
            documents: Vec::new(),
            attachments: Vec::new(),
        }
    }

    /// A changeset without document or attachment changes
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty() && self.attachments.is_empty()
    }
}

/// Outcome of applying a changeset on the primary store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangesetStatus {
    Accepted,
    Outdated,
}

/// Primary store response: status plus everything newer than `base_rev`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesetResult {
    pub status: ChangesetStatus,
    pub base_rev: Revision,
    pub current_rev: Revision,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl ChangesetResult {
    pub const fn is_accepted(&self) -> bool {
        matches!(self.status, ChangesetStatus::Accepted)
    }
}

//! Data models for Cairn

mod attachment;
mod changeset;
mod document;
mod id;

pub use attachment::Attachment;
pub use changeset::{Changeset, ChangesetResult, ChangesetStatus};
pub use document::{extract_refs, Document, STAGING_REV};
pub use id::Id;

/// Global revision of a store; monotonically increasing.
pub type Revision = i64;

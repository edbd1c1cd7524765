//! cairn-core - Core library for Cairn
//!
//! Offline-first document replication: a local replica that can be read and
//! edited while disconnected, a revision-numbered changeset protocol against
//! a primary store, shared locks between cooperating processes, and
//! user-mediated conflict resolution. State changes propagate through the
//! push-based primitives in [`reactive`].

pub mod blobs;
pub mod config;
pub mod conflicts;
pub mod db;
pub mod error;
pub mod locks;
pub mod models;
pub mod multipart;
pub mod network;
pub mod primary;
pub mod reactive;
pub mod replica;
pub mod services;
pub mod sync;
pub mod util;


pub use conflicts::{DocumentConflict, MergeConflicts};
pub use error::{Error, Result};
pub use locks::{LockCoordinator, LockState};
pub use models::{
    Attachment, Changeset, ChangesetResult, ChangesetStatus, Document, Id, Revision,
};
pub use network::{HttpExchange, LoopbackExchange, NetworkAgent};
pub use primary::PrimaryStore;
pub use reactive::{Cell, Observable};
pub use replica::Replica;
pub use services::PrimaryService;
pub use sync::{SyncManager, SyncState};

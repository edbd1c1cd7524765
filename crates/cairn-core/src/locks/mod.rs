//! Whole-store and per-document locking.
//!
//! Participants share a [`LockTable`]; each one mirrors the table into a
//! reactive [`LockState`] and grants locks through acquisition streams whose
//! subscription lifetime is the lock lifetime. Entries carry leases so a
//! participant that disappears without cleaning up is evicted once its lease
//! runs out.

mod coordinator;
mod state;
mod table;

pub use coordinator::{LockCoordinator, LockGuard};
pub use state::{Lease, LockEntries, LockKey, LockState, LockViolation};
pub use table::{FileLockTable, LockTable, MemoryLockTable};

//! Lock keys, leases and the derived lock state

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::Error;
use crate::models::Id;

const DOCUMENT_PREFIX: &str = "document:";

/// What a lock protects
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    /// The whole store
    Db,
    Document(Id),
}

impl LockKey {
    /// Whether holding `self` excludes holding `other`
    pub fn conflicts_with(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Db, _) | (_, Self::Db) => true,
            (Self::Document(a), Self::Document(b)) => a == b,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Db => f.write_str("db"),
            Self::Document(id) => write!(f, "{DOCUMENT_PREFIX}{id}"),
        }
    }
}

impl FromStr for LockKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "db" {
            return Ok(Self::Db);
        }
        s.strip_prefix(DOCUMENT_PREFIX)
            .ok_or_else(|| Error::InvalidInput(format!("Invalid lock key: {s}")))
            .and_then(Id::parse)
            .map(Self::Document)
    }
}

impl Serialize for LockKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LockKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Ownership record of a held lock in the shared table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub owner: String,
    /// Unix ms after which other participants may drop the lease
    pub expires_at: i64,
}

impl Lease {
    pub const fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// Contents of the shared lock table
pub type LockEntries = BTreeMap<LockKey, Lease>;

/// A transition the current state doesn't allow
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockViolation {
    #[error("db is locked")]
    DbLocked,
    #[error("some documents are locked")]
    DocumentsLocked,
    #[error("document {0} is already locked")]
    AlreadyLocked(Id),
    #[error("{0} is not locked")]
    NotLocked(LockKey),
}

/// Derived lock state; the three modes never overlap.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LockState {
    #[default]
    Free,
    DbLocked,
    DocumentsLocked(BTreeSet<Id>),
}

impl LockState {
    /// Derive the state from the keys present in the shared table
    pub fn from_keys<'a>(keys: impl IntoIterator<Item = &'a LockKey>) -> Self {
        let mut documents = BTreeSet::new();
        for key in keys {
            match key {
                LockKey::Db => return Self::DbLocked,
                LockKey::Document(id) => {
                    documents.insert(id.clone());
                }
            }
        }
        if documents.is_empty() {
            Self::Free
        } else {
            Self::DocumentsLocked(documents)
        }
    }

    pub fn is_available(&self, key: &LockKey) -> bool {
        match (self, key) {
            (Self::Free, _) => true,
            (Self::DbLocked, _) | (Self::DocumentsLocked(_), LockKey::Db) => false,
            (Self::DocumentsLocked(ids), LockKey::Document(id)) => !ids.contains(id),
        }
    }

    pub fn is_document_locked(&self, id: &Id) -> bool {
        match self {
            Self::Free => false,
            Self::DbLocked => true,
            Self::DocumentsLocked(ids) => ids.contains(id),
        }
    }

    pub fn lock(&self, key: &LockKey) -> Result<Self, LockViolation> {
        match key {
            LockKey::Db => self.lock_db(),
            LockKey::Document(id) => self.lock_document(id),
        }
    }

    pub fn unlock(&self, key: &LockKey) -> Result<Self, LockViolation> {
        match key {
            LockKey::Db => self.unlock_db(),
            LockKey::Document(id) => self.unlock_document(id),
        }
    }

    pub fn lock_db(&self) -> Result<Self, LockViolation> {
        match self {
            Self::Free => Ok(Self::DbLocked),
            Self::DbLocked => Err(LockViolation::DbLocked),
            Self::DocumentsLocked(_) => Err(LockViolation::DocumentsLocked),
        }
    }

    pub fn unlock_db(&self) -> Result<Self, LockViolation> {
        match self {
            Self::DbLocked => Ok(Self::Free),
            Self::Free | Self::DocumentsLocked(_) => Err(LockViolation::NotLocked(LockKey::Db)),
        }
    }

    pub fn lock_document(&self, id: &Id) -> Result<Self, LockViolation> {
        match self {
            Self::Free => Ok(Self::DocumentsLocked(BTreeSet::from([id.clone()]))),
            Self::DbLocked => Err(LockViolation::DbLocked),
            Self::DocumentsLocked(ids) if ids.contains(id) => {
                Err(LockViolation::AlreadyLocked(id.clone()))
            }
            Self::DocumentsLocked(ids) => {
                let mut ids = ids.clone();
                ids.insert(id.clone());
                Ok(Self::DocumentsLocked(ids))
            }
        }
    }

    pub fn unlock_document(&self, id: &Id) -> Result<Self, LockViolation> {
        match self {
            Self::DocumentsLocked(ids) if ids.contains(id) => {
                let mut ids = ids.clone();
                ids.remove(id);
                if ids.is_empty() {
                    Ok(Self::Free)
                } else {
                    Ok(Self::DocumentsLocked(ids))
                }
            }
            _ => Err(LockViolation::NotLocked(LockKey::Document(id.clone()))),
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => f.write_str("free"),
            Self::DbLocked => f.write_str("db-locked"),
            Self::DocumentsLocked(ids) => {
                f.write_str("documents locked: ")?;
                for (index, id) in ids.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{id}")?;
                }
                Ok(())
            }
        }
    }
}

//! Conflict resolution for documents edited both locally and remotely

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::models::{Document, Id};
use crate::reactive::{Cell, Observable, Subscription};
use crate::util::now_millis;

/// A document whose local edit diverged from the primary.
///
/// `base` is the last confirmed copy the edit started from; it is `None` when
/// the replica never had a confirmed copy. Clones share the resolution.
#[derive(Clone)]
pub struct DocumentConflict {
    pub base: Option<Document>,
    pub remote: Document,
    pub local: Document,
    resolution: Cell<Option<Document>>,
}

impl DocumentConflict {
    pub fn new(base: Option<Document>, remote: Document, local: Document) -> Self {
        Self {
            base,
            remote,
            local,
            resolution: Cell::new(None),
        }
    }

    pub fn id(&self) -> &Id {
        &self.remote.id
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.with(Option::is_some)
    }

    /// The final document once resolved
    pub fn resolution(&self) -> Option<Document> {
        self.resolution.value()
    }

    pub fn resolution_stream(&self) -> Observable<Option<Document>> {
        self.resolution.stream()
    }

    pub fn use_local(&self) -> Result<Document> {
        self.finish(self.local.clone())
    }

    pub fn use_remote(&self) -> Result<Document> {
        self.finish(self.remote.clone())
    }

    /// Resolve with a merged version of the document
    pub fn resolve(&self, custom: Document) -> Result<Document> {
        if custom.id != self.remote.id {
            return Err(Error::InvalidInput(format!(
                "Resolution for {} has a different id {}",
                self.remote.id, custom.id
            )));
        }
        self.finish(custom)
    }

    fn finish(&self, mut document: Document) -> Result<Document> {
        if self.is_resolved() {
            return Err(Error::AlreadyResolved(self.remote.id.clone()));
        }
        // the next changeset is based on what the primary already has
        document.rev = self.remote.rev;
        document.prev_rev = Some(self.remote.rev);
        document.updated_at = now_millis();

        tracing::debug!(id = %document.id, rev = document.rev, "Resolved conflict");
        self.resolution.set(Some(document.clone()));
        Ok(document)
    }
}

impl fmt::Debug for DocumentConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentConflict")
            .field("id", self.id())
            .field("remote_rev", &self.remote.rev)
            .field("resolved", &self.is_resolved())
            .finish_non_exhaustive()
    }
}

type Completion = Box<dyn FnOnce(Vec<Document>)>;

struct MergeInner {
    conflicts: Vec<DocumentConflict>,
    on_complete: RefCell<Option<Completion>>,
    resolved: RefCell<Option<Vec<Document>>>,
    subscriptions: RefCell<Vec<Subscription>>,
}

impl MergeInner {
    fn check(&self) {
        let finals: Option<Vec<Document>> = self
            .conflicts
            .iter()
            .map(DocumentConflict::resolution)
            .collect();
        let Some(finals) = finals else {
            return;
        };
        let on_complete = self.on_complete.borrow_mut().take();
        let Some(on_complete) = on_complete else {
            return;
        };

        *self.resolved.borrow_mut() = Some(finals.clone());
        let subscriptions = std::mem::take(&mut *self.subscriptions.borrow_mut());
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        tracing::info!(conflicts = finals.len(), "All merge conflicts resolved");
        on_complete(finals);
    }
}

/// A batch of conflicts completing once every one of them is resolved.
#[derive(Clone)]
pub struct MergeConflicts {
    inner: Rc<MergeInner>,
}

impl MergeConflicts {
    /// `on_complete` receives the final documents exactly once.
    pub fn new(
        conflicts: Vec<DocumentConflict>,
        on_complete: impl FnOnce(Vec<Document>) + 'static,
    ) -> Self {
        let inner = Rc::new(MergeInner {
            conflicts,
            on_complete: RefCell::new(Some(Box::new(on_complete))),
            resolved: RefCell::new(None),
            subscriptions: RefCell::new(Vec::new()),
        });

        for conflict in &inner.conflicts {
            let batch = Rc::downgrade(&inner);
            let subscription = conflict.resolution_stream().subscribe(move |resolution| {
                if resolution.is_none() {
                    return;
                }
                if let Some(batch) = batch.upgrade() {
                    batch.check();
                }
            });
            inner.subscriptions.borrow_mut().push(subscription);
        }
        // covers empty batches and conflicts resolved before batching
        inner.check();

        Self { inner }
    }

    pub fn conflicts(&self) -> &[DocumentConflict] {
        &self.inner.conflicts
    }

    pub fn get(&self, id: &Id) -> Option<&DocumentConflict> {
        self.inner.conflicts.iter().find(|conflict| conflict.id() == id)
    }

    pub fn len(&self) -> usize {
        self.inner.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.conflicts.is_empty()
    }

    pub fn unresolved(&self) -> usize {
        self.inner
            .conflicts
            .iter()
            .filter(|conflict| !conflict.is_resolved())
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.resolved.borrow().is_some()
    }

    /// Final documents once the whole batch is resolved
    pub fn resolved(&self) -> Option<Vec<Document>> {
        self.inner.resolved.borrow().clone()
    }
}

impl PartialEq for MergeConflicts {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MergeConflicts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeConflicts")
            .field("conflicts", &self.inner.conflicts)
            .field("complete", &self.is_complete())
            .finish()
    }
}

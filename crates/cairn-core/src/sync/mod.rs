//! Sync manager: drives replication rounds between a replica and the primary.
//!
//! A round locks the replica, submits its pending changes, and folds the
//! answer back in. Outdated answers without overlapping edits fast-forward
//! the replica and resubmit; overlapping edits park the round in a merge
//! that the user completes through [`MergeConflicts`].

use std::cell::RefCell;
use std::path::PathBuf;
use std::pin::pin;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use crate::config::ClientConfig;
use crate::conflicts::{DocumentConflict, MergeConflicts};
use crate::error::{Error, Result};
use crate::locks::{FileLockTable, LockCoordinator, LockGuard};
use crate::models::{Document, Id, Revision};
use crate::network::{Exchange, HttpExchange, NetworkAgent};
use crate::reactive::Cell;
use crate::replica::{ApplyOutcome, Replica};

/// Observable status of the sync manager
#[derive(Debug, Clone, PartialEq)]
pub enum SyncState {
    Idle,
    Syncing,
    /// Waiting for the user to resolve the batch
    MergeConflicts(MergeConflicts),
}

/// Locks a round takes before touching the replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockScheme {
    /// Lock the whole store
    #[default]
    WholeStore,
    /// Lock only the documents with pending edits
    PendingDocuments,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub interval: Duration,
    pub max_attempts: u32,
    pub lock_scheme: LockScheme,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_attempts: 3,
            lock_scheme: LockScheme::WholeStore,
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            interval: config.sync_interval,
            max_attempts: config.sync_max_attempts,
            ..Self::default()
        }
    }
}

/// How a round ended
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// Pending changes (possibly none) are confirmed at `rev`
    Synced { rev: Revision },
    /// The primary kept moving; changes stay pending for the next round
    Exhausted { rev: Revision },
    Conflicts(MergeConflicts),
}

type Resolved = Rc<RefCell<Option<Vec<Document>>>>;

pub struct SyncManager<E> {
    replica: Rc<Replica>,
    network: Rc<NetworkAgent<E>>,
    locks: LockCoordinator,
    options: SyncOptions,
    state: Cell<SyncState>,
    trigger: Rc<Notify>,
    stop: Notify,
    resolved: Resolved,
    merged: Rc<Notify>,
}

impl SyncManager<HttpExchange> {
    /// Manager for a remote primary, sharing its lock table with every
    /// process that uses the same data directory.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let replica = Replica::open(&config.data_dir).await?;
        let network = NetworkAgent::new(HttpExchange::new(&config.server_url)?);
        let table = FileLockTable::open(config.lock_table_path())?;
        let locks = LockCoordinator::new(&config.instance_id, Arc::new(table), config.lock_lease)?;
        Ok(Self::new(
            Rc::new(replica),
            Rc::new(network),
            locks,
            SyncOptions::from_config(config),
        ))
    }
}

impl<E: Exchange> SyncManager<E> {
    pub fn new(
        replica: Rc<Replica>,
        network: Rc<NetworkAgent<E>>,
        locks: LockCoordinator,
        options: SyncOptions,
    ) -> Self {
        Self {
            replica,
            network,
            locks,
            options: SyncOptions {
                max_attempts: options.max_attempts.max(1),
                ..options
            },
            state: Cell::new(SyncState::Idle),
            trigger: Rc::new(Notify::new()),
            stop: Notify::new(),
            resolved: Rc::new(RefCell::new(None)),
            merged: Rc::new(Notify::new()),
        }
    }

    pub fn replica(&self) -> &Rc<Replica> {
        &self.replica
    }

    pub fn network(&self) -> &Rc<NetworkAgent<E>> {
        &self.network
    }

    pub const fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    pub fn state(&self) -> Cell<SyncState> {
        self.state.clone()
    }

    /// Ask the running loop for a round
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Make [`Self::run`] return after the current round
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    /// Run one round now.
    ///
    /// Transport errors leave the local overlay untouched and are safe to
    /// retry on the next trigger.
    pub async fn sync(&self) -> Result<RoundOutcome> {
        if self.replica.is_merge_pending() {
            return Err(Error::MergePending);
        }
        self.state.set(SyncState::Syncing);
        let outcome = self.round().await;

        match &outcome {
            Ok(RoundOutcome::Conflicts(batch)) => {
                self.state.set(SyncState::MergeConflicts(batch.clone()));
            }
            Ok(RoundOutcome::Synced { rev } | RoundOutcome::Exhausted { rev }) => {
                tracing::debug!(rev, "Sync round finished");
                self.state.set(SyncState::Idle);
            }
            Err(error) => {
                if error.is_transport() {
                    tracing::warn!(%error, "Sync round aborted, will retry");
                } else {
                    tracing::error!(%error, "Sync round failed");
                }
                self.state.set(SyncState::Idle);
            }
        }
        outcome
    }

    async fn lock(&self) -> Result<LockGuard> {
        match self.options.lock_scheme {
            LockScheme::WholeStore => self.locks.lock_db().await,
            LockScheme::PendingDocuments => {
                let ids = self.replica.pending_document_ids();
                self.locks.lock_documents(ids).await
            }
        }
    }

    async fn round(&self) -> Result<RoundOutcome> {
        let _lock = self.lock().await?;

        for attempt in 1..=self.options.max_attempts {
            let pending = self.replica.pending_changes();
            tracing::info!(
                attempt,
                base_rev = pending.changeset.base_rev,
                documents = pending.changeset.documents.len(),
                attachments = pending.changeset.attachments.len(),
                "Starting sync round"
            );
            let result = self
                .network
                .sync_changes(&pending.changeset, &pending.blobs)
                .await?;

            match self.replica.apply_result(&pending.changeset, result).await? {
                ApplyOutcome::Accepted { rev } => {
                    let removed = self.replica.compact().await?;
                    if removed > 0 {
                        tracing::info!(removed, "Compacted replica attachments");
                    }
                    return Ok(RoundOutcome::Synced { rev });
                }
                ApplyOutcome::FastForwarded { rev } => {
                    tracing::debug!(rev, attempt, "Replica was outdated, resubmitting");
                }
                ApplyOutcome::Conflicts(conflicts) => {
                    return Ok(RoundOutcome::Conflicts(self.start_merge(conflicts)));
                }
            }
        }

        let rev = self.replica.revision();
        tracing::warn!(
            rev,
            attempts = self.options.max_attempts,
            "Primary kept moving, leaving changes pending"
        );
        Ok(RoundOutcome::Exhausted { rev })
    }

    fn start_merge(&self, conflicts: Vec<DocumentConflict>) -> MergeConflicts {
        let resolved = self.resolved.clone();
        let merged = self.merged.clone();
        MergeConflicts::new(conflicts, move |finals| {
            *resolved.borrow_mut() = Some(finals);
            merged.notify_one();
        })
    }

    /// Write a fully resolved merge into the replica.
    ///
    /// Returns `false` when no resolved batch is waiting.
    pub async fn complete_merge(&self) -> Result<bool> {
        let finals = self.resolved.borrow_mut().take();
        let Some(finals) = finals else {
            return Ok(false);
        };

        let written = async {
            let _lock = self.locks.lock_db().await?;
            self.replica.complete_merge(finals.clone()).await
        }
        .await;
        if let Err(error) = written {
            *self.resolved.borrow_mut() = Some(finals);
            return Err(error);
        }

        self.state.set(SyncState::Idle);
        // resolutions are pending edits now
        self.trigger();
        Ok(true)
    }

    /// Make an attachment blob available locally, downloading it if needed
    pub async fn fetch_attachment(&self, id: &Id) -> Result<PathBuf> {
        if let Some(path) = self.replica.attachment_blob(id).await? {
            return Ok(path);
        }
        if self.replica.get_attachment(id).is_none() {
            return Err(Error::NotFound(format!("Attachment {id}")));
        }
        let dest = self.replica.blobs().path(id);
        self.network.download_attachment(id, &dest).await?;
        Ok(dest)
    }

    async fn maintain_locks(&self) -> Result<()> {
        tokio::select! {
            watched = self.locks.watch() => watched,
            renewed = self.locks.keep_alive() => renewed,
        }
    }

    /// Sync on every trigger, timer tick and connectivity restore until
    /// [`Self::stop`] is called.
    ///
    /// Only invariant violations and lock table failures end the loop with
    /// an error.
    pub async fn run(&self) -> Result<()> {
        let trigger = self.trigger.clone();
        let _online = self
            .network
            .online()
            .stream()
            .skip(1)
            .filter(|online| *online)
            .subscribe(move |_| {
                tracing::debug!("Connectivity restored, scheduling sync");
                trigger.notify_one();
            })
            .into_guard();

        let mut ticks = tokio::time::interval(self.options.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut maintenance = pin!(self.maintain_locks());
        tracing::info!(
            interval_secs = self.options.interval.as_secs(),
            "Sync loop started"
        );

        loop {
            tokio::select! {
                biased;
                () = self.stop.notified() => break,
                maintained = &mut maintenance => return Self::lock_table_closed(maintained),
                () = self.merged.notified() => {
                    tokio::select! {
                        written = self.complete_merge() => { written?; }
                        maintained = &mut maintenance => return Self::lock_table_closed(maintained),
                    }
                    continue;
                }
                () = self.trigger.notified() => {}
                _ = ticks.tick() => {}
            }

            if self.replica.is_merge_pending() || !self.network.is_online() {
                continue;
            }
            let round = tokio::select! {
                round = self.sync() => round,
                maintained = &mut maintenance => return Self::lock_table_closed(maintained),
            };
            if let Err(error) = round {
                if !error.is_transport() {
                    return Err(error);
                }
            }
        }

        tracing::info!("Sync loop stopped");
        Ok(())
    }

    fn lock_table_closed(maintained: Result<()>) -> Result<()> {
        maintained?;
        tracing::warn!("Lock table closed, stopping sync loop");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::MemoryLockTable;
    use crate::network::LoopbackExchange;
    use crate::services::PrimaryService;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::Path;
    use tempfile::tempdir;

    async fn manager(
        dir: &Path,
        service: PrimaryService,
        name: &str,
    ) -> SyncManager<LoopbackExchange> {
        let replica = Replica::open(dir.join(name)).await.unwrap();
        let exchange = LoopbackExchange::new(service, "secret", dir.join("uploads")).unwrap();
        let network = NetworkAgent::new(exchange);
        network.authorize("secret").await.unwrap();
        SyncManager::new(
            Rc::new(replica),
            Rc::new(network),
            LockCoordinator::local(name),
            SyncOptions::default(),
        )
    }

    async fn service(dir: &Path) -> PrimaryService {
        PrimaryService::open_in_memory(dir.join("primary-blobs"))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn round_confirms_pending_changes() {
        let dir = tempdir().unwrap();
        let sync = manager(dir.path(), service(dir.path()).await, "a").await;
        let saved = sync
            .replica()
            .save_document(Document::new("note", json!({"name": "A"})))
            .await
            .unwrap();

        let outcome = sync.sync().await.unwrap();
        assert_eq!(outcome, RoundOutcome::Synced { rev: 1 });
        assert_eq!(sync.state().value(), SyncState::Idle);
        assert!(!sync.replica().has_pending_changes());
        assert_eq!(sync.replica().get_document(&saved.id).unwrap().rev, 1);
        assert!(!sync.locks().is_db_locked());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_round_keeps_the_overlay() {
        let dir = tempdir().unwrap();
        let sync = manager(dir.path(), service(dir.path()).await, "a").await;
        sync.replica()
            .save_document(Document::new("note", json!({})))
            .await
            .unwrap();

        sync.network().set_online(false);
        let err = sync.sync().await.unwrap_err();
        assert!(err.is_transport());
        assert!(sync.replica().has_pending_changes());
        assert_eq!(sync.state().value(), SyncState::Idle);

        sync.network().set_online(true);
        assert!(matches!(sync.sync().await.unwrap(), RoundOutcome::Synced { .. }));
        assert!(!sync.replica().has_pending_changes());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn outdated_round_fast_forwards_and_resubmits() {
        let dir = tempdir().unwrap();
        let primary = service(dir.path()).await;
        let first = manager(dir.path(), primary.clone(), "a").await;
        let second = manager(dir.path(), primary, "b").await;

        first
            .replica()
            .save_document(Document::new("note", json!({"from": "a"})))
            .await
            .unwrap();
        first.sync().await.unwrap();

        second
            .replica()
            .save_document(Document::new("note", json!({"from": "b"})))
            .await
            .unwrap();
        assert_eq!(second.sync().await.unwrap(), RoundOutcome::Synced { rev: 2 });
        assert_eq!(second.replica().list_documents(false).len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overlapping_edits_wait_for_resolution() {
        let dir = tempdir().unwrap();
        let primary = service(dir.path()).await;
        let first = manager(dir.path(), primary.clone(), "a").await;
        let second = manager(dir.path(), primary, "b").await;

        let doc = first
            .replica()
            .save_document(Document::new("note", json!({"name": "A"})))
            .await
            .unwrap();
        first.sync().await.unwrap();
        second.sync().await.unwrap();

        let mut remote = first.replica().get_document(&doc.id).unwrap();
        remote.data = json!({"name": "B"});
        first.replica().save_document(remote).await.unwrap();
        first.sync().await.unwrap();

        let mut local = second.replica().get_document(&doc.id).unwrap();
        local.data = json!({"name": "C"});
        second.replica().save_document(local).await.unwrap();

        let RoundOutcome::Conflicts(batch) = second.sync().await.unwrap() else {
            panic!("expected conflicts");
        };
        assert_eq!(second.state().value(), SyncState::MergeConflicts(batch.clone()));
        assert!(matches!(second.sync().await, Err(Error::MergePending)));
        assert!(!second.complete_merge().await.unwrap());

        batch.get(&doc.id).unwrap().use_local().unwrap();
        assert!(second.complete_merge().await.unwrap());
        assert_eq!(second.state().value(), SyncState::Idle);

        assert_eq!(second.sync().await.unwrap(), RoundOutcome::Synced { rev: 3 });
        first.sync().await.unwrap();
        assert_eq!(
            first.replica().get_document(&doc.id).unwrap().data,
            json!({"name": "C"})
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_documents_scheme_locks_only_edited_ids() {
        let dir = tempdir().unwrap();
        let replica = Replica::open(dir.path().join("a")).await.unwrap();
        let exchange =
            LoopbackExchange::new(service(dir.path()).await, "secret", dir.path().join("uploads"))
                .unwrap();
        let network = NetworkAgent::new(exchange);
        network.authorize("secret").await.unwrap();
        let table = Arc::new(MemoryLockTable::new());
        let locks = LockCoordinator::new("a", table.clone(), Duration::from_secs(30)).unwrap();
        let other = LockCoordinator::new("b", table, Duration::from_secs(30)).unwrap();
        let sync = SyncManager::new(
            Rc::new(replica),
            Rc::new(network),
            locks,
            SyncOptions {
                lock_scheme: LockScheme::PendingDocuments,
                ..SyncOptions::default()
            },
        );

        let busy = Document::new("note", json!({}));
        let _held = other.lock_documents([busy.id.clone()]).await.unwrap();
        sync.replica()
            .save_document(Document::new("note", json!({})))
            .await
            .unwrap();

        assert!(matches!(sync.sync().await.unwrap(), RoundOutcome::Synced { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_attachment_downloads_missing_blobs() {
        let dir = tempdir().unwrap();
        let primary = service(dir.path()).await;
        let first = manager(dir.path(), primary.clone(), "a").await;
        let second = manager(dir.path(), primary, "b").await;

        let attachment = first
            .replica()
            .save_attachment_bytes(b"hello", "hello.txt")
            .await
            .unwrap();
        first
            .replica()
            .save_document(Document::new(
                "note",
                json!({"file": format!("ref:{}", attachment.id)}),
            ))
            .await
            .unwrap();
        first.sync().await.unwrap();
        second.sync().await.unwrap();

        assert!(second
            .replica()
            .attachment_blob(&attachment.id)
            .await
            .unwrap()
            .is_none());
        let path = second.fetch_attachment(&attachment.id).await.unwrap();
        assert_eq!(tokio::fs::read(path).await.unwrap(), b"hello");
        assert!(matches!(
            second.fetch_attachment(&Id::from_static("nope")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_loop_syncs_on_trigger_until_stopped() {
        let dir = tempdir().unwrap();
        let sync = manager(dir.path(), service(dir.path()).await, "a").await;
        sync.replica()
            .save_document(Document::new("note", json!({})))
            .await
            .unwrap();

        let driver = async {
            sync.trigger();
            while sync.replica().has_pending_changes() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            sync.stop();
        };
        let (ran, ()) = tokio::join!(sync.run(), driver);
        ran.unwrap();
        assert_eq!(sync.replica().revision(), 1);
    }
}

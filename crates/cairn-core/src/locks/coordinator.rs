//! Lock coordinator: stream-based acquisition over a shared lock table

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use super::{Lease, LockEntries, LockKey, LockState, LockTable};
use crate::error::{Error, Result};
use crate::models::Id;
use crate::reactive::{Cell, Handlers, Observable, SubscriptionGuard, Teardown};
use crate::util::now_millis;

struct Inner {
    owner: String,
    table: Arc<dyn LockTable>,
    lease: Duration,
    state: Cell<LockState>,
    held: RefCell<BTreeSet<LockKey>>,
}

/// Grants whole-store and per-document locks.
///
/// A lock is held for as long as the subscription to its acquisition stream
/// is alive. Participants sharing one [`LockTable`] (in-process or across
/// processes) exclude each other.
#[derive(Clone)]
pub struct LockCoordinator {
    inner: Rc<Inner>,
}

impl LockCoordinator {
    /// Join the shared `table` as `owner`.
    pub fn new(
        owner: impl Into<String>,
        table: Arc<dyn LockTable>,
        lease: Duration,
    ) -> Result<Self> {
        let owner = owner.into();
        let entries = table.load()?;
        let state = LockState::from_keys(entries.keys());
        tracing::info!(%owner, %state, "Joined lock table");

        Ok(Self {
            inner: Rc::new(Inner {
                owner,
                table,
                lease,
                state: Cell::new(state),
                held: RefCell::new(BTreeSet::new()),
            }),
        })
    }

    /// Coordinator backed by a private in-memory table
    pub fn local(owner: impl Into<String>) -> Self {
        let owner = owner.into();
        Self {
            inner: Rc::new(Inner {
                owner,
                table: Arc::new(super::MemoryLockTable::new()),
                lease: Duration::from_secs(30),
                state: Cell::new(LockState::Free),
                held: RefCell::new(BTreeSet::new()),
            }),
        }
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    /// Current lock state, shared by every participant of the table
    pub fn state(&self) -> Cell<LockState> {
        self.inner.state.clone()
    }

    pub fn is_db_locked(&self) -> bool {
        self.inner.state.with(|state| *state == LockState::DbLocked)
    }

    pub fn is_document_locked(&self, id: &Id) -> Observable<bool> {
        let id = id.clone();
        self.inner
            .state
            .stream()
            .map(move |state| state.is_document_locked(&id))
    }

    /// Emits once the whole store is locked; unsubscribing releases it.
    pub fn acquire_db_lock(&self) -> Observable<()> {
        Inner::acquire(&Rc::downgrade(&self.inner), LockKey::Db)
    }

    /// Emits once `id` is locked; unsubscribing releases it.
    pub fn acquire_document_lock(&self, id: &Id) -> Observable<()> {
        Inner::acquire(&Rc::downgrade(&self.inner), LockKey::Document(id.clone()))
    }

    /// Wait for the whole-store lock
    pub async fn lock_db(&self) -> Result<LockGuard> {
        let guard = self.hold(self.acquire_db_lock()).await?;
        Ok(LockGuard {
            keys: vec![LockKey::Db],
            _guards: vec![guard],
        })
    }

    /// Wait for locks on every id, taken in id order
    pub async fn lock_documents(&self, ids: impl IntoIterator<Item = Id>) -> Result<LockGuard> {
        let ids: BTreeSet<Id> = ids.into_iter().collect();
        let mut keys = Vec::with_capacity(ids.len());
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.hold(self.acquire_document_lock(&id)).await?);
            keys.push(LockKey::Document(id));
        }
        Ok(LockGuard {
            keys,
            _guards: guards,
        })
    }

    async fn hold(&self, acquisition: Observable<()>) -> Result<SubscriptionGuard> {
        let (sender, mut receiver) = oneshot::channel::<Result<()>>();
        let sender = Rc::new(RefCell::new(Some(sender)));
        let granted = sender.clone();
        let failed = sender;

        let subscription = acquisition.subscribe_with(
            Handlers::new(move |()| {
                let sender = granted.borrow_mut().take();
                if let Some(sender) = sender {
                    sender.send(Ok(())).ok();
                }
            })
            .on_error(move |error| {
                let sender = failed.borrow_mut().take();
                if let Some(sender) = sender {
                    sender.send(Err(error)).ok();
                }
            }),
        );
        let guard = subscription.into_guard();

        // the waiter follows the table itself so foreign releases wake it up
        let outcome = tokio::select! {
            outcome = &mut receiver => Some(outcome),
            watched = self.watch() => {
                watched?;
                None
            }
        };
        let outcome = match outcome {
            Some(outcome) => outcome,
            None => receiver.await,
        };
        outcome.map_err(|_| Error::Invariant("lock stream ended without granting".into()))??;
        Ok(guard)
    }

    /// Follow the shared table, dropping expired foreign leases.
    ///
    /// Runs until the table goes away or fails.
    pub async fn watch(&self) -> Result<()> {
        let mut changes = self.inner.table.subscribe();
        let mut ticks = tokio::time::interval(tick_period(self.inner.lease, 2));
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = ticks.tick() => {}
            }
            self.inner.reload()?;
        }
    }

    /// Renew this participant's leases forever
    pub async fn keep_alive(&self) -> Result<()> {
        let mut ticks = tokio::time::interval(tick_period(self.inner.lease, 3));
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            self.inner.renew()?;
        }
    }

    /// Re-read the shared table now
    pub fn reload(&self) -> Result<()> {
        self.inner.reload()
    }
}

impl Inner {
    fn acquire(weak: &Weak<Self>, key: LockKey) -> Observable<()> {
        let Some(inner) = weak.upgrade() else {
            return Observable::new(|observer| {
                observer.error(Error::Invariant("lock coordinator is gone".into()));
                None
            });
        };
        let available_key = key.clone();
        let weak = weak.clone();
        inner
            .state
            .stream()
            .map(move |state| state.is_available(&available_key))
            .filter(|available| *available)
            .take(1)
            .switch_map(move |_| Self::grant(weak.clone(), key.clone()))
    }

    fn grant(weak: Weak<Self>, key: LockKey) -> Observable<()> {
        Observable::new(move |observer| {
            let Some(inner) = weak.upgrade() else {
                observer.error(Error::Invariant("lock coordinator is gone".into()));
                return None;
            };
            match inner.try_lock(&key) {
                Ok(true) => {
                    observer.next(()).ok();
                    let weak = weak.clone();
                    let key = key.clone();
                    Some(Teardown::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.unlock(&key);
                        }
                    }))
                }
                Ok(false) => {
                    // another participant won; wait for the next release
                    let value_target = observer.clone();
                    let error_target = observer.clone();
                    let retry = Self::acquire(&weak, key.clone()).subscribe_with(
                        Handlers::new(move |()| {
                            value_target.next(()).ok();
                        })
                        .on_error(move |error| error_target.error(error)),
                    );
                    Some(retry.into())
                }
                Err(error) => {
                    tracing::error!(%key, %error, "Failed to write lock table");
                    observer.error(error);
                    None
                }
            }
        })
    }

    fn new_lease(&self, now: i64) -> Lease {
        let lease_ms = i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX);
        Lease {
            owner: self.owner.clone(),
            expires_at: now.saturating_add(lease_ms),
        }
    }

    fn try_lock(&self, key: &LockKey) -> Result<bool> {
        let now = now_millis();
        let mut granted = false;
        let mut own_conflict = None;
        let entries = self.table.transact(&mut |entries| {
            let purged = purge_expired(entries, &self.owner, now);
            let state = LockState::from_keys(entries.keys());
            match state.lock(key) {
                Ok(_) => {
                    entries.insert(key.clone(), self.new_lease(now));
                    granted = true;
                    true
                }
                Err(violation) => {
                    if entries
                        .iter()
                        .any(|(held, lease)| lease.owner == self.owner && held.conflicts_with(key))
                    {
                        own_conflict = Some(violation);
                    }
                    purged
                }
            }
        })?;

        if let Some(violation) = own_conflict {
            panic!("[unreachable] can't lock {key}: {violation}");
        }
        if granted {
            self.held.borrow_mut().insert(key.clone());
            tracing::debug!(owner = %self.owner, %key, "Acquired lock");
        } else {
            tracing::debug!(owner = %self.owner, %key, "Lost lock race, waiting");
        }
        self.publish(&entries);
        Ok(granted)
    }

    fn unlock(&self, key: &LockKey) {
        if !self.held.borrow_mut().remove(key) {
            panic!("[unreachable] can't release {key}: not locked");
        }

        let mut forced = false;
        let result = self.table.transact(&mut |entries| {
            let owned = entries
                .get(key)
                .is_some_and(|lease| lease.owner == self.owner);
            if owned {
                entries.remove(key);
            } else {
                forced = true;
            }
            owned
        });

        match result {
            Ok(entries) => {
                if forced {
                    tracing::warn!(owner = %self.owner, %key, "Lock was force-released while held");
                } else {
                    tracing::debug!(owner = %self.owner, %key, "Released lock");
                }
                self.publish(&entries);
            }
            Err(error) => {
                tracing::error!(owner = %self.owner, %key, %error, "Failed to release lock");
            }
        }
    }

    fn reload(&self) -> Result<()> {
        let now = now_millis();
        let entries = self
            .table
            .transact(&mut |entries| purge_expired(entries, &self.owner, now))?;
        self.publish(&entries);
        Ok(())
    }

    fn renew(&self) -> Result<()> {
        let now = now_millis();
        let entries = self.table.transact(&mut |entries| {
            let mut changed = purge_expired(entries, &self.owner, now);
            for lease in entries.values_mut() {
                if lease.owner == self.owner {
                    *lease = self.new_lease(now);
                    changed = true;
                }
            }
            changed
        })?;
        for key in self.held.borrow().iter() {
            if !entries.contains_key(key) {
                tracing::warn!(owner = %self.owner, %key, "Held lock missing from the shared table");
            }
        }
        self.publish(&entries);
        Ok(())
    }

    fn publish(&self, entries: &LockEntries) {
        let state = LockState::from_keys(entries.keys());
        let description = state.to_string();
        if self.state.set_if_changed(state) {
            tracing::debug!(owner = %self.owner, "lock state -> {description}");
        }
    }
}

fn tick_period(lease: Duration, divisor: u32) -> Duration {
    (lease / divisor).max(Duration::from_millis(1))
}

/// Drop leases of other owners that have expired
fn purge_expired(entries: &mut LockEntries, owner: &str, now: i64) -> bool {
    let before = entries.len();
    entries.retain(|key, lease| {
        let stale = lease.owner != owner && lease.is_expired(now);
        if stale {
            tracing::warn!(%key, stale_owner = %lease.owner, "Releasing expired lock of another owner");
        }
        !stale
    });
    entries.len() != before
}

impl Drop for Inner {
    fn drop(&mut self) {
        let held = std::mem::take(self.held.get_mut());
        if held.is_empty() {
            return;
        }
        for key in &held {
            tracing::warn!(owner = %self.owner, %key, "Releasing remaining lock on shutdown");
        }
        let owner = self.owner.clone();
        let result = self.table.transact(&mut |entries| {
            let before = entries.len();
            entries.retain(|key, lease| !(lease.owner == owner && held.contains(key)));
            entries.len() != before
        });
        if let Err(error) = result {
            tracing::error!(%owner, %error, "Failed to release locks on shutdown");
        }
    }
}

/// Held locks; dropping the guard releases them.
#[must_use = "dropping the guard releases the locks"]
pub struct LockGuard {
    keys: Vec<LockKey>,
    _guards: Vec<SubscriptionGuard>,
}

impl LockGuard {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("keys", &self.keys).finish()
    }
}

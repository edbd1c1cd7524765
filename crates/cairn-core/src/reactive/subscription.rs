//! Subscriptions and teardown

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Deferred cleanup run when a subscription closes
pub struct Teardown(Box<dyn FnOnce()>);

impl Teardown {
    pub fn new(cleanup: impl FnOnce() + 'static) -> Self {
        Self(Box::new(cleanup))
    }

    fn run(self) {
        (self.0)();
    }
}

impl From<Subscription> for Teardown {
    fn from(subscription: Subscription) -> Self {
        Self::new(move || subscription.unsubscribe())
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Teardown")
    }
}

#[derive(Default)]
struct Inner {
    closed: Cell<bool>,
    teardowns: RefCell<Vec<Teardown>>,
}

/// Handle to an active subscription.
///
/// Clones share state. Unsubscribing is idempotent and runs every attached
/// teardown exactly once.
#[derive(Clone, Default)]
pub struct Subscription {
    inner: Rc<Inner>,
}

impl Subscription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Attach cleanup; runs it immediately if already closed.
    pub fn add(&self, teardown: impl Into<Teardown>) {
        let teardown = teardown.into();
        if self.is_closed() {
            teardown.run();
            return;
        }
        self.inner.teardowns.borrow_mut().push(teardown);
    }

    pub fn unsubscribe(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        let teardowns = std::mem::take(&mut *self.inner.teardowns.borrow_mut());
        for teardown in teardowns {
            teardown.run();
        }
    }

    /// Wrap into a guard that unsubscribes on drop
    #[must_use]
    pub fn into_guard(self) -> SubscriptionGuard {
        SubscriptionGuard(self)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Unsubscribes when dropped
#[derive(Debug)]
#[must_use = "dropping the guard unsubscribes immediately"]
pub struct SubscriptionGuard(Subscription);

impl SubscriptionGuard {
    pub fn subscription(&self) -> &Subscription {
        &self.0
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

//! Stateful stream retaining its latest value

use std::cell::{self, RefCell};
use std::fmt;
use std::rc::Rc;

use super::{Observable, Observer, Teardown};

struct Inner<T> {
    value: RefCell<T>,
    version: cell::Cell<u64>,
    observers: RefCell<Vec<(u64, Observer<T>)>>,
    next_observer_id: cell::Cell<u64>,
}

/// A value that can be read synchronously and observed for changes.
///
/// Clones share state. Subscribers receive the current value on subscribe,
/// then every later value. A value set from inside a subscriber supersedes
/// the one being delivered: observers that have not yet seen the older value
/// only receive the newer one.
pub struct Cell<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> Cell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(Inner {
                value: RefCell::new(value),
                version: cell::Cell::new(0),
                observers: RefCell::new(Vec::new()),
                next_observer_id: cell::Cell::new(0),
            }),
        }
    }

    pub fn value(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Borrow the current value without cloning it
    pub fn with<R>(&self, read: impl FnOnce(&T) -> R) -> R {
        read(&self.inner.value.borrow())
    }

    /// Store a value and notify every observer
    pub fn set(&self, value: T) {
        *self.inner.value.borrow_mut() = value.clone();
        let version = self.inner.version.get() + 1;
        self.inner.version.set(version);

        let observers: Vec<Observer<T>> = {
            let mut observers = self.inner.observers.borrow_mut();
            observers.retain(|(_, observer)| !observer.is_closed());
            observers.iter().map(|(_, observer)| observer.clone()).collect()
        };

        for observer in observers {
            if self.inner.version.get() != version {
                break;
            }
            observer.next(value.clone()).ok();
        }
    }

    /// Store a value only if it differs from the current one
    pub fn set_if_changed(&self, value: T) -> bool
    where
        T: PartialEq,
    {
        if *self.inner.value.borrow() == value {
            return false;
        }
        self.set(value);
        true
    }

    /// Derive the next value from the current one
    pub fn update(&self, update: impl FnOnce(&T) -> T) {
        let value = update(&self.inner.value.borrow());
        self.set(value);
    }

    pub fn observer_count(&self) -> usize {
        self.inner
            .observers
            .borrow()
            .iter()
            .filter(|(_, observer)| !observer.is_closed())
            .count()
    }

    /// The current value followed by every change
    pub fn stream(&self) -> Observable<T> {
        let inner = self.inner.clone();
        Observable::new(move |observer: Observer<T>| {
            let id = inner.next_observer_id.get();
            inner.next_observer_id.set(id + 1);
            let current = inner.value.borrow().clone();
            inner.observers.borrow_mut().push((id, observer.clone()));

            observer.next(current).ok();

            let registry = Rc::downgrade(&inner);
            Some(Teardown::new(move || {
                if let Some(inner) = registry.upgrade() {
                    inner
                        .observers
                        .borrow_mut()
                        .retain(|(observer_id, _)| *observer_id != id);
                }
            }))
        })
    }
}

impl<T: fmt::Debug> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("value", &*self.inner.value.borrow())
            .finish_non_exhaustive()
    }
}

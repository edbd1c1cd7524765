//! Observer: the receiving end of a stream

use std::cell::Cell;
use std::rc::Rc;

use super::Subscription;
use crate::error::{Error, Result};

type NextFn<T> = Rc<dyn Fn(T)>;
type ErrorFn = Rc<dyn Fn(Error)>;
type CompleteFn = Rc<dyn Fn()>;

/// Callbacks supplied by a subscriber
pub struct Handlers<T> {
    next: NextFn<T>,
    error: Option<ErrorFn>,
    complete: Option<CompleteFn>,
}

impl<T: 'static> Handlers<T> {
    pub fn new(next: impl Fn(T) + 'static) -> Self {
        Self {
            next: Rc::new(next),
            error: None,
            complete: None,
        }
    }

    #[must_use]
    pub fn on_error(mut self, error: impl Fn(Error) + 'static) -> Self {
        self.error = Some(Rc::new(error));
        self
    }

    #[must_use]
    pub fn on_complete(mut self, complete: impl Fn() + 'static) -> Self {
        self.complete = Some(Rc::new(complete));
        self
    }
}

struct Inner<T> {
    handlers: Handlers<T>,
    stopped: Cell<bool>,
    subscription: Subscription,
}

/// Producer-side handle delivering values to one subscriber.
///
/// After `error` or `complete` the observer is stopped: further `next` calls
/// fail with [`Error::StreamClosed`], further terminal calls are no-ops.
pub struct Observer<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for Observer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Observer<T> {
    pub(crate) fn new(handlers: Handlers<T>, subscription: Subscription) -> Self {
        Self {
            inner: Rc::new(Inner {
                handlers,
                stopped: Cell::new(false),
                subscription,
            }),
        }
    }

    /// Whether the observer stopped or its subscriber unsubscribed
    pub fn is_closed(&self) -> bool {
        self.inner.stopped.get() || self.inner.subscription.is_closed()
    }

    pub fn next(&self, value: T) -> Result<()> {
        if self.is_closed() {
            return Err(Error::StreamClosed);
        }
        let next = self.inner.handlers.next.clone();
        next(value);
        Ok(())
    }

    pub fn error(&self, error: Error) {
        if self.is_closed() {
            return;
        }
        self.inner.stopped.set(true);
        match self.inner.handlers.error.clone() {
            Some(handler) => handler(error),
            None => tracing::error!(%error, "Unhandled stream error"),
        }
        self.inner.subscription.unsubscribe();
    }

    pub fn complete(&self) {
        if self.is_closed() {
            return;
        }
        self.inner.stopped.set(true);
        if let Some(handler) = self.inner.handlers.complete.clone() {
            handler();
        }
        self.inner.subscription.unsubscribe();
    }

    /// Subscription this observer feeds; producers may attach teardowns to it.
    pub fn subscription(&self) -> &Subscription {
        &self.inner.subscription
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn next_after_complete_fails() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let observer = Observer::new(
            Handlers::new(move |value: i32| sink.borrow_mut().push(value)),
            Subscription::new(),
        );

        observer.next(1).unwrap();
        observer.complete();
        assert!(matches!(observer.next(2), Err(Error::StreamClosed)));
        assert_eq!(*seen.borrow(), vec![1]);
    }

    #[test]
    fn terminal_calls_are_single_shot() {
        let completions = Rc::new(Cell::new(0));
        let errors = Rc::new(Cell::new(0));
        let (c, e) = (completions.clone(), errors.clone());
        let subscription = Subscription::new();
        let observer = Observer::new(
            Handlers::new(|_: ()| {})
                .on_complete(move || c.set(c.get() + 1))
                .on_error(move |_| e.set(e.get() + 1)),
            subscription.clone(),
        );

        observer.complete();
        observer.complete();
        observer.error(Error::Offline);
        assert_eq!(completions.get(), 1);
        assert_eq!(errors.get(), 0);
        assert!(subscription.is_closed());
    }

    #[test]
    fn unsubscribed_observer_is_closed() {
        let subscription = Subscription::new();
        let observer = Observer::new(Handlers::new(|_: ()| {}), subscription.clone());
        subscription.unsubscribe();
        assert!(observer.is_closed());
        assert!(observer.next(()).is_err());
    }
}

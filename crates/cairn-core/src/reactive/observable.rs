//! Cold push-based streams and their operators

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use super::{Handlers, Observer, Subscription, Teardown};

type Producer<T> = Rc<dyn Fn(Observer<T>) -> Option<Teardown>>;

/// A cold stream: every subscription runs the producer anew.
pub struct Observable<T> {
    producer: Producer<T>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer.clone(),
        }
    }
}

impl<T: 'static> Observable<T> {
    /// Create a stream from a producer; the returned teardown runs on unsubscribe.
    pub fn new(producer: impl Fn(Observer<T>) -> Option<Teardown> + 'static) -> Self {
        Self {
            producer: Rc::new(producer),
        }
    }

    /// Emit one value, then complete
    pub fn from_value(value: T) -> Self
    where
        T: Clone,
    {
        Self::new(move |observer| {
            observer.next(value.clone()).ok();
            observer.complete();
            None
        })
    }

    /// Never emits and never completes
    pub fn never() -> Self {
        Self::new(|_| None)
    }

    pub fn subscribe_with(&self, handlers: Handlers<T>) -> Subscription {
        let subscription = Subscription::new();
        let observer = Observer::new(handlers, subscription.clone());
        if let Some(teardown) = (self.producer)(observer) {
            subscription.add(teardown);
        }
        subscription
    }

    /// Subscribe with a value callback only; errors are logged.
    pub fn subscribe(&self, next: impl Fn(T) + 'static) -> Subscription {
        self.subscribe_with(Handlers::new(next))
    }

    /// Subscribe to `self` on behalf of `downstream`, forwarding terminal events.
    fn relay<U: 'static>(
        &self,
        downstream: &Observer<U>,
        on_next: impl Fn(T, &Observer<U>) + 'static,
    ) -> Subscription {
        let next_target = downstream.clone();
        let error_target = downstream.clone();
        let complete_target = downstream.clone();
        self.subscribe_with(
            Handlers::new(move |value| on_next(value, &next_target))
                .on_error(move |error| error_target.error(error))
                .on_complete(move || complete_target.complete()),
        )
    }

    #[must_use]
    pub fn map<U: 'static>(&self, map: impl Fn(T) -> U + 'static) -> Observable<U> {
        let source = self.clone();
        let map = Rc::new(map);
        Observable::new(move |observer: Observer<U>| {
            let map = map.clone();
            let upstream = source.relay(&observer, move |value, downstream| {
                downstream.next(map(value)).ok();
            });
            Some(upstream.into())
        })
    }

    #[must_use]
    pub fn filter(&self, predicate: impl Fn(&T) -> bool + 'static) -> Self {
        let source = self.clone();
        let predicate = Rc::new(predicate);
        Self::new(move |observer| {
            let predicate = predicate.clone();
            let upstream = source.relay(&observer, move |value, downstream| {
                if predicate(&value) {
                    downstream.next(value).ok();
                }
            });
            Some(upstream.into())
        })
    }

    /// Run a side effect for every value
    #[must_use]
    pub fn tap(&self, effect: impl Fn(&T) + 'static) -> Self {
        let source = self.clone();
        let effect = Rc::new(effect);
        Self::new(move |observer| {
            let effect = effect.clone();
            let upstream = source.relay(&observer, move |value, downstream| {
                effect(&value);
                downstream.next(value).ok();
            });
            Some(upstream.into())
        })
    }

    /// Forward the first `limit` values, then complete.
    ///
    /// `take(0)` completes without subscribing upstream.
    #[must_use]
    pub fn take(&self, limit: usize) -> Self {
        let source = self.clone();
        Self::new(move |observer| {
            if limit == 0 {
                observer.complete();
                return None;
            }
            let taken = Rc::new(Cell::new(0usize));
            let upstream = source.relay(&observer, move |value, downstream| {
                // counted before forwarding so reentrant emissions see the limit
                let seen = taken.get() + 1;
                taken.set(seen);
                if seen > limit {
                    return;
                }
                downstream.next(value).ok();
                if seen == limit {
                    downstream.complete();
                }
            });
            Some(upstream.into())
        })
    }

    /// Drop the first `count` values
    #[must_use]
    pub fn skip(&self, count: usize) -> Self {
        let source = self.clone();
        Self::new(move |observer| {
            let skipped = Rc::new(Cell::new(0usize));
            let upstream = source.relay(&observer, move |value, downstream| {
                if skipped.get() < count {
                    skipped.set(skipped.get() + 1);
                    return;
                }
                downstream.next(value).ok();
            });
            Some(upstream.into())
        })
    }

    /// Emit a sliding window of the latest `size` values on every value.
    ///
    /// # Panics
    /// If `size` is zero.
    #[must_use]
    pub fn buffer(&self, size: usize) -> Observable<Vec<T>>
    where
        T: Clone,
    {
        assert!(size > 0, "buffer size must be greater than 0");
        let source = self.clone();
        Observable::new(move |observer: Observer<Vec<T>>| {
            let window = Rc::new(RefCell::new(VecDeque::with_capacity(size)));
            let upstream = source.relay(&observer, move |value, downstream| {
                let snapshot: Vec<T> = {
                    let mut window = window.borrow_mut();
                    window.push_back(value);
                    if window.len() > size {
                        window.pop_front();
                    }
                    window.iter().cloned().collect()
                };
                downstream.next(snapshot).ok();
            });
            Some(upstream.into())
        })
    }

    /// Map every value to an inner stream, keeping only the latest one alive.
    ///
    /// A new outer value unsubscribes the active inner stream before the next
    /// one is subscribed. The result completes once the outer stream and the
    /// last inner stream have both completed.
    #[must_use]
    pub fn switch_map<U: 'static>(
        &self,
        project: impl Fn(T) -> Observable<U> + 'static,
    ) -> Observable<U> {
        let source = self.clone();
        let project = Rc::new(project);
        Observable::new(move |observer: Observer<U>| {
            let state = Rc::new(SwitchState::default());
            let project = project.clone();

            let outer_state = state.clone();
            let next_target = observer.clone();
            let error_target = observer.clone();
            let complete_target = observer.clone();
            let complete_state = state.clone();

            let outer = source.subscribe_with(
                Handlers::new(move |value| {
                    SwitchState::switch_to(&outer_state, project(value), &next_target);
                })
                .on_error(move |error| error_target.error(error))
                .on_complete(move || {
                    complete_state.outer_complete.set(true);
                    if !complete_state.inner_active.get() {
                        complete_target.complete();
                    }
                }),
            );

            Some(Teardown::new(move || {
                outer.unsubscribe();
                let inner = state.inner.borrow_mut().take();
                if let Some(inner) = inner {
                    inner.unsubscribe();
                }
            }))
        })
    }
}

#[derive(Default)]
struct SwitchState {
    inner: RefCell<Option<Subscription>>,
    generation: Cell<u64>,
    inner_active: Cell<bool>,
    outer_complete: Cell<bool>,
}

impl SwitchState {
    fn switch_to<U: 'static>(state: &Rc<Self>, next: Observable<U>, downstream: &Observer<U>) {
        let previous = state.inner.borrow_mut().take();
        if let Some(previous) = previous {
            previous.unsubscribe();
        }

        let generation = state.generation.get() + 1;
        state.generation.set(generation);
        state.inner_active.set(true);

        let value_target = downstream.clone();
        let error_target = downstream.clone();
        let complete_target = downstream.clone();
        let inner_state = state.clone();
        let subscription = next.subscribe_with(
            Handlers::new(move |value| {
                value_target.next(value).ok();
            })
            .on_error(move |error| error_target.error(error))
            .on_complete(move || {
                if inner_state.generation.get() != generation {
                    return;
                }
                inner_state.inner_active.set(false);
                if inner_state.outer_complete.get() {
                    complete_target.complete();
                }
            }),
        );

        if state.generation.get() == generation && !downstream.is_closed() {
            *state.inner.borrow_mut() = Some(subscription);
        } else {
            subscription.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::reactive::Cell as ValueCell;
    use pretty_assertions::assert_eq;

    fn collect<T: Clone + 'static>(
        observable: &Observable<T>,
    ) -> (Rc<RefCell<Vec<T>>>, Rc<Cell<bool>>, Subscription) {
        let values = Rc::new(RefCell::new(Vec::new()));
        let completed = Rc::new(Cell::new(false));
        let sink = values.clone();
        let done = completed.clone();
        let subscription = observable.subscribe_with(
            Handlers::new(move |value: T| sink.borrow_mut().push(value))
                .on_complete(move || done.set(true)),
        );
        (values, completed, subscription)
    }

    fn range(values: Vec<i32>) -> Observable<i32> {
        Observable::new(move |observer| {
            for value in &values {
                if observer.next(*value).is_err() {
                    break;
                }
            }
            observer.complete();
            None
        })
    }

    #[test]
    fn streams_are_cold() {
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        let observable = Observable::new(move |observer: Observer<i32>| {
            counter.set(counter.get() + 1);
            observer.next(counter.get()).ok();
            None
        });

        let (first, _, _) = collect(&observable);
        let (second, _, _) = collect(&observable);
        assert_eq!(*first.borrow(), vec![1]);
        assert_eq!(*second.borrow(), vec![2]);
    }

    #[test]
    fn teardown_runs_after_synchronous_completion() {
        let torn_down = Rc::new(Cell::new(false));
        let flag = torn_down.clone();
        let observable = Observable::new(move |observer: Observer<()>| {
            observer.complete();
            let flag = flag.clone();
            Some(Teardown::new(move || flag.set(true)))
        });

        let subscription = observable.subscribe(|()| {});
        assert!(torn_down.get());
        assert!(subscription.is_closed());
    }

    #[test]
    fn map_filter_tap_relay_synchronously() {
        let tapped = Rc::new(RefCell::new(Vec::new()));
        let tap_sink = tapped.clone();
        let observable = range(vec![1, 2, 3, 4])
            .filter(|value| value % 2 == 0)
            .tap(move |value| tap_sink.borrow_mut().push(*value))
            .map(|value| value * 10);

        let (values, completed, _) = collect(&observable);
        assert_eq!(*values.borrow(), vec![20, 40]);
        assert_eq!(*tapped.borrow(), vec![2, 4]);
        assert!(completed.get());
    }

    #[test]
    fn take_completes_and_unsubscribes_upstream() {
        let torn_down = Rc::new(Cell::new(false));
        let flag = torn_down.clone();
        let source = Observable::new(move |observer: Observer<i32>| {
            for value in 1..=5 {
                if observer.next(value).is_err() {
                    break;
                }
            }
            let flag = flag.clone();
            Some(Teardown::new(move || flag.set(true)))
        });

        let (values, completed, _) = collect(&source.take(2));
        assert_eq!(*values.borrow(), vec![1, 2]);
        assert!(completed.get());
        assert!(torn_down.get());
    }

    #[test]
    fn take_zero_completes_immediately() {
        let (values, completed, _) = collect(&range(vec![1]).take(0));
        assert!(values.borrow().is_empty());
        assert!(completed.get());
    }

    #[test]
    fn skip_drops_leading_values() {
        let (values, _, _) = collect(&range(vec![1, 2, 3]).skip(2));
        assert_eq!(*values.borrow(), vec![3]);

        let (values, _, _) = collect(&range(vec![1, 2]).skip(0));
        assert_eq!(*values.borrow(), vec![1, 2]);
    }

    #[test]
    fn buffer_emits_sliding_window() {
        let (values, _, _) = collect(&range(vec![1, 2, 3]).buffer(2));
        assert_eq!(*values.borrow(), vec![vec![1], vec![1, 2], vec![2, 3]]);
    }

    #[test]
    #[should_panic(expected = "buffer size must be greater than 0")]
    fn buffer_rejects_zero() {
        let _ = range(vec![]).buffer(0);
    }

    #[test]
    fn errors_propagate_through_operators() {
        let failed = Rc::new(Cell::new(false));
        let flag = failed.clone();
        let source = Observable::new(|observer: Observer<i32>| {
            observer.error(Error::Offline);
            None
        });
        source
            .map(|value| value + 1)
            .subscribe_with(Handlers::new(|_| {}).on_error(move |error| {
                flag.set(matches!(error, Error::Offline));
            }));
        assert!(failed.get());
    }

    #[test]
    fn switch_map_unsubscribes_previous_inner() {
        let outer = ValueCell::new(0);
        let inners: Rc<RefCell<Vec<Rc<Cell<bool>>>>> = Rc::new(RefCell::new(Vec::new()));
        let registry = inners.clone();

        let composed = outer.stream().switch_map(move |value| {
            let closed = Rc::new(Cell::new(false));
            registry.borrow_mut().push(closed.clone());
            Observable::new(move |observer: Observer<i32>| {
                observer.next(value * 100).ok();
                let closed = closed.clone();
                Some(Teardown::new(move || closed.set(true)))
            })
        });

        let (values, _, subscription) = collect(&composed);
        outer.set(1);
        outer.set(2);

        assert_eq!(*values.borrow(), vec![0, 100, 200]);
        let closed: Vec<bool> = inners.borrow().iter().map(|flag| flag.get()).collect();
        assert_eq!(closed, vec![true, true, false]);

        subscription.unsubscribe();
        assert!(inners.borrow()[2].get());
    }

    #[test]
    fn switch_map_waits_for_last_inner_before_completing() {
        let gate = ValueCell::new(false);
        let inner_gate = gate.clone();
        let composed = Observable::from_value(1).switch_map(move |value| {
            inner_gate
                .stream()
                .filter(|open| *open)
                .take(1)
                .map(move |_| value)
        });

        let (values, completed, _) = collect(&composed);
        assert!(values.borrow().is_empty());
        assert!(!completed.get());

        gate.set(true);
        assert_eq!(*values.borrow(), vec![1]);
        assert!(completed.get());
    }
}

//! Push-based reactive primitives.
//!
//! Everything here is single-threaded (`Rc` based) and synchronous: values are
//! delivered on the caller's stack. Handlers may subscribe, unsubscribe or set
//! cells reentrantly; no internal borrow is held while a handler runs.

mod cell;
mod observable;
mod observer;
mod subscription;

pub use cell::Cell;
pub use observable::Observable;
pub use observer::{Handlers, Observer};
pub use subscription::{Subscription, SubscriptionGuard, Teardown};

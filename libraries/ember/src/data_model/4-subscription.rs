//! # Subscription
//! A Subscription is the capability to stop a live query. Releasing it is always explicit: dropping a
//! Subscription does *not* unsubscribe, so a live query lives exactly as long as its owner says it does.
//!
//! A SubscriptionHandle is a shared slot for "whatever subscription currently backs this live query".
//! The live query can swap what's in the slot (e.g. when an ordered query is replaced by an unordered one),
//! and whoever holds the handle can still release it with one call.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to release, e.g. one that failed before it was established.
    pub fn inert() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[derive(Default)]
struct Slot {
    current: Option<Subscription>,
    cancelled: bool,
}

#[derive(Clone, Default)]
pub struct SubscriptionHandle {
    slot: Rc<RefCell<Slot>>,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.borrow();
        f.debug_struct("SubscriptionHandle")
            .field("current", &slot.current)
            .field("cancelled", &slot.cancelled)
            .finish()
    }
}

impl SubscriptionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `subscription` as the active one and releases the previous one.
    /// If the handle has already been cancelled, `subscription` is released right away.
    pub fn replace(&self, subscription: Subscription) {
        let previous = {
            let mut slot = self.slot.borrow_mut();
            if slot.cancelled {
                Some(subscription)
            } else {
                slot.current.replace(subscription)
            }
        };
        if let Some(previous) = previous {
            previous.unsubscribe();
        }
    }

    pub fn unsubscribe(&self) {
        let current = {
            let mut slot = self.slot.borrow_mut();
            slot.cancelled = true;
            slot.current.take()
        };
        if let Some(current) = current {
            current.unsubscribe();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.slot.borrow().cancelled
    }

    pub fn same_handle(&self, other: &SubscriptionHandle) -> bool {
        Rc::ptr_eq(&self.slot, &other.slot)
    }
}

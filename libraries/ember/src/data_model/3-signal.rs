//! # Signal
//! A Signal is a shared value plus the listeners that want to hear when it changes.
//! Every write bumps a version counter and notifies every listener. The last write wins.
//!
//! Listeners are called after the value borrow has been released, so a listener can freely read or write
//! any signal (including the one that notified it). That's important because most listeners end up
//! calling back into code that touches the same state.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::data_model::ListenerKey;

type Listener = Rc<dyn Fn(ListenerKey)>;

pub struct Signal<T> {
    inner: Rc<SignalInner<T>>,
}

struct SignalInner<T> {
    value: RefCell<T>,
    version: Cell<u64>,
    listeners: RefCell<slotmap::SlotMap<slotmap::DefaultKey, Listener>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Default> Default for Signal<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("value", &self.inner.value.borrow())
            .field("version", &self.inner.version.get())
            .finish()
    }
}

impl<T> Signal<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(SignalInner {
                value: RefCell::new(value),
                version: Cell::new(0),
                listeners: RefCell::new(slotmap::SlotMap::new()),
            }),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.borrow())
    }

    /// Incremented on every write.
    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }

    pub fn set(&self, value: T) {
        *self.inner.value.borrow_mut() = value;
        self.changed();
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.inner.value.borrow_mut());
        self.changed();
        result
    }

    pub fn subscribe(&self, listener: impl Fn(ListenerKey) + 'static) -> ListenerKey {
        let key = self.inner.listeners.borrow_mut().insert(Rc::new(listener));
        ListenerKey(key)
    }

    /// Returns false if the listener was already gone.
    pub fn unsubscribe(&self, key: ListenerKey) -> bool {
        self.inner.listeners.borrow_mut().remove(key.0).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    fn changed(&self) {
        self.inner.version.set(self.inner.version.get() + 1);

        // collect first so no borrow is held while listeners run
        let due: Vec<(ListenerKey, Listener)> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .map(|(key, listener)| (ListenerKey(key), listener.clone()))
            .collect();

        for (key, listener) in due {
            // an earlier listener may have unsubscribed this one
            if self.inner.listeners.borrow().contains_key(key.0) {
                listener(key);
            }
        }
    }
}

impl<T: Clone> Signal<T> {
    pub fn get(&self) -> T {
        self.inner.value.borrow().clone()
    }
}

impl<T: PartialEq> Signal<T> {
    /// Returns true if the value was different and listeners were notified.
    pub fn set_if_changed(&self, value: T) -> bool {
        if *self.inner.value.borrow() == value {
            return false;
        }
        self.set(value);
        true
    }
}

/// A lazily computed value derived from some source, recomputed only when the source's version moves.
pub struct Memo<T> {
    cached: RefCell<Option<(u64, T)>>,
}

impl<T> Default for Memo<T> {
    fn default() -> Self {
        Self {
            cached: RefCell::new(None),
        }
    }
}

impl<T: Clone> Memo<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, version: u64, compute: impl FnOnce() -> T) -> T {
        if let Some((cached_version, value)) = &*self.cached.borrow()
            && *cached_version == version
        {
            return value.clone();
        }

        let value = compute();
        *self.cached.borrow_mut() = Some((version, value.clone()));
        value
    }

    pub fn invalidate(&self) {
        *self.cached.borrow_mut() = None;
    }
}

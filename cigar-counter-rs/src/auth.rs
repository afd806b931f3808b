//! Who is signed in.
//!
//! The identity is only ever written by the provider's change notification. `login`, `register` and `logout`
//! just ask the provider to do something; if it works, the notification that follows is what updates the state.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ember::data_model::{Signal, Subscription};
use ember::{Identity, IdentityProvider};

use crate::Error;

pub struct AuthState {
    provider: Rc<dyn IdentityProvider>,
    identity: Signal<Option<Identity>>,
    is_loading: Signal<bool>,
    initialized: Cell<bool>,
    watcher: RefCell<Option<Subscription>>,
}

impl AuthState {
    pub fn new(provider: Rc<dyn IdentityProvider>) -> Self {
        Self {
            provider,
            identity: Signal::new(None),
            // loading until the provider has told us who (if anyone) is signed in
            is_loading: Signal::new(true),
            initialized: Cell::new(false),
            watcher: RefCell::new(None),
        }
    }

    /// Starts listening to the provider. Only the first call does anything; returns whether this was it.
    pub fn initialize(&self) -> bool {
        if self.initialized.replace(true) {
            return false;
        }

        let identity = self.identity.clone();
        let is_loading = self.is_loading.clone();
        let watcher = self.provider.on_identity_changed(Box::new(move |new_identity| {
            log::info!(
                "Identity changed: {}",
                new_identity
                    .as_ref()
                    .map(|i| i.uid.as_str())
                    .unwrap_or("signed out")
            );
            identity.set(new_identity);
            is_loading.set_if_changed(false);
        }));
        *self.watcher.borrow_mut() = Some(watcher);
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.get()
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<(), Error> {
        self.provider
            .sign_in(email, password)
            .await
            .map(|_| ())
            .inspect_err(|e| log::error!("Error signing in: {e}"))
            .map_err(Error::from)
    }

    pub async fn register(&self, email: &str, password: &str) -> Result<(), Error> {
        self.provider
            .sign_up(email, password)
            .await
            .map(|_| ())
            .inspect_err(|e| log::error!("Error creating account: {e}"))
            .map_err(Error::from)
    }

    pub async fn logout(&self) -> Result<(), Error> {
        self.provider
            .sign_out()
            .await
            .inspect_err(|e| log::error!("Error signing out: {e}"))
            .map_err(Error::from)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.get()
    }

    pub fn uid(&self) -> Option<String> {
        self.identity.with(|identity| identity.as_ref().map(|i| i.uid.clone()))
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.with(Option::is_some)
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading.get()
    }

    pub fn identity_signal(&self) -> &Signal<Option<Identity>> {
        &self.identity
    }

    pub fn loading_signal(&self) -> &Signal<bool> {
        &self.is_loading
    }

    /// Stops listening to the provider. The cached identity is left as it was.
    pub fn shutdown(&self) {
        if let Some(watcher) = self.watcher.borrow_mut().take() {
            watcher.unsubscribe();
        }
    }
}

mod auth;
mod cigars;
mod config;
mod error;
mod stats;
mod utils;

use std::rc::Rc;
use std::sync::LazyLock;

use ember::data_model::{Fields, ListenerKey, SubscriptionHandle};
use ember::{DocumentStore, Identity, IdentityProvider};
#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

pub use auth::AuthState;
pub use cigars::{CigarLog, SmokingEvent, SyncMode};
pub use config::{CollectionSchema, firebase_config};
pub use error::{ActionResult, Error};
pub use stats::{CigarStats, sort_newest_first};

// putting this inside LOGGER prevents us from accidentally initializing the logger more than once
static LOGGER: LazyLock<()> = LazyLock::new(|| {
    utils::set_panic_hook();

    #[cfg(target_arch = "wasm32")]
    wasm_logger::init(wasm_logger::Config::default());
    #[cfg(not(target_arch = "wasm32"))]
    let _ = env_logger::try_init();

    log::info!("Logging initialized");
});

/// The pieces of state a UI can listen to.
#[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateStream {
    Auth,
    AuthLoading,
    Cigars,
    Loading,
    Error,
}

/// Releases whichever query is feeding the live sync it came from.
#[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
pub struct LiveSyncHandle(SubscriptionHandle);

#[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
impl LiveSyncHandle {
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn unsubscribe(&self) {
        self.0.unsubscribe()
    }
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
pub struct CigarCounter {
    // we should never hold a borrow across an .await, or while a backend callback might run
    auth: Rc<AuthState>,
    cigars: Rc<CigarLog>,
    store: Rc<dyn DocumentStore>,
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
impl CigarCounter {
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen(constructor))]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        LazyLock::force(&LOGGER);

        #[cfg(feature = "local-backend")]
        let (identity, store): (Rc<dyn IdentityProvider>, Rc<dyn DocumentStore>) = {
            log::info!("Using the in-memory backend");
            let backend = Rc::new(ember::memory::MemoryBackend::new());
            let identity: Rc<dyn IdentityProvider> = backend.clone();
            let store: Rc<dyn DocumentStore> = backend;
            (identity, store)
        };
        #[cfg(not(feature = "local-backend"))]
        let (identity, store): (Rc<dyn IdentityProvider>, Rc<dyn DocumentStore>) = {
            let auth = Rc::new(ember::firebase::FirebaseAuth::new(config::firebase_config()));
            let store: Rc<dyn DocumentStore> = Rc::new(ember::firebase::Firestore::new(&auth));
            let identity: Rc<dyn IdentityProvider> = auth;
            (identity, store)
        };

        Self::with_backend(identity, store, CollectionSchema::default())
    }

    pub async fn login(&self, email: String, password: String) -> ActionResult {
        self.auth.login(&email, &password).await.into()
    }

    pub async fn register(&self, email: String, password: String) -> ActionResult {
        self.auth.register(&email, &password).await.into()
    }

    pub async fn logout(&self) -> ActionResult {
        self.auth.logout().await.into()
    }

    /// `None` if nobody is signed in.
    pub fn start_live_sync(&self) -> Option<LiveSyncHandle> {
        self.cigars.start_live_sync().map(LiveSyncHandle)
    }

    pub fn stop_live_sync(&self) {
        self.cigars.stop_live_sync()
    }

    /// Lets backends that poll pick up changes made elsewhere. A no-op for backends that push.
    pub async fn refresh(&self) {
        self.store.refresh().await
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen(getter))]
    pub fn user(&self) -> Option<Identity> {
        self.auth.identity()
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen(getter))]
    pub fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen(getter))]
    pub fn is_auth_loading(&self) -> bool {
        self.auth.is_loading()
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen(getter))]
    pub fn cigars(&self) -> Vec<SmokingEvent> {
        self.cigars.events().into_iter().collect()
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen(getter))]
    pub fn stats(&self) -> CigarStats {
        self.cigars.stats()
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen(getter))]
    pub fn is_loading(&self) -> bool {
        self.cigars.is_loading()
    }

    /// Empty when there is no error.
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen(getter))]
    pub fn error(&self) -> String {
        self.cigars.last_error()
    }

    /// `callback` is called with no arguments whenever `stream` changes. Read the new value through the getters.
    pub fn subscribe(&self, stream: StateStream, callback: js_sys::Function) -> ListenerKey {
        self.on_change(stream, move || {
            #[cfg(target_arch = "wasm32")]
            {
                let this = JsValue::null();
                let _ = callback.call0(&this);
            }
            #[cfg(not(target_arch = "wasm32"))]
            {
                let _ = &callback;
            }
        })
    }

    pub fn unsubscribe(&self, stream: StateStream, key: ListenerKey) -> bool {
        match stream {
            StateStream::Auth => self.auth.identity_signal().unsubscribe(key),
            StateStream::AuthLoading => self.auth.loading_signal().unsubscribe(key),
            StateStream::Cigars => self.cigars.events_signal().unsubscribe(key),
            StateStream::Loading => self.cigars.loading_signal().unsubscribe(key),
            StateStream::Error => self.cigars.error_signal().unsubscribe(key),
        }
    }

    /// Stops the live sync and every backend listener this instance holds.
    pub fn shutdown(&self) {
        self.cigars.stop_live_sync();
        self.cigars.unfollow_identity();
        self.auth.shutdown();
    }
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
impl CigarCounter {
    /// `details` is any plain object; it is stored alongside the owner and timestamp.
    pub async fn add_cigar(&self, details: JsValue) -> ActionResult {
        let details: Fields = if details.is_undefined() || details.is_null() {
            Fields::new()
        } else {
            match serde_wasm_bindgen::from_value(details) {
                Ok(details) => details,
                Err(e) => {
                    log::error!("Invalid cigar details: {e}");
                    return ActionResult {
                        success: false,
                        error: Some(e.to_string()),
                    };
                }
            }
        };
        self.add_cigar_fields(details).await
    }
}

impl CigarCounter {
    pub fn with_backend(
        identity: Rc<dyn IdentityProvider>,
        store: Rc<dyn DocumentStore>,
        schema: CollectionSchema,
    ) -> Self {
        LazyLock::force(&LOGGER);

        let auth = Rc::new(AuthState::new(identity));
        auth.initialize();

        let cigars = Rc::new(CigarLog::new(auth.clone(), store.clone(), schema));
        cigars.follow_identity();

        Self {
            auth,
            cigars,
            store,
        }
    }

    pub async fn add_cigar_fields(&self, details: Fields) -> ActionResult {
        self.cigars.add_cigar(details).await.into()
    }

    pub fn auth_state(&self) -> &AuthState {
        &self.auth
    }

    pub fn cigar_log(&self) -> &CigarLog {
        &self.cigars
    }

    pub fn on_change(&self, stream: StateStream, listener: impl Fn() + 'static) -> ListenerKey {
        match stream {
            StateStream::Auth => self.auth.identity_signal().subscribe(move |_| listener()),
            StateStream::AuthLoading => self.auth.loading_signal().subscribe(move |_| listener()),
            StateStream::Cigars => self.cigars.events_signal().subscribe(move |_| listener()),
            StateStream::Loading => self.cigars.loading_signal().subscribe(move |_| listener()),
            StateStream::Error => self.cigars.error_signal().subscribe(move |_| listener()),
        }
    }
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
pub fn get_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

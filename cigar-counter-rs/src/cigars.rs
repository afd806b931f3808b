//! The signed-in user's cigars, kept live.
//!
//! Syncing strategy:
//! 1. Subscribe to the user's cigars ordered by `smokedAt`, newest first. That query needs a composite index.
//! 2. If the store can't serve it (usually because the index hasn't been created), subscribe again with only the
//!    ownership filter. Either way every snapshot replaces the cached list and is sorted locally, so the user sees
//!    the same order regardless of which query is serving.
//! 3. If the unordered query fails too, the error is kept in `last_error` and nothing is retried until
//!    [`CigarLog::start_live_sync`] is called again.
//!
//! The handle returned by [`CigarLog::start_live_sync`] always releases whichever of the two queries is active.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use chrono::{DateTime, Local, TimeZone, Utc};
use ember::data_model::{
    Direction, Document, Fields, ListenerKey, Memo, NewDocument, Query, Signal, Subscription,
    SubscriptionHandle, decode_timestamp,
};
use ember::{BackendError, DocumentStore};

use crate::Error;
use crate::auth::AuthState;
use crate::config::CollectionSchema;
use crate::stats::{CigarStats, sort_newest_first};

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[cfg_attr(target_arch = "wasm32", derive(tsify::Tsify))]
#[cfg_attr(target_arch = "wasm32", tsify(into_wasm_abi, from_wasm_abi))]
#[serde(rename_all = "camelCase")]
pub struct SmokingEvent {
    pub id: String,
    pub owner_id: String,
    /// `None` until the store has resolved its server timestamp.
    pub smoked_at: Option<DateTime<Utc>>,
    pub cost: Option<f64>,
    /// Whatever else the caller stored with the event.
    #[serde(flatten)]
    pub details: Fields,
}

impl SmokingEvent {
    pub fn from_document(document: Document, schema: &CollectionSchema) -> Self {
        let mut fields = document.fields;
        let owner_id = fields
            .remove(&schema.owner_field)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let smoked_at = fields
            .remove(&schema.timestamp_field)
            .as_ref()
            .and_then(decode_timestamp);
        let cost = fields.remove(&schema.cost_field).and_then(|v| v.as_f64());

        Self {
            id: document.id,
            owner_id,
            smoked_at,
            cost,
            details: fields,
        }
    }
}

/// Which query is currently feeding the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    Ordered,
    Fallback,
    /// The fallback failed as well. Nothing more arrives until the sync is started again.
    Failed,
}

struct LiveSync {
    owner_id: String,
    handle: SubscriptionHandle,
    mode: Rc<Cell<SyncMode>>,
}

/// Everything a subscription callback needs in order to write into the cache.
#[derive(Clone)]
struct SnapshotSink {
    owner_id: String,
    schema: CollectionSchema,
    events: Signal<im::Vector<SmokingEvent>>,
    last_error: Signal<String>,
    handle: SubscriptionHandle,
    mode: Rc<Cell<SyncMode>>,
}

impl SnapshotSink {
    /// Callbacks from a subscription that has been superseded or released must not touch the cache.
    fn is_current(&self, mode: SyncMode) -> bool {
        !self.handle.is_cancelled() && self.mode.get() == mode
    }

    fn apply(&self, documents: Vec<Document>) {
        log::info!(
            "{:?} snapshot received: {} documents",
            self.mode.get(),
            documents.len()
        );

        let mut events: Vec<SmokingEvent> = Vec::with_capacity(documents.len());
        for document in documents {
            let event = SmokingEvent::from_document(document, &self.schema);
            if event.owner_id != self.owner_id {
                log::warn!("Ignoring cigar {} owned by another user", event.id);
                continue;
            }
            events.push(event);
        }
        sort_newest_first(&mut events);

        self.events.set(events.into_iter().collect());
        self.last_error.set_if_changed(String::new());
    }
}

/// Holds `is_loading` true for as long as it lives, whichever way the operation exits.
struct LoadingGuard {
    flag: Signal<bool>,
}

impl LoadingGuard {
    fn acquire(flag: &Signal<bool>) -> Self {
        flag.set_if_changed(true);
        Self { flag: flag.clone() }
    }
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.flag.set_if_changed(false);
    }
}

pub struct CigarLog {
    auth: Rc<AuthState>,
    store: Rc<dyn DocumentStore>,
    schema: CollectionSchema,

    events: Signal<im::Vector<SmokingEvent>>,
    is_loading: Signal<bool>,
    last_error: Signal<String>,
    stats: Memo<CigarStats>,

    live: RefCell<Option<LiveSync>>,
    identity_watch: Cell<Option<ListenerKey>>,
}

impl CigarLog {
    pub fn new(
        auth: Rc<AuthState>,
        store: Rc<dyn DocumentStore>,
        schema: CollectionSchema,
    ) -> Self {
        Self {
            auth,
            store,
            schema,
            events: Signal::default(),
            is_loading: Signal::new(false),
            last_error: Signal::default(),
            stats: Memo::new(),
            live: RefCell::new(None),
            identity_watch: Cell::new(None),
        }
    }

    /// Stores a new cigar for the signed-in user. `smokedAt` is filled in by the store's clock.
    /// Returns the id of the new document.
    pub async fn add_cigar(&self, details: Fields) -> Result<String, Error> {
        let Some(owner_id) = self.auth.uid() else {
            return Err(Error::NotAuthenticated);
        };

        let _loading = LoadingGuard::acquire(&self.is_loading);
        self.last_error.set_if_changed(String::new());

        let document = NewDocument::new(details)
            .with_field(&self.schema.owner_field, owner_id)
            .with_server_timestamp(&self.schema.timestamp_field);

        match self
            .store
            .add_document(&self.schema.collection, document)
            .await
        {
            Ok(id) => {
                log::info!("Added cigar {id}");
                Ok(id)
            }
            Err(e) => {
                log::error!("Error adding cigar: {e}");
                self.last_error.set(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Starts keeping `events` in sync with the store for the signed-in user.
    ///
    /// Returns `None` (and does nothing) if nobody is signed in. Calling this again while a sync for the same
    /// user is running returns the existing handle rather than opening a second subscription. A sync whose
    /// fallback failed counts as not running, so calling this again retries from the ordered query.
    pub fn start_live_sync(&self) -> Option<SubscriptionHandle> {
        let Some(owner_id) = self.auth.uid() else {
            log::info!("No user authenticated");
            return None;
        };

        if let Some(live) = self.live.borrow().as_ref()
            && live.owner_id == owner_id
            && !live.handle.is_cancelled()
            && live.mode.get() != SyncMode::Failed
        {
            return Some(live.handle.clone());
        }

        // anything left over belongs to another user, failed, or was already released
        self.stop_live_sync();

        let handle = SubscriptionHandle::new();
        let mode = Rc::new(Cell::new(SyncMode::Ordered));
        *self.live.borrow_mut() = Some(LiveSync {
            owner_id: owner_id.clone(),
            handle: handle.clone(),
            mode: mode.clone(),
        });

        let sink = SnapshotSink {
            owner_id: owner_id.clone(),
            schema: self.schema.clone(),
            events: self.events.clone(),
            last_error: self.last_error.clone(),
            handle: handle.clone(),
            mode: mode.clone(),
        };
        let query = Query::collection(&self.schema.collection)
            .where_eq(&self.schema.owner_field, owner_id.as_str())
            .order_by(&self.schema.timestamp_field, Direction::Descending);
        log::info!(
            "Starting live sync of {} for {owner_id}",
            self.schema.collection
        );

        let on_snapshot = {
            let sink = sink.clone();
            Box::new(move |documents: Vec<Document>| {
                if sink.is_current(SyncMode::Ordered) {
                    sink.apply(documents);
                }
            })
        };
        let on_error = {
            let store: Weak<dyn DocumentStore> = Rc::downgrade(&self.store);
            let fallback_query = query.without_order();
            Box::new(move |error: BackendError| {
                if !sink.is_current(SyncMode::Ordered) {
                    return;
                }
                log::warn!("Error with ordered query, trying fallback: {error}");
                sink.mode.set(SyncMode::Fallback);

                let Some(store) = store.upgrade() else {
                    return;
                };
                let fallback = subscribe_fallback(&*store, fallback_query.clone(), sink.clone());
                sink.handle.replace(fallback);
            })
        };

        let primary = self.store.subscribe(query, on_snapshot, on_error);
        if mode.get() == SyncMode::Ordered {
            handle.replace(primary);
        } else {
            // the primary failed while it was being set up; the fallback already owns the handle
            primary.unsubscribe();
        }

        Some(handle)
    }

    /// Releases the live sync, if any. The cached events are left as they are.
    pub fn stop_live_sync(&self) {
        let live = self.live.borrow_mut().take();
        if let Some(live) = live {
            log::info!("Stopping live sync for {}", live.owner_id);
            live.handle.unsubscribe();
        }
    }

    /// `None` when no sync is running.
    pub fn sync_mode(&self) -> Option<SyncMode> {
        self.live
            .borrow()
            .as_ref()
            .filter(|live| !live.handle.is_cancelled())
            .map(|live| live.mode.get())
    }

    /// Ties the live sync to the signed-in identity: when it changes, the old user's sync is released and their
    /// events are dropped, and if a sync was running it is restarted for the new user.
    pub fn follow_identity(self: &Rc<Self>) {
        if self.identity_watch.get().is_some() {
            return;
        }
        let this = Rc::downgrade(self);
        let key = self.auth.identity_signal().subscribe(move |_| {
            if let Some(this) = this.upgrade() {
                this.identity_changed();
            }
        });
        self.identity_watch.set(Some(key));
    }

    pub fn unfollow_identity(&self) {
        if let Some(key) = self.identity_watch.take() {
            self.auth.identity_signal().unsubscribe(key);
        }
    }

    fn identity_changed(&self) {
        let uid = self.auth.uid();

        let restart = match self.live.borrow().as_ref() {
            Some(live) if !live.handle.is_cancelled() => Some(&live.owner_id) != uid.as_ref(),
            _ => false,
        };

        if restart {
            self.stop_live_sync();
            self.last_error.set_if_changed(String::new());
        }

        let has_foreign = self
            .events
            .with(|events| events.iter().any(|e| Some(&e.owner_id) != uid.as_ref()));
        if has_foreign {
            self.events
                .update(|events| events.retain(|e| Some(&e.owner_id) == uid.as_ref()));
        }

        if restart && uid.is_some() {
            self.start_live_sync();
        }
    }

    pub fn events(&self) -> im::Vector<SmokingEvent> {
        self.events.get()
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading.get()
    }

    /// Empty when there is no error.
    pub fn last_error(&self) -> String {
        self.last_error.get()
    }

    /// Recomputed the first time it's asked for after `events` changes.
    pub fn stats(&self) -> CigarStats {
        self.stats.get(self.events.version(), || self.stats_at(&Local::now()))
    }

    pub fn stats_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> CigarStats {
        self.events
            .with(|events| CigarStats::compute(events.iter(), now))
    }

    pub fn events_signal(&self) -> &Signal<im::Vector<SmokingEvent>> {
        &self.events
    }

    pub fn loading_signal(&self) -> &Signal<bool> {
        &self.is_loading
    }

    pub fn error_signal(&self) -> &Signal<String> {
        &self.last_error
    }
}

fn subscribe_fallback(
    store: &dyn DocumentStore,
    query: Query,
    sink: SnapshotSink,
) -> Subscription {
    let on_snapshot = {
        let sink = sink.clone();
        Box::new(move |documents: Vec<Document>| {
            if sink.is_current(SyncMode::Fallback) {
                sink.apply(documents);
            }
        })
    };
    let on_error = Box::new(move |error: BackendError| {
        if !sink.is_current(SyncMode::Fallback) {
            return;
        }
        log::error!("Error loading cigars with fallback: {error}");
        sink.mode.set(SyncMode::Failed);
        sink.last_error.set(error.to_string());
    });

    store.subscribe(query, on_snapshot, on_error)
}

//! An in-process backend implementing both [`DocumentStore`] and [`IdentityProvider`].
//!
//! It behaves like the managed services in the ways applications depend on: live queries deliver an
//! initial snapshot and then a fresh snapshot on every change, filtered + ordered queries can be made to
//! fail until an index exists, server timestamps can be left pending, and any call can be made to fail.
//! Used by tests and by the `local-backend` build of the app.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use chrono::{DateTime, Utc};
use futures::future::LocalBoxFuture;

use crate::backend::{
    BackendError, DocumentStore, ErrorCallback, Identity, IdentityCallback, IdentityProvider,
    SnapshotCallback,
};
use crate::data_model::{Document, NewDocument, Query, Subscription, encode_timestamp};

const MIN_PASSWORD_LEN: usize = 6;

type Clock = Rc<dyn Fn() -> DateTime<Utc>>;

struct LiveQuery {
    query: Query,
    on_snapshot: Rc<dyn Fn(Vec<Document>)>,
}

struct Account {
    password: String,
    identity: Identity,
}

struct PendingWrite {
    collection: String,
    id: String,
    fields: BTreeSet<String>,
}

#[derive(Default)]
struct MemoryState {
    collections: BTreeMap<String, Vec<Document>>,
    live_queries: slotmap::SlotMap<slotmap::DefaultKey, LiveQuery>,
    query_log: Vec<Query>,
    write_attempts: usize,

    require_composite_indexes: bool,
    indexes: BTreeSet<(String, String)>,
    defer_server_timestamps: bool,
    pending_writes: Vec<PendingWrite>,

    write_failure: Option<BackendError>,
    query_failure: Option<BackendError>,
    auth_failure: Option<BackendError>,

    accounts: BTreeMap<String, Account>,
    current: Option<Identity>,
    identity_listeners: slotmap::SlotMap<slotmap::DefaultKey, Rc<dyn Fn(Option<Identity>)>>,

    clock: Option<Clock>,
}

impl MemoryState {
    fn now(&self) -> DateTime<Utc> {
        self.clock.as_ref().map(|clock| clock()).unwrap_or_else(Utc::now)
    }

    fn snapshot(&self, query: &Query) -> Vec<Document> {
        let mut documents: Vec<Document> = self
            .collections
            .get(&query.collection)
            .map(|documents| {
                documents
                    .iter()
                    .filter(|d| query.matches(d))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        query.sort(&mut documents);
        documents
    }

    fn check_query(&self, query: &Query) -> Result<(), BackendError> {
        if self.require_composite_indexes
            && query.needs_composite_index()
            && let Some(order) = &query.order_by
            && !self
                .indexes
                .contains(&(query.collection.clone(), order.field.clone()))
        {
            let filtered: Vec<&str> = query.filters.iter().map(|f| f.field.as_str()).collect();
            return Err(BackendError::MissingIndex(format!(
                "{} ({}, {} {:?})",
                query.collection,
                filtered.join(", "),
                order.field,
                order.direction
            )));
        }
        match &self.query_failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the clock used to resolve server timestamps.
    pub fn with_clock(self, clock: impl Fn() -> DateTime<Utc> + 'static) -> Self {
        self.state.borrow_mut().clock = Some(Rc::new(clock));
        self
    }

    /// When enabled, filtered + ordered queries fail with [`BackendError::MissingIndex`] until
    /// [`MemoryBackend::create_index`] has been called for the ordering field.
    pub fn require_composite_indexes(&self, required: bool) {
        self.state.borrow_mut().require_composite_indexes = required;
    }

    pub fn create_index(&self, collection: &str, field: &str) {
        self.state
            .borrow_mut()
            .indexes
            .insert((collection.to_string(), field.to_string()));
    }

    /// When enabled, server timestamps read as `null` until [`MemoryBackend::resolve_server_timestamps`].
    pub fn defer_server_timestamps(&self, defer: bool) {
        self.state.borrow_mut().defer_server_timestamps = defer;
    }

    pub fn resolve_server_timestamps(&self) {
        let touched: BTreeSet<String> = {
            let mut state = self.state.borrow_mut();
            let now = state.now();
            let pending = std::mem::take(&mut state.pending_writes);
            let mut touched = BTreeSet::new();
            for write in pending {
                let Some(document) = state
                    .collections
                    .get_mut(&write.collection)
                    .and_then(|documents| documents.iter_mut().find(|d| d.id == write.id))
                else {
                    continue;
                };
                for field in write.fields {
                    document.fields.insert(field, encode_timestamp(now));
                }
                touched.insert(write.collection);
            }
            touched
        };

        for collection in touched {
            self.notify_collection(&collection);
        }
    }

    pub fn fail_writes(&self, error: Option<BackendError>) {
        self.state.borrow_mut().write_failure = error;
    }

    /// Applies to queries that would otherwise be served; missing indexes are reported first.
    pub fn fail_queries(&self, error: Option<BackendError>) {
        self.state.borrow_mut().query_failure = error;
    }

    pub fn fail_auth(&self, error: Option<BackendError>) {
        self.state.borrow_mut().auth_failure = error;
    }

    /// Stores a document as-is (no server timestamps), notifying live queries.
    pub fn insert_document(&self, collection: &str, document: Document) {
        self.state
            .borrow_mut()
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(document);
        self.notify_collection(collection);
    }

    /// Creates an account without signing in.
    pub fn add_account(&self, email: &str, password: &str) -> Identity {
        let identity = Identity {
            uid: eyedee::document_id(),
            email: Some(email.to_string()),
        };
        self.state.borrow_mut().accounts.insert(
            email.to_string(),
            Account {
                password: password.to_string(),
                identity: identity.clone(),
            },
        );
        identity
    }

    pub fn current_identity(&self) -> Option<Identity> {
        self.state.borrow().current.clone()
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.state
            .borrow()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of `add_document` calls, successful or not.
    pub fn write_attempts(&self) -> usize {
        self.state.borrow().write_attempts
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state.borrow().live_queries.len()
    }

    /// Every query ever passed to `subscribe`, in order.
    pub fn query_log(&self) -> Vec<Query> {
        self.state.borrow().query_log.clone()
    }

    fn notify_collection(&self, collection: &str) {
        // do it like this to avoid holding the borrow while we call the callbacks
        let due: Vec<(Rc<dyn Fn(Vec<Document>)>, Vec<Document>)> = {
            let state = self.state.borrow();
            state
                .live_queries
                .values()
                .filter(|live| live.query.collection == collection)
                .map(|live| (live.on_snapshot.clone(), state.snapshot(&live.query)))
                .collect()
        };
        for (on_snapshot, snapshot) in due {
            on_snapshot(snapshot);
        }
    }

    fn set_current(&self, identity: Option<Identity>) {
        let listeners: Vec<Rc<dyn Fn(Option<Identity>)>> = {
            let mut state = self.state.borrow_mut();
            state.current = identity.clone();
            state.identity_listeners.values().cloned().collect()
        };
        for listener in listeners {
            listener(identity.clone());
        }
    }

    fn auth_failure(&self) -> Result<(), BackendError> {
        match &self.state.borrow().auth_failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

impl DocumentStore for MemoryBackend {
    fn add_document<'a>(
        &'a self,
        collection: &'a str,
        document: NewDocument,
    ) -> LocalBoxFuture<'a, Result<String, BackendError>> {
        Box::pin(async move {
            let id = {
                let mut state = self.state.borrow_mut();
                state.write_attempts += 1;
                if let Some(error) = state.write_failure.clone() {
                    return Err(error);
                }

                let id = eyedee::document_id();
                let fields = if state.defer_server_timestamps
                    && !document.server_timestamps.is_empty()
                {
                    state.pending_writes.push(PendingWrite {
                        collection: collection.to_string(),
                        id: id.clone(),
                        fields: document.server_timestamps.clone(),
                    });
                    document.pending_fields()
                } else {
                    document.resolved_fields(state.now())
                };
                state
                    .collections
                    .entry(collection.to_string())
                    .or_default()
                    .push(Document::new(id.clone(), fields));
                id
            };

            self.notify_collection(collection);
            Ok(id)
        })
    }

    fn subscribe(
        &self,
        query: Query,
        on_snapshot: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> Subscription {
        let checked = {
            let mut state = self.state.borrow_mut();
            state.query_log.push(query.clone());
            state.check_query(&query)
        };
        if let Err(error) = checked {
            log::debug!("Rejecting query on {}: {error}", query.collection);
            on_error(error);
            return Subscription::inert();
        }

        let on_snapshot: Rc<dyn Fn(Vec<Document>)> = Rc::from(on_snapshot);
        let (key, snapshot) = {
            let mut state = self.state.borrow_mut();
            let snapshot = state.snapshot(&query);
            let key = state.live_queries.insert(LiveQuery {
                query,
                on_snapshot: on_snapshot.clone(),
            });
            (key, snapshot)
        };
        on_snapshot(snapshot);

        let state = Rc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = state.upgrade() {
                state.borrow_mut().live_queries.remove(key);
            }
        })
    }
}

impl IdentityProvider for MemoryBackend {
    fn sign_in<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> LocalBoxFuture<'a, Result<Identity, BackendError>> {
        Box::pin(async move {
            self.auth_failure()?;
            let identity = {
                let state = self.state.borrow();
                match state.accounts.get(email) {
                    Some(account) if account.password == password => account.identity.clone(),
                    _ => return Err(BackendError::Auth("auth/invalid-credential".to_string())),
                }
            };
            self.set_current(Some(identity.clone()));
            Ok(identity)
        })
    }

    fn sign_up<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> LocalBoxFuture<'a, Result<Identity, BackendError>> {
        Box::pin(async move {
            self.auth_failure()?;
            if !email.contains('@') {
                return Err(BackendError::Auth("auth/invalid-email".to_string()));
            }
            if password.chars().count() < MIN_PASSWORD_LEN {
                return Err(BackendError::Auth("auth/weak-password".to_string()));
            }
            if self.state.borrow().accounts.contains_key(email) {
                return Err(BackendError::Auth("auth/email-already-in-use".to_string()));
            }

            let identity = self.add_account(email, password);
            self.set_current(Some(identity.clone()));
            Ok(identity)
        })
    }

    fn sign_out(&self) -> LocalBoxFuture<'_, Result<(), BackendError>> {
        Box::pin(async move {
            self.auth_failure()?;
            self.set_current(None);
            Ok(())
        })
    }

    fn on_identity_changed(&self, callback: IdentityCallback) -> Subscription {
        let callback: Rc<dyn Fn(Option<Identity>)> = Rc::from(callback);
        let (key, current) = {
            let mut state = self.state.borrow_mut();
            let key = state.identity_listeners.insert(callback.clone());
            (key, state.current.clone())
        };
        callback(current);

        let state = Rc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = state.upgrade() {
                state.borrow_mut().identity_listeners.remove(key);
            }
        })
    }
}

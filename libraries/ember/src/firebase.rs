//! Firebase over its REST APIs: Identity Toolkit for accounts, Firestore for documents.
//!
//! Firestore's push channel isn't available over plain REST, so live queries here are pull-driven. A new live
//! query runs once as soon as it's registered (on wasm32, where there is an event loop to run it on), after every
//! write made through this store, and on every [`DocumentStore::refresh`]. A snapshot is delivered on the first
//! run and whenever the result changed. A query that fails is reported once through its error callback and then
//! dropped, which matches how the SDK treats a listener that errors.
//!
//! Sessions are kept in a [`SessionStore`] (`localStorage` in the browser), so a reload stays signed in. Id tokens
//! live for an hour; they are exchanged for a fresh one shortly before that, or when Firestore rejects one.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use futures::future::LocalBoxFuture;
use serde_json::{Value, json};

use crate::backend::{
    BackendError, DocumentStore, ErrorCallback, Identity, IdentityCallback, IdentityProvider,
    SnapshotCallback,
};
use crate::data_model::{Direction, Document, Fields, NewDocument, Query, Subscription};

/// Exchange the id token this long before it actually expires.
const REFRESH_MARGIN_SECONDS: i64 = 60;
/// What Identity Toolkit hands out when a response doesn't say.
const DEFAULT_TOKEN_LIFETIME_SECONDS: i64 = 3600;

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[cfg_attr(target_arch = "wasm32", derive(tsify::Tsify))]
#[cfg_attr(target_arch = "wasm32", tsify(into_wasm_abi, from_wasm_abi))]
#[serde(rename_all = "camelCase")]
pub struct FirebaseConfig {
    pub api_key: String,
    pub auth_domain: String,
    pub project_id: String,
    pub storage_bucket: String,
    pub messaging_sender_id: String,
    pub app_id: String,
}

impl FirebaseConfig {
    fn database_path(&self) -> String {
        format!("projects/{}/databases/(default)/documents", self.project_id)
    }

    fn documents_url(&self) -> String {
        format!("https://firestore.googleapis.com/v1/{}", self.database_path())
    }

    fn accounts_url(&self, method: &str) -> String {
        format!(
            "https://identitytoolkit.googleapis.com/v1/accounts:{method}?key={}",
            self.api_key
        )
    }

    fn token_url(&self) -> String {
        format!(
            "https://securetoken.googleapis.com/v1/token?key={}",
            self.api_key
        )
    }

    /// The key the web SDK keeps its signed-in user under.
    pub fn session_key(&self) -> String {
        format!("firebase:authUser:{}:[DEFAULT]", self.api_key)
    }
}

/// Where a signed-in session is remembered between page loads.
pub trait SessionStore {
    fn load(&self) -> Option<String>;
    fn save(&self, value: &str);
    fn clear(&self);
}

/// Remembers the session for as long as the process lives.
#[derive(Clone, Debug, Default)]
pub struct MemorySessionStore {
    value: Rc<RefCell<Option<String>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Option<String> {
        self.value.borrow().clone()
    }

    fn save(&self, value: &str) {
        *self.value.borrow_mut() = Some(value.to_string());
    }

    fn clear(&self) {
        *self.value.borrow_mut() = None;
    }
}

#[cfg(target_arch = "wasm32")]
pub struct LocalStorage {
    key: String,
}

#[cfg(target_arch = "wasm32")]
impl LocalStorage {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    fn storage() -> Option<web_sys::Storage> {
        web_sys::window()?.local_storage().ok().flatten()
    }
}

#[cfg(target_arch = "wasm32")]
impl SessionStore for LocalStorage {
    fn load(&self) -> Option<String> {
        Self::storage()?.get_item(&self.key).ok().flatten()
    }

    fn save(&self, value: &str) {
        let Some(storage) = Self::storage() else {
            return;
        };
        if let Err(e) = storage.set_item(&self.key, value) {
            log::warn!("Couldn't save the session: {e:?}");
        }
    }

    fn clear(&self) {
        if let Some(storage) = Self::storage() {
            let _ = storage.remove_item(&self.key);
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    identity: Identity,
    id_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
}

impl Session {
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(REFRESH_MARGIN_SECONDS) >= self.expires_at
    }
}

fn expires_at(expires_in: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    let seconds = expires_in
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECONDS);
    now + Duration::seconds(seconds)
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    local_id: String,
    #[serde(default)]
    email: Option<String>,
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

impl AccountResponse {
    fn into_session(self, now: DateTime<Utc>) -> Session {
        Session {
            expires_at: expires_at(self.expires_in.as_deref(), now),
            identity: Identity {
                uid: self.local_id,
                email: self.email,
            },
            id_token: self.id_token,
            refresh_token: self.refresh_token,
        }
    }
}

/// securetoken answers in snake_case, unlike Identity Toolkit.
#[derive(serde::Deserialize)]
struct TokenResponse {
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

fn refreshed_session(previous: &Session, response: TokenResponse, now: DateTime<Utc>) -> Session {
    Session {
        identity: previous.identity.clone(),
        id_token: response.id_token,
        refresh_token: response.refresh_token,
        expires_at: expires_at(response.expires_in.as_deref(), now),
    }
}

/// The refresh token itself is no good any more, so the user has to sign in again.
fn is_session_revoked(message: &str) -> bool {
    matches!(
        message.split(':').next().unwrap_or_default().trim(),
        "TOKEN_EXPIRED"
            | "INVALID_REFRESH_TOKEN"
            | "MISSING_REFRESH_TOKEN"
            | "USER_DISABLED"
            | "USER_NOT_FOUND"
    )
}

#[derive(Debug, Default, serde::Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug)]
enum RequestError {
    Transport(String),
    Decode(String),
    Service(ErrorBody),
}

fn error_body(body: &Value) -> ErrorBody {
    let error = match body {
        Value::Array(items) => items.iter().find_map(|item| item.get("error")),
        other => other.get("error"),
    };
    error
        .and_then(|error| serde_json::from_value(error.clone()).ok())
        .unwrap_or_else(|| ErrorBody {
            message: body.to_string(),
            status: None,
        })
}

async fn send(request: reqwest::RequestBuilder) -> Result<Value, RequestError> {
    let response = request
        .send()
        .await
        .map_err(|e| RequestError::Transport(e.to_string()))?;
    let succeeded = response.status().is_success();
    let body: Value = response
        .json()
        .await
        .map_err(|e| RequestError::Decode(e.to_string()))?;

    if succeeded {
        Ok(body)
    } else {
        Err(RequestError::Service(error_body(&body)))
    }
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    id_token: Option<String>,
    body: &Value,
) -> Result<Value, RequestError> {
    let mut request = client.post(url).json(body);
    if let Some(token) = id_token {
        request = request.header("Authorization", format!("Bearer {token}"));
    }
    send(request).await
}

/// Identity Toolkit reports failures as SCREAMING_CASE messages; translate them to the codes the web SDK uses.
fn auth_error(message: &str) -> BackendError {
    let code = match message.split(':').next().unwrap_or_default().trim() {
        "INVALID_LOGIN_CREDENTIALS" | "INVALID_PASSWORD" | "EMAIL_NOT_FOUND" => {
            "auth/invalid-credential"
        }
        "EMAIL_EXISTS" => "auth/email-already-in-use",
        "WEAK_PASSWORD" => "auth/weak-password",
        "INVALID_EMAIL" => "auth/invalid-email",
        "MISSING_PASSWORD" => "auth/missing-password",
        "USER_DISABLED" => "auth/user-disabled",
        "TOO_MANY_ATTEMPTS_TRY_LATER" => "auth/too-many-requests",
        "OPERATION_NOT_ALLOWED" => "auth/operation-not-allowed",
        "TOKEN_EXPIRED" | "INVALID_REFRESH_TOKEN" | "MISSING_REFRESH_TOKEN" | "USER_NOT_FOUND" => {
            "auth/user-token-expired"
        }
        _ => return BackendError::Auth(message.to_string()),
    };
    BackendError::Auth(code.to_string())
}

fn store_error(status: Option<&str>, message: String) -> BackendError {
    match status {
        Some("FAILED_PRECONDITION") => BackendError::MissingIndex(message),
        Some("PERMISSION_DENIED") | Some("UNAUTHENTICATED") => {
            BackendError::PermissionDenied(message)
        }
        Some("UNAVAILABLE") | Some("DEADLINE_EXCEEDED") => BackendError::Network(message),
        _ => BackendError::Protocol(message),
    }
}

fn store_request_error(error: RequestError) -> BackendError {
    match error {
        RequestError::Transport(message) => BackendError::Network(message),
        RequestError::Decode(message) => BackendError::Protocol(message),
        RequestError::Service(body) => store_error(body.status.as_deref(), body.message),
    }
}

fn auth_request_error(error: RequestError) -> BackendError {
    match error {
        RequestError::Transport(message) => BackendError::Network(message),
        RequestError::Decode(message) => BackendError::Protocol(message),
        RequestError::Service(body) => auth_error(&body.message),
    }
}

type IdentityListeners = slotmap::SlotMap<slotmap::DefaultKey, Rc<dyn Fn(Option<Identity>)>>;

/// Shared between [`FirebaseAuth`] and every [`Firestore`] built from it.
struct AuthCore {
    config: FirebaseConfig,
    client: reqwest::Client,
    session: RefCell<Option<Session>>,
    listeners: RefCell<IdentityListeners>,
    storage: Rc<dyn SessionStore>,
}

impl AuthCore {
    fn identity(&self) -> Option<Identity> {
        self.session.borrow().as_ref().map(|s| s.identity.clone())
    }

    fn restore(&self) {
        let Some(stored) = self.storage.load() else {
            return;
        };
        match serde_json::from_str::<Session>(&stored) {
            Ok(session) => {
                log::info!("Restored session for {}", session.identity.uid);
                *self.session.borrow_mut() = Some(session);
            }
            Err(e) => {
                log::warn!("Discarding unreadable stored session: {e}");
                self.storage.clear();
            }
        }
    }

    /// Saves `session` and tells listeners if that changed who is signed in.
    fn replace_session(&self, session: Option<Session>) {
        match &session {
            Some(session) => match serde_json::to_string(session) {
                Ok(stored) => self.storage.save(&stored),
                Err(e) => log::warn!("Couldn't serialize the session: {e}"),
            },
            None => self.storage.clear(),
        }

        let previous = self.session.replace(session).map(|s| s.identity);
        let identity = self.identity();
        if previous == identity {
            return;
        }

        // do it like this to avoid holding the borrow while we call the listeners
        let listeners: Vec<_> = self.listeners.borrow().values().cloned().collect();
        for listener in listeners {
            listener(identity.clone());
        }
    }

    /// An id token for whoever is signed in, exchanged for a fresh one first if it's about to expire.
    async fn id_token(&self) -> Result<Option<String>, BackendError> {
        let current = self
            .session
            .borrow()
            .as_ref()
            .map(|s| (s.id_token.clone(), s.needs_refresh(Utc::now())));
        match current {
            None => Ok(None),
            Some((_, true)) => self.refresh_session().await,
            Some((id_token, false)) => Ok(Some(id_token)),
        }
    }

    async fn refresh_session(&self) -> Result<Option<String>, BackendError> {
        let Some(previous) = self.session.borrow().clone() else {
            return Ok(None);
        };

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", previous.refresh_token.as_str()),
        ];
        let result = send(self.client.post(self.config.token_url()).form(&form)).await;

        // someone signed in or out while the request was in flight
        let still_current = self
            .session
            .borrow()
            .as_ref()
            .is_some_and(|s| s.refresh_token == previous.refresh_token);
        if !still_current {
            return Ok(self.session.borrow().as_ref().map(|s| s.id_token.clone()));
        }

        match result {
            Ok(body) => {
                let response: TokenResponse = serde_json::from_value(body)
                    .map_err(|e| BackendError::Protocol(e.to_string()))?;
                let session = refreshed_session(&previous, response, Utc::now());
                let id_token = session.id_token.clone();
                log::info!("Refreshed id token for {}", session.identity.uid);
                self.replace_session(Some(session));
                Ok(Some(id_token))
            }
            Err(RequestError::Service(body)) if is_session_revoked(&body.message) => {
                log::warn!(
                    "Session for {} can't be renewed: {}",
                    previous.identity.uid,
                    body.message
                );
                self.replace_session(None);
                Err(auth_error(&body.message))
            }
            Err(e) => Err(auth_request_error(e)),
        }
    }
}

pub struct FirebaseAuth {
    core: Rc<AuthCore>,
}

impl FirebaseAuth {
    /// Keeps the session in `localStorage` on wasm32, and in memory elsewhere.
    pub fn new(config: FirebaseConfig) -> Self {
        #[cfg(target_arch = "wasm32")]
        let storage: Rc<dyn SessionStore> = Rc::new(LocalStorage::new(config.session_key()));
        #[cfg(not(target_arch = "wasm32"))]
        let storage: Rc<dyn SessionStore> = Rc::new(MemorySessionStore::new());

        Self::with_session_store(config, storage)
    }

    /// Picks up any session `storage` already holds, so the first identity notification reports it.
    pub fn with_session_store(config: FirebaseConfig, storage: Rc<dyn SessionStore>) -> Self {
        let core = AuthCore {
            config,
            client: reqwest::Client::new(),
            session: RefCell::new(None),
            listeners: RefCell::new(slotmap::SlotMap::new()),
            storage,
        };
        core.restore();
        Self {
            core: Rc::new(core),
        }
    }

    pub fn current_identity(&self) -> Option<Identity> {
        self.core.identity()
    }

    async fn account_request(
        &self,
        method: &str,
        email: &str,
        password: &str,
    ) -> Result<Identity, BackendError> {
        let body = json!({
            "email": email,
            "password": password,
            "returnSecureToken": true,
        });
        let response = post_json(
            &self.core.client,
            &self.core.config.accounts_url(method),
            None,
            &body,
        )
        .await
        .map_err(auth_request_error)?;
        let account: AccountResponse = serde_json::from_value(response)
            .map_err(|e| BackendError::Protocol(e.to_string()))?;

        let session = account.into_session(Utc::now());
        let identity = session.identity.clone();
        self.core.replace_session(Some(session));
        Ok(identity)
    }
}

impl IdentityProvider for FirebaseAuth {
    fn sign_in<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> LocalBoxFuture<'a, Result<Identity, BackendError>> {
        Box::pin(self.account_request("signInWithPassword", email, password))
    }

    fn sign_up<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> LocalBoxFuture<'a, Result<Identity, BackendError>> {
        Box::pin(self.account_request("signUp", email, password))
    }

    fn sign_out(&self) -> LocalBoxFuture<'_, Result<(), BackendError>> {
        Box::pin(async move {
            self.core.replace_session(None);
            Ok(())
        })
    }

    fn on_identity_changed(&self, callback: IdentityCallback) -> Subscription {
        let callback: Rc<dyn Fn(Option<Identity>)> = Rc::from(callback);
        let key = self.core.listeners.borrow_mut().insert(callback.clone());
        callback(self.core.identity());

        let core = Rc::downgrade(&self.core);
        Subscription::new(move || {
            if let Some(core) = core.upgrade() {
                core.listeners.borrow_mut().remove(key);
            }
        })
    }
}

struct LiveQuery {
    query: Query,
    on_snapshot: Rc<dyn Fn(Vec<Document>)>,
    on_error: Rc<dyn Fn(BackendError)>,
    last: Option<Vec<Document>>,
}

type LiveQueries = slotmap::SlotMap<slotmap::DefaultKey, LiveQuery>;

enum Delivery {
    Snapshot(Rc<dyn Fn(Vec<Document>)>, Vec<Document>),
    Error(Rc<dyn Fn(BackendError)>, BackendError),
}

impl Delivery {
    fn deliver(self) {
        match self {
            Delivery::Snapshot(on_snapshot, documents) => on_snapshot(documents),
            Delivery::Error(on_error, error) => on_error(error),
        }
    }
}

/// Records the outcome of one run of a live query and says what, if anything, its listener should get.
fn settle(
    live: &mut LiveQueries,
    key: slotmap::DefaultKey,
    result: Result<Vec<Document>, BackendError>,
) -> Option<Delivery> {
    // unsubscribed while the request was in flight
    let entry = live.get_mut(key)?;
    match result {
        Ok(documents) if entry.last.as_ref() == Some(&documents) => None,
        Ok(documents) => {
            entry.last = Some(documents.clone());
            Some(Delivery::Snapshot(entry.on_snapshot.clone(), documents))
        }
        Err(error) => {
            log::warn!("Live query on {} failed: {error}", entry.query.collection);
            let on_error = entry.on_error.clone();
            live.remove(key);
            Some(Delivery::Error(on_error, error))
        }
    }
}

/// Authorized JSON requests against Google's REST endpoints.
trait Transport {
    fn post<'a>(
        &'a self,
        url: &'a str,
        body: &'a Value,
    ) -> LocalBoxFuture<'a, Result<Value, BackendError>>;
}

impl Transport for AuthCore {
    /// Retries once with a fresh id token if the one we had was rejected.
    fn post<'a>(
        &'a self,
        url: &'a str,
        body: &'a Value,
    ) -> LocalBoxFuture<'a, Result<Value, BackendError>> {
        Box::pin(async move {
            let token = self.id_token().await?;
            let signed_in = token.is_some();

            match post_json(&self.client, url, token, body).await {
                Err(RequestError::Service(error))
                    if signed_in && error.status.as_deref() == Some("UNAUTHENTICATED") =>
                {
                    log::info!("Id token rejected, refreshing it");
                    let token = self.refresh_session().await?;
                    post_json(&self.client, url, token, body)
                        .await
                        .map_err(store_request_error)
                }
                result => result.map_err(store_request_error),
            }
        })
    }
}

#[derive(Clone)]
pub struct Firestore {
    config: FirebaseConfig,
    transport: Rc<dyn Transport>,
    live: Rc<RefCell<LiveQueries>>,
}

impl Firestore {
    /// Requests are made as whoever is signed in to `auth`.
    pub fn new(auth: &FirebaseAuth) -> Self {
        Self::with_transport(auth.core.config.clone(), auth.core.clone())
    }

    fn with_transport(config: FirebaseConfig, transport: Rc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            live: Rc::new(RefCell::new(slotmap::SlotMap::new())),
        }
    }

    async fn run_query(&self, query: &Query) -> Result<Vec<Document>, BackendError> {
        let body = json!({ "structuredQuery": structured_query(query) });
        let url = format!("{}:runQuery", self.config.documents_url());
        let response = self.transport.post(&url, &body).await?;
        decode_run_query(&response)
    }

    async fn run_live_query(&self, key: slotmap::DefaultKey) {
        let Some(query) = self.live.borrow().get(key).map(|live| live.query.clone()) else {
            return;
        };
        // never hold the borrow across the request
        let result = self.run_query(&query).await;

        let delivery = settle(&mut self.live.borrow_mut(), key, result);
        if let Some(delivery) = delivery {
            delivery.deliver();
        }
    }
}

impl DocumentStore for Firestore {
    fn add_document<'a>(
        &'a self,
        collection: &'a str,
        document: NewDocument,
    ) -> LocalBoxFuture<'a, Result<String, BackendError>> {
        Box::pin(async move {
            let id = eyedee::document_id();
            let name = format!("{}/{collection}/{id}", self.config.database_path());
            let url = format!("{}:commit", self.config.documents_url());
            self.transport
                .post(&url, &commit_body(&name, &document))
                .await?;

            // our own write is a change every live query on this store should see
            self.refresh().await;
            Ok(id)
        })
    }

    fn subscribe(
        &self,
        query: Query,
        on_snapshot: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> Subscription {
        let key = self.live.borrow_mut().insert(LiveQuery {
            query,
            on_snapshot: Rc::from(on_snapshot),
            on_error: Rc::from(on_error),
            last: None,
        });

        #[cfg(target_arch = "wasm32")]
        {
            let this = self.clone();
            wasm_bindgen_futures::spawn_local(async move { this.run_live_query(key).await });
        }

        let live = Rc::downgrade(&self.live);
        Subscription::new(move || {
            if let Some(live) = live.upgrade() {
                live.borrow_mut().remove(key);
            }
        })
    }

    fn refresh(&self) -> LocalBoxFuture<'_, ()> {
        Box::pin(async move {
            let keys: Vec<slotmap::DefaultKey> = self.live.borrow().keys().collect();
            for key in keys {
                self.run_live_query(key).await;
            }
        })
    }
}

fn commit_body(name: &str, document: &NewDocument) -> Value {
    let transforms: Vec<Value> = document
        .server_timestamps
        .iter()
        .map(|field| json!({ "fieldPath": field, "setToServerValue": "REQUEST_TIME" }))
        .collect();

    json!({
        "writes": [{
            "update": {
                "name": name,
                "fields": encode_fields(&document.fields),
            },
            "updateTransforms": transforms,
            "currentDocument": { "exists": false },
        }]
    })
}

fn structured_query(query: &Query) -> Value {
    let mut structured = json!({
        "from": [{ "collectionId": query.collection }],
    });

    let mut filters: Vec<Value> = query
        .filters
        .iter()
        .map(|filter| {
            json!({
                "fieldFilter": {
                    "field": { "fieldPath": filter.field },
                    "op": "EQUAL",
                    "value": encode_value(&filter.value),
                }
            })
        })
        .collect();
    let filter = match filters.len() {
        0 => None,
        1 => filters.pop(),
        _ => Some(json!({ "compositeFilter": { "op": "AND", "filters": filters } })),
    };
    if let Some(filter) = filter {
        structured["where"] = filter;
    }

    if let Some(order) = &query.order_by {
        let direction = match order.direction {
            Direction::Ascending => "ASCENDING",
            Direction::Descending => "DESCENDING",
        };
        structured["orderBy"] = json!([{
            "field": { "fieldPath": order.field },
            "direction": direction,
        }]);
    }

    structured
}

fn decode_run_query(response: &Value) -> Result<Vec<Document>, BackendError> {
    let Value::Array(items) = response else {
        return Err(BackendError::Protocol(format!(
            "expected an array from runQuery, got {response}"
        )));
    };

    let mut documents = Vec::new();
    for item in items {
        if item.get("error").is_some() {
            let body = error_body(item);
            return Err(store_error(body.status.as_deref(), body.message));
        }
        // results with no matches still return one element carrying only a readTime
        if let Some(document) = item.get("document") {
            documents.push(decode_document(document)?);
        }
    }
    Ok(documents)
}

fn decode_document(document: &Value) -> Result<Document, BackendError> {
    let name = document
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::Protocol("document without a name".to_string()))?;
    let id = name.rsplit('/').next().unwrap_or(name);
    let fields = match document.get("fields") {
        Some(Value::Object(fields)) => decode_fields(fields),
        _ => Fields::new(),
    };
    Ok(Document::new(id, fields))
}

fn encode_fields(fields: &Fields) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(k, v)| (k.clone(), encode_value(v)))
            .collect(),
    )
}

fn decode_fields(fields: &serde_json::Map<String, Value>) -> Fields {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), decode_value(v)))
        .collect()
}

fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(values) => {
            let values: Vec<Value> = values.iter().map(encode_value).collect();
            json!({ "arrayValue": { "values": values } })
        }
        Value::Object(fields) => json!({ "mapValue": { "fields": encode_fields(fields) } }),
    }
}

fn decode_value(value: &Value) -> Value {
    let Some((kind, inner)) = value.as_object().and_then(|o| o.iter().next()) else {
        return Value::Null;
    };
    match kind.as_str() {
        "booleanValue" => inner.as_bool().map(Value::Bool).unwrap_or(Value::Null),
        "integerValue" => inner
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .or_else(|| inner.as_i64())
            .map(Value::from)
            .unwrap_or(Value::Null),
        "doubleValue" => inner
            .as_f64()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        // timestamps are kept as RFC 3339 strings, like everywhere else in ember
        "timestampValue" | "stringValue" | "referenceValue" | "bytesValue" => inner.clone(),
        "geoPointValue" => inner.clone(),
        "arrayValue" => Value::Array(
            inner
                .get("values")
                .and_then(Value::as_array)
                .map(|values| values.iter().map(decode_value).collect())
                .unwrap_or_default(),
        ),
        "mapValue" => Value::Object(
            inner
                .get("fields")
                .and_then(Value::as_object)
                .map(decode_fields)
                .unwrap_or_default(),
        ),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use futures::executor::block_on;

    fn config() -> FirebaseConfig {
        FirebaseConfig {
            api_key: "key".to_string(),
            auth_domain: "example.firebaseapp.com".to_string(),
            project_id: "example".to_string(),
            storage_bucket: "example.appspot.com".to_string(),
            messaging_sender_id: "1".to_string(),
            app_id: "1:1:web:1".to_string(),
        }
    }

    fn session(uid: &str, expires_at: DateTime<Utc>) -> Session {
        Session {
            identity: Identity {
                uid: uid.to_string(),
                email: Some(format!("{uid}@example.com")),
            },
            id_token: format!("token-{uid}"),
            refresh_token: format!("refresh-{uid}"),
            expires_at,
        }
    }

    type Recorded<T> = Rc<RefCell<Vec<T>>>;

    fn add_live_query(
        live: &mut LiveQueries,
    ) -> (slotmap::DefaultKey, Recorded<Vec<Document>>, Recorded<BackendError>) {
        let snapshots: Recorded<Vec<Document>> = Rc::default();
        let errors: Recorded<BackendError> = Rc::default();
        let key = live.insert(LiveQuery {
            query: Query::collection("cigars"),
            on_snapshot: {
                let snapshots = snapshots.clone();
                Rc::new(move |documents: Vec<Document>| snapshots.borrow_mut().push(documents))
            },
            on_error: {
                let errors = errors.clone();
                Rc::new(move |error: BackendError| errors.borrow_mut().push(error))
            },
            last: None,
        });
        (key, snapshots, errors)
    }

    fn doc(id: &str) -> Document {
        Document::new(id, Fields::new())
    }

    #[test]
    fn test_settle_skips_unchanged_results() {
        let mut live = LiveQueries::default();
        let (key, snapshots, errors) = add_live_query(&mut live);

        settle(&mut live, key, Ok(vec![doc("a")])).unwrap().deliver();
        assert!(settle(&mut live, key, Ok(vec![doc("a")])).is_none());
        settle(&mut live, key, Ok(vec![doc("a"), doc("b")]))
            .unwrap()
            .deliver();

        assert_eq!(
            *snapshots.borrow(),
            vec![vec![doc("a")], vec![doc("a"), doc("b")]]
        );
        assert!(errors.borrow().is_empty());
    }

    #[test]
    fn test_settle_first_empty_result_is_delivered() {
        let mut live = LiveQueries::default();
        let (key, snapshots, _errors) = add_live_query(&mut live);

        settle(&mut live, key, Ok(vec![])).unwrap().deliver();
        assert!(settle(&mut live, key, Ok(vec![])).is_none());
        assert_eq!(*snapshots.borrow(), vec![Vec::<Document>::new()]);
    }

    #[test]
    fn test_settle_drops_query_after_error() {
        let mut live = LiveQueries::default();
        let (key, snapshots, errors) = add_live_query(&mut live);

        let error = BackendError::MissingIndex("cigars".to_string());
        settle(&mut live, key, Err(error.clone())).unwrap().deliver();
        assert!(!live.contains_key(key));

        // nothing is delivered after the error, success or failure
        assert!(settle(&mut live, key, Ok(vec![doc("a")])).is_none());
        assert!(settle(&mut live, key, Err(error.clone())).is_none());
        assert_eq!(*errors.borrow(), vec![error]);
        assert!(snapshots.borrow().is_empty());
    }

    #[test]
    fn test_settle_ignores_query_released_in_flight() {
        let mut live = LiveQueries::default();
        let (key, snapshots, errors) = add_live_query(&mut live);
        let (other, other_snapshots, _) = add_live_query(&mut live);
        live.remove(key);

        assert!(settle(&mut live, key, Ok(vec![doc("a")])).is_none());
        assert!(settle(&mut live, key, Err(BackendError::Network("down".to_string()))).is_none());
        assert!(snapshots.borrow().is_empty());
        assert!(errors.borrow().is_empty());

        settle(&mut live, other, Ok(vec![doc("b")])).unwrap().deliver();
        assert_eq!(other_snapshots.borrow().len(), 1);
    }

    /// Answers commits by storing the written document and queries with everything stored so far.
    #[derive(Default)]
    struct FakeRest {
        documents: RefCell<Vec<Value>>,
        query_error: RefCell<Option<BackendError>>,
        queries: std::cell::Cell<usize>,
    }

    impl Transport for FakeRest {
        fn post<'a>(
            &'a self,
            url: &'a str,
            body: &'a Value,
        ) -> LocalBoxFuture<'a, Result<Value, BackendError>> {
            Box::pin(async move {
                if url.ends_with(":commit") {
                    let write = &body["writes"][0];
                    let mut fields = write["update"]["fields"].clone();
                    for transform in write["updateTransforms"].as_array().into_iter().flatten() {
                        if let Some(path) = transform["fieldPath"].as_str() {
                            fields[path] = json!({ "timestampValue": "2024-06-15T09:00:00Z" });
                        }
                    }
                    self.documents.borrow_mut().push(json!({
                        "document": { "name": write["update"]["name"], "fields": fields }
                    }));
                    return Ok(json!({ "writeResults": [{}] }));
                }

                assert!(url.ends_with(":runQuery"), "unexpected request to {url}");
                self.queries.set(self.queries.get() + 1);
                if let Some(error) = self.query_error.borrow().clone() {
                    return Err(error);
                }
                let mut results = self.documents.borrow().clone();
                results.push(json!({ "readTime": "2024-06-15T10:00:00Z" }));
                Ok(Value::Array(results))
            })
        }
    }

    fn fake_firestore() -> (Firestore, Rc<FakeRest>) {
        let rest = Rc::new(FakeRest::default());
        (Firestore::with_transport(config(), rest.clone()), rest)
    }

    fn live_query(
        store: &Firestore,
    ) -> (Subscription, Recorded<Vec<Document>>, Recorded<BackendError>) {
        let snapshots: Recorded<Vec<Document>> = Rc::default();
        let errors: Recorded<BackendError> = Rc::default();
        let subscription = store.subscribe(
            Query::collection("cigars").where_eq("userId", "u1"),
            {
                let snapshots = snapshots.clone();
                Box::new(move |documents: Vec<Document>| snapshots.borrow_mut().push(documents))
            },
            {
                let errors = errors.clone();
                Box::new(move |error: BackendError| errors.borrow_mut().push(error))
            },
        );
        (subscription, snapshots, errors)
    }

    #[test]
    fn test_writes_refresh_live_queries() {
        let (store, _rest) = fake_firestore();
        let (_subscription, snapshots, errors) = live_query(&store);
        assert!(snapshots.borrow().is_empty());

        let document = NewDocument::default()
            .with_field("userId", "u1")
            .with_server_timestamp("smokedAt");
        let id = block_on(store.add_document("cigars", document)).unwrap();

        let snapshots = snapshots.borrow();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].len(), 1);
        assert_eq!(snapshots[0][0].id, id);
        assert_eq!(snapshots[0][0].string("userId"), Some("u1"));
        assert_eq!(
            snapshots[0][0].timestamp("smokedAt"),
            Some(Utc.with_ymd_and_hms(2024, 6, 15, 9, 0, 0).unwrap())
        );
        assert!(errors.borrow().is_empty());
    }

    #[test]
    fn test_refresh_delivers_only_changes() {
        let (store, rest) = fake_firestore();
        let (_subscription, snapshots, _errors) = live_query(&store);

        block_on(store.refresh());
        assert_eq!(*snapshots.borrow(), vec![Vec::<Document>::new()]);

        block_on(store.refresh());
        assert_eq!(snapshots.borrow().len(), 1);
        assert_eq!(rest.queries.get(), 2);

        block_on(store.add_document("cigars", NewDocument::default().with_field("userId", "u1")))
            .unwrap();
        block_on(store.refresh());
        assert_eq!(snapshots.borrow().len(), 2);
        assert_eq!(snapshots.borrow()[1].len(), 1);
    }

    #[test]
    fn test_failed_live_query_is_not_run_again() {
        let (store, rest) = fake_firestore();
        let (_subscription, snapshots, errors) = live_query(&store);
        *rest.query_error.borrow_mut() = Some(BackendError::MissingIndex("create it".to_string()));

        block_on(store.refresh());
        assert_eq!(
            *errors.borrow(),
            vec![BackendError::MissingIndex("create it".to_string())]
        );

        *rest.query_error.borrow_mut() = None;
        block_on(store.refresh());
        assert_eq!(rest.queries.get(), 1);
        assert_eq!(errors.borrow().len(), 1);
        assert!(snapshots.borrow().is_empty());
    }

    #[test]
    fn test_released_live_query_is_not_run() {
        let (store, rest) = fake_firestore();
        let (subscription, snapshots, _errors) = live_query(&store);
        subscription.unsubscribe();

        block_on(store.add_document("cigars", NewDocument::default().with_field("userId", "u1")))
            .unwrap();
        block_on(store.refresh());

        assert_eq!(rest.queries.get(), 0);
        assert!(snapshots.borrow().is_empty());
    }

    #[test]
    fn test_session_refresh_window() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 9, 0, 0).unwrap();
        let current = session("u1", now + Duration::minutes(30));

        assert!(!current.needs_refresh(now));
        assert!(!current.needs_refresh(now + Duration::minutes(28)));
        assert!(current.needs_refresh(now + Duration::minutes(29)));
        assert!(current.needs_refresh(now + Duration::hours(2)));
    }

    #[test]
    fn test_token_lifetimes() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 9, 0, 0).unwrap();
        assert_eq!(expires_at(Some("3600"), now), now + Duration::hours(1));
        assert_eq!(expires_at(Some("90"), now), now + Duration::seconds(90));
        assert_eq!(expires_at(Some("soon"), now), now + Duration::hours(1));
        assert_eq!(expires_at(None, now), now + Duration::hours(1));
    }

    #[test]
    fn test_account_and_token_responses() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 9, 0, 0).unwrap();
        let account: AccountResponse = serde_json::from_value(json!({
            "kind": "identitytoolkit#VerifyPasswordResponse",
            "localId": "u1",
            "email": "u1@example.com",
            "idToken": "token-u1",
            "refreshToken": "refresh-u1",
            "expiresIn": "3600",
        }))
        .unwrap();
        let signed_in = account.into_session(now);
        assert_eq!(signed_in, session("u1", now + Duration::hours(1)));

        let later = now + Duration::minutes(59);
        let token: TokenResponse = serde_json::from_value(json!({
            "id_token": "token-2",
            "refresh_token": "refresh-2",
            "expires_in": "3600",
            "token_type": "Bearer",
            "user_id": "u1",
        }))
        .unwrap();
        let refreshed = refreshed_session(&signed_in, token, later);
        assert_eq!(refreshed.identity, signed_in.identity);
        assert_eq!(refreshed.id_token, "token-2");
        assert_eq!(refreshed.refresh_token, "refresh-2");
        assert!(!refreshed.needs_refresh(later));
    }

    #[test]
    fn test_revoked_sessions() {
        assert!(is_session_revoked("TOKEN_EXPIRED"));
        assert!(is_session_revoked("INVALID_REFRESH_TOKEN : bad"));
        assert!(is_session_revoked("USER_NOT_FOUND"));
        assert!(!is_session_revoked("TOO_MANY_ATTEMPTS_TRY_LATER"));
        assert_eq!(
            auth_error("TOKEN_EXPIRED"),
            BackendError::Auth("auth/user-token-expired".to_string())
        );
    }

    #[test]
    fn test_session_survives_reload() {
        let far_future = Utc::now() + Duration::days(1);
        let stored = session("u1", far_future);
        let storage = MemorySessionStore::new();
        storage.save(&serde_json::to_string(&stored).unwrap());

        let auth = FirebaseAuth::with_session_store(config(), Rc::new(storage.clone()));
        let seen: Recorded<Option<Identity>> = Rc::default();
        let _watch = {
            let seen = seen.clone();
            auth.on_identity_changed(Box::new(move |identity: Option<Identity>| seen.borrow_mut().push(identity)))
        };
        assert_eq!(*seen.borrow(), vec![Some(stored.identity.clone())]);

        // still fresh, so no exchange is needed
        assert_eq!(
            block_on(auth.core.id_token()),
            Ok(Some("token-u1".to_string()))
        );

        block_on(auth.sign_out()).unwrap();
        assert_eq!(seen.borrow().last(), Some(&None));
        assert_eq!(storage.load(), None);
    }

    #[test]
    fn test_unreadable_stored_session_is_discarded() {
        let storage = MemorySessionStore::new();
        storage.save("{not json");

        let auth = FirebaseAuth::with_session_store(config(), Rc::new(storage.clone()));
        assert_eq!(auth.current_identity(), None);
        assert_eq!(storage.load(), None);
        assert_eq!(block_on(auth.core.id_token()), Ok(None));
    }

    #[test]
    fn test_new_tokens_are_saved_without_notifying() {
        let storage = MemorySessionStore::new();
        let auth = FirebaseAuth::with_session_store(config(), Rc::new(storage.clone()));
        let seen: Recorded<Option<Identity>> = Rc::default();
        let _watch = {
            let seen = seen.clone();
            auth.on_identity_changed(Box::new(move |identity: Option<Identity>| seen.borrow_mut().push(identity)))
        };

        let expires = Utc::now() + Duration::hours(1);
        auth.core.replace_session(Some(session("u1", expires)));
        let mut renewed = session("u1", expires + Duration::hours(1));
        renewed.id_token = "token-2".to_string();
        auth.core.replace_session(Some(renewed.clone()));

        assert_eq!(seen.borrow().len(), 2);
        let saved: Session = serde_json::from_str(&storage.load().unwrap()).unwrap();
        assert_eq!(saved, renewed);
    }

    #[test]
    fn test_structured_query_ordered() {
        let query = Query::collection("cigars")
            .where_eq("userId", "u1")
            .order_by("smokedAt", Direction::Descending);

        assert_eq!(
            structured_query(&query),
            json!({
                "from": [{ "collectionId": "cigars" }],
                "where": {
                    "fieldFilter": {
                        "field": { "fieldPath": "userId" },
                        "op": "EQUAL",
                        "value": { "stringValue": "u1" },
                    }
                },
                "orderBy": [{ "field": { "fieldPath": "smokedAt" }, "direction": "DESCENDING" }],
            })
        );

        let unordered = structured_query(&query.without_order());
        assert!(unordered.get("orderBy").is_none());
        assert_eq!(unordered["where"], structured_query(&query)["where"]);
    }

    #[test]
    fn test_structured_query_multiple_filters() {
        let query = Query::collection("cigars")
            .where_eq("userId", "u1")
            .where_eq("brand", "Cohiba");
        let structured = structured_query(&query);
        assert_eq!(structured["where"]["compositeFilter"]["op"], "AND");
        assert_eq!(
            structured["where"]["compositeFilter"]["filters"]
                .as_array()
                .map(Vec::len),
            Some(2)
        );
    }

    #[test]
    fn test_commit_body_requests_server_time() {
        let document = NewDocument::default()
            .with_field("userId", "u1")
            .with_field("cost", 12.5)
            .with_server_timestamp("smokedAt");
        let body = commit_body("projects/p/databases/(default)/documents/cigars/abc", &document);
        let write = &body["writes"][0];

        assert_eq!(
            write["update"]["fields"],
            json!({
                "userId": { "stringValue": "u1" },
                "cost": { "doubleValue": 12.5 },
            })
        );
        assert_eq!(
            write["updateTransforms"],
            json!([{ "fieldPath": "smokedAt", "setToServerValue": "REQUEST_TIME" }])
        );
        assert_eq!(write["currentDocument"]["exists"], false);
    }

    #[test]
    fn test_decode_run_query_documents() {
        let at = Utc.with_ymd_and_hms(2024, 6, 15, 9, 0, 0).unwrap();
        let response = json!([
            {
                "document": {
                    "name": "projects/p/databases/(default)/documents/cigars/abc",
                    "fields": {
                        "userId": { "stringValue": "u1" },
                        "cost": { "integerValue": "7" },
                        "smokedAt": { "timestampValue": "2024-06-15T09:00:00Z" },
                        "tags": { "arrayValue": { "values": [{ "stringValue": "maduro" }] } },
                        "notes": { "nullValue": null },
                    }
                },
                "readTime": "2024-06-15T10:00:00Z"
            }
        ]);

        let documents = decode_run_query(&response).unwrap();
        assert_eq!(documents.len(), 1);
        let document = &documents[0];
        assert_eq!(document.id, "abc");
        assert_eq!(document.string("userId"), Some("u1"));
        assert_eq!(document.number("cost"), Some(7.0));
        assert_eq!(document.timestamp("smokedAt"), Some(at));
        assert_eq!(document.get("tags"), Some(&json!(["maduro"])));
        assert_eq!(document.get("notes"), Some(&Value::Null));
    }

    #[test]
    fn test_decode_run_query_empty_and_errors() {
        let empty = json!([{ "readTime": "2024-06-15T10:00:00Z" }]);
        assert_eq!(decode_run_query(&empty), Ok(vec![]));

        let missing_index = json!([{
            "error": {
                "code": 400,
                "message": "The query requires an index.",
                "status": "FAILED_PRECONDITION"
            }
        }]);
        assert!(decode_run_query(&missing_index).unwrap_err().is_missing_index());
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            auth_error("INVALID_LOGIN_CREDENTIALS"),
            BackendError::Auth("auth/invalid-credential".to_string())
        );
        assert_eq!(
            auth_error("WEAK_PASSWORD : Password should be at least 6 characters"),
            BackendError::Auth("auth/weak-password".to_string())
        );
        assert_eq!(
            auth_error("SOMETHING_NEW"),
            BackendError::Auth("SOMETHING_NEW".to_string())
        );

        let body = error_body(&json!({
            "error": { "code": 403, "message": "denied", "status": "PERMISSION_DENIED" }
        }));
        assert_eq!(
            store_error(body.status.as_deref(), body.message),
            BackendError::PermissionDenied("denied".to_string())
        );
    }
}

//! The two managed services an application talks to: a document store with live queries, and an identity
//! provider. Neither is implemented here; [`crate::memory`] and [`crate::firebase`] provide backends.
//!
//! Everything runs on one event loop, so futures are `LocalBoxFuture` and callbacks need not be `Send`.

use futures::future::LocalBoxFuture;

use crate::data_model::{Document, NewDocument, Query, Subscription};

#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[cfg_attr(target_arch = "wasm32", derive(tsify::Tsify))]
#[cfg_attr(target_arch = "wasm32", tsify(into_wasm_abi, from_wasm_abi))]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub uid: String,
    pub email: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The store can't serve a filtered + ordered query until a composite index exists.
    #[error("The query requires an index: {0}")]
    MissingIndex(String),
    #[error("Missing or insufficient permissions: {0}")]
    PermissionDenied(String),
    #[error("{0}")]
    Auth(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Unexpected response from backend: {0}")]
    Protocol(String),
}

impl BackendError {
    pub fn is_missing_index(&self) -> bool {
        matches!(self, BackendError::MissingIndex(_))
    }
}

pub type SnapshotCallback = Box<dyn Fn(Vec<Document>)>;
pub type ErrorCallback = Box<dyn Fn(BackendError)>;
pub type IdentityCallback = Box<dyn Fn(Option<Identity>)>;

pub trait DocumentStore {
    /// Resolves to the id the new document was stored under.
    fn add_document<'a>(
        &'a self,
        collection: &'a str,
        document: NewDocument,
    ) -> LocalBoxFuture<'a, Result<String, BackendError>>;

    /// `on_snapshot` receives the full matching result set every time it changes.
    /// `on_error` is called if the query can't be served; nothing is delivered after that.
    fn subscribe(
        &self,
        query: Query,
        on_snapshot: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> Subscription;

    /// Backends that pull rather than receive pushes re-run their live queries here.
    fn refresh(&self) -> LocalBoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

pub trait IdentityProvider {
    fn sign_in<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> LocalBoxFuture<'a, Result<Identity, BackendError>>;

    fn sign_up<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> LocalBoxFuture<'a, Result<Identity, BackendError>>;

    fn sign_out(&self) -> LocalBoxFuture<'_, Result<(), BackendError>>;

    /// The callback gets the current identity once registration completes, then every change after that.
    fn on_identity_changed(&self, callback: IdentityCallback) -> Subscription;
}

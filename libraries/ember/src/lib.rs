//! This is a library for keeping a local, reactive copy of a live query against a managed document store.
//! It was created for Cigar Counter, so it doesn't include much that was not needed for that project.
//!
//! Model:
//! 1. The backend is two opaque services: a document store that can run live queries, and an identity provider.
//!    Both are traits ([`backend::DocumentStore`], [`backend::IdentityProvider`]), so the app never names a vendor.
//! 2. A live query hands back a full snapshot of the matching documents on every change. The app keeps the latest
//!    snapshot in a [`data_model::Signal`], and anything that cares subscribes to the signal.
//! 3. Live queries are released explicitly through a [`data_model::Subscription`]. Nothing is cleaned up implicitly.
//!
//! Sounds simple, but there are a few tricky parts that this library handles: callbacks that arrive while state is
//! being updated, and live queries whose backing subscription gets swapped out from under the caller.

pub mod backend;
pub mod data_model;
pub mod memory;

#[cfg(feature = "firebase")]
pub mod firebase;

pub use backend::{BackendError, DocumentStore, Identity, IdentityProvider};

#[path = "1-document.rs"]
mod document;

#[path = "2-query.rs"]
mod query;

#[path = "3-signal.rs"]
mod signal;

#[path = "4-subscription.rs"]
mod subscription;

pub use document::*;
pub use query::*;
pub use signal::*;
pub use subscription::*;

#[cfg_attr(target_arch = "wasm32", wasm_bindgen::prelude::wasm_bindgen)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ListenerKey(pub(crate) slotmap::DefaultKey);

use ember::firebase::FirebaseConfig;

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

#[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
pub fn firebase_config() -> FirebaseConfig {
    FirebaseConfig {
        // baked in at build time so the key stays out of the repository
        api_key: option_env!("CIGAR_COUNTER_API_KEY")
            .unwrap_or_default()
            .to_string(),
        auth_domain: "cigarcounter-f927f.firebaseapp.com".to_string(),
        project_id: "cigarcounter-f927f".to_string(),
        storage_bucket: "cigarcounter-f927f.firebasestorage.app".to_string(),
        messaging_sender_id: "887400669927".to_string(),
        app_id: "1:887400669927:web:dfb9d3a7fc80ccb05e3842".to_string(),
    }
}

/// Where smoking events live in the document store, and what their fields are called on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionSchema {
    pub collection: String,
    pub owner_field: String,
    pub timestamp_field: String,
    pub cost_field: String,
}

impl Default for CollectionSchema {
    fn default() -> Self {
        Self {
            collection: "cigars".to_string(),
            owner_field: "userId".to_string(),
            timestamp_field: "smokedAt".to_string(),
            cost_field: "cost".to_string(),
        }
    }
}

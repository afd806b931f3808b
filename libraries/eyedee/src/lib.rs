//! Client-side document ids.
//!
//! Ids are 20 characters drawn from `[A-Za-z0-9]`, the same shape the managed
//! document store uses for ids it assigns itself, so documents created by the
//! client and by the server are indistinguishable.

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

#[cfg(not(target_arch = "wasm32"))]
use uuid::Uuid;

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = ["self", "crypto"])]
    fn randomUUID() -> String;
}

pub const DOCUMENT_ID_LEN: usize = 20;

const ALPHABET: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn random_bits() -> u128 {
    #[cfg(target_arch = "wasm32")]
    {
        u128::from_str_radix(&randomUUID().replace('-', ""), 16).unwrap_or_default()
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        Uuid::new_v4().as_u128()
    }
}

pub fn document_id() -> String {
    let mut bits = random_bits();
    let mut id = String::with_capacity(DOCUMENT_ID_LEN);
    for _ in 0..DOCUMENT_ID_LEN {
        id.push(ALPHABET[(bits % 62) as usize] as char);
        bits /= 62;
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id() {
        let id1 = document_id();
        let id2 = document_id();

        assert_ne!(id1, id2);
        assert_eq!(id1.len(), DOCUMENT_ID_LEN);
        assert!(id1.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}

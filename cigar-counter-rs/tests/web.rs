//! Browser-side checks. Run with `wasm-pack test --headless --firefox`.

#![cfg(target_arch = "wasm32")]

use std::rc::Rc;

use cigar_counter_rs::{CigarCounter, CollectionSchema, StateStream, get_app_version};
use ember::data_model::Fields;
use ember::memory::MemoryBackend;
use wasm_bindgen::prelude::*;
use wasm_bindgen_test::*;

wasm_bindgen_test_configure!(run_in_browser);

fn counter() -> CigarCounter {
    let backend = Rc::new(MemoryBackend::new());
    CigarCounter::with_backend(backend.clone(), backend, CollectionSchema::default())
}

#[wasm_bindgen_test]
fn app_version_is_set() {
    assert!(!get_app_version().is_empty());
}

#[wasm_bindgen_test]
async fn add_cigar_from_js_object() {
    let counter = counter();
    assert!(
        counter
            .register("a@example.com".into(), "hunter22".into())
            .await
            .success
    );
    counter.start_live_sync().unwrap();

    let details = js_sys::Object::new();
    js_sys::Reflect::set(&details, &"brand".into(), &"Cohiba".into()).unwrap();
    js_sys::Reflect::set(&details, &"cost".into(), &JsValue::from_f64(9.5)).unwrap();

    let result = counter.add_cigar(details.into()).await;
    assert!(result.success);

    let cigars = counter.cigars();
    assert_eq!(cigars.len(), 1);
    assert_eq!(cigars[0].cost, Some(9.5));
    assert_eq!(
        cigars[0].details.get("brand").and_then(|v| v.as_str()),
        Some("Cohiba")
    );
    assert_eq!(counter.stats().total_cost, 9.5);
}

#[wasm_bindgen_test]
async fn js_callbacks_fire_on_change() {
    let counter = counter();
    let calls = Rc::new(std::cell::Cell::new(0));
    let callback = {
        let calls = calls.clone();
        Closure::<dyn Fn()>::new(move || calls.set(calls.get() + 1))
    };
    let key = counter.subscribe(
        StateStream::Auth,
        callback.as_ref().unchecked_ref::<js_sys::Function>().clone(),
    );

    counter
        .register("a@example.com".into(), "hunter22".into())
        .await;
    assert_eq!(calls.get(), 1);

    assert!(counter.unsubscribe(StateStream::Auth, key));
    counter.logout().await;
    assert_eq!(calls.get(), 1);

    let unauthenticated = counter.add_cigar_fields(Fields::new()).await;
    assert_eq!(
        unauthenticated.error.as_deref(),
        Some("User not authenticated")
    );
}

#![allow(dead_code)]

pub mod api_app;

use shared::repos::Store;

pub async fn test_store() -> Store {
    let store = Store::connect_in_memory()
        .await
        .expect("in-memory store should open");
    store
        .ensure_schema()
        .await
        .expect("schema should apply successfully");
    store
}

//! Compile-time Send/Sync checks for the types shared across worker tasks.
//!
//! `worker::run_pool` spawns one task per worker and holds a single
//! `Arc<WorkerContext>` across them; every trait object reachable from it
//! must be `Send + Sync` or the `tokio::spawn` call in `worker.rs` would
//! not compile.

use ingest_engine::adapters::Adapter;
use ingest_engine::checkpoint_store::CheckpointStore;
use ingest_engine::ingest_run_store::IngestRunStore;
use ingest_engine::persistence::MediaPersistence;
use ingest_engine::repository::{SourceRepository, ThreadRepository};
use std::sync::Arc;

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn adapter_trait_object_is_send_sync() {
    assert_send_sync::<Arc<dyn Adapter>>();
}

#[test]
fn checkpoint_store_trait_object_is_send_sync() {
    assert_send_sync::<Arc<dyn CheckpointStore>>();
}

#[test]
fn ingest_run_store_trait_object_is_send_sync() {
    assert_send_sync::<Arc<dyn IngestRunStore>>();
}

#[test]
fn persistence_trait_object_is_send_sync() {
    assert_send_sync::<Arc<dyn MediaPersistence>>();
}

#[test]
fn repository_trait_objects_are_send_sync() {
    assert_send_sync::<Arc<dyn SourceRepository>>();
    assert_send_sync::<Arc<dyn ThreadRepository>>();
}

//! Materialization integration tests.
//!
//! Verifies:
//! - End-to-end fold of projections into a collection and its snapshot
//! - Mutation and watermark survive drop + reopen together
//! - Snapshot isolation while ingestion keeps writing
//! - Chunk boundaries for large collections
//! - Unknown collections and malformed payloads

use snapview_store::{
    CollectionRegistry, Delivery, Disposition, IngestPipeline, Outcome, Projection,
    ProjectionApplier, RegistryConfig, SnapshotChunk, SnapshotStreamer,
};

use serde_json::{json, Value};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Engine {
    registry: Arc<CollectionRegistry>,
    pipeline: IngestPipeline,
    streamer: SnapshotStreamer,
}

fn engine(dir: &std::path::Path) -> Engine {
    let registry = Arc::new(CollectionRegistry::new(RegistryConfig::for_testing(dir)));
    Engine {
        pipeline: IngestPipeline::new(ProjectionApplier::new(registry.clone())),
        streamer: SnapshotStreamer::new(registry.clone()),
        registry,
    }
}

fn publish(engine: &Engine, sequence: u64, projection: &Projection) -> Outcome {
    engine
        .pipeline
        .process(sequence, &projection.encode().unwrap())
        .unwrap()
}

fn snapshot(engine: &Engine, collection: &str) -> Vec<SnapshotChunk> {
    let mut chunks: Vec<SnapshotChunk> = Vec::new();
    engine.streamer.stream(collection, &mut chunks).unwrap();
    chunks
}

fn records(chunks: &[SnapshotChunk]) -> Vec<Value> {
    chunks
        .iter()
        .flat_map(|c| c.entries.iter())
        .map(|bytes| serde_json::from_slice(bytes).unwrap())
        .collect()
}

// ─── End-to-end ──────────────────────────────────────────────────────────────

#[test]
fn test_users_upsert_then_merge() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());

    let created = Projection::upsert("users")
        .with_event("UserCreated")
        .with_primary("id", 42)
        .with_field("name", "Ann");
    assert_eq!(publish(&engine, 5, &created), Outcome::Applied);

    let chunks = snapshot(&engine, "users");
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].sequence, 5);
    assert_eq!(records(&chunks), vec![json!({"id": 42, "name": "Ann"})]);

    let updated = Projection::upsert("users")
        .with_event("UserUpdated")
        .with_primary("id", 42)
        .with_field("email", "a@x");
    publish(&engine, 6, &updated);

    let chunks = snapshot(&engine, "users");
    assert_eq!(chunks[0].sequence, 6);
    assert_eq!(
        records(&chunks),
        vec![json!({"id": 42, "name": "Ann", "email": "a@x"})]
    );
    assert_eq!(engine.streamer.state("users").unwrap(), Some(6));
}

#[test]
fn test_delete_then_recreate_starts_fresh() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());

    publish(
        &engine,
        1,
        &Projection::upsert("users").with_primary("id", 7).with_field("old", true),
    );
    publish(&engine, 2, &Projection::delete("users").with_primary("id", 7));
    assert!(snapshot(&engine, "users").is_empty());
    assert_eq!(engine.streamer.state("users").unwrap(), Some(2));

    publish(
        &engine,
        3,
        &Projection::upsert("users").with_primary("id", 7).with_field("new", true),
    );
    assert_eq!(
        records(&snapshot(&engine, "users")),
        vec![json!({"id": 7, "new": true})]
    );
}

#[test]
fn test_collections_are_independent() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());

    publish(&engine, 1, &Projection::upsert("users").with_primary("id", 1));
    publish(&engine, 2, &Projection::upsert("orders").with_primary("id", 1));
    publish(&engine, 3, &Projection::upsert("orders").with_primary("id", 2));

    assert_eq!(engine.streamer.state("users").unwrap(), Some(1));
    assert_eq!(engine.streamer.state("orders").unwrap(), Some(3));
    assert_eq!(records(&snapshot(&engine, "users")).len(), 1);
    assert_eq!(records(&snapshot(&engine, "orders")).len(), 2);
    assert_eq!(
        engine.registry.collection_names().unwrap(),
        vec!["orders".to_string(), "users".to_string()]
    );
}

// ─── Durability ──────────────────────────────────────────────────────────────

#[test]
fn test_mutation_and_watermark_survive_reopen() {
    let dir = tempdir().unwrap();
    {
        let engine = engine(dir.path());
        for seq in 1..=20u64 {
            publish(
                &engine,
                seq,
                &Projection::upsert("events").with_primary("id", seq).with_field("n", seq),
            );
        }
        engine.registry.flush_all().unwrap();
        // Engine dropped here: every store closes.
    }

    let engine = engine(dir.path());
    assert_eq!(engine.registry.open_all().unwrap(), 1);
    assert_eq!(engine.streamer.state("events").unwrap(), Some(20));

    let store = engine.registry.lookup("events").unwrap().unwrap();
    assert_eq!(store.record_count().unwrap(), 20);
    // Watermark and records agree: the record at the watermark is present.
    assert_eq!(store.get(b"key-20").unwrap().unwrap()["n"], 20);
}

#[test]
fn test_replayed_delivery_is_idempotent() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());
    let projection = Projection::upsert("users")
        .with_primary("id", 1)
        .with_field("name", "Bo");

    publish(&engine, 4, &projection);
    let first = records(&snapshot(&engine, "users"));
    publish(&engine, 4, &projection);

    assert_eq!(records(&snapshot(&engine, "users")), first);
    assert_eq!(engine.streamer.state("users").unwrap(), Some(4));
}

// ─── Snapshots ───────────────────────────────────────────────────────────────

#[test]
fn test_250_records_stream_in_three_chunks() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());

    for seq in 1..=250u64 {
        publish(&engine, seq, &Projection::upsert("big").with_primary("id", seq));
    }

    let chunks = snapshot(&engine, "big");
    let sizes: Vec<usize> = chunks.iter().map(|c| c.entries.len()).collect();
    assert_eq!(sizes, vec![100, 100, 50]);
    assert!(chunks.iter().all(|c| c.sequence == 250));
    assert!(chunks.iter().all(|c| c.collection == "big"));
}

#[test]
fn test_snapshot_is_isolated_from_concurrent_writes() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(engine(dir.path()));

    for seq in 1..=300u64 {
        publish(&engine, seq, &Projection::upsert("live").with_primary("id", seq));
    }

    let barrier = Arc::new(Barrier::new(2));
    let writer = {
        let engine = engine.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            for seq in 301..=600u64 {
                publish(&engine, seq, &Projection::upsert("live").with_primary("id", seq));
            }
        })
    };

    let store = engine.registry.lookup("live").unwrap().unwrap();
    let view = store.open_view();
    barrier.wait();
    writer.join().unwrap();

    // Writes landed after the view was opened; none of them is visible.
    let seen = view.records().count();
    assert_eq!(view.sequence().unwrap(), 300);
    assert_eq!(seen, 300);
    view.release();

    assert_eq!(store.record_count().unwrap(), 600);
    assert_eq!(engine.streamer.state("live").unwrap(), Some(600));
}

#[test]
fn test_every_chunk_matches_final_summary() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());
    for seq in 1..=130u64 {
        publish(&engine, seq, &Projection::upsert("c").with_primary("id", seq));
    }

    let mut chunks: Vec<SnapshotChunk> = Vec::new();
    let summary = engine.streamer.stream("c", &mut chunks).unwrap();
    assert_eq!(summary.records, 130);
    assert_eq!(summary.chunks, 2);
    assert_eq!(summary.sequence, 130);
}

// ─── Edge cases ──────────────────────────────────────────────────────────────

#[test]
fn test_unknown_collection() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());

    assert!(snapshot(&engine, "ghost").is_empty());
    assert_eq!(engine.streamer.state("ghost").unwrap(), None);
    // Queries never create collections.
    assert!(engine.registry.collection_names().unwrap().is_empty());
}

#[test]
fn test_malformed_delivery_acked_without_side_effects() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());

    let (delivery, mut reply) = Delivery::new(9, b"not json".to_vec());
    assert_eq!(engine.pipeline.handle(delivery), Disposition::Ack);
    assert_eq!(reply.try_recv().unwrap(), Disposition::Ack);

    let (delivery, _reply) = Delivery::new(10, br#"{"fields": []}"#.to_vec());
    assert_eq!(engine.pipeline.handle(delivery), Disposition::Ack);

    assert_eq!(engine.pipeline.stats().discarded, 2);
    assert!(engine.registry.collection_names().unwrap().is_empty());
}

#[test]
fn test_projection_without_primary_updates_singleton() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());

    publish(&engine, 1, &Projection::upsert("settings").with_field("theme", "dark"));
    publish(&engine, 2, &Projection::upsert("settings").with_field("lang", "en"));

    assert_eq!(
        records(&snapshot(&engine, "settings")),
        vec![json!({"theme": "dark", "lang": "en"})]
    );
}

#[test]
fn test_wire_format_projection() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());

    let payload = br#"{
        "event": "OrderPlaced",
        "collection": "orders",
        "method": "create",
        "fields": [
            {"name": "order_id", "value": "o-1", "primary": true},
            {"name": "total", "value": 12.5}
        ]
    }"#;
    assert_eq!(engine.pipeline.process(1, payload).unwrap(), Outcome::Applied);
    assert_eq!(
        records(&snapshot(&engine, "orders")),
        vec![json!({"order_id": "o-1", "total": 12.5})]
    );
}

#[test]
fn test_null_fields_still_advance_watermark() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());

    publish(
        &engine,
        1,
        &Projection::upsert("profiles").with_primary("id", 7).with_field("bio", "hi"),
    );

    let (delivery, mut reply) = Delivery::new(
        2,
        br#"{"event": null, "collection": "profiles", "fields": null}"#.to_vec(),
    );
    assert_eq!(engine.pipeline.handle(delivery), Disposition::Ack);
    assert_eq!(reply.try_recv().unwrap(), Disposition::Ack);
    assert_eq!(engine.pipeline.stats().discarded, 0);

    assert_eq!(engine.streamer.state("profiles").unwrap(), Some(2));
    // No primary: the empty upsert lands on the singleton key.
    assert_eq!(
        records(&snapshot(&engine, "profiles")),
        vec![json!({}), json!({"bio": "hi", "id": 7})]
    );
}

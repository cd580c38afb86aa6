//! End-to-end runs through the engine: ordering, determinism, replay, caching.

mod common;

use std::sync::Arc;

use common::{config, engine, Delayed, TOY};
use mrp::core::canonical::canonical_bytes;
use mrp::core::record::ShardState;
use mrp::{Engine, OperatorRegistry};
use serde_json::json;
use tempfile::TempDir;

fn engine_with_delays(dir: &TempDir, delays_ms: Vec<u64>) -> Engine {
    let mut cfg = config(dir);
    cfg.shard_cache = false;
    Engine::builder(cfg, Arc::new(OperatorRegistry::with_builtins().unwrap()))
        .executor(Arc::new(Delayed { delays_ms }))
        .build()
        .unwrap()
}

#[tokio::test]
async fn arrival_order_does_not_change_the_result() {
    let dir = TempDir::new().unwrap();

    // shard 0 finishes first, then shard 1 first
    let in_order = engine_with_delays(&dir, vec![0, 150]).run_str(TOY).await.unwrap();
    let reversed = engine_with_delays(&dir, vec![150, 0]).run_str(TOY).await.unwrap();

    for outcome in [&in_order, &reversed] {
        assert!(outcome.succeeded(), "{:?}", outcome.record.failure);
        assert_eq!(outcome.record.reduce_result, Some(json!({"joined": "FOO-BAR"})));
    }
    let finished = |o: &mrp::RunOutcome, i: usize| o.record.maps[i].end_ts.unwrap();
    assert!(finished(&in_order, 0) <= finished(&in_order, 1));
    assert!(finished(&reversed, 1) <= finished(&reversed, 0));

    let a = &in_order.record;
    let b = &reversed.record;
    assert_eq!(a.reduce_result_digest, b.reduce_result_digest);
    assert_eq!(a.produce_result_digest, b.produce_result_digest);
    assert_eq!(a.reduce_input_order_digest, b.reduce_input_order_digest);
}

#[tokio::test]
async fn repeated_compile_and_run_are_deterministic() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir);
    cfg.shard_cache = false;
    let engine = engine(cfg);

    let first = engine.compiler().compile_str(TOY).unwrap();
    let second = engine.compiler().compile_str(TOY).unwrap();
    assert_eq!(canonical_bytes(&first).unwrap(), canonical_bytes(&second).unwrap());

    let a = engine.run(&first).await.unwrap().record;
    let b = engine.run(&second).await.unwrap().record;
    assert_ne!(a.run_id, b.run_id);
    assert_eq!(a.seed, b.seed);
    assert_eq!(a.ir_digest, b.ir_digest);
    assert_eq!(a.reduce_result_digest, b.reduce_result_digest);
    assert_eq!(a.produce_result_digest, b.produce_result_digest);
    assert_ne!(a.output_dir, b.output_dir);
}

#[tokio::test]
async fn produce_runs_once_per_successful_run() {
    let dir = TempDir::new().unwrap();
    let outcome = engine(config(&dir)).run_str(TOY).await.unwrap();
    let out = std::path::PathBuf::from(outcome.record.output_dir.clone().unwrap());

    let entries: Vec<_> = std::fs::read_dir(&out).unwrap().collect();
    assert_eq!(entries.len(), 1);
    let produced = outcome.record.produce_result.unwrap();
    assert_eq!(produced["path"], "result.json");
    assert_eq!(produced["result"], json!({"joined": "FOO-BAR"}));
}

#[tokio::test]
async fn replay_from_a_reopened_store_matches() {
    let dir = TempDir::new().unwrap();
    let original = engine(config(&dir)).run_str(TOY).await.unwrap();

    // a fresh engine over the same on-disk store
    let report = engine(config(&dir)).replay(&original.digest).await.unwrap();
    assert!(report.matched, "{:?}", report.diffs);
    assert!(report.diffs.is_empty());
    assert!(report.record.maps.iter().all(|m| !m.cached));
}

#[tokio::test]
async fn second_run_is_served_from_the_shard_cache() {
    let dir = TempDir::new().unwrap();
    let engine = engine(config(&dir));

    let cold = engine.run_str(TOY).await.unwrap().record;
    let warm = engine.run_str(TOY).await.unwrap().record;

    assert!(cold.maps.iter().all(|m| !m.cached && m.attempt_count == 1));
    assert!(warm.maps.iter().all(|m| m.cached && m.attempt_count == 0));
    assert!(warm.maps.iter().all(|m| m.state == ShardState::Succeeded));
    assert_eq!(cold.reduce_result_digest, warm.reduce_result_digest);
    assert_eq!(cold.reduce_input_order_digest, warm.reduce_input_order_digest);

    // identical content lands on the identical digest
    let value = json!({"joined": "FOO-BAR"});
    let d1 = engine.store().put_json(&value).unwrap();
    let d2 = engine.store().put_json(&value).unwrap();
    assert_eq!(d1, d2);
    assert_eq!(Some(d1), cold.reduce_result_digest);
}

#[tokio::test]
async fn generated_map_without_runner_fails_permanently() {
    let dir = TempDir::new().unwrap();
    let src = TOY.replace(
        "  operator: uppercase\n",
        "  generated: { entrypoint: Shout, kind: map, source: \"def run(params, seed): ...\" }\n",
    );
    let mut cfg = config(&dir);
    cfg.retry_max_retries = 0;
    let record = engine(cfg).run_str(&src).await.unwrap().record;
    assert!(!record.succeeded());
    assert!(record.reduce_result.is_none());
    assert!(record.produce_result.is_none());
}

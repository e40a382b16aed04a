//! End-to-end tests against the `demo-worker` binary.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::timeout;

use farmhand::{Farm, FarmEvent, FarmOptions, ModuleRegistry, WireValue, WorkerModule};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn worker_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_demo-worker"))
}

fn remote_options(workers: usize, calls_per_worker: usize) -> FarmOptions {
    let mut options = FarmOptions::with_worker_path(worker_bin());
    options.max_concurrent_workers = workers;
    options.max_concurrent_calls_per_worker = calls_per_worker;
    options.use_local_worker = false;
    options.warm_workers = false;
    options.forced_kill_time = Duration::from_millis(500);
    options
}

/// In-process mirror of the demo worker's `run`, for the local path.
fn local_module() -> WorkerModule {
    WorkerModule::new().method("run", |_ctx, args| async move {
        let total: i64 = args
            .iter()
            .filter_map(|arg| arg.as_data().and_then(Value::as_i64))
            .sum();
        Ok(json!(total))
    })
}

fn registry() -> ModuleRegistry {
    ModuleRegistry::new(local_module()).register(
        "util",
        WorkerModule::new().method("ping", |_ctx, _args| async { Ok(json!("pong")) }),
    )
}

fn ints(values: &[i64]) -> Vec<WireValue> {
    values.iter().map(|n| WireValue::Data(json!(n))).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn calls_fan_out_across_the_pool() {
    let farm = Farm::new(remote_options(2, 1), registry()).expect("farm");

    let (a, b, c) = timeout(
        TEST_TIMEOUT,
        async {
            tokio::join!(
                farm.run(ints(&[1, 2])),
                farm.run(ints(&[3, 4])),
                farm.run(ints(&[5, 6])),
            )
        },
    )
    .await
    .expect("calls must not hang");

    assert_eq!(a.expect("first call"), json!(3));
    assert_eq!(b.expect("second call"), json!(7));
    assert_eq!(c.expect("third call"), json!(11));

    farm.end().await.expect("end");
}

#[tokio::test(flavor = "multi_thread")]
async fn local_path_answers_while_the_pool_warms() {
    let mut options = FarmOptions::with_worker_path(worker_bin());
    options.max_concurrent_workers = 2;
    options.use_local_worker = true;
    options.warm_workers = true;
    let farm = Farm::new(options, registry()).expect("farm");
    let mut events = farm.subscribe_events();

    // Cold start: both calls resolve in-process, each shadow-dispatching a
    // warmup call to the pool.
    let first = farm.run(ints(&[1, 2])).await.expect("first local call");
    assert_eq!(first, json!(3));
    let second = farm.run(ints(&[3, 4])).await.expect("second local call");
    assert_eq!(second, json!(7));

    let event = timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("warmup must complete")
        .expect("event stream open");
    assert_eq!(event, FarmEvent::WarmedUp);

    // Warmed: the same handle now routes to the remote pool.
    let third = farm.run(ints(&[5, 6])).await.expect("remote call");
    assert_eq!(third, json!(11));

    farm.end().await.expect("end");
}

#[tokio::test(flavor = "multi_thread")]
async fn crashed_worker_call_is_requeued_and_resolves() {
    let farm = Farm::new(remote_options(1, 1), registry()).expect("farm");
    let dir = tempfile::tempdir().expect("tempdir");
    let marker = dir.path().join("crash-once");

    // First attempt kills the worker; the retry lands on the replacement.
    let flaky = farm.create_handle("flaky");
    let out = timeout(
        TEST_TIMEOUT,
        flaky.call(vec![WireValue::Data(json!(marker.to_str().unwrap()))]),
    )
    .await
    .expect("retry must not hang")
    .expect("retried call must resolve");
    assert_eq!(out, json!("recovered"));

    farm.end().await.expect("end");
}

#[tokio::test(flavor = "multi_thread")]
async fn reverse_handles_round_trip_through_a_worker() {
    let farm = Farm::new(remote_options(1, 1), registry()).expect("farm");

    let double = farm.create_reverse_handle(|args| async move {
        let n = args[0]
            .as_data()
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow::anyhow!("expected an integer"))?;
        Ok(json!(n * 2))
    });

    let call_handle = farm.create_handle("call_handle");
    let out = timeout(
        TEST_TIMEOUT,
        call_handle.call(vec![WireValue::Handle(double), WireValue::Data(json!(21))]),
    )
    .await
    .expect("must not hang")
    .expect("handle round trip");
    assert_eq!(out, json!(42));

    farm.end().await.expect("end");
}

#[tokio::test(flavor = "multi_thread")]
async fn workers_can_master_call_registered_modules() {
    let farm = Farm::new(remote_options(1, 1), registry()).expect("farm");

    let ping_master = farm.create_handle("ping_master");
    let out = timeout(TEST_TIMEOUT, ping_master.call(Vec::new()))
        .await
        .expect("must not hang")
        .expect("master call");
    assert_eq!(out, json!("pong"));

    farm.end().await.expect("end");
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_log_events_replay_on_the_parent() {
    let farm = Farm::new(remote_options(1, 1), registry()).expect("farm");

    let shout = farm.create_handle("shout");
    let out = timeout(
        TEST_TIMEOUT,
        shout.call(vec![WireValue::Data(json!("hello from the worker"))]),
    )
    .await
    .expect("must not hang")
    .expect("log-emitting call");
    assert_eq!(out, json!("logged"));

    farm.end().await.expect("end");
}

#[tokio::test(flavor = "multi_thread")]
async fn end_settles_in_flight_calls() {
    let farm = Farm::new(remote_options(1, 2), registry()).expect("farm");

    let slow = farm.create_handle("slow");
    let first = {
        let slow = slow.clone();
        tokio::spawn(async move { slow.call(vec![WireValue::Data(json!(5_000))]).await })
    };
    let second = {
        let slow = slow.clone();
        tokio::spawn(async move { slow.call(vec![WireValue::Data(json!(5_000))]).await })
    };

    // Let both calls reach the worker before tearing the farm down.
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    timeout(TEST_TIMEOUT, farm.end())
        .await
        .expect("end must not hang")
        .expect("end");

    let err = farm.run(ints(&[1])).await.expect_err("farm has ended");
    assert_eq!(
        err.to_string(),
        "Cannot add a worker call if worker farm is ending"
    );

    // The orphaned futures settle instead of hanging.
    let first = timeout(TEST_TIMEOUT, first)
        .await
        .expect("first in-flight call must settle")
        .expect("join");
    let second = timeout(TEST_TIMEOUT, second)
        .await
        .expect("second in-flight call must settle")
        .expect("join");
    assert!(first.is_err());
    assert!(second.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn shared_farm_is_reused_until_the_worker_path_changes() {
    // All shared-slot assertions live in one test; the slot is process-wide.
    let first = Farm::shared(remote_options(1, 1), registry())
        .await
        .expect("first shared farm");
    let again = Farm::shared(remote_options(1, 1), registry())
        .await
        .expect("same options");
    assert!(first.ptr_eq(&again));

    // A different worker path replaces (and ends) the previous instance.
    let dir = tempfile::tempdir().expect("tempdir");
    let other_bin = dir.path().join("demo-worker-copy");
    std::fs::copy(worker_bin(), &other_bin).expect("copy worker binary");
    let mut other_options = remote_options(1, 1);
    other_options.worker_path = other_bin;

    let replaced = Farm::shared(other_options, registry())
        .await
        .expect("replacement shared farm");
    assert!(!replaced.ptr_eq(&first));

    let err = first.run(ints(&[1])).await.expect_err("old farm has ended");
    assert_eq!(
        err.to_string(),
        "Cannot add a worker call if worker farm is ending"
    );

    replaced.end().await.expect("end replacement");
}

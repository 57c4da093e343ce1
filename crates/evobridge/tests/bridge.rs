//! End-to-end tests driving a real spawned worker (the `stub-worker`
//! binary) through the full client stack.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use evobridge::{
    BridgeClient, BridgeConfig, BridgeError, BridgeState, EventName, RequestId, StartError,
};

fn config() -> BridgeConfig {
    BridgeConfig::new(env!("CARGO_BIN_EXE_stub-worker"))
        .with_startup_timeout(Duration::from_secs(10))
        .with_request_timeout(Duration::from_secs(10))
        .with_shutdown_grace(Duration::from_secs(2))
}

async fn started_client(config: BridgeConfig) -> Arc<BridgeClient> {
    let client = Arc::new(BridgeClient::new(config));
    client.start().await.expect("worker should start");
    client
}

/// Poll until `predicate` holds or the deadline passes.
async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

#[tokio::test]
async fn handshake_then_health() {
    let client = started_client(config()).await;
    assert_eq!(client.state(), BridgeState::Running);

    let info = client.handshake_info().expect("handshake info");
    assert_eq!(info.protocol_version, "2.0");
    assert!(info.capabilities.contains(&"engine".to_string()));

    let report = client.health().await.expect("health");
    assert!(report.is_healthy());

    // Handshake and health both completed successfully.
    let metrics = client.metrics();
    assert_eq!(metrics.request_count, 2);
    assert!(metrics.avg_latency_ms > 0.0);
    assert_eq!(metrics.error_count, 0);
    assert_eq!(metrics.timeout_count, 0);

    let status = client.status();
    assert!(status.pid.is_some());
    assert!(status.started_at.is_some());

    client.stop().await;
    assert_eq!(client.state(), BridgeState::Stopped);
}

#[tokio::test]
async fn responses_settle_out_of_submission_order() {
    let client = started_client(config()).await;

    let slow = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let result = client.request("sleep", Some(json!({"ms": 300}))).await;
            (Instant::now(), result)
        })
    };
    let fast = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let result = client.request("sleep", Some(json!({"ms": 20}))).await;
            (Instant::now(), result)
        })
    };

    let (slow_done, slow_result) = slow.await.unwrap();
    let (fast_done, fast_result) = fast.await.unwrap();

    assert_eq!(slow_result.unwrap(), json!({"slept": 300}));
    assert_eq!(fast_result.unwrap(), json!({"slept": 20}));
    assert!(
        fast_done < slow_done,
        "the later, shorter request should settle first"
    );

    client.stop().await;
}

#[tokio::test]
async fn remote_error_surfaces_code_and_message() {
    let client = started_client(config()).await;

    let err = client.request("no.such.method", None).await.unwrap_err();
    match err {
        BridgeError::Remote { code, message, .. } => {
            assert_eq!(code, -32601);
            assert!(message.contains("Method not found"));
        }
        other => panic!("expected remote error, got {:?}", other),
    }

    assert_eq!(client.metrics().error_count, 1);

    client.stop().await;
}

#[tokio::test]
async fn timeout_rejects_and_late_response_is_ignored() {
    let client = started_client(config()).await;

    let started = Instant::now();
    let err = client
        .request_with(
            RequestId::from("late"),
            "sleep",
            Some(json!({"ms": 400})),
            Duration::from_millis(80),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_millis(350));

    let before = client.metrics();
    assert_eq!(before.timeout_count, 1);

    // Let the worker's reply arrive for the already-expired id.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let after = client.metrics();
    assert_eq!(after.timeout_count, 1);
    assert_eq!(after.request_count, before.request_count);

    // Correlation still works afterwards.
    assert!(client.health().await.unwrap().is_healthy());

    client.stop().await;
}

#[tokio::test]
async fn malformed_record_between_valid_ones_is_dropped() {
    let client = started_client(config()).await;

    // The worker emits an undecodable line alongside this response.
    let result = client.request("garbage", None).await.unwrap();
    assert_eq!(result, json!({"emitted": "garbage"}));

    // Neighboring requests correlate fine.
    assert!(client.health().await.unwrap().is_healthy());

    client.stop().await;
}

#[tokio::test]
async fn crash_rejects_all_pending_and_blocks_new_requests() {
    let client = started_client(config()).await;

    let exited: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let exited = Arc::clone(&exited);
        client.subscribe(EventName::WorkerExited, move |data| {
            exited.lock().unwrap().push(data.clone());
        });
    }

    let mut pending = Vec::new();
    for _ in 0..3 {
        let client = Arc::clone(&client);
        pending.push(tokio::spawn(async move {
            client.request("block", None).await
        }));
    }
    assert!(wait_until(Duration::from_secs(2), || client.pending_requests() == 3).await);

    let crash_result = client.request("crash", None).await;
    assert!(matches!(
        crash_result,
        Err(BridgeError::ProcessCrash { .. })
    ));

    for task in pending {
        let result = task.await.unwrap();
        match result {
            Err(BridgeError::ProcessCrash { detail }) => {
                assert!(detail.contains("exit code 3"), "detail: {}", detail);
            }
            other => panic!("expected crash rejection, got {:?}", other),
        }
    }

    assert_eq!(client.state(), BridgeState::Crashed);
    assert_eq!(client.pending_requests(), 0);

    // The terminal notification went out exactly once.
    assert!(wait_until(Duration::from_secs(2), || !exited.lock().unwrap().is_empty()).await);
    {
        let exited = exited.lock().unwrap();
        assert_eq!(exited.len(), 1);
        assert_eq!(exited[0]["code"], json!(3));
        assert_eq!(exited[0]["expected"], json!(false));
    }

    // No new requests until a fresh start().
    let err = client.request("health", None).await.unwrap_err();
    assert!(matches!(err, BridgeError::NotRunning(BridgeState::Crashed)));

    // start() recovers from Crashed.
    client.start().await.expect("restart after crash");
    assert!(client.health().await.unwrap().is_healthy());

    client.stop().await;
}

#[tokio::test]
async fn cancel_settles_without_waiting_for_the_timeout() {
    let client = started_client(config()).await;

    let id = RequestId::from("cancel-me");
    let task = {
        let client = Arc::clone(&client);
        let id = id.clone();
        tokio::spawn(async move {
            client
                .request_with(id, "block", None, Duration::from_secs(30))
                .await
        })
    };
    assert!(wait_until(Duration::from_secs(2), || client.pending_requests() == 1).await);

    let started = Instant::now();
    assert!(client.cancel(&id));
    let result = task.await.unwrap();
    assert!(matches!(result, Err(BridgeError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));

    // Cancelling again is a no-op.
    assert!(!client.cancel(&id));

    client.stop().await;
}

#[tokio::test]
async fn duplicate_ids_are_rejected_by_the_tracker() {
    let client = started_client(config()).await;

    let id = RequestId::from("dup");
    let task = {
        let client = Arc::clone(&client);
        let id = id.clone();
        tokio::spawn(async move {
            client
                .request_with(id, "block", None, Duration::from_secs(30))
                .await
        })
    };
    assert!(wait_until(Duration::from_secs(2), || client.pending_requests() == 1).await);

    let err = client
        .request_with(id.clone(), "health", None, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::DuplicateId(_)));

    client.cancel(&id);
    let _ = task.await.unwrap();
    client.stop().await;
}

#[tokio::test]
async fn events_reach_subscribers_and_unsubscribed_names_are_dropped() {
    let client = Arc::new(BridgeClient::new(config()));

    let started: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
    {
        let started = Arc::clone(&started);
        client.subscribe(EventName::ServerStarted, move |_| {
            *started.lock().unwrap() += 1;
        });
    }

    let ticks: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let tick_sub = {
        let ticks = Arc::clone(&ticks);
        client.subscribe(EventName::Other("tick".into()), move |data| {
            ticks.lock().unwrap().push(data.clone());
        })
    };

    client.start().await.expect("start");
    assert!(wait_until(Duration::from_secs(2), || *started.lock().unwrap() == 1).await);

    client
        .request("emit", Some(json!({"name": "tick", "data": {"n": 1}})))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || ticks.lock().unwrap().len() == 1).await);
    assert_eq!(ticks.lock().unwrap()[0], json!({"n": 1}));

    // After unsubscribing, further events for the name are dropped.
    assert!(client.unsubscribe(&tick_sub));
    client
        .request("emit", Some(json!({"name": "tick", "data": {"n": 2}})))
        .await
        .unwrap();
    client
        .request("emit", Some(json!({"name": "other", "data": null})))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(ticks.lock().unwrap().len(), 1);

    client.stop().await;
}

#[tokio::test]
async fn engine_operations_round_trip() {
    let client = started_client(config()).await;

    let progress: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let progress = Arc::clone(&progress);
        client.subscribe(EventName::EngineProgress, move |data| {
            progress.lock().unwrap().push(data.clone());
        });
    }

    let init = client
        .engine_initialize(json!({"populationSize": 8}))
        .await
        .unwrap();
    assert_eq!(init["initialized"], json!(true));
    assert_eq!(init["config"]["populationSize"], json!(8));

    let step = client.engine_step().await.unwrap();
    assert_eq!(step["generation"], json!(1));

    let state = client.engine_state().await.unwrap();
    assert_eq!(state["generation"], json!(1));

    client.engine_reset().await.unwrap();
    let state = client.engine_state().await.unwrap();
    assert_eq!(state["generation"], json!(0));

    assert!(wait_until(Duration::from_secs(2), || progress.lock().unwrap().len() == 1).await);
    assert_eq!(progress.lock().unwrap()[0], json!({"generation": 1}));

    client.stop().await;
}

#[tokio::test]
async fn tool_surface_round_trips() {
    let client = started_client(config()).await;

    let tools = client.list_tools().await.unwrap();
    assert!(tools.iter().any(|t| t.id == "echo"));
    assert!(tools.iter().any(|t| t.id == "reverse"));

    let outcome = client
        .execute_tool("reverse", json!({"text": "bridge"}))
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.output, json!("egdirb"));

    let outcome = client.execute_tool("nope", Value::Null).await.unwrap();
    assert!(!outcome.success);

    client.stop().await;
}

#[tokio::test]
async fn stop_rejects_pending_requests_and_allows_restart() {
    let client = started_client(config()).await;

    let task = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.request("block", None).await })
    };
    assert!(wait_until(Duration::from_secs(2), || client.pending_requests() == 1).await);

    client.stop().await;
    assert_eq!(client.state(), BridgeState::Stopped);

    let result = task.await.unwrap();
    assert!(matches!(result, Err(BridgeError::Cancelled)));

    // The same client starts a fresh worker.
    client.start().await.expect("restart");
    assert!(client.health().await.unwrap().is_healthy());
    client.stop().await;
}

#[tokio::test]
async fn worker_runs_in_the_configured_directory() {
    let dir = tempfile::tempdir().unwrap();
    let expected = dir.path().canonicalize().unwrap();

    let client = started_client(config().with_current_dir(dir.path())).await;
    let result = client.request("cwd", None).await.unwrap();
    let reported = std::path::PathBuf::from(result["cwd"].as_str().unwrap());
    assert_eq!(reported.canonicalize().unwrap(), expected);

    client.stop().await;
}

#[tokio::test]
async fn spawn_failure_leaves_the_bridge_stopped() {
    let client = BridgeClient::new(
        BridgeConfig::new("/definitely/not/a/real/worker-binary"),
    );
    let err = client.start().await.unwrap_err();
    assert!(matches!(err, StartError::Spawn(_)));
    assert_eq!(client.state(), BridgeState::Stopped);
}

#[tokio::test]
async fn unresponsive_worker_times_out_at_startup() {
    // `sleep` never speaks the protocol, so the handshake must expire.
    let config = BridgeConfig::new("sleep")
        .with_arg("30")
        .with_startup_timeout(Duration::from_millis(200))
        .with_shutdown_grace(Duration::from_millis(200));

    let client = BridgeClient::new(config);
    let err = client.start().await.unwrap_err();
    assert!(matches!(err, StartError::StartupTimeout(_)));
    assert_eq!(client.state(), BridgeState::Stopped);
}

#[tokio::test]
async fn clients_are_independent() {
    let a = started_client(config()).await;
    let b = started_client(config()).await;

    a.request("sleep", Some(json!({"ms": 10}))).await.unwrap();
    assert_eq!(b.metrics().request_count, 1); // b's handshake only

    a.stop().await;
    assert_eq!(b.state(), BridgeState::Running);
    assert!(b.health().await.unwrap().is_healthy());
    b.stop().await;
}

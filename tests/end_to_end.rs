//! Edge agent → loopback broker → router → store, without a network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use suctionsense::backend::{AbsentFieldPolicy, Ingestor, IngestorSettings, RouteOutcome, TopicRouter};
use suctionsense::config::{BackendConfig, EdgeConfig};
use suctionsense::edge::{DeviceAgent, RawReading};
use suctionsense::edge::source::{FnSource, MetricSource};
use suctionsense::store::{StateStore, StoreBackend, SqliteBackend};
use suctionsense::transport::loopback::Loopback;
use tokio::time::Instant;

const EDGE_TOML: &str = r#"
device_id = "esp32_dev7"
room = "OR-7"

[supervisor]
startup_attempts = 1
backoff_initial_ms = 1
backoff_max_ms = 1

[[channels]]
field = "suction_on"
source = { kind = "value_file", path = "/unused", signal = "binary" }
debounce = { mode = "dwell", stable_ms = 0 }

[[channels]]
field = "motion"
source = { kind = "value_file", path = "/unused", signal = "binary" }
debounce = { mode = "dwell", stable_ms = 5000 }
"#;

fn router(policy: AbsentFieldPolicy) -> TopicRouter {
    TopicRouter::new(Arc::new(StateStore::in_memory()), policy)
}

#[tokio::test]
async fn room_state_message_is_ingested() {
    let router = router(AbsentFieldPolicy::DefaultFalse);

    let outcome = router
        .route("suction/OR-7/state", br#"{"suction_on":true,"motion":false}"#)
        .await
        .unwrap();

    let RouteOutcome::Applied { room_id, .. } = outcome else {
        panic!("message was not applied: {:?}", outcome);
    };
    let store = router.store();
    assert!(store.get_current(room_id).await.unwrap());
    assert_eq!(store.room_log(room_id).await.unwrap().len(), 1);

    let rooms = store.list_rooms().await.unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].number, "OR-7");
    assert!(rooms[0].suction_on);
    assert!(!rooms[0].occupancy);
}

#[tokio::test]
async fn malformed_topic_does_not_stop_ingestion() {
    let mut ingestor = Ingestor::create(
        IngestorSettings::from_config(&BackendConfig::default()),
        router(AbsentFieldPolicy::DefaultFalse),
    )
    .start();

    for topic in ["suction/bad", "suction/ /state"] {
        let dropped = ingestor
            .handle_message(topic, br#"{"suction_on":true}"#)
            .await
            .unwrap();
        assert!(matches!(dropped, RouteOutcome::Dropped(_)), "{}", topic);
    }

    let applied = ingestor
        .handle_message("suction/OR-1/state", br#"{"suction_on":true}"#)
        .await
        .unwrap();
    assert!(matches!(applied, RouteOutcome::Applied { .. }));

    let stats = ingestor.stats();
    assert_eq!(
        (stats.received, stats.applied, stats.dropped, stats.failed),
        (3, 1, 2, 0)
    );
}

#[tokio::test]
async fn absent_suction_field_follows_policy() {
    for (policy, expected) in [
        (AbsentFieldPolicy::DefaultFalse, false),
        (AbsentFieldPolicy::LeaveUntouched, true),
    ] {
        let router = router(policy);
        router
            .route("suction/OR-2/state", br#"{"suction_on":true}"#)
            .await
            .unwrap();
        router
            .route("suction/OR-2/state", br#"{"motion":true}"#)
            .await
            .unwrap();

        let room = router.store().ensure_room("OR-2").await.unwrap();
        assert_eq!(router.store().get_current(room).await.unwrap(), expected, "{:?}", policy);
    }
}

#[tokio::test]
async fn edge_publishes_reach_the_store_once_per_change() {
    let config: EdgeConfig = toml::from_str(EDGE_TOML).unwrap();
    config.validate().unwrap();

    let flow = Arc::new(AtomicBool::new(false));
    let pir = Arc::new(AtomicBool::new(false));
    let broker = Loopback::new();
    let (flow_src, pir_src) = (flow.clone(), pir.clone());
    let mut agent = DeviceAgent::from_config_with(&config, broker.link(), broker.session(), |channel| {
        let level = if channel.field == "suction_on" {
            flow_src.clone()
        } else {
            pir_src.clone()
        };
        let source: Box<dyn MetricSource> =
            Box::new(FnSource(move || RawReading::Level(level.load(Ordering::SeqCst))));
        Ok(source)
    })
    .unwrap();

    let t0 = Instant::now();
    let at = |ms: u64| t0 + Duration::from_millis(ms);
    assert!(agent.start().await);

    agent.tick(at(0)).await;
    flow.store(true, Ordering::SeqCst);
    for ms in (100..=1000).step_by(100) {
        agent.tick(at(ms)).await;
    }
    // Motion has to hold for five seconds before it counts
    pir.store(true, Ordering::SeqCst);
    agent.tick(at(2000)).await;
    agent.tick(at(4000)).await;
    agent.tick(at(7000)).await;

    let state_topic = config.state_topic();
    let published = broker.published_to(&state_topic);
    let payloads: Vec<_> = published.iter().map(|m| m.payload_str()).collect();
    assert_eq!(
        payloads,
        vec![
            r#"{"motion":false,"suction_on":false}"#,
            r#"{"motion":false,"suction_on":true}"#,
            r#"{"motion":true,"suction_on":true}"#,
        ]
    );
    assert!(published.iter().all(|m| m.retain));

    let router = TopicRouter::new(
        Arc::new(StateStore::new(Box::new(SqliteBackend::open_in_memory().unwrap()))),
        AbsentFieldPolicy::DefaultFalse,
    );
    for message in &published {
        router.route(&message.topic, &message.payload).await.unwrap();
    }

    let room = router.store().ensure_room("OR-7").await.unwrap();
    assert!(router.store().get_current(room).await.unwrap());
    let log: Vec<bool> = router
        .store()
        .room_log(room)
        .await
        .unwrap()
        .iter()
        .map(|e| e.value)
        .collect();
    assert_eq!(log, vec![false, true]);
    assert!(router.store().room(room).await.unwrap().unwrap().occupancy);
}

#[tokio::test]
async fn store_recovers_from_a_write_interrupted_after_logging() {
    let mut backend = SqliteBackend::open_in_memory().unwrap();
    let room = backend.insert_room("OR-9").unwrap();
    backend.append_log(room, true, chrono::Utc::now()).unwrap();

    let router = TopicRouter::new(
        Arc::new(StateStore::new(Box::new(backend))),
        AbsentFieldPolicy::DefaultFalse,
    );
    assert!(router.store().get_current(room).await.unwrap());

    router
        .route("suction/OR-9/state", br#"{"suction_on":true}"#)
        .await
        .unwrap();
    assert_eq!(router.store().room_log(room).await.unwrap().len(), 1);
}

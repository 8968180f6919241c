use super::*;
use crate::broker::metrics::test_harness::MetricTestHarness;
use opentelemetry::KeyValue;
use serde_json::json;

#[tokio::test]
async fn lapsed_delay_is_delivered_on_restart() {
    let store = MemoryStore::default();
    let first = start_broker(&store).await;
    let id = first
        .produce(Message::new("list", json!({"order": 7})).with_delay(Duration::from_millis(20)))
        .await
        .unwrap();
    first.shutdown().await;

    // The timer expires with nobody listening.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!store.contains_key(&keys::timer_key(&id)));
    assert!(store.list("list").is_empty(), "nothing dispatched while down");
    assert!(store.contains_key(&keys::payload_key(&id)));

    let second = start_broker(&store).await;
    assert_eq!(second.recovery_report().recovered, 1);

    let listed = delivered(&store, "list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].body, json!({"order": 7}), "payload survives intact");
    assert!(!store.contains_key(&keys::payload_key(&id)));
}

#[tokio::test]
async fn pending_delay_is_left_to_the_listener() {
    let store = MemoryStore::default();
    let first = start_broker(&store).await;
    let id = first
        .produce(Message::new("list", "later").with_delay(Duration::from_millis(300)))
        .await
        .unwrap();
    first.shutdown().await;

    let second = start_broker(&store).await;
    let report = second.recovery_report();
    assert_eq!(report.pending, 1);
    assert_eq!(report.recovered, 0);
    assert!(store.list("list").is_empty(), "running timer must not be released");

    assert!(wait_until(Duration::from_secs(2), || store.list("list").len() == 1).await);
    assert_eq!(delivered(&store, "list")[0].id, id);
}

#[tokio::test]
async fn listener_then_recovery_delivers_once() {
    let store = MemoryStore::default();
    let first = start_broker(&store).await;
    first
        .produce(Message::new("list", "once").with_delay(Duration::from_millis(20)))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(1), || store.list("list").len() == 1).await);

    let second = start_broker(&store).await;
    assert_eq!(second.recovery_report(), &RecoveryReport::default());
    assert_eq!(store.list("list").len(), 1);
}

#[tokio::test]
async fn release_is_idempotent() {
    let store = MemoryStore::default();
    let broker = start_broker(&store).await;
    let message = identified("list", json!("dup?"));
    write_delay_record(&store, &message, None).await;

    let first = broker
        .core
        .release(&message.id, DispatchSource::Expired)
        .await
        .unwrap();
    let second = broker
        .core
        .release(&message.id, DispatchSource::Recovered)
        .await
        .unwrap();

    assert_eq!(first, dispatcher::Release::Dispatched);
    assert_eq!(second, dispatcher::Release::AlreadyDispatched);
    assert_eq!(store.list("list").len(), 1);
}

#[tokio::test]
async fn records_from_another_process_are_recovered() {
    let store = MemoryStore::default();
    let stale = identified("jobs", json!({"k": "v"}));
    let running = identified("jobs", json!("not yet"));
    write_delay_record(&store, &stale, None).await;
    write_delay_record(&store, &running, Some(60_000)).await;

    let broker = start_broker(&store).await;
    assert_eq!(
        broker.recovery_report(),
        &RecoveryReport {
            recovered: 1,
            pending: 1,
            skipped: 0,
        }
    );
    let listed = delivered(&store, "jobs");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, stale.id);
    assert!(store.contains_key(&keys::payload_key(&running.id)));
}

#[tokio::test]
async fn unusable_payload_keys_are_skipped() {
    let harness = MetricTestHarness::new();
    let store = MemoryStore::default();
    let good = identified("list", json!(1));
    let wrong_owner = identified("list", json!(2));
    let garbage_id = new_id();
    write_delay_record(&store, &good, None).await;
    store
        .write_batch(vec![
            WriteBatchOp::Set {
                key: "not-a-uuid:payload".to_string(),
                value: "{}".to_string(),
            },
            WriteBatchOp::Set {
                key: keys::payload_key(&garbage_id),
                value: "definitely not json".to_string(),
            },
            // Payload stored under an identifier it does not carry.
            WriteBatchOp::Set {
                key: keys::payload_key(&new_id()),
                value: crate::codec::stringify(&wrong_owner).unwrap(),
            },
        ])
        .await
        .unwrap();

    let broker = Broker::start_with_metrics(store.deployment(), &test_config(), harness.metrics())
        .await
        .unwrap();

    let report = broker.recovery_report();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.skipped, 3);
    assert_eq!(delivered(&store, "list").len(), 1);
    // Skipped keys are left for an operator to inspect.
    assert!(store.contains_key("not-a-uuid:payload"));
    assert!(store.contains_key(&keys::payload_key(&garbage_id)));
    harness.assert_counter(
        "lapse.recovery.skipped",
        &[KeyValue::new("node", "memory")],
        3,
    );
    harness.assert_counter(
        "lapse.messages.dispatched",
        &[KeyValue::new("source", "recovered")],
        1,
    );
}

#[tokio::test]
async fn concurrent_releases_push_once() {
    let store = MemoryStore::default();
    let message = identified("list", json!("contested"));
    write_delay_record(&store, &message, None).await;

    // Both callers read the payload before either writes.
    let core = Core::new(
        Arc::new(GatedReads::new(store.clone(), 2)),
        &EventsConfig::default(),
        Metrics::new(),
    );
    let (listener, scan) = tokio::join!(
        core.release(&message.id, DispatchSource::Expired),
        core.release(&message.id, DispatchSource::Recovered),
    );
    let outcomes = [listener.unwrap(), scan.unwrap()];

    let dispatched = outcomes
        .iter()
        .filter(|o| **o == dispatcher::Release::Dispatched)
        .count();
    assert_eq!(dispatched, 1, "outcomes: {outcomes:?}");
    assert!(outcomes.contains(&dispatcher::Release::AlreadyDispatched));
    assert_eq!(store.list("list").len(), 1, "message pushed exactly once");
    assert!(!store.contains_key(&keys::payload_key(&message.id)));
}

#[tokio::test]
async fn claimed_payload_is_left_to_its_claimant() {
    let store = MemoryStore::default();
    let broker = start_broker(&store).await;
    let message = identified("list", json!("held"));
    write_delay_record(&store, &message, None).await;
    assert!(store
        .set_if_absent(&keys::claim_key(&message.id), "", 60_000)
        .await
        .unwrap());

    let outcome = broker
        .core
        .release(&message.id, DispatchSource::Recovered)
        .await
        .unwrap();
    assert_eq!(outcome, dispatcher::Release::AlreadyDispatched);
    assert!(store.list("list").is_empty());
    assert!(
        store.contains_key(&keys::payload_key(&message.id)),
        "payload kept for a later scan"
    );
}

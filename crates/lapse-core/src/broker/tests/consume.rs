use super::*;
use crate::codec::Decoded;
use serde_json::json;
use std::collections::HashSet;
use tokio_stream::StreamExt;

const SHORT: Duration = Duration::from_millis(50);

fn body(pulled: Option<Decoded<IdentifiedMessage>>) -> serde_json::Value {
    pulled
        .expect("expected a message")
        .message()
        .expect("expected a decodable message")
        .body
}

#[tokio::test]
async fn pulls_in_fifo_order() {
    let store = MemoryStore::default();
    let broker = start_broker(&store).await;

    broker.produce(Message::new("list", "a")).await.unwrap();
    broker.produce(Message::new("list", "b")).await.unwrap();

    assert_eq!(body(broker.next("list", SHORT).await.unwrap()), json!("a"));
    assert_eq!(body(broker.next("list", SHORT).await.unwrap()), json!("b"));
    assert!(broker.next("list", SHORT).await.unwrap().is_none());
}

#[tokio::test]
async fn empty_topic_times_out_with_none() {
    let store = MemoryStore::default();
    let broker = start_broker(&store).await;

    let started = std::time::Instant::now();
    let pulled = broker.next("idle", SHORT).await.unwrap();
    assert!(pulled.is_none());
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[tokio::test]
async fn blocked_pull_wakes_on_delayed_dispatch() {
    let store = MemoryStore::default();
    let broker = start_broker(&store).await;
    let consumer = broker.consume("list");

    let waiting = tokio::spawn(async move { consumer.next_timeout(Duration::ZERO).await });
    let id = broker
        .produce(Message::new("list", "wake").with_delay(Duration::from_millis(30)))
        .await
        .unwrap();

    let pulled = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .expect("pull should complete")
        .unwrap()
        .unwrap()
        .and_then(Decoded::message)
        .expect("a message");
    assert_eq!(pulled.id, id);
    assert!(store.list("list").is_empty(), "pull removes the entry");
}

#[tokio::test]
async fn repeated_consume_shares_one_handle() {
    let store = MemoryStore::default();
    let broker = start_broker(&store).await;

    let first = broker.consume("list");
    let second = broker.consume("list");
    assert!(first.same_handle(&second));
    assert!(!first.same_handle(&broker.consume("other")));

    broker.produce(Message::new("list", 1)).await.unwrap();
    broker.produce(Message::new("list", 2)).await.unwrap();

    assert_eq!(body(first.next_timeout(SHORT).await.unwrap()), json!(1));
    assert_eq!(body(second.next_timeout(SHORT).await.unwrap()), json!(2));
}

#[tokio::test]
async fn stream_ends_on_timeout_and_restarts() {
    let store = MemoryStore::default();
    let broker = start_broker(&store).await;
    let consumer = broker.consume("list");

    broker.produce(Message::new("list", "x")).await.unwrap();
    broker.produce(Message::new("list", "y")).await.unwrap();

    let first: Vec<_> = consumer.stream_timeout(SHORT).collect().await;
    assert_eq!(first.len(), 2);

    let empty: Vec<_> = consumer.stream_timeout(SHORT).collect().await;
    assert!(empty.is_empty());

    broker.produce(Message::new("list", "z")).await.unwrap();
    let mut again = consumer.stream_timeout(SHORT);
    let item = again.next().await.expect("stream yields again").unwrap();
    assert_eq!(item.message().unwrap().body, json!("z"));
    assert!(again.next().await.is_none());
}

#[tokio::test]
async fn non_json_entries_surface_raw() {
    let store = MemoryStore::default();
    let broker = start_broker(&store).await;
    store
        .write_batch(vec![WriteBatchOp::PushTail {
            list: "list".to_string(),
            value: "plain text".to_string(),
        }])
        .await
        .unwrap();

    match broker.next("list", SHORT).await.unwrap() {
        Some(Decoded::Raw(raw)) => assert_eq!(raw, "plain text"),
        other => panic!("expected raw entry, got {other:?}"),
    }
}

#[tokio::test]
async fn topics_do_not_block_each_other() {
    let store = MemoryStore::default();
    let broker = start_broker(&store).await;

    let idle = broker.consume("quiet");
    let parked = tokio::spawn(async move { idle.next_timeout(Duration::ZERO).await });

    broker.produce(Message::new("busy", "go")).await.unwrap();
    assert_eq!(body(broker.next("busy", SHORT).await.unwrap()), json!("go"));
    assert!(!parked.is_finished());
    parked.abort();
}

#[tokio::test]
async fn competing_brokers_split_entries() {
    let store = MemoryStore::default();
    let a = start_broker(&store).await;
    let b = start_broker(&store).await;

    for i in 0..20 {
        a.produce(Message::new("work", i)).await.unwrap();
    }

    let pull_all = |broker: Broker| async move {
        let mut ids = Vec::new();
        while let Some(pulled) = broker.next("work", SHORT).await.unwrap() {
            ids.push(pulled.message().unwrap().id);
            tokio::task::yield_now().await;
        }
        ids
    };
    let (from_a, from_b) = tokio::join!(pull_all(a), pull_all(b));

    let unique: HashSet<_> = from_a.iter().chain(from_b.iter()).collect();
    assert_eq!(from_a.len() + from_b.len(), 20);
    assert_eq!(unique.len(), 20, "no entry is delivered twice");
}

#[tokio::test]
async fn typed_bodies_round_trip() {
    #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
    struct Job {
        name: String,
        attempts: u32,
    }

    let store = MemoryStore::default();
    let broker = start_broker(&store).await;
    let job = Job {
        name: "resize".to_string(),
        attempts: 2,
    };
    broker.produce(Message::new("jobs", &job)).await.unwrap();

    let pulled = broker
        .next("jobs", SHORT)
        .await
        .unwrap()
        .and_then(Decoded::message)
        .unwrap();
    assert_eq!(pulled.body_as::<Job>().unwrap(), job);
}

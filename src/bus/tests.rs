use super::{MessageBus, PublishOptions};
use crate::broker::InMemoryBroker;
use crate::context::{TraceInfo, with_trace};
use crate::dlq::{DeadLetterQueue, DeadLetterReason};
use crate::message::{Message, Priority};
use crate::persistence::{MemoryMessageStore, MessageStatus, MessageStore};
use crate::schema::{FieldKind, FieldSchema, SchemaRegistry};
use crate::transport::handler_fn;
use crate::utils::BusError;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(2);

/// Poll `check` until it holds or the wait budget runs out.
async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

async fn connected(bus: MessageBus) -> MessageBus {
    bus.connect().await.unwrap();
    bus
}

fn failing_handler() -> crate::transport::MessageHandler {
    handler_fn(|_m: Message| async { anyhow::bail!("agent crashed") })
}

#[tokio::test]
async fn test_publish_delivers_with_options() {
    let bus = connected(
        MessageBus::builder(Arc::new(InMemoryBroker::new()))
            .sender("planner")
            .build(),
    )
    .await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(
        "tasks",
        handler_fn(move |m: Message| {
            let tx = tx.clone();
            async move {
                tx.send(m)?;
                Ok(())
            }
        }),
    )
    .await
    .unwrap();

    let id = bus
        .publish(
            "tasks",
            json!({ "step": 1 }),
            PublishOptions::new()
                .priority(Priority::High)
                .metadata("origin", json!("test")),
        )
        .await
        .unwrap();

    let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(got.id, id);
    assert_eq!(got.priority, Priority::High);
    assert_eq!(got.sender.as_deref(), Some("planner"));
    assert_eq!(got.metadata["origin"], json!("test"));
    assert!(got.trace_id.is_none());
}

#[tokio::test]
async fn test_publish_requires_connection() {
    let bus = MessageBus::new(Arc::new(InMemoryBroker::new()));
    let err = bus.publish("t", json!(1), PublishOptions::new()).await.unwrap_err();
    assert!(matches!(err, BusError::Connection(_)));
}

#[tokio::test]
async fn test_schema_rejection_happens_before_enqueue() {
    let schemas = Arc::new(SchemaRegistry::new());
    schemas.register("tasks", FieldSchema::new().required("step", FieldKind::Integer));
    let store = Arc::new(MemoryMessageStore::new());
    let bus = connected(
        MessageBus::builder(Arc::new(InMemoryBroker::new()))
            .schemas(schemas)
            .store(store.clone())
            .build(),
    )
    .await;

    let err = bus
        .publish("tasks", json!({ "step": "one" }), PublishOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::SchemaValidation { .. }));
    assert_eq!(bus.get_queue_size("tasks").await, 0);
    assert_eq!(store.stats().await.unwrap().total, 0);

    bus.publish("tasks", json!({ "step": 1 }), PublishOptions::new())
        .await
        .unwrap();
    assert_eq!(bus.get_queue_size("tasks").await, 1);
}

#[tokio::test]
async fn test_ambient_trace_is_injected() {
    let bus = connected(MessageBus::new(Arc::new(InMemoryBroker::new()))).await;
    let root = TraceInfo::new_root();

    with_trace(root.clone(), async {
        bus.publish("t", json!(1), PublishOptions::new()).await.unwrap();
    })
    .await;

    let pending = bus.get_pending_messages("t", 10).await.unwrap();
    let message = &pending[0];
    assert_eq!(message.trace_id.as_deref(), Some(root.trace_id.as_str()));
    assert_eq!(message.parent_span_id.as_deref(), Some(root.span_id.as_str()));
    assert!(message.span_id.is_some());
    assert_ne!(message.span_id.as_deref(), Some(root.span_id.as_str()));
}

#[tokio::test]
async fn test_explicit_trace_and_disabled_injection() {
    let bus = connected(
        MessageBus::builder(Arc::new(InMemoryBroker::new()))
            .auto_inject_trace(false)
            .build(),
    )
    .await;

    with_trace(TraceInfo::new_root(), async {
        bus.publish("plain", json!(1), PublishOptions::new()).await.unwrap();
        bus.publish("explicit", json!(1), PublishOptions::new().trace_id("t-1"))
            .await
            .unwrap();
    })
    .await;

    let plain = bus.get_pending_messages("plain", 1).await.unwrap();
    assert!(plain[0].trace_id.is_none());
    let explicit = bus.get_pending_messages("explicit", 1).await.unwrap();
    assert_eq!(explicit[0].trace_id.as_deref(), Some("t-1"));
}

#[tokio::test]
async fn test_persistence_tracks_acknowledgement() {
    let store = Arc::new(MemoryMessageStore::new());
    let bus = connected(
        MessageBus::builder(Arc::new(InMemoryBroker::new()))
            .store(store.clone())
            .build(),
    )
    .await;

    let id = bus.publish("t", json!(1), PublishOptions::new()).await.unwrap();
    assert_eq!(store.get(&id).await.unwrap().unwrap().status, MessageStatus::Delivered);

    bus.subscribe("t", handler_fn(|_m: Message| async { Ok(()) }))
        .await
        .unwrap();

    let mut acknowledged = false;
    for _ in 0..200 {
        if store.get(&id).await.unwrap().unwrap().status == MessageStatus::Acknowledged {
            acknowledged = true;
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert!(acknowledged);
}

#[tokio::test]
async fn test_handler_failure_is_dead_lettered() {
    let dlq = Arc::new(DeadLetterQueue::default());
    let store = Arc::new(MemoryMessageStore::new());
    let bus = connected(
        MessageBus::builder(Arc::new(InMemoryBroker::new()))
            .dead_letter_queue(dlq.clone())
            .store(store.clone())
            .build(),
    )
    .await;

    bus.subscribe("jobs", failing_handler()).await.unwrap();
    let id = bus.publish("jobs", json!({ "n": 1 }), PublishOptions::new())
        .await
        .unwrap();

    assert!(eventually(|| dlq.len() == 1).await);
    let entry = dlq.get(&id).unwrap();
    assert_eq!(entry.reason, DeadLetterReason::HandlerError);
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.error, "agent crashed");
    assert_eq!(entry.original_topic, "jobs");
    assert!(entry.context.is_some());

    // give the status update a moment to land after the DLQ insert
    let mut status = None;
    for _ in 0..200 {
        status = store.get(&id).await.unwrap().map(|s| s.status);
        if status == Some(MessageStatus::DeadLettered) {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(status, Some(MessageStatus::DeadLettered));
}

#[tokio::test]
async fn test_handler_failure_without_dlq_marks_failed() {
    let store = Arc::new(MemoryMessageStore::new());
    let bus = connected(
        MessageBus::builder(Arc::new(InMemoryBroker::new()))
            .store(store.clone())
            .build(),
    )
    .await;

    bus.subscribe("jobs", failing_handler()).await.unwrap();
    let id = bus.publish("jobs", json!(1), PublishOptions::new()).await.unwrap();

    let mut stored = None;
    for _ in 0..200 {
        stored = store.get(&id).await.unwrap();
        if stored.as_ref().is_some_and(|s| s.status == MessageStatus::Failed) {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    let stored = stored.unwrap();
    assert_eq!(stored.status, MessageStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("agent crashed"));
}

#[tokio::test]
async fn test_expired_message_skips_handler() {
    let dlq = Arc::new(DeadLetterQueue::default());
    let bus = connected(
        MessageBus::builder(Arc::new(InMemoryBroker::new()))
            .dead_letter_queue(dlq.clone())
            .build(),
    )
    .await;

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    bus.subscribe(
        "t",
        handler_fn(move |_m: Message| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }),
    )
    .await
    .unwrap();

    let mut stale = Message::new("t", json!("old")).with_ttl(Duration::from_millis(10));
    stale.timestamp = chrono::Utc::now() - chrono::Duration::seconds(1);
    let id = bus.publish_message(stale, false).await.unwrap();

    assert!(eventually(|| dlq.len() == 1).await);
    assert_eq!(dlq.get(&id).unwrap().reason, DeadLetterReason::Expired);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_request_reply_round_trip() {
    let bus = Arc::new(connected(MessageBus::new(Arc::new(InMemoryBroker::new()))).await);

    let responder = bus.clone();
    bus.subscribe(
        "agent.echo",
        handler_fn(move |m: Message| {
            let bus = responder.clone();
            async move {
                bus.reply(&m, json!({ "echo": m.payload }), PublishOptions::new())
                    .await?;
                Ok(())
            }
        }),
    )
    .await
    .unwrap();

    let root = TraceInfo::new_root();
    let reply = with_trace(
        root.clone(),
        bus.request(
            "agent.echo",
            json!("ping"),
            PublishOptions::new().reply_to("agent.echo.replies"),
            Some(WAIT),
        ),
    )
    .await
    .unwrap();

    assert_eq!(reply.payload, json!({ "echo": "ping" }));
    assert_eq!(reply.topic, "agent.echo.replies");
    assert!(reply.correlation_id.is_some());
    assert_eq!(reply.trace_id.as_deref(), Some(root.trace_id.as_str()));
}

#[tokio::test]
async fn test_request_times_out() {
    let bus = connected(MessageBus::new(Arc::new(InMemoryBroker::new()))).await;
    let err = bus
        .request(
            "nobody.home",
            json!(1),
            PublishOptions::new().correlation_id("c-1"),
            Some(Duration::from_millis(30)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Timeout { ref correlation_id, .. } if correlation_id == "c-1"));
}

#[tokio::test]
async fn test_reply_requires_correlation_id() {
    let bus = connected(MessageBus::new(Arc::new(InMemoryBroker::new()))).await;
    let original = Message::new("t", json!(1));
    let err = bus
        .reply(&original, json!(2), PublishOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Configuration(_)));
}

#[tokio::test]
async fn test_reply_defaults_to_original_topic() {
    let bus = connected(MessageBus::new(Arc::new(InMemoryBroker::new()))).await;
    let original = Message::new("questions", json!(1)).with_correlation_id("c-9");

    bus.reply(&original, json!("answer"), PublishOptions::new())
        .await
        .unwrap();

    let pending = bus.get_pending_messages("questions", 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].correlation_id.as_deref(), Some("c-9"));
}

#[tokio::test]
async fn test_replay_requires_store() {
    let bus = MessageBus::new(Arc::new(InMemoryBroker::new()));
    let err = bus
        .replay("t", handler_fn(|_m: Message| async { Ok(()) }), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Configuration(_)));
}

#[tokio::test]
async fn test_replay_counts_successful_messages() {
    let store = Arc::new(MemoryMessageStore::new());
    let bus = connected(
        MessageBus::builder(Arc::new(InMemoryBroker::new()))
            .store(store.clone())
            .build(),
    )
    .await;

    for n in 0..3 {
        bus.publish("history", json!(n), PublishOptions::new())
            .await
            .unwrap();
        sleep(Duration::from_millis(2)).await;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let processed = bus
        .replay(
            "history",
            handler_fn(move |m: Message| {
                let tx = tx.clone();
                async move {
                    if m.payload == json!(1) {
                        anyhow::bail!("skip");
                    }
                    tx.send(m.payload)?;
                    Ok(())
                }
            }),
            None,
            None,
        )
        .await
        .unwrap();

    assert_eq!(processed, 2);
    assert_eq!(rx.recv().await, Some(json!(0)));
    assert_eq!(rx.recv().await, Some(json!(2)));
    // replay never touches the live queue
    assert_eq!(bus.get_queue_size("history").await, 3);
}

#[tokio::test]
async fn test_requeue_dead_letter_republishes() {
    let dlq = Arc::new(DeadLetterQueue::default());
    let bus = connected(
        MessageBus::builder(Arc::new(InMemoryBroker::new()))
            .dead_letter_queue(dlq.clone())
            .build(),
    )
    .await;

    let sub = bus.subscribe("jobs", failing_handler()).await.unwrap();
    let id = bus.publish("jobs", json!("work"), PublishOptions::new())
        .await
        .unwrap();
    assert!(eventually(|| dlq.len() == 1).await);
    bus.unsubscribe(&sub).await.unwrap();

    assert!(bus.requeue_dead_letter(&id).await.unwrap());
    assert!(dlq.is_empty());

    let pending = bus.get_pending_messages("jobs", 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);

    let err = bus.requeue_dead_letter("ghost").await.unwrap_err();
    assert!(matches!(err, BusError::DeadLetterNotFound(_)));
}

#[tokio::test]
async fn test_requeue_without_dlq_is_configuration_error() {
    let bus = connected(MessageBus::new(Arc::new(InMemoryBroker::new()))).await;
    assert!(bus.dead_letters().is_none());
    let err = bus.requeue_dead_letters(None).await.unwrap_err();
    assert!(matches!(err, BusError::Configuration(_)));
}

#[tokio::test]
async fn test_from_settings_wires_collaborators() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = crate::config::Settings::default();
    settings.broker.max_queue_size = 2;
    settings.persistence.enabled = true;
    settings.persistence.path = dir.path().join("db").to_string_lossy().into_owned();
    settings.bus.sender = Some("cli".to_string());

    let bus = connected(MessageBus::from_settings(&settings).unwrap()).await;
    assert!(bus.dead_letters().is_some());
    assert!(bus.store().is_some());

    bus.publish("t", json!(1), PublishOptions::new()).await.unwrap();
    bus.publish("t", json!(2), PublishOptions::new()).await.unwrap();
    let err = bus.publish("t", json!(3), PublishOptions::new()).await.unwrap_err();
    assert!(matches!(err, BusError::CapacityExceeded { max_size: 2, .. }));

    let pending = bus.get_pending_messages("t", 10).await.unwrap();
    assert_eq!(pending[0].sender.as_deref(), Some("cli"));
    let stats = bus.get_backpressure_stats(Some("t")).await;
    assert_eq!(stats["t"].queue_size, 2);
    bus.disconnect().await.unwrap();
}

/// Poll the store until `count` messages on `topic` carry `status`.
async fn wait_for_status(
    store: &MemoryMessageStore,
    topic: &str,
    status: MessageStatus,
    count: usize,
) -> bool {
    timeout(WAIT, async {
        loop {
            let found = store.get_by_topic(topic, Some(status), 1000).await.unwrap();
            if found.len() >= count {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fast_handlers_are_not_overwritten_by_delivered() {
    let store = Arc::new(MemoryMessageStore::new());
    let bus = connected(
        MessageBus::builder(Arc::new(InMemoryBroker::new()))
            .store(store.clone())
            .build(),
    )
    .await;
    bus.subscribe("fast", handler_fn(|_m: Message| async { Ok(()) }))
        .await
        .unwrap();

    for i in 0..200 {
        bus.publish("fast", json!(i), PublishOptions::new()).await.unwrap();
    }

    assert!(wait_for_status(&store, "fast", MessageStatus::Acknowledged, 200).await);
    // the publisher's DELIVERED writes have all landed by now
    sleep(Duration::from_millis(20)).await;
    let delivered = store
        .get_by_topic("fast", Some(MessageStatus::Delivered), 1000)
        .await
        .unwrap();
    assert!(delivered.is_empty(), "{} messages regressed to DELIVERED", delivered.len());
    assert_eq!(
        store
            .get_by_topic("fast", Some(MessageStatus::Acknowledged), 1000)
            .await
            .unwrap()
            .len(),
        200
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_answered_request_stays_acknowledged() {
    let store = Arc::new(MemoryMessageStore::new());
    let bus = Arc::new(
        connected(
            MessageBus::builder(Arc::new(InMemoryBroker::new()))
                .store(store.clone())
                .build(),
        )
        .await,
    );
    let responder = bus.clone();
    bus.subscribe(
        "agent.echo",
        handler_fn(move |m: Message| {
            let bus = responder.clone();
            async move {
                bus.reply(&m, json!("pong"), PublishOptions::new()).await?;
                Ok(())
            }
        }),
    )
    .await
    .unwrap();

    for _ in 0..20 {
        bus.request(
            "agent.echo",
            json!("ping"),
            PublishOptions::new().reply_to("agent.echo.replies"),
            Some(WAIT),
        )
        .await
        .unwrap();
    }

    assert!(wait_for_status(&store, "agent.echo", MessageStatus::Acknowledged, 20).await);
    sleep(Duration::from_millis(20)).await;
    let requests = store.get_by_topic("agent.echo", None, 100).await.unwrap();
    assert_eq!(requests.len(), 20);
    assert!(
        requests
            .iter()
            .all(|stored| stored.status == MessageStatus::Acknowledged)
    );
}

use super::{DeadLetterEntry, DeadLetterQueue, DeadLetterReason};
use crate::message::Message;
use crate::transport::{MessageHandler, handler_fn};
use crate::utils::BusError;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn entry(topic: &str, id: &str, reason: DeadLetterReason) -> DeadLetterEntry {
    DeadLetterEntry::new(Message::new(topic, json!(id)).with_id(id), reason, "boom")
}

fn failing_handler() -> MessageHandler {
    handler_fn(|_m: Message| async { anyhow::bail!("still broken") })
}

fn ok_handler() -> MessageHandler {
    handler_fn(|_m: Message| async { Ok(()) })
}

#[test]
fn test_new_entry_defaults() {
    let e = entry("t", "m1", DeadLetterReason::HandlerError);
    assert_eq!(e.retry_count, 0);
    assert_eq!(e.original_topic, "t");
    assert_eq!(e.message_id(), "m1");
    assert!(e.context.is_none());
}

#[test]
fn test_add_and_get() {
    let dlq = DeadLetterQueue::new(10, 3);
    assert!(dlq.is_empty());
    dlq.add(entry("t", "m1", DeadLetterReason::HandlerError));
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq.get("m1").unwrap().error, "boom");
    assert!(dlq.get("missing").is_none());
}

#[test]
fn test_add_evicts_oldest_at_capacity() {
    let dlq = DeadLetterQueue::new(2, 3);
    assert!(dlq.add(entry("t", "m1", DeadLetterReason::HandlerError)).is_none());
    assert!(dlq.add(entry("t", "m2", DeadLetterReason::HandlerError)).is_none());
    let evicted = dlq.add(entry("t", "m3", DeadLetterReason::Expired)).unwrap();

    assert_eq!(evicted.message_id(), "m1");
    assert_eq!(dlq.len(), 2);
    assert!(dlq.get("m1").is_none());
    assert!(dlq.get("m3").is_some());
}

#[test]
fn test_re_adding_same_id_replaces_without_eviction() {
    let dlq = DeadLetterQueue::new(2, 3);
    dlq.add(entry("t", "m1", DeadLetterReason::HandlerError));
    dlq.add(entry("t", "m2", DeadLetterReason::HandlerError));
    let evicted = dlq.add(entry("t", "m1", DeadLetterReason::Rejected));

    assert!(evicted.is_none());
    assert_eq!(dlq.len(), 2);
    assert_eq!(dlq.get("m1").unwrap().reason, DeadLetterReason::Rejected);

    // m1 moved to the back, so m2 is now the oldest
    let evicted = dlq.add(entry("t", "m3", DeadLetterReason::HandlerError)).unwrap();
    assert_eq!(evicted.message_id(), "m2");
}

#[test]
fn test_zero_capacity_drops_entries() {
    let dlq = DeadLetterQueue::new(0, 3);
    dlq.add(entry("t", "m1", DeadLetterReason::HandlerError));
    assert!(dlq.is_empty());
}

#[test]
fn test_on_add_callback_failures_are_swallowed() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let dlq = DeadLetterQueue::new(10, 3).with_on_add(move |e| {
        seen.fetch_add(1, Ordering::SeqCst);
        if e.message_id() == "m2" {
            panic!("observer bug");
        }
        anyhow::bail!("observer unavailable")
    });

    dlq.add(entry("t", "m1", DeadLetterReason::HandlerError));
    dlq.add(entry("t", "m2", DeadLetterReason::HandlerError));

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(dlq.len(), 2);
}

#[test]
fn test_remove_and_clear() {
    let dlq = DeadLetterQueue::new(10, 3);
    dlq.add(entry("a", "m1", DeadLetterReason::HandlerError));
    dlq.add(entry("a", "m2", DeadLetterReason::HandlerError));
    dlq.add(entry("b", "m3", DeadLetterReason::HandlerError));

    assert_eq!(dlq.remove("m1").unwrap().message_id(), "m1");
    assert!(dlq.remove("m1").is_none());

    assert_eq!(dlq.clear(Some("a")), 1);
    assert_eq!(dlq.clear(Some("a")), 0);
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq.clear(None), 1);
    assert!(dlq.is_empty());
    assert!(dlq.stats().by_topic.is_empty());
}

#[tokio::test]
async fn test_retry_success_removes_entry() {
    let dlq = DeadLetterQueue::new(10, 3);
    dlq.add(entry("t", "m1", DeadLetterReason::HandlerError));

    assert!(dlq.retry("m1", &ok_handler()).await.unwrap());
    assert!(dlq.get("m1").is_none());
}

#[tokio::test]
async fn test_retry_unknown_id_fails() {
    let dlq = DeadLetterQueue::new(10, 3);
    let err = dlq.retry("ghost", &ok_handler()).await.unwrap_err();
    assert!(matches!(err, BusError::DeadLetterNotFound(id) if id == "ghost"));
}

#[tokio::test]
async fn test_retry_counts_up_to_max_then_refuses() {
    let dlq = DeadLetterQueue::new(10, 3);
    dlq.add(entry("t", "m1", DeadLetterReason::HandlerError));
    let handler = failing_handler();

    let mut last = 0;
    for attempt in 1..=3 {
        assert!(!dlq.retry("m1", &handler).await.unwrap());
        let e = dlq.get("m1").unwrap();
        assert!(e.retry_count >= last);
        assert_eq!(e.retry_count, attempt);
        assert_eq!(e.error, "still broken");
        assert!(e.last_retry_at.is_some());
        let expected = if attempt < 3 {
            DeadLetterReason::HandlerError
        } else {
            DeadLetterReason::MaxRetries
        };
        assert_eq!(e.reason, expected);
        last = e.retry_count;
    }

    let err = dlq.retry("m1", &handler).await.unwrap_err();
    assert!(matches!(
        err,
        BusError::RetryLimitExceeded { max_retries: 3, .. }
    ));
    assert_eq!(dlq.get("m1").unwrap().retry_count, 3);

    // a successful handler is refused too once the limit is reached
    assert!(dlq.retry("m1", &ok_handler()).await.is_err());
}

#[tokio::test]
async fn test_retry_all_reports_per_id_outcome() {
    let dlq = DeadLetterQueue::new(10, 1);
    dlq.add(entry("a", "good", DeadLetterReason::HandlerError));
    dlq.add(entry("a", "bad", DeadLetterReason::HandlerError));
    dlq.add(entry("b", "other", DeadLetterReason::HandlerError));

    let handler = handler_fn(|m: Message| async move {
        if m.id == "bad" {
            anyhow::bail!("nope");
        }
        Ok(())
    });

    let results = dlq.retry_all(&handler, Some("a")).await;
    assert_eq!(results.len(), 2);
    assert!(results["good"]);
    assert!(!results["bad"]);
    assert!(dlq.get("other").is_some());
    assert_eq!(dlq.get("bad").unwrap().reason, DeadLetterReason::MaxRetries);

    // "bad" is at its limit now and reports false instead of raising
    let results = dlq.retry_all(&handler, None).await;
    assert!(!results["bad"]);
    assert!(results["other"]);
    assert_eq!(dlq.len(), 1);
}

#[test]
fn test_get_entries_filters_sorts_and_paginates() {
    let dlq = DeadLetterQueue::new(10, 3);
    for (i, (topic, reason)) in [
        ("a", DeadLetterReason::HandlerError),
        ("a", DeadLetterReason::Expired),
        ("b", DeadLetterReason::HandlerError),
        ("a", DeadLetterReason::HandlerError),
    ]
    .into_iter()
    .enumerate()
    {
        let mut e = entry(topic, &format!("m{i}"), reason);
        e.timestamp = Utc::now() + chrono::Duration::seconds(i as i64);
        dlq.add(e);
    }

    let all = dlq.get_entries(None, None, 10, 0);
    let ids: Vec<_> = all.iter().map(|e| e.message_id().to_string()).collect();
    assert_eq!(ids, vec!["m3", "m2", "m1", "m0"]);

    let topic_a = dlq.get_entries(Some("a"), Some(DeadLetterReason::HandlerError), 10, 0);
    let ids: Vec<_> = topic_a.iter().map(|e| e.message_id().to_string()).collect();
    assert_eq!(ids, vec!["m3", "m0"]);

    let page = dlq.get_entries(None, None, 2, 1);
    let ids: Vec<_> = page.iter().map(|e| e.message_id().to_string()).collect();
    assert_eq!(ids, vec!["m2", "m1"]);

    assert!(dlq.get_entries(Some("zzz"), None, 10, 0).is_empty());
}

#[test]
fn test_stats_count_every_reason() {
    let dlq = DeadLetterQueue::new(10, 5);
    dlq.add(entry("a", "m1", DeadLetterReason::HandlerError));
    dlq.add(entry("a", "m2", DeadLetterReason::Unknown));
    dlq.add(entry("b", "m3", DeadLetterReason::Expired));

    let stats = dlq.stats();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.max_size, 10);
    assert_eq!(stats.max_retries, 5);
    assert_eq!(stats.by_reason[&DeadLetterReason::HandlerError], 1);
    assert_eq!(stats.by_reason[&DeadLetterReason::Unknown], 1);
    assert_eq!(stats.by_reason[&DeadLetterReason::MaxRetries], 0);
    assert_eq!(stats.by_reason.len(), DeadLetterReason::ALL.len());
    assert_eq!(stats.by_topic["a"], 2);
    assert_eq!(stats.by_topic["b"], 1);
}

#[test]
fn test_unrecognised_reason_deserializes_as_unknown() {
    let reason: DeadLetterReason = serde_json::from_str("\"POISON_PILL\"").unwrap();
    assert_eq!(reason, DeadLetterReason::Unknown);
    let reason: DeadLetterReason = serde_json::from_str("\"EXPIRED\"").unwrap();
    assert_eq!(reason, DeadLetterReason::Expired);
    assert_eq!(DeadLetterReason::MaxRetries.to_string(), "MAX_RETRIES");
}

fn slow_failing_handler() -> MessageHandler {
    handler_fn(|_m: Message| async {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        anyhow::bail!("still broken")
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_retries_of_one_entry_are_serialized() {
    let dlq = DeadLetterQueue::new(10, 1);
    dlq.add(entry("t", "m1", DeadLetterReason::HandlerError));
    let handler = slow_failing_handler();

    let (a, b) = tokio::join!(dlq.retry("m1", &handler), dlq.retry("m1", &handler));
    let outcomes = [a, b];

    let attempted = outcomes.iter().filter(|r| matches!(r, Ok(false))).count();
    let refused = outcomes
        .iter()
        .filter(|r| matches!(r, Err(BusError::RetryInProgress(id)) if id == "m1"))
        .count();
    assert_eq!(attempted, 1);
    assert_eq!(refused, 1);

    let e = dlq.get("m1").unwrap();
    assert_eq!(e.retry_count, 1);
    assert_eq!(e.reason, DeadLetterReason::MaxRetries);

    // the slot is released once the attempt finishes
    let err = dlq.retry("m1", &handler).await.unwrap_err();
    assert!(matches!(err, BusError::RetryLimitExceeded { max_retries: 1, .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_count_never_exceeds_limit_under_contention() {
    let dlq = Arc::new(DeadLetterQueue::new(10, 3));
    dlq.add(entry("t", "m1", DeadLetterReason::HandlerError));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let dlq = dlq.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..4 {
                let _ = dlq.retry("m1", &slow_failing_handler()).await;
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let e = dlq.get("m1").unwrap();
    assert!(e.retry_count <= 3, "retry_count {} exceeded the limit", e.retry_count);
}

#[tokio::test]
async fn test_cancelled_retry_releases_its_slot() {
    let dlq = DeadLetterQueue::new(10, 3);
    dlq.add(entry("t", "m1", DeadLetterReason::HandlerError));
    let stuck = handler_fn(|_m: Message| async {
        std::future::pending::<()>().await;
        Ok(())
    });

    let timed_out =
        tokio::time::timeout(std::time::Duration::from_millis(20), dlq.retry("m1", &stuck)).await;
    assert!(timed_out.is_err());

    assert!(dlq.retry("m1", &ok_handler()).await.unwrap());
}

//! Message bus tests.
//!
//! These tests verify per-recipient FIFO delivery, request/response
//! correlation, waiter fan-in and broadcast fan-out with concurrent tasks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use conductor::orchestration::{BusConfig, MessageBus, MessageType};
use conductor::Error;

fn bus() -> Arc<MessageBus> {
    Arc::new(MessageBus::new(BusConfig::default()))
}

async fn wait_for_waiters(bus: &MessageBus, agent_id: &str, count: usize) {
    while bus.waiter_count(agent_id) < count {
        tokio::task::yield_now().await;
    }
}

/// Test: FIFO
/// Given messages A then B sent to one recipient
/// When the recipient receives twice
/// Then it gets A first and B second
#[tokio::test]
async fn test_fifo_per_recipient() {
    let bus = bus();
    bus.send_to_agent("coder", "planner", MessageType::Status, json!("A"), None);
    bus.send_to_agent("tester", "planner", MessageType::Status, json!("X"), None);
    bus.send_to_agent("coder", "planner", MessageType::Status, json!("B"), None);

    let first = bus.receive_message("coder", None).await.unwrap();
    let second = bus.receive_message("coder", None).await.unwrap();
    assert_eq!(first.payload, json!("A"));
    assert_eq!(second.payload, json!("B"));
    assert_eq!(bus.pending_count("coder"), 0);
    assert_eq!(bus.pending_count("tester"), 1);
}

/// Test: Receive timeout
/// Given an empty mailbox and no sender
/// When receiving with timeout T
/// Then None is returned no earlier than T
#[tokio::test]
async fn test_receive_timeout_not_early() {
    let bus = bus();
    let timeout = Duration::from_millis(60);
    let start = Instant::now();
    let got = bus.receive_message("idle", Some(timeout)).await;
    let elapsed = start.elapsed();

    assert!(got.is_none());
    assert!(elapsed >= timeout, "returned after {:?}", elapsed);
    assert!(elapsed < timeout + Duration::from_secs(1));
}

/// Test: Timed-out receiver does not swallow later messages
#[tokio::test]
async fn test_message_after_timeout_is_queued() {
    let bus = bus();
    assert!(bus
        .receive_message("coder", Some(Duration::from_millis(10)))
        .await
        .is_none());

    bus.send_status("coder", "planner", json!("late"));
    assert_eq!(bus.pending_count("coder"), 1);
    let message = bus.receive_message("coder", None).await.unwrap();
    assert_eq!(message.payload, json!("late"));
}

/// Test: Receive losing a select
/// Given a receiver racing a shutdown signal inside `tokio::select!`
/// When a message and the signal arrive together and the signal wins
/// Then the message stays queued for the next receive
#[tokio::test]
async fn test_receive_dropped_by_select_keeps_message() {
    let bus = bus();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let worker = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = stop_rx => None,
                message = bus.receive_message("coder", Some(Duration::from_secs(5))) => message,
            }
        })
    };
    wait_for_waiters(&bus, "coder", 1).await;

    bus.send_status("coder", "planner", json!("survives"));
    stop_tx.send(()).unwrap();
    assert!(worker.await.unwrap().is_none());

    assert_eq!(bus.pending_count("coder"), 1);
    assert_eq!(bus.waiter_count("coder"), 0);
    let message = bus.receive_message("coder", None).await.unwrap();
    assert_eq!(message.payload, json!("survives"));
}

/// Test: Idle polling
/// Given a recipient nobody writes to
/// When it is polled many times with short timeouts
/// Then no waiter is left behind and a later message is still delivered
#[tokio::test]
async fn test_idle_polling_leaves_no_waiters() {
    let bus = bus();
    for _ in 0..200 {
        assert!(bus.receive_message("idle", Some(Duration::ZERO)).await.is_none());
    }
    assert_eq!(bus.waiter_count("idle"), 0);
    assert_eq!(bus.pending_count("idle"), 0);

    bus.send_status("idle", "planner", json!("finally"));
    let message = bus.receive_message("idle", None).await.unwrap();
    assert_eq!(message.payload, json!("finally"));
}

/// Test: Multiple waiters
/// Given two receivers parked on the same recipient, in order
/// When two messages arrive
/// Then each receiver gets exactly one, in arrival order
#[tokio::test]
async fn test_multiple_waiters_served_in_order() {
    let bus = bus();

    let first = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move { bus.receive_message("coder", Some(Duration::from_secs(2))).await })
    };
    wait_for_waiters(&bus, "coder", 1).await;
    let second = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move { bus.receive_message("coder", Some(Duration::from_secs(2))).await })
    };
    wait_for_waiters(&bus, "coder", 2).await;

    bus.send_status("coder", "planner", json!("one"));
    bus.send_status("coder", "planner", json!("two"));

    assert_eq!(first.await.unwrap().unwrap().payload, json!("one"));
    assert_eq!(second.await.unwrap().unwrap().payload, json!("two"));
    assert_eq!(bus.pending_count("coder"), 0);
}

/// Test: Duplicate responses
/// Given a pending request
/// When the responder replies twice with the same correlation id
/// Then the requester resolves with the first payload only
#[tokio::test]
async fn test_first_response_wins() {
    let bus = bus();
    let responder = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            let request = bus
                .receive_message("reviewer", Some(Duration::from_secs(2)))
                .await
                .unwrap();
            let cid = request.correlation_id.unwrap();
            bus.send_response(&request.from, "reviewer", cid, json!("first"));
            bus.send_response(&request.from, "reviewer", cid, json!("second"));
        })
    };

    let reply = bus
        .send_request("reviewer", "coder", json!({"pr": 12}), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    responder.await.unwrap();

    assert_eq!(reply, json!("first"));
    assert_eq!(bus.outstanding_requests(), 0);
    // Both replies still land in the requester's mailbox.
    let a = bus.receive_message("coder", None).await.unwrap();
    let b = bus.receive_message("coder", None).await.unwrap();
    assert_eq!(a.payload, json!("first"));
    assert_eq!(b.payload, json!("second"));
    assert_eq!(a.correlation_id, b.correlation_id);
}

/// Test: Request timeout
/// Given no responder
/// When a request times out
/// Then MessageTimeout is returned and no pending entry remains
#[tokio::test]
async fn test_request_timeout() {
    let bus = bus();
    let start = Instant::now();
    let err = bus
        .send_request("absent", "coder", json!({}), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MessageTimeout(_)));
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(bus.outstanding_requests(), 0);
}

/// Test: Interim status then error
/// Given a responder that reports progress before failing
/// Then the requester gets RemoteError and the status stays queued for it
#[tokio::test]
async fn test_status_then_error_reply() {
    let bus = bus();
    {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            let request = bus
                .receive_message("tester", Some(Duration::from_secs(2)))
                .await
                .unwrap();
            bus.send_status(&request.from, "tester", json!({"progress": 50}));
            bus.send_error(
                &request.from,
                "tester",
                request.correlation_id.unwrap(),
                json!("2 tests failed"),
            );
        });
    }

    let err = bus
        .send_request("tester", "coder", json!({}), Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RemoteError(ref msg) if msg == "2 tests failed"));

    let status = bus.receive_message("coder", None).await.unwrap();
    assert_eq!(status.message_type, MessageType::Status);
    assert_eq!(status.payload, json!({"progress": 50}));
}

/// Test: Broadcast fan-out
/// Given two subscribers
/// When a broadcast is published
/// Then both receive it and no mailbox is touched
#[tokio::test]
async fn test_broadcast_fan_out() {
    let bus = bus();
    let mut a = bus.subscribe_broadcasts();
    let mut b = bus.subscribe_broadcasts();

    let id = bus.broadcast("orchestrator", json!({"event": "shutdown"}));

    let got_a = a.recv().await.unwrap();
    let got_b = b.recv().await.unwrap();
    assert_eq!(got_a.id, id);
    assert_eq!(got_b.id, id);
    assert_eq!(got_a.from, "orchestrator");
    assert_eq!(bus.pending_count("orchestrator"), 0);
}

/// Test: Destroy
/// Given a parked receiver
/// When the bus is destroyed
/// Then the receiver returns None promptly and queues are gone
#[tokio::test]
async fn test_destroy_releases_waiters() {
    let bus = bus();
    bus.send_status("tester", "planner", json!(1));
    let waiter = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move { bus.receive_message("coder", Some(Duration::from_secs(10))).await })
    };
    wait_for_waiters(&bus, "coder", 1).await;

    bus.destroy();
    let got = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(got.is_none());
    assert_eq!(bus.pending_count("tester"), 0);
}

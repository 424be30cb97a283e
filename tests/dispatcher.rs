//! Integration tests for the dispatcher, driven by in-process workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use worker_dispatch::context::{TaskProvider, WorkerScope};
use worker_dispatch::{Callback, DispatchError, Dispatcher, OperationId};

/// Workers mirroring the behaviors the dispatcher has to cope with.
fn provider() -> TaskProvider {
    TaskProvider::new()
        // Replies immediately with what it got.
        .worker("no-delay", |mut scope: WorkerScope| async move {
            if let Some(envelope) = scope.recv().await {
                scope.post(envelope.payload)?;
            }
            Ok(())
        })
        // Replies with what it got after a while.
        .worker("delayed", |mut scope: WorkerScope| async move {
            if let Some(envelope) = scope.recv().await {
                tokio::time::sleep(Duration::from_millis(50)).await;
                scope.post(envelope.payload)?;
            }
            Ok(())
        })
        // Signals readiness before replying.
        .worker("announce", |mut scope: WorkerScope| async move {
            scope.ready()?;
            if let Some(envelope) = scope.recv().await {
                scope.post(json!({ "echo": envelope.payload }))?;
            }
            Ok(())
        })
        .worker("error", |_scope: WorkerScope| async {
            Err(DispatchError::Context("Uncaught Error: foo".to_string()))
        })
        .worker("panic", |_scope: WorkerScope| async {
            panic!("boom");
        })
        // Swallows everything.
        .worker("no-response", |mut scope: WorkerScope| async move {
            while scope.recv().await.is_some() {}
            Ok(())
        })
        // Ready, then a tick every 10ms.
        .worker("subscription", |scope: WorkerScope| async move {
            scope.ready()?;
            let mut index = 0;
            while scope.post(json!({ "index": index })).is_ok() {
                index += 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(())
        })
        // Ready, then posts as fast as it is scheduled.
        .worker("flood", |scope: WorkerScope| async move {
            scope.ready()?;
            let mut index = 0;
            while scope.post(json!({ "index": index })).is_ok() {
                index += 1;
                tokio::task::yield_now().await;
            }
            Ok(())
        })
        // Ready, then fails.
        .worker("ready-then-error", |scope: WorkerScope| async move {
            scope.ready()?;
            Err(DispatchError::Context("boom".to_string()))
        })
        // Never signals readiness.
        .worker("quiet", |mut scope: WorkerScope| async move {
            while scope.recv().await.is_some() {}
            Ok(())
        })
        // Ready, then posts back whatever it receives.
        .worker("echo-subscription", |mut scope: WorkerScope| async move {
            scope.ready()?;
            while let Some(envelope) = scope.recv().await {
                scope.post(envelope.payload)?;
            }
            Ok(())
        })
        // Answers each round trip with `index + 1`.
        .worker("increment", |mut scope: WorkerScope| async move {
            scope.ready()?;
            while let Some(envelope) = scope.recv().await {
                let index = envelope.payload["index"].as_i64().unwrap_or_default();
                if let Some(port) = envelope.reply {
                    port.send(json!({ "index": index + 1 }))?;
                }
            }
            Ok(())
        })
        // Collects two round trips and answers them in reverse order.
        .worker("shuffle", |mut scope: WorkerScope| async move {
            scope.ready()?;
            let mut held = Vec::new();
            while let Some(envelope) = scope.recv().await {
                held.push(envelope);
                if held.len() == 2 {
                    while let Some(envelope) = held.pop() {
                        if let Some(port) = envelope.reply {
                            port.send(json!({ "answer": envelope.payload }))?;
                        }
                    }
                }
            }
            Ok(())
        })
        // Posts unsolicited data after opening.
        .worker("chatty", |mut scope: WorkerScope| async move {
            scope.ready()?;
            scope.post(json!({ "hello": scope.name() }))?;
            while scope.recv().await.is_some() {}
            Ok(())
        })
        // Opens fine, fails on the first message.
        .worker("crash-on-message", |mut scope: WorkerScope| async move {
            scope.ready()?;
            let _ = scope.recv().await;
            Err(DispatchError::Context("crashed".to_string()))
        })
}

fn dispatcher() -> Dispatcher {
    Dispatcher::new(provider())
}

/// Callback collecting every payload it sees.
fn recorder() -> (Callback, Arc<Mutex<Vec<Value>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback = Callback::new(move |payload| sink.lock().push(payload));
    (callback, seen)
}

/// Poll `condition` until it holds, failing after a second.
async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

// ============================================================================
// Request / response
// ============================================================================

#[tokio::test]
async fn test_send_to_missing_worker_rejects() {
    let dispatcher = dispatcher();

    let pending = dispatcher.send("fail", json!({})).unwrap();
    assert_eq!(pending.id(), OperationId::DETACHED);
    assert!(matches!(pending.await, Err(DispatchError::Context(m)) if m.contains("fail")));
    assert_eq!(dispatcher.active_operations(), 0);
}

#[tokio::test]
async fn test_send_to_failing_worker_rejects() {
    let dispatcher = dispatcher();

    let pending = dispatcher.send("error", json!({})).unwrap();
    assert_eq!(dispatcher.active_operations(), 1);

    let err = pending.await.unwrap_err();
    assert!(matches!(err, DispatchError::Context(ref m) if m == "Uncaught Error: foo"));
    assert_eq!(err.to_string(), "Context error: Uncaught Error: foo");
    assert_eq!(dispatcher.active_operations(), 0);
}

#[tokio::test]
async fn test_send_to_panicking_worker_rejects() {
    let dispatcher = dispatcher();

    let err = dispatcher.send("panic", json!({})).unwrap().await.unwrap_err();
    assert!(matches!(err, DispatchError::Context(ref m) if m.contains("boom")));
    assert_eq!(dispatcher.active_operations(), 0);
}

#[tokio::test]
async fn test_send_resolves_with_reply() {
    let dispatcher = dispatcher();

    let pending = dispatcher.send("no-delay", json!({ "foo": "foo" })).unwrap();
    assert_eq!(dispatcher.active_operations(), 1);
    assert!(dispatcher.is_active(pending.id()));

    let id = pending.id();
    assert_eq!(pending.await.unwrap(), json!({ "foo": "foo" }));
    assert_eq!(dispatcher.active_operations(), 0);
    assert!(!dispatcher.is_active(id));
}

#[tokio::test]
async fn test_concurrent_sends_settle_independently() {
    let dispatcher = dispatcher();

    let slow = dispatcher.send("delayed", json!({ "foo": "slow" })).unwrap();
    let fast = dispatcher.send("no-delay", json!({ "foo": "fast" })).unwrap();
    assert_eq!(dispatcher.active_operations(), 2);

    assert_eq!(fast.await.unwrap(), json!({ "foo": "fast" }));
    assert_eq!(dispatcher.active_operations(), 1);

    assert_eq!(slow.await.unwrap(), json!({ "foo": "slow" }));
    assert_eq!(dispatcher.active_operations(), 0);
}

#[tokio::test]
async fn test_send_ignores_readiness() {
    let dispatcher = dispatcher();

    let reply = dispatcher.send("announce", json!(1)).unwrap().await.unwrap();
    assert_eq!(reply, json!({ "echo": 1 }));
    assert_eq!(dispatcher.active_operations(), 0);
}

// ============================================================================
// Termination
// ============================================================================

#[tokio::test]
async fn test_terminate_one_of_several() {
    let dispatcher = dispatcher();

    let first = dispatcher.send("no-response", json!({})).unwrap();
    let second = dispatcher.send("no-response", json!({})).unwrap();
    let third = dispatcher.send("no-response", json!({})).unwrap();
    assert_eq!(dispatcher.active_operations(), 3);

    assert!(dispatcher.terminate(second.id()));
    assert_eq!(dispatcher.active_operations(), 2);
    assert!(dispatcher.is_active(first.id()));
    assert!(!dispatcher.is_active(second.id()));
    assert!(dispatcher.is_active(third.id()));
    assert!(matches!(second.await, Err(DispatchError::Terminated)));

    // Give the remaining contexts a chance to misbehave.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(dispatcher.active_operations(), 2);

    assert_eq!(dispatcher.terminate_all(), 2);
    assert!(matches!(first.await, Err(DispatchError::Terminated)));
    assert!(matches!(third.await, Err(DispatchError::Terminated)));
}

#[tokio::test]
async fn test_terminate_all_empties_registry() {
    let dispatcher = dispatcher();
    let callback = Callback::new(|_| {});

    let _request = dispatcher.send("no-response", json!({})).unwrap();
    let _subscription = dispatcher.subscribe("subscription", &callback).unwrap();
    let _channel = dispatcher.open("increment").unwrap();
    assert_eq!(dispatcher.active_operations(), 3);

    assert_eq!(dispatcher.terminate_all(), 3);
    assert_eq!(dispatcher.active_operations(), 0);
}

#[tokio::test]
async fn test_terminate_is_idempotent() {
    let dispatcher = dispatcher();
    assert_eq!(dispatcher.terminate_all(), 0);

    let pending = dispatcher.send("no-response", json!({})).unwrap();
    let id = pending.id();
    assert!(dispatcher.terminate(id));
    assert!(!dispatcher.terminate(id));
    assert_eq!(dispatcher.terminate_all(), 0);

    // A settled operation cannot be terminated either.
    let settled = dispatcher.send("no-delay", json!(1)).unwrap();
    let settled_id = settled.id();
    settled.await.unwrap();
    assert!(!dispatcher.terminate(settled_id));
}

#[tokio::test]
async fn test_terminate_missing_id_terminates_nothing() {
    let dispatcher = dispatcher();

    let rejected = dispatcher.send("fail", json!({})).unwrap();
    let _live = dispatcher.send("no-response", json!({})).unwrap();

    assert!(!dispatcher.terminate(rejected.id()));
    assert_eq!(dispatcher.active_operations(), 1);
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test]
async fn test_subscribe_delivers_in_order() {
    let dispatcher = dispatcher();
    let (callback, seen) = recorder();

    dispatcher
        .subscribe("subscription", &callback)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(dispatcher.active_operations(), 1);

    wait_until(|| seen.lock().len() >= 3).await;

    assert_eq!(
        dispatcher
            .unsubscribe("subscription", Some(&callback))
            .unwrap()
            .await
            .unwrap(),
        1
    );
    assert_eq!(dispatcher.active_operations(), 0);

    let delivered = seen.lock().clone();
    for (i, payload) in delivered.iter().enumerate() {
        assert_eq!(payload, &json!({ "index": i }));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.lock().len(), delivered.len());
}

#[tokio::test]
async fn test_unsubscribe_by_callback_keeps_others() {
    let dispatcher = dispatcher();
    let (first, _) = recorder();
    let (second, second_seen) = recorder();

    dispatcher.subscribe("subscription", &first).unwrap().await.unwrap();
    dispatcher.subscribe("subscription", &second).unwrap().await.unwrap();

    assert_eq!(
        dispatcher
            .unsubscribe("subscription", Some(&first))
            .unwrap()
            .await
            .unwrap(),
        1
    );
    assert_eq!(dispatcher.active_operations(), 1);

    let before = second_seen.lock().len();
    wait_until(|| second_seen.lock().len() > before).await;

    // The same callback cannot be removed twice.
    assert!(matches!(
        dispatcher
            .unsubscribe("subscription", Some(&first))
            .unwrap()
            .await,
        Err(DispatchError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_unsubscribe_by_name_removes_all() {
    let dispatcher = dispatcher();
    let (first, _) = recorder();
    let (second, _) = recorder();
    let (other, _) = recorder();

    dispatcher.subscribe("subscription", &first).unwrap().await.unwrap();
    dispatcher.subscribe("subscription", &second).unwrap().await.unwrap();
    dispatcher.subscribe("echo-subscription", &other).unwrap().await.unwrap();
    let _request = dispatcher.send("no-response", json!({})).unwrap();
    assert_eq!(dispatcher.active_operations(), 4);

    assert_eq!(
        dispatcher
            .unsubscribe("subscription", None)
            .unwrap()
            .await
            .unwrap(),
        2
    );
    assert_eq!(dispatcher.active_operations(), 2);
}

#[tokio::test]
async fn test_unsubscribe_without_match() {
    let dispatcher = dispatcher();

    // Absence is reported through the result, not as a call-site error.
    let pending = dispatcher.unsubscribe("subscription", None).unwrap();
    let err = pending.await.unwrap_err();
    assert!(matches!(err, DispatchError::NotFound { ref name } if name == "subscription"));
    assert_eq!(err.to_string(), "Worker: event does not exist: subscription");

    // A request on the same name is not a subscription.
    let _request = dispatcher.send("no-response", json!({})).unwrap();
    assert!(dispatcher
        .unsubscribe("no-response", None)
        .unwrap()
        .await
        .is_err());
    assert_eq!(dispatcher.active_operations(), 1);
}

#[tokio::test]
async fn test_unsubscribe_before_ready_resolves() {
    let dispatcher = dispatcher();
    let callback = Callback::new(|_| {});

    let pending = dispatcher.subscribe("quiet", &callback).unwrap();
    assert_eq!(
        dispatcher
            .unsubscribe("quiet", Some(&callback))
            .unwrap()
            .await
            .unwrap(),
        1
    );
    assert!(pending.await.is_ok());
}

#[tokio::test]
async fn test_subscribe_with_initial_payload() {
    let dispatcher = dispatcher();
    let (callback, seen) = recorder();

    dispatcher
        .subscribe_with("echo-subscription", json!({ "start": 5 }), &callback)
        .unwrap()
        .await
        .unwrap();

    wait_until(|| !seen.lock().is_empty()).await;
    assert_eq!(seen.lock()[0], json!({ "start": 5 }));
}

#[tokio::test]
async fn test_subscribe_to_failing_worker_rejects() {
    let dispatcher = dispatcher();
    let (callback, seen) = recorder();

    let err = dispatcher
        .subscribe("error", &callback)
        .unwrap()
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Context(ref m) if m == "Uncaught Error: foo"));
    assert_eq!(dispatcher.active_operations(), 0);
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn test_subscription_error_after_ready_tears_down() {
    let dispatcher = dispatcher();
    let (callback, seen) = recorder();

    dispatcher
        .subscribe("ready-then-error", &callback)
        .unwrap()
        .await
        .unwrap();

    wait_until(|| dispatcher.active_operations() == 0).await;
    assert!(seen.lock().is_empty());
    assert!(matches!(
        dispatcher
            .unsubscribe("ready-then-error", Some(&callback))
            .unwrap()
            .await,
        Err(DispatchError::NotFound { .. })
    ));
}

/// Once `unsubscribe` returns, the callback never runs again, even with
/// the pump on another worker thread.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_callback_after_unsubscribe_returns() {
    let dispatcher = dispatcher();

    for _ in 0..50 {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let callback = Callback::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.subscribe("flood", &callback).unwrap().await.unwrap();
        wait_until(|| count.load(Ordering::SeqCst) >= 5).await;

        dispatcher
            .unsubscribe("flood", Some(&callback))
            .unwrap()
            .await
            .unwrap();
        let settled = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), settled);
    }

    assert_eq!(dispatcher.active_operations(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_callback_can_unsubscribe_itself() {
    let dispatcher = dispatcher();
    let count = Arc::new(AtomicUsize::new(0));

    let counter = count.clone();
    let handle = dispatcher.clone();
    let callback = Callback::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = handle.unsubscribe("flood", None);
    });

    dispatcher.subscribe("flood", &callback).unwrap().await.unwrap();
    wait_until(|| dispatcher.active_operations() == 0).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_terminate_stops_callbacks() {
    let dispatcher = dispatcher();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let callback = Callback::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let pending = dispatcher.subscribe("flood", &callback).unwrap();
    let id = pending.id();
    pending.await.unwrap();
    wait_until(|| count.load(Ordering::SeqCst) >= 3).await;

    assert!(dispatcher.terminate(id));
    let settled = count.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(count.load(Ordering::SeqCst), settled);
}

#[tokio::test]
async fn test_subscribe_to_missing_worker_rejects() {
    let dispatcher = dispatcher();
    let callback = Callback::new(|_| {});

    let pending = dispatcher.subscribe("fail", &callback).unwrap();
    assert!(matches!(pending.await, Err(DispatchError::Context(_))));
    assert_eq!(dispatcher.active_operations(), 0);
}

// ============================================================================
// Channels
// ============================================================================

#[tokio::test]
async fn test_channel_round_trips() {
    let dispatcher = dispatcher();

    let channel = dispatcher.open("increment").unwrap().await.unwrap();
    assert_eq!(channel.name(), "increment");
    assert!(channel.is_open());
    assert_eq!(dispatcher.active_operations(), 1);

    let first = channel.send(json!({ "index": 0 })).await.unwrap();
    assert_eq!(first, json!({ "index": 1 }));
    assert_eq!(dispatcher.active_operations(), 1);

    let second = channel.send(json!({ "index": 1 })).await.unwrap();
    assert_eq!(second, json!({ "index": 2 }));
    assert_eq!(dispatcher.active_operations(), 1);
}

#[tokio::test]
async fn test_concurrent_channel_sends_do_not_cross() {
    let dispatcher = dispatcher();
    let channel = dispatcher.open("shuffle").unwrap().await.unwrap();

    let a = channel.send(json!("a"));
    let b = channel.send(json!("b"));
    let (a, b) = tokio::join!(a, b);

    assert_eq!(a.unwrap(), json!({ "answer": "a" }));
    assert_eq!(b.unwrap(), json!({ "answer": "b" }));
}

#[tokio::test]
async fn test_channel_receives_unsolicited_data() {
    let dispatcher = dispatcher();
    let mut channel = dispatcher.open("chatty").unwrap().await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(1), channel.recv())
        .await
        .unwrap();
    assert_eq!(message, Some(json!({ "hello": "chatty" })));
}

#[tokio::test]
async fn test_channel_terminate() {
    let dispatcher = dispatcher();
    let channel = dispatcher.open("increment").unwrap().await.unwrap();

    assert!(channel.terminate());
    assert!(!channel.is_open());
    assert!(!channel.terminate());
    assert_eq!(dispatcher.active_operations(), 0);

    assert!(matches!(
        channel.send(json!({ "index": 0 })).await,
        Err(DispatchError::Terminated)
    ));
}

#[tokio::test]
async fn test_channel_context_failure_closes_channel() {
    let dispatcher = dispatcher();
    let channel = dispatcher.open("crash-on-message").unwrap().await.unwrap();

    assert!(matches!(
        channel.send(json!(1)).await,
        Err(DispatchError::NoReply)
    ));
    wait_until(|| dispatcher.active_operations() == 0).await;
    assert!(!channel.is_open());
}

#[tokio::test]
async fn test_open_terminated_before_ready() {
    let dispatcher = dispatcher();

    let pending = dispatcher.open("quiet").unwrap();
    assert!(dispatcher.terminate(pending.id()));
    assert!(matches!(pending.await, Err(DispatchError::Terminated)));
}

// ============================================================================
// Preconditions
// ============================================================================

#[tokio::test]
async fn test_disabled_dispatcher_fails_fast() {
    let dispatcher = Dispatcher::builder(provider()).enabled(false).build();
    let callback = Callback::new(|_| {});

    assert!(!dispatcher.is_enabled());
    assert!(matches!(
        dispatcher.send("no-delay", json!({})),
        Err(DispatchError::Unavailable)
    ));
    assert!(matches!(
        dispatcher.subscribe("subscription", &callback),
        Err(DispatchError::Unavailable)
    ));
    assert!(matches!(
        dispatcher.open("increment"),
        Err(DispatchError::Unavailable)
    ));
    assert_eq!(dispatcher.active_operations(), 0);
}

#[tokio::test]
async fn test_empty_name_fails_fast() {
    let dispatcher = dispatcher();

    let err = dispatcher.send("", json!({})).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid argument: You must provide the worker name"
    );
    assert!(matches!(
        dispatcher.open(""),
        Err(DispatchError::InvalidArgument(_))
    ));
    assert_eq!(dispatcher.active_operations(), 0);
}

#[tokio::test]
async fn test_clones_share_registry() {
    let dispatcher = dispatcher();
    let clone = dispatcher.clone();

    let pending = clone.send("no-response", json!({})).unwrap();
    assert_eq!(dispatcher.active_operations(), 1);
    assert!(dispatcher.terminate(pending.id()));
    assert_eq!(clone.active_operations(), 0);
}

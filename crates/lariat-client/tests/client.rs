// End-to-end client tests against the in-process broker.
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lariat_client::{Connection, Error, HeaderMap, Options, Status};
use lariat_test_harness::MockBroker;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn connect_to(broker: &MockBroker) -> Connection {
    lariat_client::connect(&broker.url()).await.expect("connect")
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn publish_round_trips_payload() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;

    let sub = conn.subscribe_sync("greetings").await.expect("subscribe");
    conn.publish("greetings", b"hello").expect("publish");
    conn.flush().await.expect("flush");

    let msg = sub.next_msg(Duration::from_secs(1)).await.expect("next");
    assert_eq!(&msg.payload[..], b"hello");
    assert_eq!(msg.subject, "greetings");
    assert_eq!(msg.reply, None);
}

#[tokio::test]
async fn flush_barrier_orders_prior_publishes() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;

    let sub = conn.subscribe_sync("seq").await.expect("subscribe");
    for i in 0..10u8 {
        conn.publish("seq", &[i]).expect("publish");
    }
    conn.flush_timeout(Duration::from_secs(1))
        .await
        .expect("flush");

    // Everything published before the barrier is already enqueued.
    for i in 0..10u8 {
        let msg = sub.next_msg(Duration::from_millis(100)).await.expect("next");
        assert_eq!(&msg.payload[..], &[i]);
    }
}

#[tokio::test]
async fn wildcard_subscription_sees_concrete_subject() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;

    let sub = conn.subscribe_sync("orders.*").await.expect("subscribe");
    conn.publish("orders.eu", b"1").expect("publish");
    conn.flush().await.expect("flush");

    let msg = sub.next_msg(Duration::from_secs(1)).await.expect("next");
    assert_eq!(msg.subject, "orders.eu");
}

#[tokio::test]
async fn headers_survive_the_round_trip() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;

    let sub = conn.subscribe_sync("tagged").await.expect("subscribe");
    let mut headers = HeaderMap::new();
    headers.insert("Content-Type", "application/json");
    headers.append("X-Trace", "a");
    headers.append("X-Trace", "b");
    conn.publish_with_headers("tagged", &headers, b"{}")
        .expect("publish");
    conn.flush().await.expect("flush");

    let msg = sub.next_msg(Duration::from_secs(1)).await.expect("next");
    let got = msg.headers.expect("headers");
    assert_eq!(got.get("content-type"), Some("application/json"));
    assert_eq!(got.get_all("x-trace"), vec!["a", "b"]);
    assert_eq!(&msg.payload[..], b"{}");
}

#[tokio::test]
async fn request_reply_round_trip() {
    let broker = MockBroker::spawn().await.expect("broker");
    let responder = connect_to(&broker).await;
    let requester = connect_to(&broker).await;

    let reply_conn = responder.clone();
    let _service = responder
        .subscribe("svc.echo", move |msg| {
            if let Some(reply) = msg.reply.as_deref() {
                let mut body = b"echo:".to_vec();
                body.extend_from_slice(&msg.payload);
                reply_conn.publish(reply, &body).expect("reply");
            }
        })
        .await
        .expect("subscribe");
    responder.flush().await.expect("flush");

    let msg = requester
        .request("svc.echo", b"ping", Duration::from_secs(2))
        .await
        .expect("request");
    assert_eq!(&msg.payload[..], b"echo:ping");
}

#[tokio::test]
async fn request_without_responders_fails_fast() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;

    let err = conn
        .request("nobody.home", b"?", Duration::from_secs(1))
        .await
        .expect_err("no responders");
    assert_eq!(err, Error::NoResponders);
}

#[tokio::test]
async fn auto_unsubscribe_stops_after_budget() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;

    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let sub = conn
        .subscribe("burst", move |_msg| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .expect("subscribe");
    sub.auto_unsubscribe(1).expect("auto unsubscribe");

    for _ in 0..5 {
        conn.publish("burst", b"x").expect("publish");
    }
    conn.flush().await.expect("flush");

    wait_for("one delivery", || count.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    // The subscription is spent and no longer usable.
    wait_for("subscription invalidated", || !sub.is_valid()).await;
    assert_eq!(
        sub.auto_unsubscribe(3).expect_err("spent"),
        Error::BadSubscription
    );
}

#[tokio::test]
async fn full_mailbox_flags_slow_consumer() {
    let broker = MockBroker::spawn().await.expect("broker");
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    let conn = Options::new()
        .mailbox_capacity(1)
        .on_error(move |_conn, sub, err| {
            let subject = sub.map(|s| s.subject().to_string());
            let _ = err_tx.send((subject, err.clone()));
        })
        .connect(&broker.url())
        .await
        .expect("connect");

    let sub = conn.subscribe_sync("flood").await.expect("subscribe");
    conn.publish("flood", b"first").expect("publish");
    conn.publish("flood", b"dropped").expect("publish");
    conn.flush().await.expect("flush");

    let (subject, err) = timeout(Duration::from_secs(1), err_rx.recv())
        .await
        .expect("async error in time")
        .expect("async error");
    assert_eq!(subject.as_deref(), Some("flood"));
    assert_eq!(err, Error::SlowConsumer);

    // The sync consumer observes the condition once, then resumes.
    let err = sub
        .next_msg(Duration::from_millis(100))
        .await
        .expect_err("slow consumer");
    assert_eq!(err, Error::SlowConsumer);
    let msg = sub.next_msg(Duration::from_secs(1)).await.expect("first");
    assert_eq!(&msg.payload[..], b"first");
}

#[tokio::test]
async fn drain_delivers_everything_already_enqueued() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;

    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let sub = conn
        .subscribe("firehose", move |_msg| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .expect("subscribe");
    for _ in 0..100 {
        conn.publish("firehose", b"x").expect("publish");
    }

    timeout(Duration::from_secs(2), sub.drain())
        .await
        .expect("drain in time")
        .expect("drain");
    assert_eq!(count.load(Ordering::SeqCst), 100);
    assert!(!sub.is_valid());
}

#[tokio::test]
async fn queue_group_delivers_to_one_member() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;

    let a = conn
        .queue_subscribe_sync("jobs", "workers")
        .await
        .expect("subscribe a");
    let b = conn
        .queue_subscribe_sync("jobs", "workers")
        .await
        .expect("subscribe b");
    conn.publish("jobs", b"task").expect("publish");
    conn.flush().await.expect("flush");

    let got_a = a.next_msg(Duration::from_millis(100)).await.is_ok();
    let got_b = b.next_msg(Duration::from_millis(100)).await.is_ok();
    assert!(got_a ^ got_b, "exactly one group member receives");
}

#[tokio::test]
async fn distinct_queue_groups_each_receive() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;

    let mut subs = Vec::new();
    for i in 0..5 {
        let group = format!("q-{i}");
        subs.push(
            conn.queue_subscribe_sync("fanout", &group)
                .await
                .expect("subscribe"),
        );
    }
    conn.publish("fanout", b"x").expect("publish");
    conn.flush().await.expect("flush");

    for sub in &subs {
        sub.next_msg(Duration::from_secs(1)).await.expect("delivery");
    }
}

#[tokio::test]
async fn close_releases_blocked_callers() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;
    let sub = conn.subscribe_sync("idle").await.expect("subscribe");

    let waiter = tokio::spawn({
        let sub = sub.clone();
        async move { sub.next_msg(Duration::from_secs(10)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.close();

    let result = timeout(Duration::from_secs(1), waiter)
        .await
        .expect("released in time")
        .expect("join");
    assert_eq!(result.expect_err("closed"), Error::ConnectionClosed);
    assert_eq!(
        conn.flush().await.expect_err("closed"),
        Error::ConnectionClosed
    );
    assert_eq!(conn.status(), Status::Closed);
}

#[tokio::test]
async fn unsubscribe_invalidates_the_handle() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;

    let sub = conn.subscribe_sync("once").await.expect("subscribe");
    conn.publish("once", b"1").expect("publish");
    conn.flush().await.expect("flush");
    sub.next_msg(Duration::from_secs(1)).await.expect("next");

    sub.unsubscribe().expect("unsubscribe");
    assert_eq!(
        sub.unsubscribe().expect_err("already unsubscribed"),
        Error::BadSubscription
    );
    conn.publish("once", b"2").expect("publish");
    conn.flush().await.expect("flush");
    assert_eq!(
        sub.next_msg(Duration::from_millis(100))
            .await
            .expect_err("closed mailbox"),
        Error::BadSubscription
    );
}

#[tokio::test]
async fn reconnect_replays_subscriptions_with_remaining_budget() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = Options::new()
        .reconnect_wait(Duration::from_millis(50))
        .max_reconnect(100)
        .connect(&broker.url())
        .await
        .expect("connect");

    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let sub = conn
        .subscribe("feed", move |_msg| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .expect("subscribe");
    sub.auto_unsubscribe(10).expect("auto unsubscribe");

    for _ in 0..3 {
        conn.publish("feed", b"x").expect("publish");
    }
    conn.flush().await.expect("flush");
    wait_for("first three deliveries", || count.load(Ordering::SeqCst) == 3).await;

    broker.drop_clients();
    wait_for("reconnect", || {
        conn.stats().reconnects >= 1 && conn.status() == Status::Connected
    })
    .await;

    // The replayed budget is max minus the three already delivered.
    for _ in 0..10 {
        conn.publish("feed", b"y").expect("publish");
    }
    conn.flush().await.expect("flush");
    wait_for("remaining budget delivered", || {
        count.load(Ordering::SeqCst) == 10
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn publishes_during_reconnect_land_after_replay() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = Options::new()
        .reconnect_wait(Duration::from_millis(50))
        .max_reconnect(200)
        .connect(&broker.url())
        .await
        .expect("connect");

    let sub = conn.subscribe_sync("mailbox").await.expect("subscribe");
    conn.flush().await.expect("flush");

    broker.stop_listening();
    broker.drop_clients();
    wait_for("reconnecting state", || {
        conn.status() == Status::Reconnecting
    })
    .await;

    // Buffered while disconnected, bounded by the pending cap.
    conn.publish("mailbox", b"while-down").expect("publish");

    broker.resume_listening().await.expect("resume");
    wait_for("reconnected", || conn.status() == Status::Connected).await;
    conn.flush().await.expect("flush");

    let msg = sub.next_msg(Duration::from_secs(1)).await.expect("next");
    assert_eq!(&msg.payload[..], b"while-down");
    assert_eq!(conn.stats().reconnects, 1);
}

#[tokio::test]
async fn exhausted_reconnect_closes_the_connection() {
    let broker = MockBroker::spawn().await.expect("broker");
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let conn = Options::new()
        .reconnect_wait(Duration::from_millis(10))
        .max_reconnect(2)
        .on_closed(move |_conn| {
            let _ = closed_tx.send(());
        })
        .connect(&broker.url())
        .await
        .expect("connect");

    broker.stop_listening();
    broker.drop_clients();

    timeout(Duration::from_secs(5), closed_rx.recv())
        .await
        .expect("closed callback in time")
        .expect("closed callback");
    assert_eq!(conn.status(), Status::Closed);
    assert!(conn.last_error().is_some());
}

#[tokio::test]
async fn oversized_payload_fails_before_the_wire() {
    let broker = MockBroker::spawn_with(lariat_test_harness::BrokerConfig { max_payload: 16 })
        .await
        .expect("broker");
    let conn = connect_to(&broker).await;

    let err = conn
        .publish("big", &[0u8; 17])
        .expect_err("payload too large");
    assert_eq!(err, Error::MaxPayload);
    assert_eq!(conn.stats().out_msgs, 0);

    conn.publish("small", &[0u8; 16]).expect("at the limit");
}

#[tokio::test]
async fn invalid_subjects_and_queues_are_rejected() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;

    assert!(matches!(
        conn.publish("foo..bar", b"x").expect_err("bad subject"),
        Error::BadSubject(_)
    ));
    assert!(matches!(
        conn.subscribe_sync("").await.expect_err("empty subject"),
        Error::BadSubject(_)
    ));
    assert!(matches!(
        conn.queue_subscribe_sync("ok", "has space")
            .await
            .expect_err("bad queue"),
        Error::BadQueueName(_)
    ));
}

#[tokio::test]
async fn connection_drain_flushes_and_closes() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;

    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    conn.subscribe("work", move |_msg| {
        seen.fetch_add(1, Ordering::SeqCst);
    })
    .await
    .expect("subscribe");
    for _ in 0..5 {
        conn.publish("work", b"x").expect("publish");
    }

    timeout(Duration::from_secs(2), conn.drain())
        .await
        .expect("drain in time")
        .expect("drain");
    assert_eq!(count.load(Ordering::SeqCst), 5);
    assert_eq!(conn.status(), Status::Closed);
    assert_eq!(
        conn.publish("work", b"late").expect_err("closed"),
        Error::ConnectionClosed
    );
}

#[tokio::test]
async fn next_msg_times_out_without_traffic() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;
    let sub = conn.subscribe_sync("quiet").await.expect("subscribe");
    assert_eq!(
        sub.next_msg(Duration::from_millis(50))
            .await
            .expect_err("timeout"),
        Error::Timeout
    );
}

#[tokio::test]
async fn sync_pull_on_async_subscription_is_illegal() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;
    let sub = conn.subscribe("cbs", |_msg| {}).await.expect("subscribe");
    assert_eq!(
        sub.next_msg(Duration::from_millis(50))
            .await
            .expect_err("wrong type"),
        Error::TypeSubscription
    );
}

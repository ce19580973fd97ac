// End-to-end service framework tests against the in-process broker.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lariat_client::Connection;
use lariat_service::{
    EndpointConfig, Error, InfoResponse, PingResponse, STATS_RESPONSE_TYPE, ServiceConfig,
    StatsResponse, Verb, add_service, control_subject,
};
use lariat_test_harness::MockBroker;
use tokio::time::timeout;

async fn connect_to(broker: &MockBroker) -> Connection {
    lariat_client::connect(&broker.url()).await.expect("connect")
}

fn echo_endpoint(name: &str, subject: &str) -> EndpointConfig {
    EndpointConfig::new(name, |req| {
        let body = req.data().to_vec();
        let _ = req.respond(&body);
    })
    .subject(subject)
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
async fn monitoring_endpoints_respond() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;
    let requester = connect_to(&broker).await;

    let service = add_service(
        &conn,
        ServiceConfig::new("calc", "1.2.3")
            .description("adds things together")
            .endpoint(echo_endpoint("add", "calc.add")),
    )
    .await
    .expect("service");
    conn.flush().await.expect("flush");

    // All three subject forms answer PING.
    for subject in [
        control_subject(Verb::Ping, None, None).expect("subject"),
        control_subject(Verb::Ping, Some("calc"), None).expect("subject"),
        control_subject(Verb::Ping, Some("calc"), Some(service.id())).expect("subject"),
    ] {
        let reply = requester
            .request(&subject, b"", Duration::from_secs(1))
            .await
            .expect("ping reply");
        let ping: PingResponse = serde_json::from_slice(&reply.payload).expect("ping json");
        assert_eq!(ping.kind, "io.nats.micro.v1.ping_response");
        assert_eq!(ping.name, "calc");
        assert_eq!(ping.version, "1.2.3");
        assert_eq!(ping.id, service.id());
    }

    let subject = control_subject(Verb::Info, Some("calc"), None).expect("subject");
    let reply = requester
        .request(&subject, b"", Duration::from_secs(1))
        .await
        .expect("info reply");
    let info: InfoResponse = serde_json::from_slice(&reply.payload).expect("info json");
    assert_eq!(info.description, "adds things together");
    assert_eq!(info.endpoints.len(), 1);
    assert_eq!(info.endpoints[0].subject, "calc.add");
    assert_eq!(info.endpoints[0].queue_group, "q");

    let subject = control_subject(Verb::Stats, Some("calc"), None).expect("subject");
    let reply = requester
        .request(&subject, b"", Duration::from_secs(1))
        .await
        .expect("stats reply");
    let stats: StatsResponse = serde_json::from_slice(&reply.payload).expect("stats json");
    assert_eq!(stats.kind, STATS_RESPONSE_TYPE);
    assert_eq!(stats.endpoints.len(), 1);
    assert_eq!(stats.endpoints[0].num_requests, 0);
}

#[tokio::test]
async fn requests_update_stats_and_reset_zeroes_them() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;
    let requester = connect_to(&broker).await;

    let service = add_service(
        &conn,
        ServiceConfig::new("timer", "0.1.0").endpoint(EndpointConfig::new("tick", |req| {
            std::thread::sleep(Duration::from_millis(2));
            let _ = req.respond(b"tock");
        })),
    )
    .await
    .expect("service");
    conn.flush().await.expect("flush");

    for _ in 0..5 {
        let reply = requester
            .request("tick", b"", Duration::from_secs(1))
            .await
            .expect("reply");
        assert_eq!(&reply.payload[..], b"tock");
    }

    let stats = service.stats();
    assert_eq!(stats.endpoints[0].num_requests, 5);
    assert!(stats.endpoints[0].processing_time > 0);
    assert!(stats.endpoints[0].average_processing_time > 0);
    assert_eq!(stats.endpoints[0].num_errors, 0);

    service.reset();
    let stats = service.stats();
    assert_eq!(stats.endpoints[0].num_requests, 0);
    assert_eq!(stats.endpoints[0].processing_time, 0);
    assert_eq!(stats.endpoints[0].average_processing_time, 0);
}

#[tokio::test]
async fn stats_aggregate_across_instances() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;
    let requester = connect_to(&broker).await;

    let mut services = Vec::new();
    for _ in 0..5 {
        services.push(
            add_service(
                &conn,
                ServiceConfig::new("calc", "0.1.0").endpoint(echo_endpoint("add", "calc.add")),
            )
            .await
            .expect("service"),
        );
    }
    conn.flush().await.expect("flush");

    for _ in 0..50 {
        requester
            .request("calc.add", b"{\"x\":1}", Duration::from_secs(1))
            .await
            .expect("reply");
    }

    // Every instance answers the name-scoped STATS subject.
    let inbox = lariat_client::new_inbox();
    let stats_sub = requester.subscribe_sync(&inbox).await.expect("subscribe");
    let subject = control_subject(Verb::Stats, Some("calc"), None).expect("subject");
    requester
        .publish_with_reply(&subject, &inbox, b"")
        .expect("publish");
    requester.flush().await.expect("flush");

    let mut replies = 0;
    let mut total_requests = 0;
    while let Ok(msg) = stats_sub.next_msg(Duration::from_millis(250)).await {
        let stats: StatsResponse = serde_json::from_slice(&msg.payload).expect("stats json");
        total_requests += stats.endpoints[0].num_requests;
        replies += 1;
    }
    assert_eq!(replies, 5);
    assert_eq!(total_requests, 50);
}

#[tokio::test]
async fn distinct_queue_groups_fan_out_across_services() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;
    let requester = connect_to(&broker).await;

    let mut services = Vec::new();
    for i in 0..5 {
        services.push(
            add_service(
                &conn,
                ServiceConfig::new("fan", "0.1.0")
                    .queue_group(format!("q-{i}"))
                    .endpoint(echo_endpoint("echo", "fan.echo")),
            )
            .await
            .expect("service"),
        );
    }
    conn.flush().await.expect("flush");

    let inbox = lariat_client::new_inbox();
    let replies_sub = requester.subscribe_sync(&inbox).await.expect("subscribe");
    requester
        .publish_with_reply("fan.echo", &inbox, b"go")
        .expect("publish");
    requester.flush().await.expect("flush");

    // One reply per queue group, and nothing after the fifth.
    for _ in 0..5 {
        replies_sub
            .next_msg(Duration::from_secs(1))
            .await
            .expect("reply");
    }
    assert!(
        replies_sub
            .next_msg(Duration::from_millis(100))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn groups_join_prefixes_and_inherit_queue_groups() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;
    let requester = connect_to(&broker).await;

    let service = add_service(&conn, ServiceConfig::new("svc", "0.1.0"))
        .await
        .expect("service");
    let v1 = service.add_group("v1", None);
    let math = v1.add_group("math", None);
    math.add_endpoint(echo_endpoint("add", "add"))
        .await
        .expect("endpoint");

    let fast = service.add_group("ops", Some("fast"));
    fast.add_endpoint(EndpointConfig::new("status", |req| {
        let _ = req.respond(b"ok");
    }))
    .await
    .expect("endpoint");
    conn.flush().await.expect("flush");

    let reply = requester
        .request("v1.math.add", b"2+2", Duration::from_secs(1))
        .await
        .expect("reply");
    assert_eq!(&reply.payload[..], b"2+2");

    let info = service.info();
    let add = info
        .endpoints
        .iter()
        .find(|e| e.name == "add")
        .expect("add endpoint");
    assert_eq!(add.subject, "v1.math.add");
    assert_eq!(add.queue_group, "q");
    let status = info
        .endpoints
        .iter()
        .find(|e| e.name == "status")
        .expect("status endpoint");
    assert_eq!(status.subject, "ops.status");
    assert_eq!(status.queue_group, "fast");
}

#[tokio::test]
async fn config_validation_rejects_bad_input() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;

    let cases = [
        ServiceConfig::new("bad name!", "0.1.0"),
        ServiceConfig::new("ok", "not-a-version"),
        ServiceConfig::new("ok", "0.1.0").queue_group("has space"),
        ServiceConfig::new("ok", "0.1.0").endpoint(echo_endpoint("add", "foo..bar")),
        ServiceConfig::new("ok", "0.1.0").endpoint(echo_endpoint("bad.name", "fine")),
    ];
    for config in cases {
        assert!(matches!(
            add_service(&conn, config).await.expect_err("invalid"),
            Error::ConfigValidation(_)
        ));
    }

    let service = add_service(
        &conn,
        ServiceConfig::new("dup", "0.1.0").endpoint(echo_endpoint("add", "dup.add")),
    )
    .await
    .expect("service");
    assert!(matches!(
        service
            .add_endpoint(echo_endpoint("add", "dup.other"))
            .await
            .expect_err("duplicate"),
        Error::ConfigValidation(_)
    ));
}

#[tokio::test]
async fn error_replies_carry_reserved_headers() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;
    let requester = connect_to(&broker).await;

    let service = add_service(
        &conn,
        ServiceConfig::new("faulty", "0.1.0").endpoint(EndpointConfig::new("boom", |req| {
            let _ = req.error("500", "kaboom", Some(b"details"));
        })),
    )
    .await
    .expect("service");
    conn.flush().await.expect("flush");

    let reply = requester
        .request("boom", b"", Duration::from_secs(1))
        .await
        .expect("error reply");
    let headers = reply.headers.expect("headers");
    assert_eq!(headers.get("Nats-Service-Error"), Some("kaboom"));
    assert_eq!(headers.get("Nats-Service-Error-Code"), Some("500"));
    assert_eq!(&reply.payload[..], b"details");

    let stats = service.stats();
    assert_eq!(stats.endpoints[0].num_requests, 1);
    assert_eq!(stats.endpoints[0].num_errors, 1);
    assert_eq!(stats.endpoints[0].last_error, "500:kaboom");
}

#[tokio::test]
async fn respond_without_reply_subject_counts_as_error() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;

    let service = add_service(
        &conn,
        ServiceConfig::new("deaf", "0.1.0").endpoint(EndpointConfig::new("sink", |req| {
            assert!(matches!(req.respond(b"lost"), Err(Error::Respond)));
        })),
    )
    .await
    .expect("service");
    conn.flush().await.expect("flush");

    // A plain publish has no reply subject to respond on.
    conn.publish("sink", b"fire-and-forget").expect("publish");
    conn.flush().await.expect("flush");

    wait_for("error recorded", || {
        service.stats().endpoints[0].num_errors == 1
    })
    .await;
    assert_eq!(service.stats().endpoints[0].num_requests, 1);
}

#[tokio::test]
async fn error_requires_code_and_description() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;
    let requester = connect_to(&broker).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    add_service(
        &conn,
        ServiceConfig::new("strict", "0.1.0").endpoint(EndpointConfig::new("check", move |req| {
            let no_code = matches!(req.error("", "desc", None), Err(Error::ArgRequired(_)));
            let no_desc = matches!(req.error("500", "", None), Err(Error::ArgRequired(_)));
            let _ = tx.send(no_code && no_desc);
            let _ = req.respond(b"done");
        })),
    )
    .await
    .expect("service");
    conn.flush().await.expect("flush");

    requester
        .request("check", b"", Duration::from_secs(1))
        .await
        .expect("reply");
    let both_rejected = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("handler ran")
        .expect("handler result");
    assert!(both_rejected);
}

#[tokio::test]
async fn respond_json_serializes_the_value() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;
    let requester = connect_to(&broker).await;

    add_service(
        &conn,
        ServiceConfig::new("jsonic", "0.1.0").endpoint(EndpointConfig::new("sum", |req| {
            let mut result = HashMap::new();
            result.insert("sum", 42);
            let _ = req.respond_json(&result);
        })),
    )
    .await
    .expect("service");
    conn.flush().await.expect("flush");

    let reply = requester
        .request("sum", b"", Duration::from_secs(1))
        .await
        .expect("reply");
    let parsed: HashMap<String, i64> = serde_json::from_slice(&reply.payload).expect("json");
    assert_eq!(parsed.get("sum"), Some(&42));
}

#[tokio::test]
async fn stop_drains_and_fires_done_once() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;
    let requester = connect_to(&broker).await;

    let done_count = Arc::new(AtomicUsize::new(0));
    let done_seen = Arc::clone(&done_count);
    let service = add_service(
        &conn,
        ServiceConfig::new("stoppable", "0.1.0")
            .endpoint(echo_endpoint("echo", "stoppable.echo"))
            .done_handler(move |_service| {
                done_seen.fetch_add(1, Ordering::SeqCst);
            }),
    )
    .await
    .expect("service");
    conn.flush().await.expect("flush");

    requester
        .request("stoppable.echo", b"hi", Duration::from_secs(1))
        .await
        .expect("reply");

    service.stop().await.expect("stop");
    assert!(service.stopped());
    assert_eq!(done_count.load(Ordering::SeqCst), 1);

    // Idempotent: no second done invocation.
    service.stop().await.expect("stop again");
    assert_eq!(done_count.load(Ordering::SeqCst), 1);

    // Interest is gone; requests find no responders.
    requester.flush().await.expect("flush");
    assert_eq!(
        requester
            .request("stoppable.echo", b"hi", Duration::from_secs(1))
            .await
            .expect_err("stopped"),
        lariat_client::Error::NoResponders
    );
}

#[tokio::test]
async fn stats_handler_attaches_custom_data() {
    let broker = MockBroker::spawn().await.expect("broker");
    let conn = connect_to(&broker).await;

    let service = add_service(
        &conn,
        ServiceConfig::new("custom", "0.1.0")
            .endpoint(echo_endpoint("echo", "custom.echo"))
            .stats_handler(|endpoint| {
                serde_json::json!({ "endpoint": endpoint.name(), "shards": 4 })
            }),
    )
    .await
    .expect("service");

    let stats = service.stats();
    let data = stats.endpoints[0].data.as_ref().expect("custom data");
    assert_eq!(data["endpoint"], "echo");
    assert_eq!(data["shards"], 4);
}

//! Pub/sub and service demo binary.
//!
//! # Purpose
//! Demonstrates the end-to-end flow for broker boot, subscribe, publish,
//! request/reply, and service monitoring against the in-process broker.
//!
//! # Notes
//! This is a developer-facing demo; it favors clarity over performance.
use std::time::Duration;

use anyhow::{Context, Result};
use lariat_client::Options;
use lariat_service::{EndpointConfig, ServiceConfig, Verb, add_service, control_subject};
use lariat_test_harness::MockBroker;
use tracing_subscriber::EnvFilter;

async fn run_demo() -> Result<()> {
    println!("== Lariat Pub/Sub Demo ==");
    println!("Goal: demonstrate publish/subscribe, request/reply, and service monitoring.");

    println!("Step 1/6: booting in-process broker.");
    let broker = MockBroker::spawn().await.context("spawn broker")?;
    println!("Broker listening on {}", broker.url());

    println!("Step 2/6: connecting client.");
    let conn = Options::new()
        .name("pubsub-demo")
        .connect(&broker.url())
        .await
        .context("connect")?;

    println!("Step 3/6: subscribing and publishing two messages.");
    let sub = conn.subscribe_sync("demo.updates").await.context("subscribe")?;
    conn.publish("demo.updates", b"hello").context("publish")?;
    conn.publish("demo.updates", b"world").context("publish")?;
    conn.flush().await.context("flush")?;
    for _ in 0..2 {
        let msg = sub
            .next_msg(Duration::from_secs(1))
            .await
            .context("receive")?;
        println!(
            "Message on {}: {}",
            msg.subject,
            String::from_utf8_lossy(&msg.payload)
        );
    }

    println!("Step 4/6: starting the adder service.");
    let service = add_service(
        &conn,
        ServiceConfig::new("adder", "0.1.0")
            .description("Adds whitespace-separated integers")
            .endpoint(EndpointConfig::new("sum", |req| {
                let total: i64 = String::from_utf8_lossy(req.data())
                    .split_ascii_whitespace()
                    .filter_map(|tok| tok.parse::<i64>().ok())
                    .sum();
                let _ = req.respond(total.to_string().as_bytes());
            })),
    )
    .await
    .context("add service")?;
    conn.flush().await.context("flush")?;

    println!("Step 5/6: request/reply and monitoring.");
    let reply = conn
        .request("sum", b"19 23", Duration::from_secs(1))
        .await
        .context("request")?;
    println!("19 + 23 = {}", String::from_utf8_lossy(&reply.payload));

    let ping_subject = control_subject(Verb::Ping, Some("adder"), None)?;
    let pong = conn
        .request(&ping_subject, b"", Duration::from_secs(1))
        .await
        .context("service ping")?;
    println!("Service ping: {}", String::from_utf8_lossy(&pong.payload));
    let stats = service.stats();
    println!(
        "Endpoint {} handled {} requests",
        stats.endpoints[0].name, stats.endpoints[0].num_requests
    );

    println!("Step 6/6: shutting down.");
    service.stop().await.context("stop service")?;
    conn.drain().await.context("drain")?;
    println!("Demo complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    run_demo().await
}

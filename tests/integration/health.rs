use crate::*;

use forwarder_api::{ApiState, HealthServer, StatusResponse};
use forwarder_core::memory::{MemorySink, MemorySource};
use forwarder_core::{ForwardStats, HealthState, Resources, Shutdown, Signal, ExitReason};

async fn serve() -> (HealthServer, HealthState, ForwardStats, String) {
    let health = HealthState::new();
    let stats = ForwardStats::new();
    let state = ApiState {
        health: health.clone(),
        stats: stats.clone(),
    };
    let server = HealthServer::bind("127.0.0.1", 0, state, Shutdown::new())
        .await
        .unwrap();
    let base = format!("http://{}", server.local_addr());
    (server, health, stats, base)
}

#[tokio::test]
async fn healthz_reports_fail_until_ready() {
    let (_server, health, _, base) = serve().await;

    let resp = reqwest::get(format!("{base}/healthz")).await.unwrap();
    assert_eq!(resp.status().as_u16(), 503);
    assert_eq!(resp.text().await.unwrap(), "FAIL");

    health.set_ready(true);
    let resp = reqwest::get(format!("{base}/healthz")).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn status_exposes_counters() {
    let (_server, health, stats, base) = serve().await;
    health.set_ready(true);
    for _ in 0..5 {
        stats.record();
    }

    let status: StatusResponse = reqwest::get(format!("{base}/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        status,
        StatusResponse {
            ready: true,
            forwarded_total: 5,
        }
    );
}

#[tokio::test]
async fn drain_fails_health_and_closes_the_listener() {
    let (server, health, _, base) = serve().await;
    health.set_ready(true);
    let addr = server.local_addr();

    let shutdown = Shutdown::new();
    shutdown.trigger(ExitReason::Signal(Signal::Terminate));
    let mut resources: Resources<MemorySource, MemorySink, HealthServer> = Resources {
        source: None,
        sink: None,
        endpoint: Some(server),
    };
    assert_eq!(shutdown.drain(&health, &mut resources).await, Some(143));

    assert!(!health.is_ready());
    assert!(reqwest::get(format!("{base}/healthz")).await.is_err());
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

//! End-to-end tests against live Postgres and NATS.
//!
//! Run with:
//!   DATABASE_URL=postgres://... NATS_URL=nats://... \
//!   cargo test -p fleet-server -- --ignored

use std::net::SocketAddr;
use std::time::Duration;

use fleet_common::api::{IngestResponse, RegisterRequest, RegisterResponse};
use fleet_common::types::{Capability, TelemetryEnvelope};
use fleet_server::config::ServerConfig;
use fleet_server::ingest::LogPublisher;
use fleet_server::routes::build_router;
use fleet_server::state::AppState;
use uuid::Uuid;

struct TestServer {
    base_url: String,
    client: reqwest::Client,
}

async fn start_server() -> TestServer {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL required for integration tests");
    let nats_url = std::env::var("NATS_URL").expect("NATS_URL required for integration tests");

    let mut vars = std::collections::HashMap::new();
    vars.insert("DATABASE_URL".to_string(), database_url.clone());
    vars.insert("NATS_URL".to_string(), nats_url.clone());
    vars.insert("ADMIN_TOKEN".to_string(), "integration-admin".to_string());
    let config = ServerConfig::from_map(&vars).expect("config");

    let pool = fleet_server::db::connect_and_migrate(&database_url)
        .await
        .expect("database");
    let log = LogPublisher::connect(&nats_url).await.expect("nats");
    let state = AppState::new(config, pool, log);

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    fleet_server::workers::spawn_all(&state, shutdown_rx);
    std::mem::forget(_shutdown_tx);

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });

    TestServer {
        base_url: format!("http://{addr}"),
        client: fleet_common::http::build_client(),
    }
}

async fn register_device(server: &TestServer) -> (Uuid, String) {
    let device_id = Uuid::new_v4();
    let request = RegisterRequest {
        device_id,
        hostname: "it-host-01".to_string(),
        capabilities: vec![
            Capability {
                name: "os.info".to_string(),
                version: "1.0".to_string(),
            },
            Capability {
                name: "cpu.utilization".to_string(),
                version: "1.0".to_string(),
            },
        ],
        agent_version: "0.3.0".to_string(),
    };

    let resp = server
        .client
        .post(format!("{}/v1/agents/register", server.base_url))
        .json(&request)
        .send()
        .await
        .expect("register");
    assert!(resp.status().is_success());

    let body: RegisterResponse = resp.json().await.expect("register body");
    (device_id, body.auth_token.expect("token"))
}

fn envelope(device_id: Uuid, seq: i64) -> TelemetryEnvelope {
    let mut metrics = serde_json::Map::new();
    metrics.insert(
        "cpu.utilization".to_string(),
        serde_json::json!({"cpu_percent": 12.0}),
    );
    TelemetryEnvelope {
        device_id,
        agent_version: "0.3.0".to_string(),
        collected_at: chrono::Utc::now(),
        seq,
        metrics,
        tags: None,
    }
}

#[tokio::test]
#[ignore = "requires live postgres and nats"]
async fn register_ingest_and_materialize() {
    let server = start_server().await;
    let (device_id, token) = register_device(&server).await;

    let resp = server
        .client
        .post(format!(
            "{}/v1/agents/{device_id}/inventory",
            server.base_url
        ))
        .bearer_auth(&token)
        .json(&envelope(device_id, 1))
        .send()
        .await
        .expect("ingest");
    assert_eq!(resp.status().as_u16(), 202);
    let accepted: IngestResponse = resp.json().await.expect("body");
    assert_eq!(accepted.status, "accepted");

    // The telemetry writer materializes asynchronously.
    tokio::time::sleep(Duration::from_secs(7)).await;

    let resp = server
        .client
        .get(format!(
            "{}/v1/devices/{device_id}/telemetry",
            server.base_url
        ))
        .bearer_auth("integration-admin")
        .send()
        .await
        .expect("telemetry");
    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().await.expect("json");
    assert!(body["latest"].is_object(), "latest row missing: {body}");
    assert_eq!(body["history"].as_array().expect("history").len(), 1);
}

#[tokio::test]
#[ignore = "requires live postgres and nats"]
async fn replayed_envelope_does_not_duplicate() {
    let server = start_server().await;
    let (device_id, token) = register_device(&server).await;

    let payload = envelope(device_id, 42);
    for _ in 0..2 {
        let resp = server
            .client
            .post(format!(
                "{}/v1/agents/{device_id}/inventory",
                server.base_url
            ))
            .bearer_auth(&token)
            .json(&payload)
            .send()
            .await
            .expect("ingest");
        assert_eq!(resp.status().as_u16(), 202);
    }
    tokio::time::sleep(Duration::from_secs(7)).await;

    let resp = server
        .client
        .get(format!(
            "{}/v1/devices/{device_id}/telemetry",
            server.base_url
        ))
        .bearer_auth("integration-admin")
        .send()
        .await
        .expect("telemetry");
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["history"].as_array().expect("history").len(), 1);
}

#[tokio::test]
#[ignore = "requires live postgres and nats"]
async fn invalid_envelopes_are_rejected() {
    let server = start_server().await;
    let (device_id, token) = register_device(&server).await;
    let url = format!("{}/v1/agents/{device_id}/inventory", server.base_url);

    // Device id mismatch.
    let resp = server
        .client
        .post(&url)
        .bearer_auth(&token)
        .json(&envelope(Uuid::new_v4(), 1))
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status().as_u16(), 400);

    // collected_at beyond the skew bound.
    let mut future = envelope(device_id, 2);
    future.collected_at = chrono::Utc::now() + chrono::Duration::seconds(120);
    let resp = server
        .client
        .post(&url)
        .bearer_auth(&token)
        .json(&future)
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status().as_u16(), 400);

    // Advertised gzip that is not gzip.
    let resp = server
        .client
        .post(&url)
        .bearer_auth(&token)
        .header("content-encoding", "gzip")
        .body("definitely not gzip")
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status().as_u16(), 400);

    // Wrong token.
    let resp = server
        .client
        .post(&url)
        .bearer_auth("flt_live_not_the_token")
        .json(&envelope(device_id, 3))
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status().as_u16(), 401);
}

#[tokio::test]
#[ignore = "requires live postgres and nats"]
async fn policy_is_served_with_etag_and_304() {
    let server = start_server().await;
    let (device_id, token) = register_device(&server).await;
    let url = format!("{}/v1/agents/{device_id}/policy", server.base_url);

    let resp = server
        .client
        .get(&url)
        .bearer_auth(&token)
        .send()
        .await
        .expect("policy");
    assert!(resp.status().is_success());
    let etag = resp
        .headers()
        .get("etag")
        .expect("etag header")
        .to_str()
        .expect("etag str")
        .to_string();
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["config"]["interval_seconds"].as_u64(), Some(900));

    let resp = server
        .client
        .get(&url)
        .bearer_auth(&token)
        .header("if-none-match", &etag)
        .send()
        .await
        .expect("conditional");
    assert_eq!(resp.status().as_u16(), 304);

    // A device-scoped policy changes the answer and the tag.
    let resp = server
        .client
        .post(format!("{}/v1/policies", server.base_url))
        .bearer_auth("integration-admin")
        .json(&serde_json::json!({
            "scope": "device",
            "device_id": device_id,
            "config": {
                "interval_seconds": 300,
                "metrics": {"cpu.utilization": {"enabled": true}}
            }
        }))
        .send()
        .await
        .expect("create policy");
    assert_eq!(resp.status().as_u16(), 201);

    let resp = server
        .client
        .get(&url)
        .bearer_auth(&token)
        .header("if-none-match", &etag)
        .send()
        .await
        .expect("refetch");
    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["config"]["interval_seconds"].as_u64(), Some(300));
}

#[tokio::test]
#[ignore = "requires live postgres and nats"]
async fn command_lifecycle_claim_ack_idempotent() {
    let server = start_server().await;
    let (device_id, token) = register_device(&server).await;

    let resp = server
        .client
        .post(format!("{}/v1/commands", server.base_url))
        .bearer_auth("integration-admin")
        .json(&serde_json::json!({
            "device_id": device_id,
            "type": "collect.now",
            "parameters": {"metrics": ["os.info"]},
            "ttl_seconds": 120
        }))
        .send()
        .await
        .expect("create command");
    assert_eq!(resp.status().as_u16(), 201);
    let created: serde_json::Value = resp.json().await.expect("json");
    let command_id = created["command_id"].as_str().expect("id").to_string();

    // First poll claims the command; the second sees nothing.
    let poll_url = format!("{}/v1/agents/{device_id}/commands", server.base_url);
    let resp = server
        .client
        .get(&poll_url)
        .bearer_auth(&token)
        .send()
        .await
        .expect("poll");
    let claimed: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(claimed.as_array().expect("array").len(), 1);
    assert_eq!(claimed[0]["status"].as_str(), Some("executing"));

    let resp = server
        .client
        .get(&poll_url)
        .bearer_auth(&token)
        .send()
        .await
        .expect("second poll");
    let empty: serde_json::Value = resp.json().await.expect("json");
    assert!(empty.as_array().expect("array").is_empty());

    // Ack completes; the repeat ack is a no-op.
    let ack_url = format!(
        "{}/v1/agents/{device_id}/commands/{command_id}/ack",
        server.base_url
    );
    for _ in 0..2 {
        let resp = server
            .client
            .post(&ack_url)
            .bearer_auth(&token)
            .json(&serde_json::json!({
                "result": {"status": "completed", "metrics": ["os.info"]}
            }))
            .send()
            .await
            .expect("ack");
        assert!(resp.status().is_success());
    }

    let resp = server
        .client
        .get(format!(
            "{}/v1/commands?device_id={device_id}",
            server.base_url
        ))
        .bearer_auth("integration-admin")
        .send()
        .await
        .expect("list");
    let listed: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(listed[0]["status"].as_str(), Some("completed"));
}

#[tokio::test]
#[ignore = "requires live postgres and nats"]
async fn command_ttl_is_validated() {
    let server = start_server().await;
    let (device_id, _token) = register_device(&server).await;

    for ttl in [0, -5, 3601] {
        let resp = server
            .client
            .post(format!("{}/v1/commands", server.base_url))
            .bearer_auth("integration-admin")
            .json(&serde_json::json!({
                "device_id": device_id,
                "type": "collect.now",
                "ttl_seconds": ttl
            }))
            .send()
            .await
            .expect("create");
        assert_eq!(resp.status().as_u16(), 400, "ttl {ttl} accepted");
    }
}

#[tokio::test]
#[ignore = "requires live postgres and nats"]
async fn re_registration_rotates_the_token() {
    let server = start_server().await;
    let (device_id, first_token) = register_device(&server).await;

    let request = RegisterRequest {
        device_id,
        hostname: "it-host-01".to_string(),
        capabilities: vec![],
        agent_version: "0.3.1".to_string(),
    };
    let resp = server
        .client
        .post(format!("{}/v1/agents/register", server.base_url))
        .json(&request)
        .send()
        .await
        .expect("re-register");
    assert!(resp.status().is_success());
    let body: RegisterResponse = resp.json().await.expect("body");
    let second_token = body.auth_token.expect("token");
    assert_ne!(first_token, second_token);

    // The old token no longer authenticates.
    let resp = server
        .client
        .get(format!("{}/v1/agents/{device_id}/policy", server.base_url))
        .bearer_auth(&first_token)
        .send()
        .await
        .expect("old token");
    assert_eq!(resp.status().as_u16(), 401);

    let resp = server
        .client
        .get(format!("{}/v1/agents/{device_id}/policy", server.base_url))
        .bearer_auth(&second_token)
        .send()
        .await
        .expect("new token");
    assert!(resp.status().is_success());
}

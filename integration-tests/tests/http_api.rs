use morio_core::{api, Collaborators, Coordinator, CoreConfig, HttpPeerClient};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{fast_config, wait_for_port};

struct Server {
    base: String,
    http: reqwest::Client,
    coordinator: Arc<Coordinator>,
    _data: tempfile::TempDir,
}

impl Server {
    async fn start() -> Self {
        let data = tempfile::tempdir().unwrap();
        let config = CoreConfig {
            data_dir: Some(data.path().to_path_buf()),
            ..fast_config("localhost")
        };
        let peers = Arc::new(HttpPeerClient::new(&config, None).unwrap());
        let coordinator = Coordinator::open(config, Collaborators::with_peers(peers))
            .await
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = api::create_router(coordinator.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        wait_for_port(port, Duration::from_secs(5)).await;

        Self {
            base: format!("http://127.0.0.1:{}", port),
            http: reqwest::Client::new(),
            coordinator,
            _data: data,
        }
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .http
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        (resp.status().as_u16(), resp.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: &Value) -> (u16, Value) {
        let resp = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()
            .await
            .unwrap();
        (resp.status().as_u16(), resp.json().await.unwrap())
    }
}

fn code(envelope: &Value) -> &str {
    envelope["type"]
        .as_str()
        .and_then(|t| t.rsplit('/').next())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_ephemeral_node_over_http() {
    let server = Server::start().await;

    let (status, body) = server.get("/status").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"]["cluster"]["code"], 1);
    assert_eq!(body["node"]["ephemeral"], true);

    let (status, body) = server.post("/settings", &json!({ "nodes": ["localhost"] })).await;
    assert_eq!(status, 409);
    assert_eq!(code(&body), "morio.core.ephemeral.prohibited");
    assert_eq!(body["status"], 409);

    let (status, body) = server.get("/nope").await;
    assert_eq!(status, 404);
    assert_eq!(code(&body), "morio.core.404");

    let resp = server
        .http
        .post(format!("{}/setup", server.base))
        .header("content-type", "application/json")
        .body("{ not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(code(&body), "morio.core.schema.violation");
}

#[tokio::test]
async fn test_setup_over_http() {
    let server = Server::start().await;
    let handles = server.coordinator.start();

    let (status, body) = server.post("/setup", &json!({ "nodes": ["localhost"] })).await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["result"], "success");
    assert!(body["root_token"]["value"].as_str().unwrap().starts_with("mrt."));

    let (status, body) = server.post("/setup", &json!({ "nodes": ["localhost"] })).await;
    assert_eq!(status, 409);
    assert_eq!(code(&body), "morio.core.ephemeral.required");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let (status, body) = server.get("/status").await;
        if status == 200 && body["status"]["cluster"]["code"] == 0 {
            assert_eq!(body["status"]["cluster"]["leading"], true);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "never went green: {}", body);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let (status, body) = server.get("/ca/certificate").await;
    assert_eq!(status, 200);
    assert!(body["certificate"]
        .as_str()
        .unwrap()
        .starts_with("-----BEGIN CERTIFICATE-----"));

    let (status, body) = server.get("/reload").await;
    assert_eq!(status, 200);
    assert!(body["settings"]["serial"].as_i64().unwrap() > 0);

    let (status, body) = server.get("/settings").await;
    assert_eq!(status, 200);
    let current = body["current"].as_i64().unwrap();
    assert_eq!(body["serials"], json!([current]));

    let (status, body) = server.get(&format!("/settings/{}", current)).await;
    assert_eq!(status, 200);
    assert_eq!(body["current"], true);
    assert_eq!(body["settings"]["deployment"]["nodes"], json!(["localhost"]));

    server.coordinator.shutdown();
    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
}

#[tokio::test]
async fn test_setup_survives_restart() {
    let data = tempfile::tempdir().unwrap();
    let config = || CoreConfig {
        data_dir: Some(data.path().to_path_buf()),
        ..fast_config("localhost")
    };

    let first = Coordinator::open(
        config(),
        Collaborators::with_peers(Arc::new(HttpPeerClient::new(&config(), None).unwrap())),
    )
    .await
    .unwrap();
    let setup = first
        .setup(json!({ "nodes": ["localhost"] }), None)
        .await
        .unwrap();
    crate::common::wait_settled(&first).await;
    let serial = first.driver().applied_serial();
    first.shutdown();
    drop(first);

    let second = Coordinator::open(
        config(),
        Collaborators::with_peers(Arc::new(HttpPeerClient::new(&config(), None).unwrap())),
    )
    .await
    .unwrap();
    crate::common::wait_settled(&second).await;

    let local = second.local().await.unwrap();
    assert_eq!(local.uuid, setup.uuids.node);
    assert_eq!(local.cluster, setup.uuids.cluster);
    assert_eq!(second.driver().applied_serial(), serial);
}

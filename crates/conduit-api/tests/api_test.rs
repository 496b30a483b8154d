//! HTTP tests against the router bound to an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use conduit_api::{router, AppState};
use conduit_db::Stores;
use conduit_jobs::{
    FixtureSource, HashingEmbedder, MapperRegistry, Pipeline, PipelineConfig, PipelinePlan,
    SourceRegistry, Stage, Tier, WorkerConfig,
};

struct Server {
    base: String,
    pipeline: Arc<Pipeline>,
    client: reqwest::Client,
}

/// Serve the router with the pools stopped, so runs only move when a test
/// starts a pool.
async fn serve() -> Server {
    let mut sources = SourceRegistry::new();
    sources.register(PipelinePlan::github(), Arc::new(FixtureSource::github_sample()));
    let config = PipelineConfig::default()
        .with_worker(WorkerConfig::default().with_enabled(false).with_poll_interval(20));
    let pipeline = Arc::new(Pipeline::new(
        Stores::in_memory(),
        sources,
        MapperRegistry::new(),
        Arc::new(HashingEmbedder::default()),
        config,
    ));

    let app = router(AppState::new(pipeline.clone()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Server {
        base: format!("http://{}", addr),
        pipeline,
        client: reqwest::Client::new(),
    }
}

impl Server {
    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap()
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn create_job(&self, tier: &str) -> Value {
        let resp = self
            .post(
                "/api/v1/jobs",
                json!({"tenant_id": Uuid::new_v4(), "tier": tier, "source": "github"}),
            )
            .await;
        assert_eq!(resp.status(), 201);
        resp.json().await.unwrap()
    }
}

#[tokio::test]
async fn test_health() {
    let server = serve().await;
    let resp = server.get("/health").await;
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key("x-request-id"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_create_and_inspect_job() {
    let server = serve().await;
    let job = server.create_job("premium").await;
    assert_eq!(job["tier"], "premium");
    assert_eq!(job["status"]["overall"], "READY");

    let id = job["id"].as_str().unwrap();
    let fetched: Value = server
        .get(&format!("/api/v1/jobs/{}", id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["id"], job["id"]);

    let status: Value = server
        .get(&format!("/api/v1/jobs/{}/status", id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(status["steps"]["github_repositories"]["extraction"], "idle");
    assert_eq!(status["steps"]["github_repositories"]["order"], 1);

    let listed: Value = server.get("/api/v1/jobs").await.json().await.unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_job_and_source() {
    let server = serve().await;
    let resp = server.get(&format!("/api/v1/jobs/{}", Uuid::new_v4())).await;
    assert_eq!(resp.status(), 404);

    let resp = server
        .post(
            "/api/v1/jobs",
            json!({"tenant_id": Uuid::new_v4(), "tier": "free", "source": "gitlab"}),
        )
        .await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_run_twice_conflicts_and_reset_refuses_running_job() {
    let server = serve().await;
    let job = server.create_job("basic").await;
    let id = job["id"].as_str().unwrap();

    let resp = server.post(&format!("/api/v1/jobs/{}/run", id), json!({})).await;
    assert_eq!(resp.status(), 200);
    let running: Value = resp.json().await.unwrap();
    assert_eq!(running["status"]["overall"], "RUNNING");

    let resp = server.post(&format!("/api/v1/jobs/{}/run", id), json!({})).await;
    assert_eq!(resp.status(), 409);

    let resp = server.post(&format!("/api/v1/jobs/{}/reset", id), json!({})).await;
    assert_eq!(resp.status(), 409);

    let completion: Value = server
        .get(&format!("/api/v1/jobs/{}/completion", id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(completion["all_finished"], false);
}

#[tokio::test]
async fn test_queues_and_pool_control() {
    let server = serve().await;
    let job = server.create_job("enterprise").await;
    let id = job["id"].as_str().unwrap();
    server.post(&format!("/api/v1/jobs/{}/run", id), json!({})).await;

    let queues: Value = server.get("/api/v1/queues").await.json().await.unwrap();
    let queues = queues.as_array().unwrap();
    assert_eq!(queues.len(), 12);
    let extraction = queues
        .iter()
        .find(|q| q["queue"]["tier"] == "enterprise" && q["queue"]["stage"] == "extraction")
        .unwrap();
    assert_eq!(extraction["ready"], 1);

    let pools: Value = server.get("/api/v1/pools").await.json().await.unwrap();
    assert_eq!(pools.as_array().unwrap().len(), 12);
    assert!(pools.as_array().unwrap().iter().all(|p| p["running"] == false));

    let resp = server
        .post("/api/v1/pools/enterprise/extraction/start", json!({}))
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["changed"], true);
    assert_eq!(body["status"]["running"], true);
    assert_eq!(body["status"]["configured"], 10);

    let resp = server
        .post("/api/v1/pools/enterprise/extraction/start", json!({}))
        .await;
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["changed"], false);

    let resp = server
        .post("/api/v1/pools/enterprise/extraction/stop", json!({}))
        .await;
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["changed"], true);
    assert_eq!(body["status"]["running"], false);

    let resp = server.post("/api/v1/pools/gold/extraction/start", json!({})).await;
    assert_eq!(resp.status(), 400);
    let resp = server.post("/api/v1/pools/free/extraction/pause", json!({})).await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_full_run_over_http_with_event_stream() {
    let server = serve().await;
    let job = server.create_job("free").await;
    let id = job["id"].as_str().unwrap().to_string();

    let events = server.get(&format!("/api/v1/events?job_id={}", id)).await;
    assert_eq!(events.status(), 200);
    let mut stream = events.bytes_stream();

    for stage in Stage::ALL {
        server
            .pipeline
            .supervisor
            .start(Tier::Free, stage, 1)
            .await
            .unwrap();
    }
    server.post(&format!("/api/v1/jobs/{}/run", id), json!({})).await;

    // Read the stream until the job is finalized.
    let mut text = String::new();
    tokio::time::timeout(Duration::from_secs(20), async {
        while let Some(chunk) = stream.next().await {
            text.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            if text.contains("event: job.finalized") {
                break;
            }
        }
    })
    .await
    .expect("job was not finalized");
    assert!(text.contains("event: job.started"));
    assert!(text.contains("event: job.status_changed"));

    let completion: Value = server
        .get(&format!("/api/v1/jobs/{}/completion", id))
        .await
        .json()
        .await
        .unwrap();
    let job: Value = server
        .get(&format!("/api/v1/jobs/{}", id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(job["status"]["overall"], "FINISHED");
    // Single-slot pools process each queue in order, so every stage has
    // finished by the time the job-terminal message is embedded.
    assert_eq!(completion["all_finished"], true);

    let reset: Value = server
        .post(&format!("/api/v1/jobs/{}/reset", id), json!({}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(reset["success"], true);
    assert_eq!(reset["overall"], "READY");

    server.pipeline.supervisor.shutdown().await;
}

//! End-to-end HTTP tests against a live listener, with a scripted
//! transformer and the embedding skip path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use enrichd_api::app::services::{AppRuntime, assemble};
use enrichd_api::app::build_app;
use enrichd_api::middleware::TENANT_HEADER;
use enrichd_core::{TenantId, UntrustedDocument};
use enrichd_infra::config::EnrichConfig;
use enrichd_infra::embed::{EmbedConfig, HttpEmbeddingClient};
use enrichd_infra::jobs::{JobRecord, MemoryJobStore};
use enrichd_infra::retry::{BreakerConfig, CircuitBreaker};
use enrichd_infra::service::HealthRegistry;
use enrichd_infra::transform::{TransformError, TransformOutput, Transformer};
use enrichd_observability::InMemoryMetrics;

struct FakeTransformer;

#[async_trait]
impl Transformer for FakeTransformer {
    async fn run(&self, job: &JobRecord, _attempt: u32) -> Result<TransformOutput, TransformError> {
        Ok(TransformOutput {
            document: UntrustedDocument::from_value(json!({
                "entity_id": job.entity_id.as_str(),
                "summary": "principal engineer, data platforms",
                "model_version": "m-test",
            }))
            .unwrap(),
            duration_ms: 1,
        })
    }
}

async fn start_server() -> (String, AppRuntime) {
    let mut config = EnrichConfig::default();
    config.pool.workers = 2;
    config.pool.poll_timeout = Duration::from_millis(20);
    config.sync_wait = Duration::from_secs(5);

    let embedder = HttpEmbeddingClient::new(
        EmbedConfig {
            enabled: false,
            ..EmbedConfig::default()
        },
        Arc::new(CircuitBreaker::new(BreakerConfig::default())),
    );

    let runtime = assemble(
        &config,
        Arc::new(MemoryJobStore::default()),
        Arc::new(FakeTransformer),
        Arc::new(embedder),
        Arc::new(InMemoryMetrics::new()),
        HealthRegistry::new(),
    )
    .await
    .unwrap();

    let app = build_app(runtime.services.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), runtime)
}

fn submit_body(entity: &str) -> Value {
    json!({"entityId": entity, "payload": {"depth": "full"}})
}

async fn poll_until_completed(
    client: &reqwest::Client,
    base: &str,
    tenant: &str,
    job_id: &str,
) -> Value {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let body: Value = client
            .get(format!("{base}/v1/enrich/status/{job_id}"))
            .header(TENANT_HEADER, tenant)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let status = body["job"]["status"].as_str().unwrap_or_default().to_string();
        if status == "completed" || status == "failed" {
            return body;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "job {job_id} never completed, last: {body}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn submissions_without_tenant_context_are_rejected() {
    let (base, _runtime) = start_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/v1/enrich/profile"))
        .json(&submit_body("cand_1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn async_submission_is_accepted_and_completes() {
    let (base, _runtime) = start_server().await;
    let client = reqwest::Client::new();
    let tenant = TenantId::new().to_string();

    let response = client
        .post(format!("{base}/v1/enrich/profile"))
        .header(TENANT_HEADER, &tenant)
        .json(&submit_body("cand_1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let body: Value = response.json().await.unwrap();
    let job_id = body["job"]["jobId"].as_str().unwrap().to_string();
    assert_eq!(body["job"]["status"], "queued");

    let terminal = poll_until_completed(&client, &base, &tenant, &job_id).await;
    assert_eq!(terminal["job"]["status"], "completed");
    let result = &terminal["job"]["result"];
    assert_eq!(result["embeddingUpserted"], false);
    assert_eq!(result["embeddingSkippedReason"], "embedding_disabled");
    assert_eq!(result["modelVersion"], "m-test");
    assert_eq!(
        result["entitySnapshot"]["summary"],
        "principal engineer, data platforms"
    );
}

#[tokio::test]
async fn duplicate_submission_returns_the_same_job() {
    let (base, _runtime) = start_server().await;
    let client = reqwest::Client::new();
    let tenant = TenantId::new().to_string();

    let first: Value = client
        .post(format!("{base}/v1/enrich/profile"))
        .header(TENANT_HEADER, &tenant)
        .json(&submit_body("cand_1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let second: Value = client
        .post(format!("{base}/v1/enrich/profile"))
        .header(TENANT_HEADER, &tenant)
        .json(&submit_body("cand_1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(first["job"]["jobId"], second["job"]["jobId"]);
}

#[tokio::test]
async fn sync_submission_blocks_for_the_terminal_record() {
    let (base, _runtime) = start_server().await;
    let client = reqwest::Client::new();
    let tenant = TenantId::new().to_string();

    let response = client
        .post(format!("{base}/v1/enrich/profile"))
        .header(TENANT_HEADER, &tenant)
        .json(&json!({"entityId": "cand_1", "async": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["job"]["status"], "completed");
}

#[tokio::test]
async fn status_is_tenant_scoped() {
    let (base, _runtime) = start_server().await;
    let client = reqwest::Client::new();
    let tenant = TenantId::new().to_string();

    let submitted: Value = client
        .post(format!("{base}/v1/enrich/profile"))
        .header(TENANT_HEADER, &tenant)
        .json(&submit_body("cand_1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let job_id = submitted["job"]["jobId"].as_str().unwrap();

    let other_tenant = TenantId::new().to_string();
    let body: Value = client
        .get(format!("{base}/v1/enrich/status/{job_id}"))
        .header(TENANT_HEADER, &other_tenant)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["job"].is_null());
}

#[tokio::test]
async fn malformed_job_ids_are_rejected() {
    let (base, _runtime) = start_server().await;
    let client = reqwest::Client::new();
    let tenant = TenantId::new().to_string();

    let response = client
        .get(format!("{base}/v1/enrich/status/not-a-uuid"))
        .header(TENANT_HEADER, &tenant)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn health_reports_all_dependencies_up() {
    let (base, _runtime) = start_server().await;
    let client = reqwest::Client::new();

    let response = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["redis"], true);
    assert_eq!(body["transformer"], true);
    assert_eq!(body["embed"], true);
}

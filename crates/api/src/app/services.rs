//! Infrastructure wiring: store selection, breakers, worker pool, façade.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use enrichd_infra::config::EnrichConfig;
use enrichd_infra::embed::{EmbeddingClient, HttpEmbeddingClient};
use enrichd_infra::jobs::{JobStore, JobStoreError, MemoryJobStore};
use enrichd_infra::retry::{CircuitBreaker, CircuitState};
use enrichd_infra::service::{EnrichmentService, HealthRegistry};
use enrichd_infra::transform::{SubprocessTransformer, Transformer};
use enrichd_infra::workers::{WorkerPool, WorkerPoolHandle};
use enrichd_observability::{MetricsSink, TracingMetrics};

#[cfg(feature = "redis")]
use enrichd_infra::jobs::RedisJobStore;

/// What the HTTP handlers get to see.
pub struct AppServices {
    pub enrichment: Arc<EnrichmentService>,
    /// Upper bound for the `async=false` blocking wait.
    pub sync_wait: Duration,
}

/// Running application: handler-facing services plus the worker pool handle
/// the binary must shut down.
pub struct AppRuntime {
    pub services: Arc<AppServices>,
    pub workers: WorkerPoolHandle,
}

/// Production wiring from configuration.
pub async fn build_services(config: &EnrichConfig) -> anyhow::Result<AppRuntime> {
    let metrics: Arc<dyn MetricsSink> = Arc::new(TracingMetrics);
    let health = HealthRegistry::new();

    let store = connect_store(config).await?;

    let transformer: Arc<dyn Transformer> = Arc::new(SubprocessTransformer::new(
        config.transform.clone(),
        Arc::new(dependency_breaker(
            "transformer",
            config.transform_breaker,
            health.clone(),
            metrics.clone(),
        )),
    ));
    let embedder: Arc<dyn EmbeddingClient> = Arc::new(HttpEmbeddingClient::new(
        config.embed.clone(),
        Arc::new(dependency_breaker(
            "embed",
            config.embed_breaker,
            health.clone(),
            metrics.clone(),
        )),
    ));

    Ok(assemble(config, store, transformer, embedder, metrics, health).await?)
}

/// Wire a runtime from explicit components (tests inject doubles here).
pub async fn assemble(
    config: &EnrichConfig,
    store: Arc<dyn JobStore>,
    transformer: Arc<dyn Transformer>,
    embedder: Arc<dyn EmbeddingClient>,
    metrics: Arc<dyn MetricsSink>,
    health: Arc<HealthRegistry>,
) -> Result<AppRuntime, JobStoreError> {
    let pool = WorkerPool::new(
        store.clone(),
        transformer,
        embedder,
        metrics.clone(),
        config.pool.clone(),
    );
    let workers = pool.spawn().await?;
    info!(workers = config.pool.workers, "worker pool started");

    let enrichment = Arc::new(EnrichmentService::new(
        store,
        metrics,
        health,
        config.store_retry_on_submit,
    ));

    Ok(AppRuntime {
        services: Arc::new(AppServices {
            enrichment,
            sync_wait: config.sync_wait,
        }),
        workers,
    })
}

/// Breaker whose transitions drive the health flags and a state gauge.
fn dependency_breaker(
    dependency: &'static str,
    config: enrichd_infra::retry::BreakerConfig,
    health: Arc<HealthRegistry>,
    metrics: Arc<dyn MetricsSink>,
) -> CircuitBreaker {
    CircuitBreaker::with_transition_hook(config, move |state| {
        let healthy = matches!(state, CircuitState::Closed);
        match dependency {
            "transformer" => health.set_transformer(healthy),
            _ => health.set_embed(healthy),
        }
        metrics.breaker_state(dependency, state.as_str());
    })
}

#[cfg(feature = "redis")]
async fn connect_store(config: &EnrichConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    match &config.redis_url {
        Some(url) => {
            let store = RedisJobStore::connect(url, config.job_retention, config.dedupe_ttl).await?;
            info!("connected to redis job store");
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryJobStore::new(
            config.job_retention,
            config.dedupe_ttl,
        ))),
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_store(config: &EnrichConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    if config.redis_url.is_some() {
        tracing::warn!(
            "ENRICH_REDIS_URL is set but the `redis` feature is disabled; using the in-memory store"
        );
    }
    Ok(Arc::new(MemoryJobStore::new(
        config.job_retention,
        config.dedupe_ttl,
    )))
}

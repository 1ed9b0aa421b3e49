use {
    axum::{Router, extract::State, http::StatusCode, routing::get},
    prometheus::{Encoder, Registry, TextEncoder},
    prometheus_metric_storage::StorageRegistry,
    std::{net::SocketAddr, sync::Arc, sync::OnceLock},
};

/// The global registry. Initialized by the first call to [`setup_registry`]
/// or lazily with default settings on first access.
static REGISTRY: OnceLock<StorageRegistry> = OnceLock::new();

/// Configures the global metrics registry with an optional prefix for all
/// metric names. Must be called before any metric is registered; later calls
/// are ignored.
pub fn setup_registry(prefix: Option<String>) {
    let _ = REGISTRY.set(storage_registry(prefix));
}

fn storage_registry(prefix: Option<String>) -> StorageRegistry {
    let registry = Registry::new_custom(prefix, None).expect("invalid metrics prefix");
    StorageRegistry::new(registry)
}

pub fn get_registry() -> &'static Registry {
    get_storage_registry().registry()
}

pub fn get_storage_registry() -> &'static StorageRegistry {
    REGISTRY.get_or_init(|| storage_registry(None))
}

pub fn encode(registry: &Registry) -> String {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .expect("metrics encoding failed");
    String::from_utf8(buffer).expect("metrics encoding is not utf-8")
}

/// Answers whether the service should currently pass its liveness probe.
#[async_trait::async_trait]
pub trait LivenessChecking: Send + Sync {
    async fn is_alive(&self) -> bool;
}

/// Serves `/metrics` and `/liveness` until the process exits.
pub async fn serve_metrics(liveness: Arc<dyn LivenessChecking>, address: SocketAddr) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/liveness", get(liveness_handler))
        .with_state(liveness);
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .expect("failed to bind metrics endpoint");
    tracing::info!(%address, "serving metrics");
    axum::serve(listener, app)
        .await
        .expect("metrics server failed");
}

async fn metrics_handler() -> String {
    encode(get_registry())
}

async fn liveness_handler(State(liveness): State<Arc<dyn LivenessChecking>>) -> StatusCode {
    if liveness.is_alive().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_metrics() {
        let registry = Registry::new();
        let counter = prometheus::IntCounter::new("some_counter", "a counter").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc();
        let encoded = encode(&registry);
        assert!(encoded.contains("some_counter 1"));
    }
}

//! Shield Daemon
//!
//! HTTP front for the enforcement core: signed patch ingress, telemetry
//! intake and read-only status.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         SHIELDD                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │  POST /v1/shield ──► Admission ──► Verifier ──► RuleStore    │
//! │  POST /v1/telemetry ──► TelemetryPipeline ──► Engine/Forge   │
//! │  GET  /v1/status, /v1/ledger, /v1/audit, /health             │
//! │                          │                                   │
//! │                          ▼                                   │
//! │                   ┌─────────────┐                            │
//! │                   │ ChainLedger │ (JSONL journal)            │
//! │                   └─────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod config;
mod error;
mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use shield_core::ShieldCore;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use error::{AppError, AppResult};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging; the default `tracing-log` bridge picks up the core's `log` records
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "shieldd=debug,shield_core=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if config::log_json_from_env() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // Load configuration
    let config = config::Config::from_env()?;

    tracing::info!("Shield daemon starting ({})...", config.environment);
    tracing::info!("Baseline: {}", config.pipeline.baseline_dir.display());
    match &config.pipeline.ledger_path {
        Some(path) => tracing::info!("Ledger journal: {}", path.display()),
        None => tracing::warn!("Ledger journal disabled, history is lost on restart"),
    }
    if config.is_production() && config.pipeline.forge_key.is_none() {
        tracing::warn!("No SHIELD_FORGE_KEY_SEED in production, forge patches will use an ephemeral key");
    }

    // Build the core
    let core = Arc::new(ShieldCore::from_config(config.pipeline.clone())?);
    core.start();

    let state = AppState {
        core: Arc::clone(&core),
        config: Arc::new(config),
    };
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let app = create_router(state);

    // Start server
    tracing::info!("Server listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Draining pipeline...");
    core.shutdown().await;
    tracing::info!("Shield daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<ShieldCore>,
    pub config: Arc<config::Config>,
}

/// Create the main router with all routes
fn create_router(state: AppState) -> Router {
    let patch_limit = state.config.pipeline.max_patch_bytes;

    let ingress_routes = Router::new()
        .route(
            "/v1/shield",
            post(handlers::shield::submit).layer(DefaultBodyLimit::max(patch_limit)),
        )
        .route("/v1/telemetry", post(handlers::telemetry::ingest));

    let read_routes = Router::new()
        .route("/health", get(handlers::health::check))
        .route("/api/health", get(handlers::health::check))
        .route("/v1/status", get(handlers::status::get))
        .route("/v1/ledger", get(handlers::status::ledger))
        .route("/v1/audit", get(handlers::status::audit));

    Router::new()
        .merge(ingress_routes)
        .merge(read_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use shield_core::logic::forge::NullSynthesizer;
    use shield_core::{
        ChainAnchor, LedgerError, LedgerJournal, LedgerRecord, MemoryJournal, PatchEnvelope,
        PipelineConfig, Provenance, RuleEntry, RuleLanguage, RuleOp, SigningKeyPair,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    fn operator_key() -> SigningKeyPair {
        SigningKeyPair::from_seed(&[7u8; 32])
    }

    /// Takes the genesis record, then delays and optionally fails every append
    struct TestJournal {
        appended: usize,
        delay: Duration,
        fail: bool,
    }

    impl LedgerJournal for TestJournal {
        fn load(&mut self) -> Result<Vec<LedgerRecord>, LedgerError> {
            Ok(Vec::new())
        }

        fn append(&mut self, _record: &LedgerRecord) -> std::io::Result<()> {
            self.appended += 1;
            if self.appended == 1 {
                return Ok(());
            }
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
            }
            Ok(())
        }
    }

    fn state_over(pipeline: PipelineConfig, journal: Box<dyn LedgerJournal>) -> AppState {
        let pipeline = PipelineConfig {
            trusted_keys: vec![operator_key().public_key()],
            ..pipeline
        };
        let baseline = vec![RuleEntry::new(
            "shadow_read",
            RuleLanguage::Sigma,
            "@decision block\n@severity critical\n@match target ^/etc/shadow$",
            Provenance::Baseline,
        )];
        let core =
            ShieldCore::with_journal(pipeline.clone(), baseline, Arc::new(NullSynthesizer), journal).unwrap();
        core.start();

        AppState {
            core: Arc::new(core),
            config: Arc::new(config::Config {
                port: 0,
                environment: "test".to_string(),
                log_json: false,
                pipeline,
            }),
        }
    }

    fn test_state() -> AppState {
        state_over(PipelineConfig::default(), Box::new(MemoryJournal::new()))
    }

    fn patch(state: &AppState, id: &str, body: &str) -> Vec<u8> {
        let anchor = ChainAnchor::from(state.core.store().ledger().head());
        let op = RuleOp::Upsert {
            rule: RuleEntry::new(id, RuleLanguage::Sigma, body, Provenance::Patch),
        };
        PatchEnvelope::new(Provenance::Patch, anchor, vec![op])
            .signed_by(&operator_key())
            .to_json()
            .unwrap()
    }

    async fn send(app: Router, method: &str, uri: &str, body: Vec<u8>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health_reports_healthy() {
        let state = test_state();
        let (status, body) = send(create_router(state), "GET", "/health", Vec::new()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["rule_set_version"], 0);
    }

    #[tokio::test]
    async fn test_ledger_failures_surface_as_unavailable_then_degraded() {
        let journal = TestJournal {
            appended: 0,
            delay: Duration::ZERO,
            fail: true,
        };
        let pipeline = PipelineConfig {
            ledger_failure_threshold: 2,
            ..PipelineConfig::default()
        };
        let state = state_over(pipeline, Box::new(journal));

        for _ in 0..2 {
            let bytes = patch(&state, "passwd_write", "@decision flag\n@match target ^/etc/passwd$");
            let (status, body) = send(create_router(state.clone()), "POST", "/v1/shield", bytes).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(body["status"], 503);
        }

        let (status, body) = send(create_router(state.clone()), "GET", "/health", Vec::new()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["rule_set_version"], 0);

        let (status, _) = send(create_router(state), "GET", "/api/health", Vec::new()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_slow_admission_times_out() {
        let journal = TestJournal {
            appended: 0,
            delay: Duration::from_millis(300),
            fail: false,
        };
        let pipeline = PipelineConfig {
            admission_timeout: Duration::from_millis(20),
            ..PipelineConfig::default()
        };
        let state = state_over(pipeline, Box::new(journal));
        let bytes = patch(&state, "passwd_write", "@decision flag\n@match target ^/etc/passwd$");

        let (status, body) = send(create_router(state.clone()), "POST", "/v1/shield", bytes).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["status"], 504);

        // the apply was not cancelled; it commits once the journal returns
        for _ in 0..200 {
            if state.core.store().current().version() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(state.core.store().current().version(), 1);
    }

    #[tokio::test]
    async fn test_health_alias_under_api() {
        let (status, body) = send(create_router(test_state()), "GET", "/api/health", Vec::new()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_signed_patch_is_committed() {
        let state = test_state();
        let bytes = patch(&state, "passwd_write", "@decision flag\n@match target ^/etc/passwd$");

        let (status, _) = send(create_router(state.clone()), "POST", "/v1/shield", bytes).await;

        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.core.store().current().version(), 1);
        assert!(state.core.store().current().contains("passwd_write"));
    }

    #[tokio::test]
    async fn test_garbage_patch_is_unauthorized() {
        let state = test_state();
        let (status, body) =
            send(create_router(state.clone()), "POST", "/v1/shield", b"not a patch".to_vec()).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["status"], 401);
        assert_eq!(state.core.store().current().version(), 0);
    }

    #[tokio::test]
    async fn test_empty_rule_body_is_unprocessable() {
        let state = test_state();
        let bytes = patch(&state, "empty", "");

        let (status, _) = send(create_router(state.clone()), "POST", "/v1/shield", bytes).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(state.core.store().current().version(), 0);
    }

    #[tokio::test]
    async fn test_replayed_patch_is_stale() {
        let state = test_state();
        let bytes = patch(&state, "passwd_write", "@decision flag\n@match target ^/etc/passwd$");

        let (first, _) = send(create_router(state.clone()), "POST", "/v1/shield", bytes.clone()).await;
        let (second, body) = send(create_router(state.clone()), "POST", "/v1/shield", bytes).await;

        assert_eq!(first, StatusCode::NO_CONTENT);
        assert_eq!(second, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("anchor"));
        assert_eq!(state.core.store().current().version(), 1);
    }

    #[tokio::test]
    async fn test_oversized_patch_is_rejected_before_admission() {
        let state = test_state();
        let limit = state.config.pipeline.max_patch_bytes;

        let (status, _) =
            send(create_router(state.clone()), "POST", "/v1/shield", vec![b'x'; limit + 1]).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(state.core.audit().rejected_count(), 0);
    }

    #[tokio::test]
    async fn test_telemetry_batch_counts_malformed() {
        let state = test_state();
        let batch = serde_json::json!([
            { "subject": "cat", "action": "open", "target": "/etc/shadow" },
            { "subject": "vim", "action": "write", "target": "/tmp/notes" },
            { "subject": "sh", "action": "exec" }
        ]);

        let (status, body) = send(
            create_router(state),
            "POST",
            "/v1/telemetry",
            serde_json::to_vec(&batch).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], 2);
        assert_eq!(body["malformed"], 1);
    }

    #[tokio::test]
    async fn test_telemetry_single_event_accepted() {
        let state = test_state();
        let event = serde_json::json!({ "process": "cat", "op": "open", "path": "/etc/hosts" });

        let (status, body) = send(
            create_router(state),
            "POST",
            "/v1/telemetry",
            serde_json::to_vec(&event).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], 1);
    }

    #[tokio::test]
    async fn test_telemetry_invalid_json_is_bad_request() {
        let state = test_state();
        let (status, _) =
            send(create_router(state), "POST", "/v1/telemetry", b"{not json".to_vec()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_and_history_endpoints() {
        let state = test_state();
        let bytes = patch(&state, "passwd_write", "@decision flag\n@match target ^/etc/passwd$");
        send(create_router(state.clone()), "POST", "/v1/shield", bytes).await;

        let (status, body) = send(create_router(state.clone()), "GET", "/v1/status", Vec::new()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["head"]["version"], 1);
        assert_eq!(body["patches_accepted"], 1);

        let (status, body) = send(create_router(state.clone()), "GET", "/v1/ledger", Vec::new()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (status, body) = send(create_router(state), "GET", "/v1/audit?limit=5", Vec::new()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["outcome"], "accepted");
    }
}

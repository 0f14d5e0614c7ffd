use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use leadflow_api::config::Config;
use leadflow_api::email_verifier::HttpEmailVerifier;
use leadflow_api::enrichment::EnrichmentOrchestrator;
use leadflow_api::handlers::{self, AppState};
use leadflow_api::jobs::JobTracker;
use leadflow_api::progress::ProgressBus;
use leadflow_api::providers::ProviderRegistry;
use leadflow_api::store::{LeadStore, PgLeadStore};
use leadflow_api::workflow::{PhoneLookupWorkflow, WorkflowRunner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "leadflow_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Lead store
    let store: Arc<dyn LeadStore> = Arc::new(PgLeadStore::connect(&config.database_url).await?);
    tracing::info!("Database connection pool established");

    // Providers, sorted by priority, each owning its rate limiter
    let registry = Arc::new(ProviderRegistry::from_configs(config.provider_configs())?);

    // Workflow layer: waterfall lookup + idempotent runner
    let phone_workflow = Arc::new(PhoneLookupWorkflow::new(Arc::clone(&registry)));
    let verifier = Arc::new(HttpEmailVerifier::new(
        config.email_verifier_endpoint.clone(),
    )?);
    let runner = Arc::new(WorkflowRunner::new(phone_workflow, verifier));

    // Job tracking and progress rooms
    let jobs = Arc::new(JobTracker::new());
    let bus = Arc::new(ProgressBus::new());

    let orchestrator = Arc::new(EnrichmentOrchestrator::new(
        Arc::clone(&store),
        runner,
        Arc::clone(&jobs),
        Arc::clone(&bus),
    ));

    let app_state = Arc::new(AppState {
        store,
        orchestrator,
        jobs,
        bus,
        registry,
    });

    // Configure ingress rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("valid governor configuration"),
    );

    let protected_routes = Router::new()
        .route("/api/v1/leads/enrich", post(handlers::enrich_leads))
        .route("/api/v1/jobs/:id", get(handlers::get_job))
        .route("/api/v1/jobs/:id/events", get(handlers::job_events))
        .route("/api/v1/providers/stats", get(handlers::provider_stats))
        .layer(
            ServiceBuilder::new()
                // Request size limit: 1MB max payload
                .layer(RequestBodyLimitLayer::new(1024 * 1024))
                // Rate limiting: 10 req/sec per IP, burst of 20
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{GoogleBooksAdapter, InMemoryDatabase, OpenAiAnnotationAdapter, PdfTextExtractor, PgDatabase},
    config::Config,
    error::ApiError,
    web::{self, rate_limit::ClientRateLimiter, rest::ApiDoc, state::AppState},
};
use async_openai::{config::OpenAIConfig, Client};
use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderValue, Method,
};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use textlift_core::{
    AnnotationExtractor, DatabaseService, DocumentService, IsbnResolver, Pipeline, PipelineConfig, PipelineWaker,
    StorageLayout, UploadLimits, UploadService,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    let db: Arc<dyn DatabaseService> = match &config.database_url {
        Some(database_url) => {
            info!("Connecting to database...");
            let db_pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await?;
            let db_adapter = PgDatabase::new(db_pool);
            info!("Running database migrations...");
            db_adapter.run_migrations().await?;
            info!("Database migrations complete.");
            Arc::new(db_adapter)
        }
        None => {
            warn!("DATABASE_URL is not set, using the in-memory store; data is lost on restart");
            Arc::new(InMemoryDatabase::new())
        }
    };

    let storage = StorageLayout::new(config.storage_root.clone());
    storage.ensure_root().await?;
    info!(root = %storage.root().display(), "Storage root ready");

    // --- 3. Initialize Service Adapters ---
    let openai_config = OpenAIConfig::new().with_api_key(config.openai_api_key.clone());
    let openai_client = Client::with_config(openai_config);
    let completion = Arc::new(OpenAiAnnotationAdapter::new(
        openai_client,
        config.annotation_model.clone(),
    ));
    let book_lookup = Arc::new(GoogleBooksAdapter::new(config.books_api_url.clone())?);
    let text_extractor = Arc::new(PdfTextExtractor::new());

    // --- 4. Build the Core Services & Pipeline ---
    let waker = PipelineWaker::new();
    let resolver = Arc::new(IsbnResolver::new(db.clone(), book_lookup, waker.clone()));
    let annotator = Arc::new(AnnotationExtractor::new(db.clone(), completion));
    let pipeline = Pipeline::new(
        db.clone(),
        text_extractor,
        resolver,
        annotator,
        storage.clone(),
        PipelineConfig {
            workers: config.pipeline_workers,
            max_attempts: config.pipeline_max_attempts,
            retry_base: config.pipeline_retry_base,
            ..PipelineConfig::default()
        },
        waker.clone(),
    );
    let uploads = Arc::new(UploadService::new(
        db.clone(),
        storage,
        UploadLimits {
            max_declared_bytes: config.max_declared_upload_bytes,
            max_file_bytes: config.max_file_bytes,
        },
        waker,
    ));
    let documents = Arc::new(DocumentService::new(db.clone()));
    let rate_limiter = Arc::new(ClientRateLimiter::new(
        config.rate_limit_capacity,
        config.rate_limit_refill,
        config.rate_limit_max_clients,
    ));

    // --- 5. Start Background Tasks ---
    let shutdown = CancellationToken::new();
    let pipeline_task = tokio::spawn(pipeline.run(shutdown.clone()));
    tokio::spawn(web::rate_limit::run_pruner(
        rate_limiter.clone(),
        config.rate_limit_idle,
        shutdown.clone(),
    ));

    // --- 6. Build the Shared AppState ---
    let app_state = Arc::new(AppState {
        db,
        config: config.clone(),
        uploads,
        documents,
        rate_limiter,
    });

    let cors_origin = config
        .cors_origin
        .parse::<HeaderValue>()
        .map_err(|e| ApiError::Internal(format!("Invalid CORS origin '{}': {}", config.cors_origin, e)))?;
    let cors = CorsLayer::new()
        .allow_origin(cors_origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, ACCEPT]);

    // --- 7. Create the Web Router ---
    let app = Router::new()
        .merge(web::router(app_state).layer(cors))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 8. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for the shutdown signal");
            }
            info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = pipeline_task.await {
        warn!(error = %e, "Pipeline task ended abnormally");
    }
    info!("Server stopped");
    Ok(())
}

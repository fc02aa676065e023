// Main entry point for the product enhancement + auto-tagging service

use product_enhance::{
    CategoryOverride, Config, Metrics, ProcessRequest, ProcessResponse, RequestOrchestrator,
    SuggestedTagsResponse,
};

use anyhow::Result;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path as UrlPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Status plus `{"error": ...}` body, the envelope every failure uses
type ApiError = (StatusCode, Json<serde_json::Value>);

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    orchestrator: Arc<RequestOrchestrator>,
    metrics: Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new().expect("Failed to load configuration"));

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "product_enhance={},ort=off",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== PRODUCT ENHANCEMENT + AUTO-TAGGING SERVICE ===");
    info!(
        "Config: subject='{}' feather={}px scale=x{} cleanup={}",
        config.subject_class(),
        config.feather_margin(),
        config.upscale.scale,
        if config.cleanup_intermediates() {
            "ON"
        } else {
            "OFF"
        }
    );

    // Initialize metrics
    let metrics = Metrics::new();

    // Initialize request orchestrator
    info!("Initializing request orchestrator...");
    let orchestrator = Arc::new(RequestOrchestrator::new(config.clone(), metrics.clone()).await?);
    let state = AppState {
        config: config.clone(),
        orchestrator,
        metrics,
    };

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Create router with monitoring endpoints
    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/suggested-tags", get(suggested_tags))
        .route("/process", post(process_image))
        .route("/upload", post(upload_alias))
        .route("/uploads/:filename", get(get_upload))
        .route("/out/:filename", get(get_output))
        .route("/download/:filename", get(download))
        .with_state(state)
        .layer(DefaultBodyLimit::max(200 * 1024 * 1024)) // 200MB for large photos
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /                    - Root endpoint");
    info!("  GET  /health              - Health check");
    info!("  GET  /metrics             - Prometheus metrics");
    info!("  GET  /stats               - Detailed statistics");
    info!("  GET  /suggested-tags      - Tag suggestions per category");
    info!("  POST /process             - Enhance + tag an image (multipart/form-data)");
    info!("  POST /upload              - Alias of /process");
    info!("  GET  /uploads/:filename   - Serve uploaded originals");
    info!("  GET  /out/:filename       - Serve generated images");
    info!("  GET  /download/:filename  - Download a generated image");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn root() -> &'static str {
    "Product Enhancement + Auto-Tagging Service"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": state.orchestrator.backend_type(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let snapshot = state.metrics.snapshot();
    serde_json::to_value(snapshot).map(Json).map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize metrics: {}", e),
        )
    })
}

#[derive(Deserialize)]
struct SuggestedTagsQuery {
    category: Option<String>,
}

async fn suggested_tags(
    State(state): State<AppState>,
    Query(query): Query<SuggestedTagsQuery>,
) -> Json<SuggestedTagsResponse> {
    Json(
        state
            .orchestrator
            .suggested_tags(query.category.as_deref().unwrap_or("")),
    )
}

/// Enhance + tag endpoint
///
/// # Request Format:
/// - multipart/form-data
/// - Field "image": the photo to process (required)
/// - Field "name" (optional): echoed back in the response
/// - Field "category" (optional): category table to tag against
/// - Field "config" (optional): JSON override for the category table
///
/// # Response:
/// ProcessResponse JSON with tags, artifact paths and resolutions
async fn process_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<ProcessResponse>, ApiError> {
    handle_process(state, headers, multipart, "/process").await
}

/// Kept for frontends that still post to /upload
async fn upload_alias(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<ProcessResponse>, ApiError> {
    handle_process(state, headers, multipart, "/upload").await
}

async fn handle_process(
    state: AppState,
    headers: HeaderMap,
    mut multipart: Multipart,
    endpoint: &str,
) -> Result<Json<ProcessResponse>, ApiError> {
    let start_time = std::time::Instant::now();
    state.metrics.record_endpoint_request(endpoint);

    info!("Received process request on {}", endpoint);

    let request = parse_process_request(&mut multipart).await?;
    let base_url = resolve_base_url(&state.config, &headers);

    let result = state.orchestrator.process(request, &base_url).await;
    state
        .metrics
        .record_request(result.is_ok(), start_time.elapsed());

    match result {
        Ok(response) => {
            info!(
                "Request completed in {:.2}s: {} tags",
                start_time.elapsed().as_secs_f64(),
                response.generated_tags.len()
            );
            Ok(Json(response))
        }
        Err(e) => {
            error!("Processing failed: {:?}", e);
            let status = if e.is_client_error() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            Err(api_error(status, e.to_string()))
        }
    }
}

/// Parse multipart form into a ProcessRequest, rejecting bad input before
/// anything touches disk or a model.
async fn parse_process_request(multipart: &mut Multipart) -> Result<ProcessRequest, ApiError> {
    let mut image_bytes: Option<Vec<u8>> = None;
    let mut name = String::new();
    let mut category = String::from("laptop");
    let mut config_override: Option<CategoryOverride> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        api_error(StatusCode::BAD_REQUEST, format!("Multipart error: {}", e))
    })? {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "image" => {
                let data = field.bytes().await.map_err(|e| {
                    api_error(StatusCode::BAD_REQUEST, format!("Read error: {}", e))
                })?;
                image_bytes = Some(data.to_vec());
            }
            "name" => {
                name = field.text().await.map_err(|e| {
                    api_error(StatusCode::BAD_REQUEST, format!("Read error: {}", e))
                })?;
            }
            "category" => {
                category = field.text().await.map_err(|e| {
                    api_error(StatusCode::BAD_REQUEST, format!("Read error: {}", e))
                })?;
            }
            "config" => {
                let raw = field.text().await.map_err(|e| {
                    api_error(StatusCode::BAD_REQUEST, format!("Read error: {}", e))
                })?;
                if !raw.trim().is_empty() {
                    config_override = Some(serde_json::from_str(&raw).map_err(|_| {
                        api_error(StatusCode::BAD_REQUEST, "config must be valid json")
                    })?);
                }
            }
            _ => {}
        }
    }

    let image_bytes =
        image_bytes.ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "image required"))?;

    Ok(ProcessRequest {
        image_bytes,
        name,
        category,
        config_override,
    })
}

async fn get_upload(
    State(state): State<AppState>,
    UrlPath(filename): UrlPath<String>,
) -> Result<Response, ApiError> {
    serve_artifact(state.config.upload_dir(), &filename, false).await
}

async fn get_output(
    State(state): State<AppState>,
    UrlPath(filename): UrlPath<String>,
) -> Result<Response, ApiError> {
    serve_artifact(state.config.output_dir(), &filename, false).await
}

async fn download(
    State(state): State<AppState>,
    UrlPath(filename): UrlPath<String>,
) -> Result<Response, ApiError> {
    serve_artifact(state.config.output_dir(), &filename, true).await
}

async fn serve_artifact(dir: &str, filename: &str, attachment: bool) -> Result<Response, ApiError> {
    if !is_safe_filename(filename) {
        return Err(api_error(StatusCode::BAD_REQUEST, "invalid filename"));
    }

    let path = std::path::Path::new(dir).join(filename);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| api_error(StatusCode::NOT_FOUND, "file not found"))?;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type_for(filename));
    if attachment {
        builder = builder.header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        );
    }

    builder
        .body(Body::from(bytes))
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Stored artifacts are flat files named by request id; anything that could
/// escape the directory is rejected outright.
fn is_safe_filename(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.contains("..")
        && !filename.contains('/')
        && !filename.contains('\\')
}

fn content_type_for(filename: &str) -> &'static str {
    match filename
        .rsplit('.')
        .next()
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

fn resolve_base_url(config: &Config, headers: &HeaderMap) -> String {
    if let Some(base) = config.server.public_base_url.as_deref() {
        return base.to_string();
    }
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{}", host)
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

use axum::{
    extract::{Json, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use serde::Deserialize;
use serde_json::json;
use std::{
    env,
    fs::OpenOptions,
    io::Write,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::signal;
use tower_http::cors::{AllowOrigin, CorsLayer};

use relaygate_server::commands::{nginx_version, test_destination};
use relaygate_server::models::Destination;
use relaygate_server::services::{
    ConfigValidator, EgressSupervisor, LivenessProbe, ProcessController, StateStore,
    ValidationMode,
};

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_PORT: u16 = 8008;
const DEFAULT_CONFIG_PATH: &str = "/tmp/nginx-rtmp.conf";
const DEFAULT_PID_PATH: &str = "/tmp/nginx.pid";
const DEFAULT_STAT_URL: &str = "http://127.0.0.1:8080/stat";

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone)]
struct AppState {
    store: Arc<StateStore>,
    supervisor: Arc<EgressSupervisor>,
    controller: Arc<ProcessController>,
    nginx_binary: String,
    stat_url: String,
    http: reqwest::Client,
}

// ============================================================================
// Logging
// ============================================================================

struct ServerLogger {
    file: Mutex<std::fs::File>,
    level: LevelFilter,
}

impl ServerLogger {
    fn new(log_dir: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let log_path = log_dir.join("relaygate-server.log");
        let file = OpenOptions::new().create(true).append(true).open(log_path)?;
        Ok(Self {
            file: Mutex::new(file),
            level: LevelFilter::Info,
        })
    }
}

impl Log for ServerLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now();
        let date = timestamp.format("%Y-%m-%d");
        let time = timestamp.format("%H:%M:%S");
        let target = record.target();
        let level = record.level();
        let line = format!("[{date}][{time}][{target}][{level}] {}", record.args());

        if let Ok(mut file) = self.file.try_lock() {
            let _ = writeln!(file, "{line}");
        }

        // Mirror to stderr so the server is observable without tailing the file
        if level <= Level::Info {
            eprintln!("{line}");
        }
    }

    fn flush(&self) {}
}

// ============================================================================
// Helpers
// ============================================================================

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn parse_host(host: &str) -> IpAddr {
    host.parse().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

// ============================================================================
// CORS Configuration
// ============================================================================

fn build_cors_layer() -> CorsLayer {
    let cors_origins = env::var("RELAYGATE_CORS_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:*,http://127.0.0.1:*".to_string());

    let allowed_origins: Vec<String> = cors_origins
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let origin_str = match origin.to_str() {
                Ok(s) => s,
                Err(_) => return false,
            };

            allowed_origins.iter().any(|allowed| {
                if allowed.ends_with(":*") {
                    // Wildcard port matching
                    let prefix = allowed.trim_end_matches(":*");
                    origin_str.starts_with(prefix) && origin_str[prefix.len()..].starts_with(':')
                } else {
                    origin_str == allowed
                }
            })
        }))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

// ============================================================================
// Request Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

/// Reconcile the egress process with the current destination set
async fn apply_egress_handler(State(state): State<AppState>) -> Response {
    let supervisor = Arc::clone(&state.supervisor);
    let result = tokio::task::spawn_blocking(move || supervisor.apply()).await;

    match result {
        Ok(Ok(outcome)) => Json(outcome).into_response(),
        Ok(Err(e)) => {
            log::error!("Failed to apply egress config: {e}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => {
            log::error!("Apply task panicked: {e}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to apply config")
        }
    }
}

/// Read back the configuration most recently written for the egress process
async fn egress_config_handler(State(state): State<AppState>) -> impl IntoResponse {
    let config = state
        .supervisor
        .rendered_config()
        .unwrap_or_else(|| "No config found".to_string());
    Json(json!({ "config": config }))
}

async fn egress_status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.status())
}

/// Pass through the rtmp_stat XML from the egress process's HTTP endpoint
async fn egress_stats_handler(State(state): State<AppState>) -> Response {
    let request = state
        .http
        .get(&state.stat_url)
        .header(reqwest::header::ACCEPT, "text/xml")
        .send()
        .await;

    match request {
        Ok(response) if response.status().is_success() => {
            let xml = response.text().await.unwrap_or_default();
            ([(header::CONTENT_TYPE, "text/xml")], xml).into_response()
        }
        Ok(response) => error_json(
            StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            "Failed to fetch egress stats",
        ),
        Err(e) => {
            log::warn!("Egress stats unavailable: {e}");
            error_json(StatusCode::SERVICE_UNAVAILABLE, "Egress process not available")
        }
    }
}

async fn egress_version_handler(State(state): State<AppState>) -> Response {
    let binary = state.nginx_binary.clone();
    match tokio::task::spawn_blocking(move || nginx_version(&binary)).await {
        Ok(Ok(version)) => Json(json!({ "version": version })).into_response(),
        Ok(Err(e)) => error_json(StatusCode::SERVICE_UNAVAILABLE, e),
        Err(_) => error_json(StatusCode::INTERNAL_SERVER_ERROR, "Version probe failed"),
    }
}

async fn get_template_handler(State(state): State<AppState>) -> Response {
    match state.store.load_template() {
        Ok(Some(template)) => Json(json!({ "template": template })).into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, "Egress template not found"),
        Err(e) => {
            log::error!("Failed to load template: {e}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load template")
        }
    }
}

#[derive(Deserialize)]
struct TemplateUpdate {
    template: String,
}

async fn put_template_handler(
    State(state): State<AppState>,
    Json(payload): Json<TemplateUpdate>,
) -> Response {
    match state.store.save_template(&payload.template) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => {
            log::error!("Failed to save template: {e}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save template")
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DestinationPayload {
    name: String,
    rtmp_url: String,
    stream_key: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn list_destinations_handler(State(state): State<AppState>) -> Response {
    match state.store.list_destinations() {
        Ok(destinations) => Json(destinations).into_response(),
        Err(e) => {
            log::error!("Failed to list destinations: {e}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list destinations")
        }
    }
}

async fn create_destination_handler(
    State(state): State<AppState>,
    Json(payload): Json<DestinationPayload>,
) -> Response {
    let mut destination = Destination::new(payload.name, payload.rtmp_url, payload.stream_key);
    destination.enabled = payload.enabled;

    match state.store.add_destination(destination) {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(e) => {
            log::error!("Failed to create destination: {e}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create destination")
        }
    }
}

async fn update_destination_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<DestinationPayload>,
) -> Response {
    let destination = Destination {
        id,
        name: payload.name,
        rtmp_url: payload.rtmp_url,
        stream_key: payload.stream_key,
        enabled: payload.enabled,
    };

    match state.store.update_destination(&destination) {
        Ok(()) => Json(destination).into_response(),
        Err(e) if e.contains("not found") => error_json(StatusCode::NOT_FOUND, e),
        Err(e) => {
            log::error!("Failed to update destination: {e}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to update destination")
        }
    }
}

async fn delete_destination_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.store.remove_destination(&id) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) if e.contains("not found") => error_json(StatusCode::NOT_FOUND, e),
        Err(e) => {
            log::error!("Failed to delete destination: {e}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete destination")
        }
    }
}

async fn test_destination_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let destination = match state.store.get_destination(&id) {
        Ok(destination) => destination,
        Err(e) => return error_json(StatusCode::NOT_FOUND, e),
    };

    match tokio::task::spawn_blocking(move || test_destination(&destination)).await {
        Ok(Ok(result)) => Json(result).into_response(),
        Ok(Err(e)) => error_json(StatusCode::BAD_REQUEST, e),
        Err(_) => error_json(StatusCode::INTERNAL_SERVER_ERROR, "Destination test failed"),
    }
}

// ============================================================================
// Startup
// ============================================================================

/// Graceful shutdown signal handler
/// Waits for Ctrl+C or SIGTERM, then stops the managed egress process
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("Shutdown signal received, stopping egress process...");
    state.controller.stop();
    log::info!("Egress process stopped, server shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration from environment
    let data_dir = env::var("RELAYGATE_DATA_DIR").unwrap_or_else(|_| "data".to_string());
    let log_dir = env::var("RELAYGATE_LOG_DIR").unwrap_or_else(|_| format!("{data_dir}/logs"));
    let host = env::var("RELAYGATE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("RELAYGATE_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let nginx_binary = env::var("NGINX_BINARY").unwrap_or_else(|_| "nginx".to_string());
    let config_path = PathBuf::from(
        env::var("NGINX_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );
    let pid_path = PathBuf::from(
        env::var("NGINX_PID_PATH").unwrap_or_else(|_| DEFAULT_PID_PATH.to_string()),
    );
    let stat_url = env::var("NGINX_STAT_URL").unwrap_or_else(|_| DEFAULT_STAT_URL.to_string());

    let ingest_key = env::var("INGEST_KEY").ok().and_then(|value| {
        let trimmed = value.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    });

    let validation_mode = env::var("RELAYGATE_VALIDATION")
        .ok()
        .and_then(|value| ValidationMode::parse(&value))
        .unwrap_or(ValidationMode::Lenient);

    let liveness = match env::var("RELAYGATE_LIVENESS")
        .map(|value| value.trim().to_lowercase())
        .as_deref()
    {
        Ok("pidfile") => LivenessProbe::PidFile(pid_path),
        _ => LivenessProbe::Handle,
    };

    let app_data_dir = PathBuf::from(&data_dir);
    let log_dir_path = PathBuf::from(&log_dir);
    std::fs::create_dir_all(&app_data_dir)?;
    std::fs::create_dir_all(&log_dir_path)?;

    let logger = ServerLogger::new(&log_dir_path)?;
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(LevelFilter::Info);

    if ingest_key.is_none() {
        log::warn!("INGEST_KEY is not set; apply will fail until it is configured");
    }
    log::info!("Validation mode: {validation_mode:?}, liveness probe: {liveness:?}");

    let store = Arc::new(StateStore::new(app_data_dir));
    if let Err(e) = store.ensure_defaults() {
        log::error!("Failed to seed defaults: {e}");
    }

    let controller = Arc::new(ProcessController::new(
        nginx_binary.clone(),
        config_path.clone(),
        liveness,
    ));

    let supervisor = Arc::new(EgressSupervisor::new(
        Arc::clone(&store),
        Arc::clone(&controller),
        ConfigValidator::new(nginx_binary.clone()),
        validation_mode,
        config_path,
        ingest_key,
    ));

    let state = AppState {
        store,
        supervisor,
        controller,
        nginx_binary,
        stat_url,
        http: reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to create HTTP client"),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/egress/apply", post(apply_egress_handler))
        .route("/api/egress/config", get(egress_config_handler))
        .route("/api/egress/status", get(egress_status_handler))
        .route("/api/egress/stats", get(egress_stats_handler))
        .route("/api/egress/version", get(egress_version_handler))
        .route("/api/template", get(get_template_handler).put(put_template_handler))
        .route(
            "/api/destinations",
            get(list_destinations_handler).post(create_destination_handler),
        )
        .route(
            "/api/destinations/:id",
            put(update_destination_handler).delete(delete_destination_handler),
        )
        .route("/api/destinations/:id/test", post(test_destination_handler))
        .with_state(state.clone())
        .layer(build_cors_layer());

    let address = SocketAddr::new(parse_host(&host), port);
    log::info!("RelayGate backend listening on http://{address}");

    let listener = tokio::net::TcpListener::bind(address).await?;

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

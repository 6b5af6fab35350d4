mod archive;
mod catalog;
mod config;
mod http;
mod jobs;
mod ledger;
mod maintenance;
mod matcher;
mod metrics;
mod models;
mod reconcile;
mod sizes;
mod spreadsheet;
mod uploader;

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Multipart, Path, State,
        multipart::{Field, MultipartError, MultipartRejection},
        rejection::JsonRejection,
    },
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
};
use catalog::InMemoryCatalog;
use config::{ImportConfig, ServerConfig, StorageConfig};
use jobs::{AdmissionError, ImportRequest, ImportSupervisor, StatusSnapshot};
use ledger::{AssetLedger, MemoryLedger, RedisLedger};
use maintenance::{CatalogMaintenance, MaintenanceError};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, BatchListing, DeletionSummary, ImportMode, ProductFilter};
use reconcile::Reconciler;
use serde_json::json;
use std::{
    net::SocketAddr,
    path::{Path as FsPath, PathBuf},
    sync::Arc,
};
use tokio::io::AsyncWriteExt;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "catalog.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let server = ServerConfig::from_env();
    let import = ImportConfig::from_env();
    let storage = StorageConfig::from_env();

    let catalog = Arc::new(match &server.catalog_snapshot {
        Some(path) => InMemoryCatalog::open(path.clone()).await?,
        None => InMemoryCatalog::new(),
    });
    let ledger: Arc<dyn AssetLedger> = match storage.redis_url.as_deref().map(redis::Client::open) {
        Some(Ok(client)) => Arc::new(RedisLedger::new(client)),
        Some(Err(err)) => {
            warn!(target = "catalog.api", error = %err, "redis_unavailable_using_memory_ledger");
            Arc::new(MemoryLedger::default())
        }
        None => Arc::new(MemoryLedger::default()),
    };
    let assets = uploader::store_from_config(&storage, Some(ledger));
    let reconciler = Arc::new(Reconciler::new(
        catalog.clone(),
        assets.clone(),
        import.placeholder_image.clone(),
    ));
    let supervisor = ImportSupervisor::new(reconciler, import);
    let maintenance = CatalogMaintenance::new(catalog, assets);
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let media_base = storage.media_base_url.trim_end_matches('/');
    let media = (storage.remote_url.is_none() && media_base.starts_with('/'))
        .then(|| (media_base.to_string(), storage.media_dir.clone()));

    let port = server.port;
    let app = build_router(AppState {
        supervisor,
        maintenance,
        openapi: Arc::new(load_openapi()),
        prometheus_handle,
        server: Arc::new(server),
        media,
    });

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "catalog.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    supervisor: ImportSupervisor,
    maintenance: CatalogMaintenance,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
    server: Arc<ServerConfig>,
    /// Public base path and directory of locally mirrored images.
    media: Option<(String, PathBuf)>,
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);
    let body_limit = state.server.body_limit;
    let media = state.media.clone();

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/imports", post(start_import))
        .route("/imports/status", get(import_status))
        .route("/imports/products", delete(delete_products))
        .route("/imports/batches", get(list_batches))
        .route("/imports/batches/{batch_id}", delete(delete_batch))
        .with_state(state);
    if let Some((base, dir)) = media {
        app = app.nest_service(&base, ServeDir::new(dir));
    }
    app.layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or(json!({"openapi":"3.0.3"}))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "catalog-import-rs",
    }))
}

fn key_matches(headers: &HeaderMap, name: &str, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|presented| presented == expected)
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if !key_matches(&headers, "X-Docs-Key", state.server.openapi_key.as_deref()) {
        return Err(AppError::Unauthorized);
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Catalog Import API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#,
    )
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !key_matches(&headers, "X-Metrics-Key", state.server.metrics_key.as_deref()) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Start an import run.
///
/// - Method: `POST`
/// - Path: `/imports`
/// - Body: multipart with `file` (spreadsheet), optional `images` (ZIP),
///   optional `category` and `mode`
/// - Response: `202` with the status snapshot; `409` while another run is active
async fn start_import(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<StatusSnapshot>), AppError> {
    crate::metrics::inc_requests("/imports");
    let mut multipart = multipart.map_err(|err| AppError::BadRequest(err.body_text()))?;
    let mut form = ImportForm::default();
    if let Err(err) =
        read_import_form(&mut multipart, &state.supervisor.config().upload_dir, &mut form).await
    {
        form.discard().await;
        return Err(err);
    }

    let Some(mode) = ImportMode::parse(form.mode.as_deref().unwrap_or_default()) else {
        form.discard().await;
        return Err(AppError::BadRequest(
            "mode must be `standard` or `smart`".into(),
        ));
    };
    let Some((spreadsheet, original_name)) = form.spreadsheet.take() else {
        form.discard().await;
        return Err(AppError::BadRequest("multipart field `file` is required".into()));
    };
    let request = ImportRequest {
        spreadsheet,
        original_name,
        archive: form.archive.take(),
        category: form.category.take(),
        mode,
    };
    match state.supervisor.start(request.clone()).await {
        Ok(snapshot) => Ok((StatusCode::ACCEPTED, Json(snapshot))),
        Err(err) => {
            request.discard().await;
            Err(err.into())
        }
    }
}

async fn import_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    crate::metrics::inc_requests("/imports/status");
    Json(state.supervisor.poll().await)
}

/// Delete imported products matching a filter. An empty filter is a `400`.
async fn delete_products(
    State(state): State<AppState>,
    payload: Result<Json<ProductFilter>, JsonRejection>,
) -> Result<Json<DeletionSummary>, AppError> {
    crate::metrics::inc_requests("/imports/products");
    let Json(filter) = payload.map_err(|err| AppError::BadRequest(err.body_text()))?;
    Ok(Json(state.maintenance.delete_imported(&filter).await?))
}

async fn delete_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<DeletionSummary>, AppError> {
    crate::metrics::inc_requests("/imports/batches/{batch_id}");
    let Ok(batch_id) = Uuid::parse_str(&batch_id) else {
        return Err(AppError::BadRequest(format!("invalid batch id `{batch_id}`")));
    };
    Ok(Json(state.maintenance.delete_batch(batch_id).await?))
}

async fn list_batches(State(state): State<AppState>) -> Result<Json<BatchListing>, AppError> {
    crate::metrics::inc_requests("/imports/batches");
    Ok(Json(state.maintenance.list_batches().await?))
}

#[derive(Debug, Default)]
struct ImportForm {
    /// Stored path and the name the client uploaded it under.
    spreadsheet: Option<(PathBuf, String)>,
    archive: Option<PathBuf>,
    category: Option<String>,
    mode: Option<String>,
}

impl ImportForm {
    async fn discard(&self) {
        let stored = self
            .spreadsheet
            .iter()
            .map(|(path, _)| path)
            .chain(self.archive.iter());
        for path in stored {
            if let Err(err) = tokio::fs::remove_file(path).await {
                debug!(target = "catalog.api", path = %path.display(), error = %err, "upload_discard_failed");
            }
        }
    }
}

async fn read_import_form(
    multipart: &mut Multipart,
    upload_dir: &FsPath,
    form: &mut ImportForm,
) -> Result<(), AppError> {
    tokio::fs::create_dir_all(upload_dir)
        .await
        .map_err(|err| AppError::Internal(format!("upload dir: {err}")))?;
    while let Some(mut field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" | "images" => {
                let original = base_name(field.file_name().unwrap_or(&name));
                let Some(stored) = save_upload(&mut field, upload_dir, &original).await? else {
                    // an empty part counts as not sent
                    continue;
                };
                let replaced = if name == "file" {
                    form.spreadsheet.replace((stored, original)).map(|(path, _)| path)
                } else {
                    form.archive.replace(stored)
                };
                if let Some(path) = replaced {
                    tokio::fs::remove_file(path).await.ok();
                }
            }
            "category" => form.category = Some(field.text().await.map_err(bad_multipart)?),
            "mode" => form.mode = Some(field.text().await.map_err(bad_multipart)?),
            other => debug!(target = "catalog.api", field = other, "multipart_field_ignored"),
        }
    }
    Ok(())
}

/// Streams a file part to `<upload_dir>/<uuid>-<name>`. `None` for an empty part.
async fn save_upload(
    field: &mut Field<'_>,
    upload_dir: &FsPath,
    original: &str,
) -> Result<Option<PathBuf>, AppError> {
    let path = upload_dir.join(format!(
        "{}-{}",
        Uuid::new_v4().simple(),
        sanitize_file_name(original)
    ));
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|err| AppError::Internal(format!("upload file: {err}")))?;
    let mut written = 0u64;
    let copied: Result<(), AppError> = async {
        while let Some(chunk) = field.chunk().await.map_err(bad_multipart)? {
            file.write_all(&chunk)
                .await
                .map_err(|err| AppError::Internal(format!("upload write: {err}")))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|err| AppError::Internal(format!("upload write: {err}")))
    }
    .await;
    drop(file);
    if copied.is_err() || written == 0 {
        tokio::fs::remove_file(&path).await.ok();
    }
    copied?;
    debug!(target = "catalog.api", file = %original, bytes = written, "upload_stored");
    Ok((written > 0).then_some(path))
}

fn bad_multipart(err: MultipartError) -> AppError {
    AppError::BadRequest(err.body_text())
}

fn base_name(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or(name).trim().to_string()
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Maintenance(#[from] MaintenanceError),
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            AppError::Admission(AdmissionError::Busy) => (StatusCode::CONFLICT, "import_in_progress"),
            AppError::Admission(AdmissionError::BadRequest(_)) => {
                (StatusCode::BAD_REQUEST, "invalid_category")
            }
            AppError::Maintenance(MaintenanceError::EmptyFilter) => {
                (StatusCode::BAD_REQUEST, "empty_filter")
            }
            AppError::Maintenance(MaintenanceError::BatchNotFound(_)) => {
                (StatusCode::NOT_FOUND, "batch_not_found")
            }
            AppError::Maintenance(MaintenanceError::Catalog(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "catalog_error")
            }
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            error!(target = "catalog.api", error = %self, "request_failed");
        }
        let payload = ApiError {
            error: code.to_string(),
            detail: Some(self.to_string()),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

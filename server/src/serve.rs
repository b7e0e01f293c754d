use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use axum::extract::{DefaultBodyLimit, Multipart, Path as AxumPath, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use clap::Args;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::builder::PyramidBuilder;
use crate::core::face::{FaceImage, FaceName};
use crate::core::pyramid::{panorama_dir, parse_tile_name, tile_path, validate_panorama_id};
use crate::ingest::PyramidArgs;
use crate::store::{DocumentStore, MemoryStore, PanoramaRecord};

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub pyramid: PyramidArgs,
    #[arg(long, default_value_t = 3000)]
    pub port: u16,
    /// In-memory tile cache capacity (entries)
    #[arg(long, default_value_t = 2048)]
    pub cache_entries: usize,
    /// Largest accepted upload body, in MiB
    #[arg(long, default_value_t = 256)]
    pub max_upload_mb: usize,
    #[arg(long, default_value_t = 30)]
    pub metrics_interval_secs: u64,
    #[arg(long)]
    pub rayon_threads: Option<usize>,
    #[arg(long, default_value_t = 8)]
    pub tokio_workers: usize,
    #[arg(long, default_value_t = 32)]
    pub tokio_blocking_threads: usize,
}

#[derive(Clone)]
pub struct AppState {
    builder: Arc<PyramidBuilder>,
    store: Arc<dyn DocumentStore>,
    cache: Arc<moka::sync::Cache<TileKey, Bytes>>,
    metrics: Arc<Mutex<Metrics>>,
}

impl AppState {
    pub fn new(builder: PyramidBuilder, store: Arc<dyn DocumentStore>, cache_entries: usize) -> Self {
        let cache = moka::sync::Cache::builder()
            .max_capacity(cache_entries as u64)
            .time_to_idle(Duration::from_secs(300))
            .build();
        Self {
            builder: Arc::new(builder),
            store,
            cache: Arc::new(cache),
            metrics: Arc::new(Mutex::new(Metrics::default())),
        }
    }

    fn storage_root(&self) -> &std::path::Path {
        &self.builder.config().storage_root
    }
}

#[derive(Clone, Debug, Hash, Eq, PartialEq)]
struct TileKey {
    panorama_id: String,
    level: usize,
    face: FaceName,
    x: u32,
    y: u32,
}

#[derive(Default, Clone)]
struct Metrics {
    tile_total: u64,
    tile_disk: u64,
    tile_cache_hit: u64,
    tile_missing: u64,
    tile_ms_sum: u128,
    tile_ms_max: u128,
    build_ok: u64,
    build_failed: u64,
    build_ms_sum: u128,
    build_ms_max: u128,
}

impl Metrics {
    fn record_tile(&mut self, kind: &str, ms: u128) {
        self.tile_total += 1;
        self.tile_ms_sum += ms;
        if ms > self.tile_ms_max {
            self.tile_ms_max = ms;
        }
        match kind {
            "disk" => self.tile_disk += 1,
            "cache_hit" => self.tile_cache_hit += 1,
            "missing" => self.tile_missing += 1,
            _ => {}
        }
    }

    fn record_build(&mut self, ok: bool, ms: u128) {
        if ok {
            self.build_ok += 1;
        } else {
            self.build_failed += 1;
        }
        self.build_ms_sum += ms;
        if ms > self.build_ms_max {
            self.build_ms_max = ms;
        }
    }

    fn take(&mut self) -> Metrics {
        let snapshot = self.clone();
        *self = Metrics::default();
        snapshot
    }
}

pub fn run(args: ServeArgs) -> Result<()> {
    if let Some(threads) = args.rayon_threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|e| anyhow!("rayon init failed: {}", e))?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.tokio_workers)
        .max_blocking_threads(args.tokio_blocking_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args))
}

async fn async_main(args: ServeArgs) -> Result<()> {
    let config = args.pyramid.to_config()?;
    std::fs::create_dir_all(&config.storage_root)
        .with_context(|| format!("create storage root {}", config.storage_root.display()))?;
    info!(
        "storage_root={} quality={} filter={} build_timeout={:?}",
        config.storage_root.display(),
        config.quality,
        config.filter,
        config.timeout
    );

    let state = AppState::new(
        PyramidBuilder::new(config),
        Arc::new(MemoryStore::default()),
        args.cache_entries,
    );

    if args.metrics_interval_secs > 0 {
        let metrics = state.metrics.clone();
        let interval = Duration::from_secs(args.metrics_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let snapshot = metrics.lock().unwrap().take();
                if snapshot.tile_total == 0 && snapshot.build_ok + snapshot.build_failed == 0 {
                    continue;
                }
                let tile_avg = if snapshot.tile_total > 0 {
                    snapshot.tile_ms_sum / snapshot.tile_total as u128
                } else {
                    0
                };
                let builds = snapshot.build_ok + snapshot.build_failed;
                let build_avg = if builds > 0 {
                    snapshot.build_ms_sum / builds as u128
                } else {
                    0
                };
                info!(
                    "metrics tiles_total={} disk={} cache_hit={} missing={} tile_avg_ms={} tile_max_ms={} builds_ok={} builds_failed={} build_avg_ms={} build_max_ms={}",
                    snapshot.tile_total,
                    snapshot.tile_disk,
                    snapshot.tile_cache_hit,
                    snapshot.tile_missing,
                    tile_avg,
                    snapshot.tile_ms_max,
                    snapshot.build_ok,
                    snapshot.build_failed,
                    build_avg,
                    snapshot.build_ms_max
                );
            }
        });
    }

    let app = build_router(state, args.max_upload_mb * 1024 * 1024);

    let addr = format!("0.0.0.0:{}", args.port);
    info!(
        "listening on http://{} (rayon_threads={}, tokio_workers={}, tokio_blocking_threads={})",
        addr,
        rayon::current_num_threads(),
        args.tokio_workers,
        args.tokio_blocking_threads
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Routes for panorama upload/list/delete and tile serving.
pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/panoramas",
            get(list_panoramas)
                .post(create_panorama)
                .layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/panoramas/:panorama_id", axum::routing::delete(delete_panorama))
        // Paths used by the existing editor client
        .route(
            "/panorama",
            axum::routing::post(create_panorama)
                .delete(delete_panorama_by_body)
                .layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/data", get(list_panoramas))
        .route("/cubemaps/:panorama_id/:level/:face/:tile", get(get_tile))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn jpeg_response(bytes: Bytes) -> Response {
    let mut resp = Response::new(bytes.into());
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
    resp
}

async fn get_tile(
    State(state): State<AppState>,
    AxumPath((panorama_id, level, face, tile)): AxumPath<(String, usize, String, String)>,
) -> Result<Response, StatusCode> {
    let start = Instant::now();
    validate_panorama_id(&panorama_id).map_err(|_| StatusCode::BAD_REQUEST)?;
    let face = FaceName::from_str(&face).map_err(|_| StatusCode::BAD_REQUEST)?;
    let (x, y) = parse_tile_name(&tile).ok_or(StatusCode::BAD_REQUEST)?;

    let key = TileKey {
        panorama_id,
        level,
        face,
        x,
        y,
    };
    if let Some(bytes) = state.cache.get(&key) {
        state
            .metrics
            .lock()
            .unwrap()
            .record_tile("cache_hit", start.elapsed().as_millis());
        return Ok(jpeg_response(bytes));
    }

    let path = tile_path(state.storage_root(), &key.panorama_id, level, face, x, y);
    let bytes = match tokio::fs::read(&path).await {
        Ok(data) => Bytes::from(data),
        Err(_) => {
            state
                .metrics
                .lock()
                .unwrap()
                .record_tile("missing", start.elapsed().as_millis());
            return Err(StatusCode::NOT_FOUND);
        }
    };
    state.cache.insert(key, bytes.clone());
    state
        .metrics
        .lock()
        .unwrap()
        .record_tile("disk", start.elapsed().as_millis());
    Ok(jpeg_response(bytes))
}

async fn list_panoramas(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "panoramas": state.store.list() }))
}

/// Six cube faces plus their declared edge length, as posted by the editor.
struct Upload {
    faces: Vec<FaceImage>,
    size: u32,
    name: Option<String>,
}

async fn read_upload(multipart: &mut Multipart) -> std::result::Result<Upload, String> {
    let mut faces = Vec::new();
    let mut size = None;
    let mut name = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| format!("malformed upload: {}", e))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "cubemaptiles" => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| "cubemaptiles part without a file name".to_string())?;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| format!("reading '{}': {}", file_name, e))?;
                faces.push(FaceImage::new(file_name, bytes));
            }
            "widthAndHeight" => {
                let text = field.text().await.map_err(|e| e.to_string())?;
                let parsed = text
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| format!("widthAndHeight '{}' is not a whole pixel count", text))?;
                size = Some(parsed);
            }
            "originalImageFileName" => {
                let text = field.text().await.map_err(|e| e.to_string())?;
                if !text.trim().is_empty() {
                    name = Some(text);
                }
            }
            _ => {}
        }
    }

    if faces.is_empty() {
        return Err("Please provide panorama cubemap image files".to_string());
    }
    let size = size.ok_or_else(|| "missing widthAndHeight".to_string())?;
    Ok(Upload { faces, size, name })
}

async fn create_panorama(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let upload = match read_upload(&mut multipart).await {
        Ok(upload) => upload,
        Err(msg) => return json_error(StatusCode::BAD_REQUEST, msg),
    };

    let id = uuid::Uuid::new_v4().simple().to_string();
    let start = Instant::now();
    info!(
        "creating panorama id={} faces={} size={}",
        id,
        upload.faces.len(),
        upload.size
    );
    let result = state
        .builder
        .build_pyramid(&id, upload.faces, upload.size)
        .await;
    let ms = start.elapsed().as_millis();

    match result {
        Ok(levels) => {
            state.metrics.lock().unwrap().record_build(true, ms);
            let record = state.store.save(PanoramaRecord {
                id,
                name: upload.name.unwrap_or_else(|| "Unknown name".to_string()),
                cubemap_levels: levels,
            });
            info!("New panorama added! id={} ms={}", record.id, ms);
            Json(json!({ "panorama": record })).into_response()
        }
        Err(err) => {
            state.metrics.lock().unwrap().record_build(false, ms);
            warn!("panorama {} failed after {}ms: {}", id, ms, err);
            let dir = panorama_dir(state.storage_root(), &id);
            if dir.exists() {
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    warn!("cleanup of {} failed: {}", dir.display(), e);
                }
            }
            json_error(StatusCode::from(&err), err.to_string())
        }
    }
}

#[derive(Deserialize)]
struct DeleteRequest {
    #[serde(rename = "_id")]
    id: String,
}

async fn delete_panorama_by_body(
    State(state): State<AppState>,
    Json(req): Json<DeleteRequest>,
) -> Result<Response, StatusCode> {
    remove_panorama(&state, req.id).await
}

async fn delete_panorama(
    State(state): State<AppState>,
    AxumPath(panorama_id): AxumPath<String>,
) -> Result<Response, StatusCode> {
    remove_panorama(&state, panorama_id).await
}

async fn remove_panorama(state: &AppState, panorama_id: String) -> Result<Response, StatusCode> {
    validate_panorama_id(&panorama_id).map_err(|_| StatusCode::BAD_REQUEST)?;
    let removed = state.store.remove(&panorama_id);

    let dir: PathBuf = panorama_dir(state.storage_root(), &panorama_id);
    if dir.exists() {
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
            warn!("delete of {} failed: {}", dir.display(), err);
        }
    }
    let stale: Vec<Arc<TileKey>> = state
        .cache
        .iter()
        .filter(|(k, _)| k.panorama_id == panorama_id)
        .map(|(k, _)| k)
        .collect();
    for key in stale {
        state.cache.invalidate(key.as_ref());
    }

    info!("deleted panorama id={} existed={}", panorama_id, removed.is_some());
    Ok(Json(json!({ "deleted": removed.is_some() })).into_response())
}

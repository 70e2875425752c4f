use std::io;

use atelier_core::{
    output::is_safe_filename, DeleteOutcome, DiskState, GenerationRequest, GenerationResult,
    ModelDescriptor, StylePreset,
};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Json, Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::StreamExt;
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/generate", post(generate))
        .route("/models", get(list_models))
        .route("/models/download", post(download_model))
        .route("/models/delete", post(delete_model))
        .route("/unload", post(unload))
        .route("/cancel", post(cancel))
        .route("/styles", get(list_styles))
        .route("/image/{filename}", get(serve_image))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Deserialize)]
struct ModelBody {
    model: String,
}

async fn generate(
    State(state): State<AppState>,
    request: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResult>, ApiError> {
    let Json(request) = request?;
    // Detached so a client disconnect cannot abandon a generation holding the slot.
    let dispatcher = state.dispatcher.clone();
    let result = tokio::spawn(async move { dispatcher.dispatch(request).await })
        .await
        .map_err(|join| ApiError::Internal(format!("generation task failed: {join}")))??;
    Ok(Json(result))
}

async fn download_model(
    State(state): State<AppState>,
    body: Result<Json<ModelBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    let events = state.downloads.download(&body.model).await?;
    let lines = events.map(|event| serde_json::to_string(&event).map(|line| line + "\n"));
    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

async fn delete_model(
    State(state): State<AppState>,
    body: Result<Json<ModelBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body?;
    let outcome = state.guard.delete(&body.model).await?;
    Ok(Json(match outcome {
        DeleteOutcome::Deleted { freed_bytes } => json!({
            "deleted": true,
            "model": body.model,
            "freed_bytes": freed_bytes,
        }),
        DeleteOutcome::AlreadyAbsent => json!({
            "deleted": false,
            "model": body.model,
            "message": "model was not on disk",
        }),
    }))
}

async fn unload(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let released = state.slot.unload().await?;
    Ok(Json(json!({
        "unloaded": released.is_some(),
        "model": released,
    })))
}

async fn cancel(State(state): State<AppState>) -> Json<Value> {
    let running = state.slot.snapshot().inference_running;
    let epoch = state.slot.request_cancel().await;
    info!(epoch, running, "cancel acknowledged");
    let message = if running {
        "the running generation will complete and be flagged as cancel requested"
    } else {
        "no generation was running"
    };
    Json(json!({
        "acknowledged": true,
        "inference_running": running,
        "cancel_epoch": epoch,
        "message": message,
    }))
}

#[derive(Serialize)]
struct ModelEntry {
    #[serde(flatten)]
    descriptor: ModelDescriptor,
    state: DiskState,
    downloaded: bool,
    loaded_in_memory: bool,
    size_on_disk: u64,
}

async fn list_models(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let loaded = state.slot.snapshot().model;
    let default_model = state.registry.default_key();
    let entries = {
        let state = state.clone();
        let loaded = loaded.clone();
        tokio::task::spawn_blocking(move || {
            state
                .registry
                .iter()
                .map(|descriptor| {
                    let disk = state.downloads.disk_state(descriptor.key);
                    ModelEntry {
                        descriptor: descriptor.clone(),
                        state: disk,
                        downloaded: disk == DiskState::Present,
                        loaded_in_memory: loaded.as_deref() == Some(descriptor.key),
                        size_on_disk: state.store.size_on_disk(descriptor.key),
                    }
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|join| ApiError::Internal(join.to_string()))?
    };
    Ok(Json(json!({
        "models": entries,
        "default_model": default_model,
        "loaded_model": loaded,
    })))
}

async fn list_styles(State(state): State<AppState>) -> Json<Value> {
    let styles: Vec<Value> = StylePreset::ALL
        .iter()
        .map(|style| json!({ "key": style.key(), "modifier": style.modifier() }))
        .collect();
    Json(json!({
        "styles": styles,
        "default": state.default_style.key(),
    }))
}

async fn serve_image(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    if !is_safe_filename(&filename) || !filename.ends_with(".png") {
        return Err(ApiError::NotFound(filename));
    }
    match tokio::fs::read(state.output_dir.join(&filename)).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ApiError::NotFound(filename)),
        Err(e) => Err(ApiError::Internal(format!("failed to read {filename}: {e}"))),
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let slot = state.slot.snapshot();
    let model_status = if slot.model.is_some() { "loaded" } else { "lazy_waiting" };
    Json(json!({
        "status": "ready",
        "model_status": model_status,
        "device": state.slot.device_name(),
        "resident_bytes": slot.resident_bytes,
        "slot": slot,
        "default_model": state.registry.default_key(),
        "models_dir": state.store.base_dir().display().to_string(),
        "output_dir": state.output_dir.display().to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use std::path::{Path as FsPath, PathBuf};
    use std::sync::Arc;

    use async_trait::async_trait;
    use atelier_core::{
        Artifact, Config, Fetcher, FluxVariant, InferenceParams, LoadRequest, Loader, ModelLike,
        ModelVariant, Registry,
    };
    use axum::http::{Request, StatusCode};
    use image::DynamicImage;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;

    const STUB_ARTIFACTS: &[Artifact] = &[Artifact::new("stub/model", "weights.safetensors")];

    struct StubLoader;

    impl Loader for StubLoader {
        fn load(&self, _request: LoadRequest<'_>) -> anyhow::Result<Box<dyn ModelLike>> {
            Ok(Box::new(StubModel))
        }
    }

    struct StubModel;

    impl ModelLike for StubModel {
        fn run(&mut self, params: &InferenceParams) -> anyhow::Result<DynamicImage> {
            Ok(DynamicImage::new_rgb8(
                params.width as u32 / 8,
                params.height as u32 / 8,
            ))
        }

        fn release(self: Box<Self>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct StubFetcher;

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(
            &self,
            artifact: &Artifact,
            dest: &FsPath,
            _token: Option<&str>,
        ) -> anyhow::Result<PathBuf> {
            tokio::fs::create_dir_all(dest).await?;
            let path = dest.join(artifact.file);
            tokio::fs::write(&path, b"stub").await?;
            Ok(path)
        }
    }

    fn stub_descriptor(key: &'static str) -> ModelDescriptor {
        ModelDescriptor {
            key,
            name: key,
            remote_id: "stub/model",
            variant: ModelVariant::Flux(FluxVariant::Schnell),
            requires_auth: false,
            default_steps: 2,
            default_guidance: 0.0,
            default_width: 64,
            default_height: 64,
            needs_memory_optimization: false,
            artifacts: STUB_ARTIFACTS,
        }
    }

    fn app() -> (TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            models_dir: dir.path().join("models"),
            output_dir: dir.path().join("output"),
            ..Default::default()
        };
        config.create_dirs().unwrap();
        let registry = Registry::new(vec![stub_descriptor("alpha"), stub_descriptor("beta")]);
        let state = AppState::new(&config, registry, Arc::new(StubLoader), Arc::new(StubFetcher));
        (dir, router(state))
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, bytes) = call(app, request).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let (status, bytes) = call(app, Request::get(uri).body(Body::empty()).unwrap()).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn download(app: &Router, model: &str) -> Vec<Value> {
        let request = Request::post("/models/download")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "model": model }).to_string()))
            .unwrap();
        let (status, bytes) = call(app, request).await;
        assert_eq!(status, StatusCode::OK);
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn health_reports_an_empty_slot() {
        let (_dir, app) = app();
        let (status, body) = get_json(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["model_status"], "lazy_waiting");
        assert_eq!(body["slot"]["status"], "empty");
        assert_eq!(body["default_model"], "alpha");
    }

    #[tokio::test]
    async fn unknown_and_missing_models_are_client_errors() {
        let (_dir, app) = app();
        let (status, body) =
            post_json(&app, "/generate", json!({ "prompt": "x", "model": "omega" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_MODEL");

        let (status, body) =
            post_json(&app, "/generate", json!({ "prompt": "x", "model": "alpha" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MODEL_NOT_DOWNLOADED");
    }

    #[tokio::test]
    async fn malformed_bodies_are_invalid_requests() {
        let (_dir, app) = app();
        let (status, body) = post_json(&app, "/models/download", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUEST");
        assert!(body["error"].as_str().unwrap().contains("model"));

        let request = Request::post("/generate")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("a fox"))
            .unwrap();
        let (status, bytes) = call(&app, request).await;
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUEST");

        let request = Request::post("/models/delete")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"model\":"))
            .unwrap();
        let (status, bytes) = call(&app, request).await;
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn download_streams_ndjson_until_complete() {
        let (_dir, app) = app();
        let events = download(&app, "alpha").await;
        assert_eq!(events.first().unwrap()["phase"], "starting");
        assert_eq!(events.last().unwrap()["phase"], "complete");

        let again = download(&app, "alpha").await;
        assert_eq!(again.len(), 1);
        assert_eq!(again[0]["alreadyDownloaded"], true);

        let (_, body) = get_json(&app, "/models").await;
        let alpha = &body["models"][0];
        assert_eq!(alpha["key"], "alpha");
        assert_eq!(alpha["downloaded"], true);
        assert_eq!(alpha["loaded_in_memory"], false);
        assert_eq!(alpha["size_on_disk"], 4);
    }

    #[tokio::test]
    async fn full_lifecycle_through_http() {
        let (_dir, app) = app();
        download(&app, "alpha").await;

        let (status, result) =
            post_json(&app, "/generate", json!({ "prompt": "a fox", "style": "anime" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["model"], "alpha");
        assert_eq!(result["style"], "anime");

        let uri = result["relative_path"].as_str().unwrap().to_string();
        let (status, png) = call(&app, Request::get(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(image::load_from_memory(&png).unwrap().width(), 8);

        let (status, body) = post_json(&app, "/models/delete", json!({ "model": "alpha" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MODEL_IN_USE");

        let (status, body) = post_json(&app, "/unload", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["unloaded"], true);
        assert_eq!(body["model"], "alpha");

        let (status, body) = post_json(&app, "/models/delete", json!({ "model": "alpha" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], true);

        let (_, body) = post_json(&app, "/models/delete", json!({ "model": "alpha" })).await;
        assert_eq!(body["deleted"], false);
    }

    #[tokio::test]
    async fn image_route_rejects_traversal() {
        let (_dir, app) = app();
        let (status, body) = get_json(&app, "/image/%2E%2E%2Fsecret.png").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");

        let (status, _) = get_json(&app, "/image/20240101_000000_0001.png").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_and_styles_respond() {
        let (_dir, app) = app();
        let (status, body) = post_json(&app, "/cancel", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["acknowledged"], true);
        assert_eq!(body["inference_running"], false);

        let (_, body) = get_json(&app, "/styles").await;
        assert_eq!(body["styles"].as_array().unwrap().len(), StylePreset::ALL.len());
        assert_eq!(body["default"], "none");
    }
}

//! HTTP surface of the grasp detection service.
//!
//! A request moves through `received -> validated -> executed -> parsed ->
//! responded`; any step may end it early with a [`DetectionError`]. The
//! uploaded cloud is written to a request-unique file that is removed when the
//! request ends, whichever way it ends.
use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::{
    any::Any,
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::io::AsyncWriteExt;
use tower_http::{catch_panic::CatchPanicLayer, services::ServeFile};
use uuid::Uuid;

use super::{
    config::{DetectionParams, ServiceConfig},
    errors::DetectionError,
    executor::{DetectionJob, Detector, ExecutionResult, ProcessDetector},
    grasp::DetectionResponse,
    normalizer::Normalizer,
    prerequisites::{PrerequisiteError, PrerequisiteValidator},
};

pub const DETECT_ROUTE: &str = "/detect_grasps";
pub const SNAPSHOT_ROUTE: &str = "/visualization.png";
pub const HEALTH_ROUTE: &str = "/health";
pub const POINT_CLOUD_FIELD: &str = "point_cloud";

/// Point clouds are far larger than axum's default body limit.
pub const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

const INPUT_FILE_PREFIX: &str = "grasp-input-";

/// Raw contents of a detection request: the uploaded cloud, if any, and every
/// other form field as text.
#[derive(Clone, Debug, Default)]
pub struct DetectionUpload {
    pub point_cloud: Option<Bytes>,
    pub fields: HashMap<String, String>,
}

pub struct DetectionService {
    config: Arc<ServiceConfig>,
    validator: PrerequisiteValidator,
    detector: Arc<dyn Detector>,
    normalizer: Normalizer,
}

impl DetectionService {
    pub fn new(config: ServiceConfig) -> Self {
        let detector = Arc::new(ProcessDetector::new(&config));
        Self::with_detector(config, detector)
    }

    pub fn with_detector(config: ServiceConfig, detector: Arc<dyn Detector>) -> Self {
        Self {
            validator: PrerequisiteValidator::new(&config),
            normalizer: Normalizer::new(config.dialect()),
            config: Arc::new(config),
            detector,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn validate(&self) -> Result<(), PrerequisiteError> {
        self.validator.validate()
    }

    pub async fn detect(&self, upload: DetectionUpload) -> Result<DetectionResponse, DetectionError> {
        let request_id = Uuid::new_v4().to_string();
        let Some(point_cloud) = upload.point_cloud else {
            log::info!("[{request_id}] rejected: no point cloud attached");
            return Err(DetectionError::MissingInput);
        };

        // removed on drop, so every return below cleans up
        let input = ScopedInput::persist(self.config.workspace_dir(), &request_id, &point_cloud)
            .await
            .map_err(|err| {
                log::error!("[{request_id}] cannot store upload: {err}");
                DetectionError::StorageFailure(err)
            })?;
        log::debug!(
            "[{request_id}] stored {} bytes at {}",
            point_cloud.len(),
            input.path().display()
        );

        let params = DetectionParams::from_form(&upload.fields)?;

        if let Err(err) = self.revalidate().await {
            log::error!("[{request_id}] {err}");
            return Err(err);
        }

        if params.visualization_enabled {
            // only a snapshot written by this run may be advertised
            self.discard_snapshot(&request_id).await;
        }

        let job = DetectionJob {
            request_id: request_id.clone(),
            input_path: input.path().to_path_buf(),
            params,
        };
        let outcome = match self.detector.run(&job).await {
            ExecutionResult::Success(outcome) => outcome,
            ExecutionResult::ExecutionFailed(outcome) => {
                return Err(DetectionError::ExecutionFailed(outcome))
            }
            ExecutionResult::Timeout(outcome) => {
                return Err(DetectionError::Timeout {
                    limit: self.config.timeout(),
                    outcome,
                })
            }
            ExecutionResult::SpawnFailure(err) => return Err(DetectionError::SpawnFailure(err)),
        };

        let candidates = self.normalizer.parse(&outcome.stdout).map_err(|source| {
            log::warn!(
                "[{request_id}] unreadable {} output: {source}",
                self.normalizer.dialect()
            );
            DetectionError::Parse {
                source,
                raw_output: outcome.stdout.clone(),
            }
        })?;
        log::info!(
            "[{request_id}] {} grasps in {}ms",
            candidates.len(),
            outcome.elapsed.as_millis()
        );

        let response = DetectionResponse::from_candidates(&candidates);
        let snapshot_written = tokio::fs::metadata(self.config.snapshot_path())
            .await
            .is_ok_and(|meta| meta.is_file());
        if params.visualization_enabled && snapshot_written {
            return Ok(response.with_visualization_url(SNAPSHOT_ROUTE));
        }
        Ok(response)
    }

    // the checks may copy files, keep them off the async workers
    async fn revalidate(&self) -> Result<(), DetectionError> {
        let validator = self.validator.clone();
        tokio::task::spawn_blocking(move || validator.validate())
            .await
            .map_err(|err| DetectionError::Internal(format!("prerequisite check aborted: {err}")))?
            .map_err(DetectionError::from)
    }

    async fn discard_snapshot(&self, request_id: &str) {
        let snapshot = self.config.snapshot_path();
        match tokio::fs::remove_file(&snapshot).await {
            Ok(()) => log::debug!("[{request_id}] removed previous {}", snapshot.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("[{request_id}] could not remove {}: {err}", snapshot.display()),
        }
    }
}

/// Request-scoped copy of the uploaded cloud.
struct ScopedInput {
    path: PathBuf,
}

impl ScopedInput {
    async fn persist(workspace: &Path, request_id: &str, payload: &[u8]) -> io::Result<Self> {
        tokio::fs::create_dir_all(workspace).await?;
        let path = workspace.join(format!("{INPUT_FILE_PREFIX}{request_id}.pcd"));
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        let input = ScopedInput { path };
        file.write_all(payload).await?;
        file.flush().await?;
        Ok(input)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedInput {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("could not remove {}: {err}", self.path.display()),
        }
    }
}

pub fn router(service: Arc<DetectionService>) -> Router {
    let snapshot = ServeFile::new(service.config().snapshot_path());
    Router::new()
        .route(DETECT_ROUTE, post(detect_grasps))
        .route(HEALTH_ROUTE, get(health))
        .route_service(SNAPSHOT_ROUTE, snapshot)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(service)
}

async fn detect_grasps(
    State(service): State<Arc<DetectionService>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectionResponse>, DetectionError> {
    let upload = match multipart {
        Ok(multipart) => read_upload(multipart).await?,
        Err(rejection) => {
            log::debug!("not a multipart upload: {rejection}");
            DetectionUpload::default()
        }
    };
    service.detect(upload).await.map(Json)
}

async fn read_upload(mut multipart: Multipart) -> Result<DetectionUpload, DetectionError> {
    let malformed = |err: axum::extract::multipart::MultipartError| {
        DetectionError::MalformedUpload(err.body_text())
    };
    let mut upload = DetectionUpload::default();
    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        if name == POINT_CLOUD_FIELD {
            upload.point_cloud = Some(field.bytes().await.map_err(malformed)?);
        } else {
            let value = field.text().await.map_err(malformed)?;
            upload.fields.insert(name, value);
        }
    }
    Ok(upload)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let details = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "unknown panic".to_owned()
    };
    log::error!("request handler panicked: {details}");
    let err = DetectionError::Internal(details);
    debug_assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    err.into_response()
}

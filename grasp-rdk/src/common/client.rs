//! Calling side of the grasp service.
//!
//! The detector works on the merged item + environment cloud and reports poses
//! relative to its own frame. [`GraspClient::predict`] shifts every pose by the
//! center of the item's bounding box exactly once and hands back
//! [`CallerFrameGrasps`], which has no way to be corrected again.
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use super::{
    config::DetectionParams,
    grasp::{BestGrasp, DetectionResponse, GraspCandidate, LengthMismatch},
    math_utils::Vector3,
    point_cloud::{PointCloud, PointCloudError},
};

pub const DEFAULT_SERVER_IP: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 5000;
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(150);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("item cloud has no points to anchor the grasps on")]
    EmptyItemCloud(#[from] PointCloudError),
    #[error("request to grasp server failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("grasp server answered {status}: {error} ({details})")]
    Server {
        status: u16,
        error: String,
        details: String,
    },
    #[error("grasp server sent an inconsistent result: {0}")]
    InvalidResponse(#[from] LengthMismatch),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    pub server_ip: String,
    pub server_port: u16,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_ip: DEFAULT_SERVER_IP.to_owned(),
            server_port: DEFAULT_SERVER_PORT,
            timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Resolves the server address from `servers.graspnet.{ip,port}` of an
    /// application config document, keeping defaults for anything absent.
    pub fn from_json(document: &Value) -> Self {
        let mut config = Self::default();
        let server = &document["servers"]["graspnet"];
        if let Some(ip) = server["ip"].as_str() {
            config.server_ip = ip.to_owned();
        }
        let port = match &server["port"] {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        if let Some(port) = port.and_then(|p| u16::try_from(p).ok()) {
            config.server_port = port;
        }
        if let Some(secs) = server["timeout"].as_f64().filter(|s| *s > 0.0) {
            config.timeout = Duration::from_secs_f64(secs);
        }
        config
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.server_ip, self.server_port)
    }
}

/// Grasps already moved into the caller's frame.
#[derive(Clone, Debug, PartialEq)]
pub struct CallerFrameGrasps {
    candidates: Vec<GraspCandidate>,
    anchor: Vector3,
    visualization_url: Option<String>,
}

impl CallerFrameGrasps {
    /// Adds `anchor` to the translation of every candidate.
    pub fn correct(candidates: Vec<GraspCandidate>, anchor: Vector3) -> Self {
        Self {
            candidates: candidates.iter().map(|c| c.translated(anchor)).collect(),
            anchor,
            visualization_url: None,
        }
    }

    pub fn candidates(&self) -> &[GraspCandidate] {
        &self.candidates
    }

    pub fn into_candidates(self) -> Vec<GraspCandidate> {
        self.candidates
    }

    /// Offset that was applied.
    pub fn anchor(&self) -> Vector3 {
        self.anchor
    }

    pub fn visualization_url(&self) -> Option<&str> {
        self.visualization_url.as_deref()
    }

    pub fn best(&self) -> BestGrasp {
        BestGrasp::select(&self.candidates)
    }
}

pub struct GraspClient {
    config: ClientConfig,
    http: reqwest::Client,
}

impl GraspClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Uploads an encoded cloud as is. Poses come back in the detector's frame.
    pub async fn detect(
        &self,
        cloud: Vec<u8>,
        params: &DetectionParams,
    ) -> Result<DetectionResponse, ClientError> {
        let part = Part::bytes(cloud)
            .file_name("cloud.pcd")
            .mime_str("application/octet-stream")?;
        let form = params
            .to_form()
            .into_iter()
            .fold(Form::new().part("point_cloud", part), |form, (name, value)| {
                form.text(name, value)
            });
        let url = format!("{}/detect_grasps", self.config.base_url());
        log::debug!("posting cloud to {url}");
        let response = self.http.post(&url).multipart(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (error, details) = match serde_json::from_str::<Value>(&body) {
                Ok(json) => (
                    json["error"].as_str().unwrap_or("unknown error").to_owned(),
                    json["details"].as_str().unwrap_or_default().to_owned(),
                ),
                Err(_) => (status.to_string(), body),
            };
            log::warn!("grasp server returned {status}: {error}");
            return Err(ClientError::Server {
                status: status.as_u16(),
                error,
                details,
            });
        }
        Ok(response.json::<DetectionResponse>().await?)
    }

    /// Merges both clouds, runs detection and expresses the grasps in the
    /// caller's frame.
    pub async fn predict(
        &self,
        item: &PointCloud,
        env: &PointCloud,
        params: &DetectionParams,
    ) -> Result<CallerFrameGrasps, ClientError> {
        let anchor = item.bounding_box()?.center();
        log::debug!("item center at ({}, {}, {})", anchor.x, anchor.y, anchor.z);
        let merged = item.merged(env);
        let response = self.detect(merged.to_pcd(), params).await?;
        let visualization_url = response.visualization_url.clone();
        let candidates = response.into_candidates()?;
        log::info!("{} grasps received", candidates.len());

        let mut grasps = CallerFrameGrasps::correct(candidates, anchor);
        grasps.visualization_url = visualization_url;
        for (i, grasp) in grasps.candidates().iter().enumerate() {
            let t = grasp.translation();
            log::debug!("grasp {} at [{:.4}, {:.4}, {:.4}]", i + 1, t.x, t.y, t.z);
        }
        Ok(grasps)
    }

    pub async fn get_best(
        &self,
        item: &PointCloud,
        env: &PointCloud,
        params: &DetectionParams,
    ) -> Result<BestGrasp, ClientError> {
        Ok(self.predict(item, env, params).await?.best())
    }
}

#[cfg(all(test, unix, feature = "server"))]
mod tests {
    use serde_json::json;
    use std::{fs, sync::Arc, time::Duration};

    use super::{CallerFrameGrasps, ClientConfig, ClientError, GraspClient};
    use crate::common::{
        config::{DetectionParams, ServiceConfig},
        grasp::{BestGrasp, GraspCandidate},
        handler::{router, DetectionService},
        math_utils::{from_translation, Vector3},
        point_cloud::PointCloud,
    };

    const RAISED_GRASP: &str = r#"{"tf_matrices":[[[1,0,0,0],[0,1,0,0],[0,0,1,0.1],[0,0,0,1]]],"widths":[0.05],"scores":[10.0]}"#;

    struct Server {
        _dir: tempfile::TempDir,
        port: u16,
    }

    // Serves the real router on an ephemeral port, `/bin/sh` running `script`
    // stands in for the detector.
    async fn serve(script: &str) -> Server {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("detector.sh");
        fs::write(&script_path, script).unwrap();
        let config = ServiceConfig::new("/bin/sh", &script_path)
            .with_workspace_dir(dir.path().join("workspace"))
            .with_timeout(Duration::from_secs(10));
        let app = router(Arc::new(DetectionService::new(config)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await });
        Server { _dir: dir, port }
    }

    fn client(server: &Server, timeout: Duration) -> GraspClient {
        GraspClient::new(ClientConfig {
            server_ip: "127.0.0.1".to_owned(),
            server_port: server.port,
            timeout,
        })
        .unwrap()
    }

    fn item_at_2_3_0() -> PointCloud {
        PointCloud::new(vec![Vector3::new(1.0, 2.0, -1.0), Vector3::new(3.0, 4.0, 1.0)])
    }

    fn table() -> PointCloud {
        PointCloud::new(vec![Vector3::new(0.0, 0.0, -1.0)])
    }

    fn assert_close(actual: Vector3, expected: Vector3) {
        let d = (actual.x - expected.x).abs() + (actual.y - expected.y).abs() + (actual.z - expected.z).abs();
        assert!(d < 1e-12, "{actual:?} != {expected:?}");
    }

    #[test_log::test]
    fn test_config_from_json() {
        let config = ClientConfig::from_json(&json!({
            "servers": {"graspnet": {"ip": "10.1.0.7", "port": 5001}}
        }));
        assert_eq!(config.base_url(), "http://10.1.0.7:5001");
        assert_eq!(config.timeout, super::DEFAULT_CLIENT_TIMEOUT);

        let config = ClientConfig::from_json(&json!({
            "servers": {"graspnet": {"port": "6000", "timeout": 2.5}}
        }));
        assert_eq!(config.base_url(), "http://127.0.0.1:6000");
        assert_eq!(config.timeout, Duration::from_millis(2500));

        assert_eq!(ClientConfig::from_json(&json!({})), ClientConfig::default());
        assert_eq!(
            ClientConfig::from_json(&json!({"servers": {"graspnet": {"port": 70000}}})).server_port,
            5000
        );
    }

    #[test_log::test]
    fn test_correction_applies_once() {
        let raw = vec![GraspCandidate::new(
            from_translation(Vector3::new(0.0, 0.0, 0.1)),
            0.05,
            10.0,
        )];
        let anchor = Vector3::new(2.0, 3.0, 0.0);
        let corrected = CallerFrameGrasps::correct(raw, anchor);
        assert_close(corrected.candidates()[0].translation(), Vector3::new(2.0, 3.0, 0.1));

        // a second application is visibly wrong
        let doubled = corrected.candidates()[0].translated(anchor);
        assert_close(doubled.translation(), Vector3::new(4.0, 6.0, 0.1));
        assert_ne!(doubled.translation(), corrected.candidates()[0].translation());
    }

    #[test_log::test(tokio::test)]
    async fn test_predict_corrects_into_caller_frame() {
        // the detector only answers if it received the merged cloud
        let server = serve(&format!(
            "grep -q '^POINTS 3$' \"$1\" || exit 7\necho '{RAISED_GRASP}'"
        ))
        .await;
        let grasps = client(&server, Duration::from_secs(10))
            .predict(&item_at_2_3_0(), &table(), &DetectionParams::default())
            .await
            .unwrap();
        assert_eq!(grasps.candidates().len(), 1);
        assert_eq!(grasps.anchor(), Vector3::new(2.0, 3.0, 0.0));
        assert_close(grasps.candidates()[0].translation(), Vector3::new(2.0, 3.0, 0.1));
        assert_eq!(grasps.candidates()[0].width(), 0.05);
        assert!(grasps.visualization_url().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_get_best() {
        let server = serve(
            "echo '{\"tf_matrices\":[[[1,0,0,0],[0,1,0,0],[0,0,1,0],[0,0,0,1]],[[1,0,0,0.5],[0,1,0,0],[0,0,1,0],[0,0,0,1]]],\"widths\":[0.04,0.06],\"scores\":[3.0,8.0]}'",
        )
        .await;
        let best = client(&server, Duration::from_secs(10))
            .get_best(&item_at_2_3_0(), &table(), &DetectionParams::default())
            .await
            .unwrap();
        match best {
            BestGrasp::Found(grasp) => {
                assert_eq!(grasp.score(), 8.0);
                assert_eq!(grasp.width(), 0.06);
                assert_close(grasp.translation(), Vector3::new(2.5, 3.0, 0.0));
            }
            BestGrasp::NoGrasps => panic!("expected a grasp"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_get_best_without_grasps() {
        let server = serve("echo '{\"tf_matrices\":[],\"widths\":[],\"scores\":[]}'").await;
        let best = client(&server, Duration::from_secs(10))
            .get_best(&item_at_2_3_0(), &table(), &DetectionParams::default())
            .await
            .unwrap();
        assert_eq!(best, BestGrasp::NoGrasps);
    }

    #[test_log::test(tokio::test)]
    async fn test_server_error_is_propagated() {
        let server = serve("echo 'voxel grid too small' >&2\nexit 1").await;
        let err = client(&server, Duration::from_secs(10))
            .predict(&item_at_2_3_0(), &table(), &DetectionParams::default())
            .await
            .unwrap_err();
        match err {
            ClientError::Server {
                status,
                error,
                details,
            } => {
                assert_eq!(status, 500);
                assert_eq!(error, "detection command failed");
                assert_eq!(details, "voxel grid too small\n");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_client_timeout() {
        let server = serve("sleep 5").await;
        let err = client(&server, Duration::from_millis(200))
            .predict(&item_at_2_3_0(), &table(), &DetectionParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport(ref e) if e.is_timeout()), "{err:?}");
    }

    #[test_log::test(tokio::test)]
    async fn test_empty_item_cloud() {
        let client = GraspClient::new(ClientConfig::default()).unwrap();
        let err = client
            .predict(&PointCloud::default(), &table(), &DetectionParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::EmptyItemCloud(_)));
    }
}

//! Detector backed by an HTTP inference server.
//!
//! `POST {endpoint}/load` warms a model; `POST {endpoint}/infer` takes a
//! base64 JPEG frame and returns boxes in corner form with stage timings.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camwatch_models::{BoundingBox, Detection};
use camwatch_vision::{
    encode_base64_jpeg, Detector, DetectorFactory, Frame, Inference, InferenceParams,
    InferenceTimings, VisionError, VisionResult,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{WorkerError, WorkerResult};

/// JPEG quality of frames sent for inference.
const UPLOAD_JPEG_QUALITY: u8 = 85;

#[derive(Debug, Serialize)]
struct LoadRequest<'a> {
    model: &'a str,
    confidence: f32,
}

#[derive(Debug, Default, Deserialize)]
struct LoadResponse {
    #[serde(default)]
    memory_bytes: Option<u64>,
}

#[derive(Debug, Serialize)]
struct InferRequest<'a> {
    model: &'a str,
    image: String,
    confidence: f32,
    iou: f32,
}

#[derive(Debug, Deserialize)]
struct RemoteDetection {
    #[serde(rename = "box")]
    corners: [f64; 4],
    confidence: f32,
    class_id: u32,
}

#[derive(Debug, Default, Deserialize)]
struct RemoteSpeed {
    #[serde(default)]
    preprocess: f64,
    #[serde(default)]
    inference: f64,
    #[serde(default)]
    postprocess: f64,
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    #[serde(default)]
    detections: Vec<RemoteDetection>,
    #[serde(default)]
    speed: RemoteSpeed,
}

impl From<InferResponse> for Inference {
    fn from(response: InferResponse) -> Self {
        let detections = response
            .detections
            .into_iter()
            .map(|d| {
                let [x1, y1, x2, y2] = d.corners;
                Detection::new(BoundingBox::from_corners(x1, y1, x2, y2), d.confidence, d.class_id)
            })
            .collect();
        Inference {
            detections,
            timings: InferenceTimings {
                preprocess_ms: response.speed.preprocess,
                inference_ms: response.speed.inference,
                postprocess_ms: response.speed.postprocess,
            },
        }
    }
}

/// Loads [`HttpDetector`]s against one inference endpoint.
#[derive(Clone)]
pub struct HttpDetectorFactory {
    client: Client,
    endpoint: String,
}

impl HttpDetectorFactory {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> WorkerResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(4)
            .user_agent(concat!("camwatch-worker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(WorkerError::Http)?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl DetectorFactory for HttpDetectorFactory {
    async fn load(&self, model_path: &str, confidence: f32) -> VisionResult<Arc<dyn Detector>> {
        let url = format!("{}/load", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&LoadRequest {
                model: model_path,
                confidence,
            })
            .send()
            .await
            .map_err(|e| VisionError::detector_load(format!("load request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VisionError::detector_load(format!(
                "inference server returned {}: {}",
                status, body
            )));
        }
        let loaded: LoadResponse = response.json().await.unwrap_or_default();
        debug!(model = model_path, "Remote model loaded");

        Ok(Arc::new(HttpDetector {
            client: self.client.clone(),
            url: format!("{}/infer", self.endpoint),
            model: model_path.to_string(),
            memory_bytes: loaded.memory_bytes.unwrap_or(0),
        }))
    }
}

/// One model on the remote inference server.
pub struct HttpDetector {
    client: Client,
    url: String,
    model: String,
    memory_bytes: u64,
}

#[async_trait]
impl Detector for HttpDetector {
    async fn infer(&self, frame: &Frame, params: InferenceParams) -> VisionResult<Inference> {
        let image = frame.image.clone();
        let encoded =
            tokio::task::spawn_blocking(move || encode_base64_jpeg(&image, UPLOAD_JPEG_QUALITY))
                .await
                .map_err(|e| VisionError::inference(format!("frame encode join error: {}", e)))??;
        let request = InferRequest {
            model: &self.model,
            image: encoded,
            confidence: params.confidence,
            iou: params.iou_threshold,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| VisionError::inference(format!("infer request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VisionError::inference(format!(
                "inference server returned {}: {}",
                status, body
            )));
        }

        let parsed: InferResponse = response
            .json()
            .await
            .map_err(|e| VisionError::inference(format!("malformed inference response: {}", e)))?;
        Ok(parsed.into())
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn memory_bytes(&self) -> u64 {
        self.memory_bytes
    }
}

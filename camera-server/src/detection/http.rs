// 外部检测服务客户端
//
// 把当前帧编码为 JPEG POST 到模型服务，响应格式：
// `{"boxes": [{"x1":..,"y1":..,"x2":..,"y2":..,"class_id":..}]}`

use super::{DetectionError, Detector, RawDetection};
use crate::streaming::frame::encode_jpeg;
use async_trait::async_trait;
use common::CameraId;
use image::RgbImage;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpDetectorConfig {
    /// 检测接口地址
    pub url: String,
    pub timeout: Duration,
    pub jpeg_quality: u8,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    boxes: Vec<RawDetection>,
}

pub struct HttpDetector {
    http: Client,
    config: HttpDetectorConfig,
}

impl HttpDetector {
    pub fn new(config: HttpDetectorConfig) -> Result<Self, DetectionError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DetectionError::Request(e.to_string()))?;

        Ok(Self { http, config })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn detect(
        &self,
        camera_id: CameraId,
        image: &RgbImage,
    ) -> Result<Vec<RawDetection>, DetectionError> {
        let quality = self.config.jpeg_quality;
        let image = image.clone();
        let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&image, quality))
            .await
            .map_err(|e| DetectionError::Encode(format!("encode task failed: {}", e)))?
            .map_err(|e| DetectionError::Encode(e.to_string()))?;

        let response = self
            .http
            .post(&self.config.url)
            .query(&[("camera_id", camera_id)])
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg)
            .send()
            .await
            .map_err(|e| DetectionError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DetectionError::Request(format!(
                "detector returned {}: {}",
                status, body
            )));
        }

        let parsed: DetectResponse = response
            .json()
            .await
            .map_err(|e| DetectionError::InvalidResponse(e.to_string()))?;

        debug!(
            "Detector returned {} boxes for camera {}",
            parsed.boxes.len(),
            camera_id
        );
        Ok(parsed.boxes)
    }
}

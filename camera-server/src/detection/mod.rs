// 摄像头视频流服务 - 目标检测模块
//
// `Detector` 是与检测模型之间的接缝；`DetectionStage` 是流水线上的检测边界：
// 检测器的错误、panic、超时都在这里被吸收并按"无检测框"处理，
// 下一帧照常重试。

pub mod http;
pub mod motion;
pub mod overlay;

use async_trait::async_trait;
use common::{CameraId, DetectionBox};
use futures::FutureExt;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

pub use http::{HttpDetector, HttpDetectorConfig};
pub use motion::MotionDetector;
pub use overlay::draw_boxes;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Detector request failed: {0}")]
    Request(String),

    #[error("Detector returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("Frame encoding failed: {0}")]
    Encode(String),
}

/// 检测器原始输出
///
/// 坐标未经校验，可能越界或颠倒。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDetection {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
    #[serde(default)]
    pub class_id: u32,
}

/// 检测模型
#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    async fn detect(
        &self,
        camera_id: CameraId,
        image: &RgbImage,
    ) -> Result<Vec<RawDetection>, DetectionError>;
}

/// 检测阶段
#[derive(Clone)]
pub struct DetectionStage {
    detector: Option<Arc<dyn Detector>>,
    timeout: Duration,
    failures: Arc<AtomicU64>,
}

impl DetectionStage {
    pub fn new(detector: Arc<dyn Detector>, timeout: Duration) -> Self {
        Self {
            detector: Some(detector),
            timeout,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn disabled() -> Self {
        Self {
            detector: None,
            timeout: Duration::ZERO,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.detector.is_some()
    }

    pub fn detector_name(&self) -> Option<&'static str> {
        self.detector.as_ref().map(|d| d.name())
    }

    /// 累计失败次数（错误、panic、超时）
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// 检测并把结果规整为帧内合法的检测框
    ///
    /// 失败一律返回空列表。
    pub async fn detect(&self, camera_id: CameraId, image: &RgbImage) -> Vec<DetectionBox> {
        let Some(detector) = &self.detector else {
            return Vec::new();
        };

        let guarded = AssertUnwindSafe(detector.detect(camera_id, image)).catch_unwind();

        let raw = match tokio::time::timeout(self.timeout, guarded).await {
            Ok(Ok(Ok(raw))) => raw,
            Ok(Ok(Err(e))) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Detector {} failed on camera {}: {}",
                    detector.name(),
                    camera_id,
                    e
                );
                return Vec::new();
            }
            Ok(Err(_)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Detector {} panicked on camera {}",
                    detector.name(),
                    camera_id
                );
                return Vec::new();
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Detector {} timed out after {:?} on camera {}",
                    detector.name(),
                    self.timeout,
                    camera_id
                );
                return Vec::new();
            }
        };

        let (width, height) = image.dimensions();
        raw.into_iter()
            .filter_map(|r| DetectionBox::clipped(r.x1, r.y1, r.x2, r.y2, r.class_id, width, height))
            .collect()
    }
}

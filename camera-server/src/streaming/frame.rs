// 摄像头视频流服务 - 帧数据
//
// 发布后的帧不可变；JPEG 编码结果按质量缓存一次，所有订阅者共享。

use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::{CameraId, DetectionBox};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum EncodeError {
    #[error("JPEG encoding failed: {0}")]
    Jpeg(String),
}

/// 已发布的帧
#[derive(Debug)]
pub struct Frame {
    pub camera_id: CameraId,
    /// 每个摄像头内严格递增
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    /// 已绘制检测框的画面
    pub image: RgbImage,
    pub detections: Vec<DetectionBox>,
    jpeg: OnceLock<(u8, Bytes)>,
}

impl Frame {
    pub fn new(
        camera_id: CameraId,
        sequence: u64,
        captured_at: DateTime<Utc>,
        image: RgbImage,
        detections: Vec<DetectionBox>,
    ) -> Self {
        Self {
            camera_id,
            sequence,
            captured_at,
            image,
            detections,
            jpeg: OnceLock::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    fn cached_jpeg(&self, quality: u8) -> Option<Bytes> {
        self.jpeg
            .get()
            .filter(|(cached_quality, _)| *cached_quality == quality)
            .map(|(_, bytes)| bytes.clone())
    }

    /// JPEG 编码（同步）
    ///
    /// 同一质量只编码一次；不同质量的请求（少见）直接重新编码。
    pub fn jpeg(&self, quality: u8) -> Result<Bytes, EncodeError> {
        if let Some(bytes) = self.cached_jpeg(quality) {
            return Ok(bytes);
        }
        if self.jpeg.get().is_some() {
            return encode_jpeg(&self.image, quality);
        }

        let bytes = encode_jpeg(&self.image, quality)?;
        let _ = self.jpeg.set((quality, bytes.clone()));
        Ok(bytes)
    }

    /// JPEG 编码，未命中缓存时在 blocking 线程池上执行
    pub async fn encode(self: &Arc<Self>, quality: u8) -> Result<Bytes, EncodeError> {
        if let Some(bytes) = self.cached_jpeg(quality) {
            return Ok(bytes);
        }

        let frame = Arc::clone(self);
        tokio::task::spawn_blocking(move || frame.jpeg(quality))
            .await
            .map_err(|e| EncodeError::Jpeg(format!("encode task failed: {}", e)))?
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Bytes, EncodeError> {
    let mut buffer = Vec::with_capacity((image.width() * image.height() / 4) as usize);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|e| EncodeError::Jpeg(e.to_string()))?;
    Ok(Bytes::from(buffer))
}

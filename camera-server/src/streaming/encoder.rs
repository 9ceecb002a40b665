// 摄像头视频流服务 - 帧编码
//
// 两种推送格式：
// - multipart/x-mixed-replace：每帧一个 `--frame` 分段，内容为 JPEG
// - SSE：每帧一个 `frame` 事件，数据为 JSON，JPEG 以 Base64 内嵌

use super::frame::Frame;
use base64::{engine::general_purpose, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use common::{CameraId, DetectionBox};
use serde::{Deserialize, Serialize};

/// multipart 分隔符
pub const MULTIPART_BOUNDARY: &str = "frame";

pub fn multipart_content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={}", MULTIPART_BOUNDARY)
}

/// 推送格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    #[default]
    Mjpeg,
    Sse,
}

/// 一帧 JPEG 的 multipart 分段
pub fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        MULTIPART_BOUNDARY,
        jpeg.len()
    );

    let mut chunk = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    chunk.put_slice(header.as_bytes());
    chunk.put_slice(jpeg);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}

/// SSE 帧数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseFrameData {
    pub camera_id: CameraId,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub detections: Vec<DetectionBox>,
    /// Base64编码的JPEG
    pub data: String,
}

impl SseFrameData {
    pub fn new(frame: &Frame, jpeg: &[u8]) -> Self {
        Self {
            camera_id: frame.camera_id,
            sequence: frame.sequence,
            captured_at: frame.captured_at,
            width: frame.width(),
            height: frame.height(),
            detections: frame.detections.clone(),
            data: general_purpose::STANDARD.encode(jpeg),
        }
    }
}

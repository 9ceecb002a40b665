// 摄像头视频流服务 - Streaming模块
//
// 数据流：CameraPool 读帧 → FrameSource 节拍 → [检测 → 画框] →
// LatestFrameSlot → StreamMultiplexer 按客户端分发 → 编码推送
//
// # 核心组件
//
// - `FrameSource` / `FrameSourceManager`: 每个摄像头一个拉帧任务
// - `LatestFrameSlot`: 单槽最新帧缓冲
// - `StreamMultiplexer`: 每个客户端独立节奏的推送序列
// - `encoder`: multipart JPEG 与 SSE 两种编码

pub mod encoder;
pub mod frame;
pub mod multiplexer;
pub mod pacer;
pub mod slot;
pub mod source;

// 重新导出核心类型
pub use encoder::{multipart_chunk, multipart_content_type, SseFrameData, StreamFormat};
pub use frame::{EncodeError, Frame};
pub use multiplexer::{ActiveStream, FrameStream, StreamConfig, StreamError, StreamMultiplexer};
pub use pacer::FrameRatePacer;
pub use slot::{LatestFrameSlot, SlotError, SlotReader};
pub use source::{FrameSource, FrameSourceConfig, FrameSourceInfo, FrameSourceManager};

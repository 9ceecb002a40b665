// 摄像头视频流服务 - 流复用器
//
// 每个客户端一个独立的拉取循环：按自己的节奏读取最新帧槽位的快照并推送。
// 客户端之间不共享队列，慢客户端只会错过帧，不会拖慢采集或其他客户端；
// 推送路径完全不接触摄像头池的条目锁。

use super::encoder::StreamFormat;
use super::frame::Frame;
use super::pacer::FrameRatePacer;
use super::slot::SlotReader;
use super::source::FrameSourceManager;
use crate::auth::TokenVerifier;
use chrono::{DateTime, Utc};
use common::CameraId;
use dashmap::DashMap;
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Unknown camera: {0}")]
    CameraUnknown(CameraId),

    #[error("Camera {0} is disabled")]
    CameraDisabled(CameraId),
}

/// 推送配置
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// 每个客户端的轮询周期
    pub poll_interval: Duration,
    pub jpeg_quality: u8,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            jpeg_quality: 80,
        }
    }
}

/// 活跃客户端流
#[derive(Debug, Clone, Serialize)]
pub struct ActiveStream {
    pub stream_id: Uuid,
    pub camera_id: CameraId,
    pub subject: String,
    pub format: StreamFormat,
    pub opened_at: DateTime<Utc>,
}

/// 流被丢弃（客户端断开或摄像头停止）时注销
struct StreamGuard {
    stream_id: Uuid,
    camera_id: CameraId,
    registry: Arc<DashMap<Uuid, ActiveStream>>,
    frames_sent: u64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.stream_id);
        info!(
            "Client stream {} on camera {} closed after {} frames",
            self.stream_id, self.camera_id, self.frames_sent
        );
    }
}

/// 按固定周期轮询槽位的帧序列
///
/// 槽位为空时跳过本次节拍；写端关闭后序列结束。
pub fn frame_stream(
    reader: SlotReader,
    poll_interval: Duration,
) -> impl Stream<Item = Arc<Frame>> + Send + 'static {
    async_stream::stream! {
        let mut pacer = FrameRatePacer::from_interval(poll_interval);
        loop {
            pacer.wait_for_next_frame().await;
            if reader.is_closed() {
                break;
            }
            if let Some(frame) = reader.snapshot() {
                yield frame;
            }
        }
    }
}

/// 单个客户端的帧序列
pub struct FrameStream {
    pub stream_id: Uuid,
    pub camera_id: CameraId,
    inner: Pin<Box<dyn Stream<Item = Arc<Frame>> + Send>>,
}

impl Stream for FrameStream {
    type Item = Arc<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// 流复用器
#[derive(Clone)]
pub struct StreamMultiplexer {
    sources: FrameSourceManager,
    auth: Arc<dyn TokenVerifier>,
    config: StreamConfig,
    active: Arc<DashMap<Uuid, ActiveStream>>,
}

impl StreamMultiplexer {
    pub fn new(
        sources: FrameSourceManager,
        auth: Arc<dyn TokenVerifier>,
        config: StreamConfig,
    ) -> Self {
        Self {
            sources,
            auth,
            config,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// 打开客户端流
    ///
    /// 只在这里校验一次令牌。摄像头已启用但帧源未运行时会先启动帧源。
    pub async fn open_stream(
        &self,
        camera_id: CameraId,
        token: Option<&str>,
        format: StreamFormat,
    ) -> Result<FrameStream, StreamError> {
        let token = token.ok_or_else(|| StreamError::Unauthorized("missing token".to_string()))?;
        let subject = self
            .auth
            .verify_token(token)
            .map_err(|e| StreamError::Unauthorized(e.to_string()))?;

        if !self.sources.pool().contains(camera_id) {
            return Err(StreamError::CameraUnknown(camera_id));
        }

        let reader = match self.sources.reader(camera_id) {
            Some(reader) => reader,
            None => {
                if !self.sources.reconcile(camera_id).await {
                    return Err(StreamError::CameraDisabled(camera_id));
                }
                self.sources
                    .reader(camera_id)
                    .ok_or(StreamError::CameraDisabled(camera_id))?
            }
        };

        let stream_id = Uuid::new_v4();
        self.active.insert(
            stream_id,
            ActiveStream {
                stream_id,
                camera_id,
                subject: subject.clone(),
                format,
                opened_at: Utc::now(),
            },
        );
        info!(
            "Client stream {} opened on camera {} ({:?}, user {})",
            stream_id, camera_id, format, subject
        );

        let mut guard = StreamGuard {
            stream_id,
            camera_id,
            registry: self.active.clone(),
            frames_sent: 0,
        };
        let frames = frame_stream(reader, self.config.poll_interval);

        let inner = async_stream::stream! {
            futures::pin_mut!(frames);
            while let Some(frame) = frames.next().await {
                guard.frames_sent += 1;
                yield frame;
            }
            debug!("Camera {} stopped, ending client stream {}", guard.camera_id, guard.stream_id);
        };

        Ok(FrameStream {
            stream_id,
            camera_id,
            inner: Box::pin(inner),
        })
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn streams_for(&self, camera_id: CameraId) -> usize {
        self.active
            .iter()
            .filter(|s| s.camera_id == camera_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthError;
    use crate::camera::mock::MockBackend;
    use crate::camera::{CameraPool, CaptureSettings, PoolConfig, ReconnectPolicy};
    use crate::detection::DetectionStage;
    use crate::streaming::slot::LatestFrameSlot;
    use crate::streaming::source::FrameSourceConfig;
    use image::RgbImage;

    struct StaticVerifier;

    impl TokenVerifier for StaticVerifier {
        fn verify_token(&self, token: &str) -> Result<String, AuthError> {
            if token == "good" {
                Ok("tester".to_string())
            } else {
                Err(AuthError::InvalidToken("bad token".to_string()))
            }
        }
    }

    async fn multiplexer(devices: &[CameraId]) -> (StreamMultiplexer, CameraPool) {
        let backend = Arc::new(MockBackend::with_devices(devices));
        let pool = CameraPool::new(
            backend,
            PoolConfig {
                capture: CaptureSettings {
                    width: 16,
                    height: 12,
                    frame_rate: 100,
                    read_timeout: Duration::from_millis(50),
                },
                reconnect: ReconnectPolicy::fixed(3, Duration::from_millis(1)),
                ..PoolConfig::default()
            },
        );
        pool.discover().await;

        let sources = FrameSourceManager::new(
            pool.clone(),
            DetectionStage::disabled(),
            FrameSourceConfig {
                frame_rate: 100,
                stop_timeout: Duration::from_secs(2),
            },
        );
        sources.start_enabled().await;

        let mux = StreamMultiplexer::new(
            sources,
            Arc::new(StaticVerifier),
            StreamConfig {
                poll_interval: Duration::from_millis(10),
                jpeg_quality: 80,
            },
        );
        (mux, pool)
    }

    fn frame(sequence: u64) -> Frame {
        Frame::new(0, sequence, Utc::now(), RgbImage::new(4, 4), Vec::new())
    }

    #[tokio::test]
    async fn test_empty_slot_emits_nothing() {
        let (_slot, reader) = LatestFrameSlot::new();
        let mut frames = Box::pin(frame_stream(reader, Duration::from_millis(10)));

        let result = tokio::time::timeout(Duration::from_millis(200), frames.next()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_stream_ends_when_slot_closes() {
        let (slot, reader) = LatestFrameSlot::new();
        slot.publish(frame(1)).unwrap();
        let mut frames = Box::pin(frame_stream(reader, Duration::from_millis(10)));

        assert_eq!(frames.next().await.unwrap().sequence, 1);
        drop(slot);
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_reader_sees_latest_frame() {
        let (slot, reader) = LatestFrameSlot::new();
        let mut frames = Box::pin(frame_stream(reader, Duration::from_millis(10)));

        for seq in 1..=5 {
            slot.publish(frame(seq)).unwrap();
        }
        assert_eq!(frames.next().await.unwrap().sequence, 5);
    }

    #[tokio::test]
    async fn test_open_stream_rejections() {
        let (mux, pool) = multiplexer(&[0]).await;

        assert!(matches!(
            mux.open_stream(0, None, StreamFormat::Mjpeg).await.err(),
            Some(StreamError::Unauthorized(_))
        ));
        assert!(matches!(
            mux.open_stream(0, Some("bad"), StreamFormat::Mjpeg).await.err(),
            Some(StreamError::Unauthorized(_))
        ));
        assert_eq!(
            mux.open_stream(7, Some("good"), StreamFormat::Mjpeg).await.err(),
            Some(StreamError::CameraUnknown(7))
        );

        pool.toggle(0).await.unwrap();
        mux.sources.reconcile(0).await;
        assert_eq!(
            mux.open_stream(0, Some("good"), StreamFormat::Sse).await.err(),
            Some(StreamError::CameraDisabled(0))
        );
        assert_eq!(mux.active_count(), 0);
    }

    #[tokio::test]
    async fn test_streams_are_registered_and_independent() {
        let (mux, _pool) = multiplexer(&[0]).await;

        let mut fast = mux.open_stream(0, Some("good"), StreamFormat::Mjpeg).await.unwrap();
        let idle = mux.open_stream(0, Some("good"), StreamFormat::Sse).await.unwrap();
        assert_eq!(mux.active_count(), 2);
        assert_eq!(mux.streams_for(0), 2);

        let mut last = 0;
        for _ in 0..5 {
            let frame = tokio::time::timeout(Duration::from_secs(2), fast.next())
                .await
                .unwrap()
                .unwrap();
            assert!(frame.sequence >= last);
            last = frame.sequence;
        }

        drop(idle);
        assert_eq!(mux.active_count(), 1);
        drop(fast);
        assert_eq!(mux.active_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_ends_when_camera_disabled() {
        let (mux, pool) = multiplexer(&[0]).await;
        let mut stream = mux.open_stream(0, Some("good"), StreamFormat::Mjpeg).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();

        pool.toggle(0).await.unwrap();
        mux.sources.reconcile(0).await;

        let ended = tokio::time::timeout(Duration::from_secs(2), async {
            while stream.next().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok());
    }
}

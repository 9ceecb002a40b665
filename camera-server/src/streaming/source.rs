// 摄像头视频流服务 - 帧源
//
// 每个启用的摄像头一个 FrameSource 任务：按目标帧率从摄像头池拉帧，
// 可选地做目标检测并在自己的副本上画框，再以递增序号发布到最新帧槽位。
// `FrameSourceManager` 负责按摄像头启用状态启动、停止这些任务。

use super::frame::Frame;
use super::pacer::FrameRatePacer;
use super::slot::{LatestFrameSlot, SlotReader};
use crate::camera::CameraPool;
use crate::detection::{draw_boxes, DetectionStage};
use chrono::{DateTime, Utc};
use common::{CameraId, PoolError};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 帧源配置
#[derive(Debug, Clone)]
pub struct FrameSourceConfig {
    /// 读帧帧率
    pub frame_rate: u32,
    /// 停止时等待任务退出的上限
    pub stop_timeout: Duration,
}

impl Default for FrameSourceConfig {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// 帧源统计
#[derive(Debug, Default)]
pub struct FrameSourceStats {
    pub frames_published: AtomicU64,
    pub read_failures: AtomicU64,
    pub frames_with_detections: AtomicU64,
}

/// 帧源状态快照
#[derive(Debug, Clone, Serialize)]
pub struct FrameSourceInfo {
    pub camera_id: CameraId,
    pub started_at: DateTime<Utc>,
    pub last_sequence: u64,
    pub frames_published: u64,
    pub read_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Continue,
    Stop,
}

/// 单个摄像头的帧源
pub struct FrameSource {
    camera_id: CameraId,
    pool: CameraPool,
    detection: DetectionStage,
    slot: LatestFrameSlot,
    pacer: FrameRatePacer,
    sequence: u64,
    stats: Arc<FrameSourceStats>,
}

impl FrameSource {
    pub fn new(
        camera_id: CameraId,
        pool: CameraPool,
        detection: DetectionStage,
        frame_rate: u32,
    ) -> (Self, SlotReader) {
        let (slot, reader) = LatestFrameSlot::new();
        let source = Self {
            camera_id,
            pool,
            detection,
            slot,
            pacer: FrameRatePacer::from_fps(frame_rate),
            sequence: 0,
            stats: Arc::new(FrameSourceStats::default()),
        };
        (source, reader)
    }

    pub fn stats(&self) -> Arc<FrameSourceStats> {
        self.stats.clone()
    }

    /// 运行直到取消或摄像头被禁用
    ///
    /// 取消时正在进行的读帧/检测直接放弃，不会发布不完整的帧。
    /// 返回时槽位写端随之释放，读端可据此结束推送。
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Frame source for camera {} started", self.camera_id);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Frame source for camera {} cancelled", self.camera_id);
                    break;
                }
                outcome = self.tick() => {
                    if outcome == TickOutcome::Stop {
                        break;
                    }
                }
            }
        }

        info!(
            "Frame source for camera {} stopped (last sequence {})",
            self.camera_id, self.sequence
        );
    }

    async fn tick(&mut self) -> TickOutcome {
        self.pacer.wait_for_next_frame().await;

        let capture = match self.pool.get_frame(self.camera_id).await {
            Ok(capture) => capture,
            Err(PoolError::CameraDisabled(_)) | Err(PoolError::CameraUnknown(_)) => {
                info!(
                    "Camera {} is no longer enabled, stopping frame source",
                    self.camera_id
                );
                return TickOutcome::Stop;
            }
            Err(e) => {
                self.stats.read_failures.fetch_add(1, Ordering::Relaxed);
                debug!("Camera {} tick skipped: {}", self.camera_id, e);
                return TickOutcome::Continue;
            }
        };

        let detections = self.detection.detect(self.camera_id, &capture.image).await;

        let mut image = capture.image;
        if !detections.is_empty() {
            draw_boxes(&mut image, &detections);
            self.stats.frames_with_detections.fetch_add(1, Ordering::Relaxed);
        }

        let sequence = self.sequence + 1;
        let frame = Frame::new(self.camera_id, sequence, capture.captured_at, image, detections);

        match self.slot.publish(frame) {
            Ok(()) => {
                self.sequence = sequence;
                self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("Camera {} publish rejected: {}", self.camera_id, e);
            }
        }

        TickOutcome::Continue
    }
}

struct RunningSource {
    reader: SlotReader,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    stats: Arc<FrameSourceStats>,
    started_at: DateTime<Utc>,
}

impl RunningSource {
    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

/// 帧源管理器
///
/// 同一摄像头的启动/停止由该摄像头自己的互斥锁串行化。
#[derive(Clone)]
pub struct FrameSourceManager {
    pool: CameraPool,
    detection: DetectionStage,
    config: FrameSourceConfig,
    sources: Arc<DashMap<CameraId, RunningSource>>,
    transitions: Arc<DashMap<CameraId, Arc<Mutex<()>>>>,
}

impl FrameSourceManager {
    pub fn new(pool: CameraPool, detection: DetectionStage, config: FrameSourceConfig) -> Self {
        info!(
            "Frame source manager created: frame_rate={}, detection={}",
            config.frame_rate,
            detection.detector_name().unwrap_or("disabled")
        );

        Self {
            pool,
            detection,
            config,
            sources: Arc::new(DashMap::new()),
            transitions: Arc::new(DashMap::new()),
        }
    }

    pub fn pool(&self) -> &CameraPool {
        &self.pool
    }

    pub fn detection(&self) -> &DetectionStage {
        &self.detection
    }

    fn transition_lock(&self, id: CameraId) -> Arc<Mutex<()>> {
        self.transitions.entry(id).or_default().value().clone()
    }

    /// 启动帧源，已在运行时不做任何事
    ///
    /// # 返回
    ///
    /// 新启动返回 `true`
    pub async fn start(&self, id: CameraId) -> bool {
        let lock = self.transition_lock(id);
        let _guard = lock.lock().await;
        self.start_locked(id)
    }

    fn start_locked(&self, id: CameraId) -> bool {
        if self.sources.get(&id).map(|s| s.is_alive()).unwrap_or(false) {
            return false;
        }

        let (source, reader) =
            FrameSource::new(id, self.pool.clone(), self.detection.clone(), self.config.frame_rate);
        let stats = source.stats();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(source.run(cancel.clone()));

        self.sources.insert(
            id,
            RunningSource {
                reader,
                cancel,
                task,
                stats,
                started_at: Utc::now(),
            },
        );
        true
    }

    /// 停止帧源并等待任务退出
    ///
    /// # 返回
    ///
    /// 之前存在帧源返回 `true`
    pub async fn stop(&self, id: CameraId) -> bool {
        let lock = self.transition_lock(id);
        let _guard = lock.lock().await;
        self.stop_locked(id).await
    }

    async fn stop_locked(&self, id: CameraId) -> bool {
        let Some((_, running)) = self.sources.remove(&id) else {
            return false;
        };

        running.cancel.cancel();
        let mut task = running.task;
        if tokio::time::timeout(self.config.stop_timeout, &mut task)
            .await
            .is_err()
        {
            warn!(
                "Frame source for camera {} did not stop within {:?}, aborting",
                id, self.config.stop_timeout
            );
            task.abort();
        }
        true
    }

    /// 让帧源状态与摄像头启用状态一致
    ///
    /// # 返回
    ///
    /// 调用结束后帧源是否在运行
    pub async fn reconcile(&self, id: CameraId) -> bool {
        let lock = self.transition_lock(id);
        let _guard = lock.lock().await;

        if self.pool.is_enabled(id).await {
            self.start_locked(id);
            true
        } else {
            self.stop_locked(id).await;
            false
        }
    }

    /// 为所有启用的摄像头启动帧源
    pub async fn start_enabled(&self) -> Vec<CameraId> {
        let mut started = Vec::new();
        for id in self.pool.camera_ids() {
            if self.pool.is_enabled(id).await && self.start(id).await {
                started.push(id);
            }
        }
        started
    }

    /// 运行中帧源的槽位读端
    pub fn reader(&self, id: CameraId) -> Option<SlotReader> {
        self.sources
            .get(&id)
            .filter(|s| s.is_alive())
            .map(|s| s.reader.clone())
    }

    pub fn is_running(&self, id: CameraId) -> bool {
        self.sources.get(&id).map(|s| s.is_alive()).unwrap_or(false)
    }

    pub fn info(&self, id: CameraId) -> Option<FrameSourceInfo> {
        self.sources.get(&id).filter(|s| s.is_alive()).map(|s| FrameSourceInfo {
            camera_id: id,
            started_at: s.started_at,
            last_sequence: s.reader.snapshot().map(|f| f.sequence).unwrap_or(0),
            frames_published: s.stats.frames_published.load(Ordering::Relaxed),
            read_failures: s.stats.read_failures.load(Ordering::Relaxed),
        })
    }

    pub fn running_ids(&self) -> Vec<CameraId> {
        let mut ids: Vec<CameraId> = self
            .sources
            .iter()
            .filter(|s| s.is_alive())
            .map(|s| *s.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// 停止所有帧源
    pub async fn stop_all(&self) {
        let ids: Vec<CameraId> = self.sources.iter().map(|s| *s.key()).collect();
        for id in ids {
            self.stop(id).await;
        }
        info!("All frame sources stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::mock::MockBackend;
    use crate::camera::{CaptureSettings, PoolConfig, ReconnectPolicy};

    fn pool(backend: Arc<MockBackend>) -> CameraPool {
        CameraPool::new(
            backend,
            PoolConfig {
                probe_range: 3,
                capture: CaptureSettings {
                    width: 32,
                    height: 24,
                    frame_rate: 100,
                    read_timeout: Duration::from_millis(50),
                },
                reconnect: ReconnectPolicy::fixed(3, Duration::from_millis(1)),
                ..PoolConfig::default()
            },
        )
    }

    fn manager(pool: CameraPool) -> FrameSourceManager {
        FrameSourceManager::new(
            pool,
            DetectionStage::disabled(),
            FrameSourceConfig {
                frame_rate: 100,
                stop_timeout: Duration::from_secs(2),
            },
        )
    }

    async fn wait_for_sequence(reader: &SlotReader, at_least: u64) -> u64 {
        for _ in 0..200 {
            if let Some(frame) = reader.snapshot() {
                if frame.sequence >= at_least {
                    return frame.sequence;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("sequence {} not reached", at_least);
    }

    #[tokio::test]
    async fn test_sequences_increase_across_read_failures() {
        let backend = Arc::new(MockBackend::with_devices(&[0]));
        let pool = pool(backend.clone());
        pool.discover().await;
        let manager = manager(pool);

        assert!(manager.start(0).await);
        let reader = manager.reader(0).unwrap();

        let mut seen = Vec::new();
        for round in 0..20 {
            if round % 4 == 0 {
                backend.fail_next_reads(0, 2);
            }
            if let Some(frame) = reader.snapshot() {
                seen.push(frame.sequence);
            }
            tokio::time::sleep(Duration::from_millis(7)).await;
        }
        wait_for_sequence(&reader, 5).await;

        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let backend = Arc::new(MockBackend::with_devices(&[0]));
        let pool = pool(backend);
        pool.discover().await;
        let manager = manager(pool);

        assert!(manager.start(0).await);
        assert!(!manager.start(0).await);
        assert_eq!(manager.running_ids(), vec![0]);

        assert!(manager.stop(0).await);
        assert!(!manager.stop(0).await);
        assert!(manager.reader(0).is_none());
    }

    #[tokio::test]
    async fn test_disable_stops_source_and_closes_slot() {
        let backend = Arc::new(MockBackend::with_devices(&[0]));
        let pool = pool(backend.clone());
        pool.discover().await;
        let manager = manager(pool.clone());

        manager.start(0).await;
        let reader = manager.reader(0).unwrap();
        wait_for_sequence(&reader, 1).await;

        assert!(!pool.toggle(0).await.unwrap());
        assert!(!manager.reconcile(0).await);

        assert!(reader.is_closed());
        assert!(!manager.is_running(0));
        assert_eq!(backend.open_handles(0), 0);
    }

    #[tokio::test]
    async fn test_source_exits_on_its_own_when_disabled() {
        let backend = Arc::new(MockBackend::with_devices(&[0]));
        let pool = pool(backend);
        pool.discover().await;
        let manager = manager(pool.clone());

        manager.start(0).await;
        let reader = manager.reader(0).unwrap();
        pool.toggle(0).await.unwrap();

        for _ in 0..100 {
            if reader.is_closed() && !manager.is_running(0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(reader.is_closed());
        assert!(!manager.is_running(0));

        // 重新启用后可以再次启动
        pool.toggle(0).await.unwrap();
        assert!(manager.reconcile(0).await);
        assert!(manager.is_running(0));
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_info_reports_progress() {
        let backend = Arc::new(MockBackend::with_devices(&[1]));
        let pool = pool(backend);
        pool.discover().await;
        let manager = manager(pool);

        assert_eq!(manager.start_enabled().await, vec![1]);
        let reader = manager.reader(1).unwrap();
        wait_for_sequence(&reader, 3).await;

        let info = manager.info(1).unwrap();
        assert!(info.last_sequence >= 3);
        assert!(info.frames_published >= 3);
        assert!(manager.info(0).is_none());
        manager.stop_all().await;
    }
}

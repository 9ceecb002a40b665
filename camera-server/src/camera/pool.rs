// 摄像头视频流服务 - 摄像头池
//
// 摄像头ID → 条目（设备句柄 + 启用标志 + 连续失败计数）。
// 每个条目一把异步锁，句柄的打开、读帧、关闭都在锁内串行进行；
// 阻塞的设备调用放到 blocking 线程池执行，不同摄像头之间互不阻塞。

use super::device::{Capture, CaptureBackend, CaptureSettings, DeviceHandle};
use super::reconnect::ReconnectPolicy;
use chrono::{DateTime, Utc};
use common::{CameraId, CameraStatus, DeviceError, DeviceState, PoolError, PoolResult};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// 健康检查配置
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// 采样读帧次数
    pub samples: u32,
    /// 失败次数达到该值即判定为不健康
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            samples: 5,
            failure_threshold: 2,
        }
    }
}

/// 摄像头池配置
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// 发现时探测 `0..probe_range`
    pub probe_range: u32,
    pub capture: CaptureSettings,
    pub reconnect: ReconnectPolicy,
    pub health: HealthCheckConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            probe_range: 3,
            capture: CaptureSettings::default(),
            reconnect: ReconnectPolicy::default(),
            health: HealthCheckConfig::default(),
        }
    }
}

/// 摄像头条目
#[derive(Debug)]
struct CameraEntry {
    id: CameraId,
    handle: Option<DeviceHandle>,
    enabled: bool,
    consecutive_failures: u32,
    frames_read: u64,
    last_frame_at: Option<DateTime<Utc>>,
}

impl CameraEntry {
    fn new(id: CameraId) -> Self {
        Self {
            id,
            handle: None,
            enabled: false,
            consecutive_failures: 0,
            frames_read: 0,
            last_frame_at: None,
        }
    }

    fn with_handle(id: CameraId, handle: DeviceHandle) -> Self {
        Self {
            handle: Some(handle),
            enabled: true,
            ..Self::new(id)
        }
    }

    fn is_healthy(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_healthy()).unwrap_or(false)
    }

    /// 关闭旧句柄（如有）
    fn release_handle(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
    }

    /// 读帧，失败时在同一句柄上立即重试一次
    fn read_with_retry(&mut self) -> PoolResult<Capture> {
        let id = self.id;
        let Some(handle) = self.handle.as_mut() else {
            return Err(PoolError::FrameUnavailable(id));
        };

        let mut last_error: Option<DeviceError> = None;
        for attempt in 0..2 {
            match handle.read_frame() {
                Ok(capture) => {
                    self.consecutive_failures = 0;
                    self.frames_read += 1;
                    self.last_frame_at = Some(capture.captured_at);
                    return Ok(capture);
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    debug!(
                        "Camera {} read attempt {} failed ({} consecutive): {}",
                        id,
                        attempt + 1,
                        self.consecutive_failures,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            warn!("Camera {} frame unavailable after retry: {}", id, e);
        }
        Err(PoolError::FrameUnavailable(id))
    }

    fn status(&self) -> CameraStatus {
        CameraStatus {
            camera_id: self.id,
            enabled: self.enabled,
            device_state: self
                .handle
                .as_ref()
                .map(|h| h.state())
                .unwrap_or(DeviceState::Closed),
            consecutive_failures: self.consecutive_failures,
            frames_read: self.frames_read,
            last_frame_at: self.last_frame_at,
        }
    }
}

/// 摄像头池
///
/// 可廉价克隆，所有克隆共享同一组条目。原生句柄不会离开池。
#[derive(Clone)]
pub struct CameraPool {
    backend: Arc<dyn CaptureBackend>,
    config: Arc<PoolConfig>,
    entries: Arc<DashMap<CameraId, Arc<Mutex<CameraEntry>>>>,
}

impl CameraPool {
    pub fn new(backend: Arc<dyn CaptureBackend>, config: PoolConfig) -> Self {
        info!(
            "Camera pool created: backend={}, probe_range={}, reconnect_attempts={}",
            backend.name(),
            config.probe_range,
            config.reconnect.max_attempts
        );

        Self {
            backend,
            config: Arc::new(config),
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// 在 blocking 线程池上打开设备
    async fn open_device(&self, id: CameraId) -> Result<DeviceHandle, DeviceError> {
        let backend = self.backend.clone();
        let settings = self.config.capture.clone();

        tokio::task::spawn_blocking(move || DeviceHandle::open(backend.as_ref(), id, &settings))
            .await
            .map_err(|e| DeviceError::DeviceUnavailable(id, format!("open task failed: {}", e)))?
    }

    fn entry(&self, id: CameraId) -> PoolResult<Arc<Mutex<CameraEntry>>> {
        self.entries
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(PoolError::CameraUnknown(id))
    }

    /// 探测 `0..probe_range` 内的全部ID
    ///
    /// 中间有空缺也继续探测。已在池中的条目保持不变（不会重复打开）。
    /// 返回池中所有已知的摄像头ID。
    pub async fn discover(&self) -> BTreeSet<CameraId> {
        let mut newly_found = Vec::new();

        for id in 0..self.config.probe_range {
            if self.entries.contains_key(&id) {
                continue;
            }

            match self.open_device(id).await {
                Ok(handle) => match self.entries.entry(id) {
                    dashmap::mapref::entry::Entry::Occupied(_) => {
                        // 探测期间被 toggle 抢先创建，保留已有条目
                        drop(handle);
                    }
                    dashmap::mapref::entry::Entry::Vacant(slot) => {
                        slot.insert(Arc::new(Mutex::new(CameraEntry::with_handle(id, handle))));
                        newly_found.push(id);
                    }
                },
                Err(e) => {
                    debug!("Probe of camera {} failed: {}", id, e);
                }
            }
        }

        let known: BTreeSet<CameraId> = self.entries.iter().map(|e| *e.key()).collect();

        if newly_found.is_empty() {
            debug!("Discovery found no new cameras (known: {:?})", known);
        } else {
            info!("Discovered cameras {:?} (known: {:?})", newly_found, known);
        }

        known
    }

    pub fn contains(&self, id: CameraId) -> bool {
        self.entries.contains_key(&id)
    }

    /// 已知摄像头ID，升序
    pub fn camera_ids(&self) -> Vec<CameraId> {
        let mut ids: Vec<CameraId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// 读取一帧
    ///
    /// 禁用的摄像头不触碰设备；句柄不健康时先重连；读失败立即重试一次。
    pub async fn get_frame(&self, id: CameraId) -> PoolResult<Capture> {
        let entry = self.entry(id)?;
        let mut guard = entry.lock_owned().await;

        if !guard.enabled {
            return Err(PoolError::CameraDisabled(id));
        }

        if !guard.is_healthy() {
            warn!("Camera {} connection abnormal, reconnecting", id);
            if !self.reconnect_locked(&mut guard).await {
                return Err(PoolError::FrameUnavailable(id));
            }
        }

        let (_guard, result) = tokio::task::spawn_blocking(move || {
            let result = guard.read_with_retry();
            (guard, result)
        })
        .await
        .map_err(|e| PoolError::Internal(format!("read task failed: {}", e)))?;

        result
    }

    /// 重连
    ///
    /// 禁用或未知的摄像头直接返回 `false`。
    pub async fn reconnect(&self, id: CameraId) -> bool {
        let Ok(entry) = self.entry(id) else {
            return false;
        };
        let mut guard = entry.lock_owned().await;

        if !guard.enabled {
            debug!("Camera {} is disabled, skipping reconnect", id);
            return false;
        }

        self.reconnect_locked(&mut guard).await
    }

    /// 在已持有条目锁的情况下重连
    async fn reconnect_locked(&self, entry: &mut CameraEntry) -> bool {
        let policy = &self.config.reconnect;

        for attempt in 0..policy.max_attempts {
            entry.release_handle();

            match self.open_device(entry.id).await {
                Ok(handle) => {
                    entry.handle = Some(handle);
                    entry.consecutive_failures = 0;
                    info!(
                        "Camera {} reconnected on attempt {}/{}",
                        entry.id,
                        attempt + 1,
                        policy.max_attempts
                    );
                    return true;
                }
                Err(e) => {
                    warn!(
                        "Camera {} reconnect attempt {}/{} failed: {}",
                        entry.id,
                        attempt + 1,
                        policy.max_attempts,
                        e
                    );
                }
            }

            if let Some(delay) = policy.delay_after(attempt) {
                tokio::time::sleep(delay).await;
            }
        }

        error!(
            "Camera {} reconnect failed after {} attempts",
            entry.id, policy.max_attempts
        );
        false
    }

    /// 切换启用状态，返回切换后的状态
    ///
    /// 探测范围内尚未发现的ID先尝试打开，成功后才入池；
    /// 打开失败时池不变并返回 `CameraUnavailable`。
    pub async fn toggle(&self, id: CameraId) -> PoolResult<bool> {
        let existing = self.entries.get(&id).map(|e| e.value().clone());
        let entry = match existing {
            Some(entry) => entry,
            None => match self.enable_undiscovered(id).await? {
                Some(entry) => entry,
                None => return Ok(true),
            },
        };
        let mut guard = entry.lock_owned().await;

        if guard.enabled {
            guard.enabled = false;
            guard.consecutive_failures = 0;
            guard.release_handle();
            info!("Camera {} disabled", id);
            return Ok(false);
        }

        guard.release_handle();
        match self.open_device(id).await {
            Ok(handle) => {
                guard.handle = Some(handle);
                guard.enabled = true;
                guard.consecutive_failures = 0;
                info!("Camera {} enabled", id);
                Ok(true)
            }
            Err(e) => {
                warn!("Camera {} could not be enabled: {}", id, e);
                Err(PoolError::CameraUnavailable(id, e))
            }
        }
    }

    /// 打开尚未入池的摄像头
    ///
    /// 成功时以启用状态入池并返回 `None`；
    /// 打开期间已被其他调用入池时释放本次句柄，返回已有条目。
    async fn enable_undiscovered(
        &self,
        id: CameraId,
    ) -> PoolResult<Option<Arc<Mutex<CameraEntry>>>> {
        if id >= self.config.probe_range {
            return Err(PoolError::CameraUnknown(id));
        }

        let handle = match self.open_device(id).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Camera {} could not be enabled: {}", id, e);
                return Err(PoolError::CameraUnavailable(id, e));
            }
        };

        match self.entries.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(slot) => {
                drop(handle);
                Ok(Some(slot.get().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(CameraEntry::with_handle(id, handle))));
                info!("Camera {} enabled", id);
                Ok(None)
            }
        }
    }

    pub async fn is_enabled(&self, id: CameraId) -> bool {
        match self.entry(id) {
            Ok(entry) => entry.lock().await.enabled,
            Err(_) => false,
        }
    }

    /// 健康检查：采样若干次读帧，失败次数低于阈值即为健康
    pub async fn health_check(&self, id: CameraId) -> PoolResult<bool> {
        if !self.is_enabled(id).await {
            return Err(if self.contains(id) {
                PoolError::CameraDisabled(id)
            } else {
                PoolError::CameraUnknown(id)
            });
        }

        let health = &self.config.health;
        let mut failures = 0;
        for _ in 0..health.samples {
            if self.get_frame(id).await.is_err() {
                failures += 1;
            }
        }

        let healthy = failures < health.failure_threshold;
        debug!(
            "Camera {} health check: {}/{} samples failed, healthy={}",
            id, failures, health.samples, healthy
        );
        Ok(healthy)
    }

    pub async fn status(&self, id: CameraId) -> PoolResult<CameraStatus> {
        let entry = self.entry(id)?;
        let guard = entry.lock().await;
        Ok(guard.status())
    }

    pub async fn statuses(&self) -> Vec<CameraStatus> {
        let mut statuses = Vec::new();
        for id in self.camera_ids() {
            if let Ok(status) = self.status(id).await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// 关闭所有设备并禁用全部摄像头
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<Mutex<CameraEntry>>> =
            self.entries.iter().map(|e| e.value().clone()).collect();

        for entry in entries {
            let mut guard = entry.lock().await;
            guard.enabled = false;
            guard.release_handle();
        }

        info!("Camera pool shut down");
    }
}

// 摄像头视频流服务 - 采集设备句柄
//
// `CaptureBackend` / `CaptureDevice` 是与具体采集实现（V4L2、模拟源、测试替身）之间的接缝，
// `DeviceHandle` 在其上实现打开探测、单帧读取、幂等关闭和健康检查。

use chrono::{DateTime, Utc};
use common::{CameraId, DeviceError, DeviceState};
use image::RgbImage;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 采集参数（打开设备时应用）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// 单次读帧的硬超时
    pub read_timeout: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_rate: 30,
            read_timeout: Duration::from_millis(3000),
        }
    }
}

/// 一次成功读取的原始画面
#[derive(Debug, Clone)]
pub struct Capture {
    pub image: RgbImage,
    pub captured_at: DateTime<Utc>,
}

/// 采集后端：按摄像头ID打开原生设备
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// 打开设备并应用采集参数
    ///
    /// 实现必须在返回前应用分辨率和帧率设置；是否真正可用由
    /// `DeviceHandle::open` 通过探测读帧确认。
    fn open(
        &self,
        camera_id: CameraId,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CaptureDevice>, DeviceError>;
}

/// 已打开的原生设备
pub trait CaptureDevice: Send {
    /// 读取一帧，最长阻塞 `timeout`
    fn read(&mut self, timeout: Duration) -> Result<RgbImage, DeviceError>;

    /// 释放底层资源，`DeviceHandle` 保证只调用一次
    fn release(&mut self);

    fn is_healthy(&self) -> bool {
        true
    }
}

/// 采集设备句柄
///
/// 只能由所属摄像头条目的锁串行访问。`Drop` 时自动关闭。
pub struct DeviceHandle {
    camera_id: CameraId,
    device: Option<Box<dyn CaptureDevice>>,
    state: DeviceState,
    read_timeout: Duration,
}

impl DeviceHandle {
    /// 打开并探测设备
    ///
    /// 有些后端对不可用的设备也报告"已打开"，因此这里实际读取一帧：
    /// 探测失败时立即释放设备并返回 `DeviceUnavailable`。
    pub fn open(
        backend: &dyn CaptureBackend,
        camera_id: CameraId,
        settings: &CaptureSettings,
    ) -> Result<Self, DeviceError> {
        let mut device = backend.open(camera_id, settings)?;

        if let Err(e) = device.read(settings.read_timeout) {
            warn!(
                "Camera {} opened on {} backend but probe read failed: {}",
                camera_id,
                backend.name(),
                e
            );
            device.release();
            return Err(DeviceError::DeviceUnavailable(
                camera_id,
                format!("probe read failed: {}", e),
            ));
        }

        info!(
            "Camera {} opened ({} backend, {}x{} @ {}fps)",
            camera_id,
            backend.name(),
            settings.width,
            settings.height,
            settings.frame_rate
        );

        Ok(Self {
            camera_id,
            device: Some(device),
            state: DeviceState::Open,
            read_timeout: settings.read_timeout,
        })
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// 读取一帧
    ///
    /// 失败后句柄进入 `Faulted`，仍允许调用方在同一句柄上再重试一次；
    /// 重试成功会恢复为 `Open`。已关闭的句柄直接返回 `ReadFailed`。
    pub fn read_frame(&mut self) -> Result<Capture, DeviceError> {
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| DeviceError::ReadFailed("device handle is closed".to_string()))?;

        match device.read(self.read_timeout) {
            Ok(image) => {
                let captured_at = Utc::now();
                self.state = DeviceState::Open;
                Ok(Capture { image, captured_at })
            }
            Err(e) => {
                debug!("Camera {} read failed: {}", self.camera_id, e);
                self.state = DeviceState::Faulted;
                Err(e)
            }
        }
    }

    /// 关闭设备，重复调用无副作用
    pub fn close(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.release();
            self.state = DeviceState::Closed;
            info!("Camera {} released", self.camera_id);
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state == DeviceState::Open
            && self.device.as_ref().map(|d| d.is_healthy()).unwrap_or(false)
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("camera_id", &self.camera_id)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::mock::MockBackend;

    #[test]
    fn test_open_probes_with_a_read() {
        let backend = MockBackend::with_devices(&[0]);
        let handle = DeviceHandle::open(&backend, 0, &CaptureSettings::default()).unwrap();

        assert_eq!(handle.state(), DeviceState::Open);
        assert!(handle.is_healthy());
        assert_eq!(backend.opens(0), 1);
        assert_eq!(backend.reads(0), 1);
    }

    #[test]
    fn test_open_missing_device_is_unavailable() {
        let backend = MockBackend::with_devices(&[0]);
        let err = DeviceHandle::open(&backend, 1, &CaptureSettings::default()).unwrap_err();
        assert!(matches!(err, DeviceError::DeviceUnavailable(1, _)));
    }

    #[test]
    fn test_failed_probe_releases_device() {
        let backend = MockBackend::with_devices(&[0]);
        backend.fail_next_reads(0, 1);

        let err = DeviceHandle::open(&backend, 0, &CaptureSettings::default()).unwrap_err();
        assert!(matches!(err, DeviceError::DeviceUnavailable(0, _)));
        assert_eq!(backend.opens(0), 1);
        assert_eq!(backend.closes(0), 1);
    }

    #[test]
    fn test_read_failure_faults_then_recovers() {
        let backend = MockBackend::with_devices(&[0]);
        let mut handle = DeviceHandle::open(&backend, 0, &CaptureSettings::default()).unwrap();

        backend.fail_next_reads(0, 1);
        assert!(handle.read_frame().is_err());
        assert_eq!(handle.state(), DeviceState::Faulted);
        assert!(!handle.is_healthy());

        let capture = handle.read_frame().unwrap();
        assert_eq!(capture.image.width(), 640);
        assert_eq!(handle.state(), DeviceState::Open);
        assert!(handle.is_healthy());
    }

    #[test]
    fn test_close_is_idempotent() {
        let backend = MockBackend::with_devices(&[0]);
        let mut handle = DeviceHandle::open(&backend, 0, &CaptureSettings::default()).unwrap();

        handle.close();
        handle.close();
        drop(handle);

        assert_eq!(backend.closes(0), 1);
    }

    #[test]
    fn test_read_after_close_fails() {
        let backend = MockBackend::with_devices(&[0]);
        let mut handle = DeviceHandle::open(&backend, 0, &CaptureSettings::default()).unwrap();
        handle.close();

        assert!(matches!(
            handle.read_frame(),
            Err(DeviceError::ReadFailed(_))
        ));
        assert_eq!(handle.state(), DeviceState::Closed);
    }
}

// 摄像头视频流服务 - V4L2 采集后端
//
// 摄像头ID映射到 `{prefix}{id}` 设备节点（默认 /dev/video0 ...）。
// 打开时先设置 RGB3 格式、分辨率和帧率，再建立 mmap 缓冲流。

use super::device::{CaptureBackend, CaptureDevice, CaptureSettings};
use common::{CameraId, DeviceError};
use image::RgbImage;
use ouroboros::self_referencing;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct V4l2Backend {
    device_prefix: String,
}

impl V4l2Backend {
    pub fn new(device_prefix: impl Into<String>) -> Self {
        Self {
            device_prefix: device_prefix.into(),
        }
    }

    fn device_path(&self, camera_id: CameraId) -> String {
        format!("{}{}", self.device_prefix, camera_id)
    }
}

#[self_referencing]
struct StreamState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

struct V4l2Device {
    path: String,
    width: u32,
    height: u32,
    state: Option<StreamState>,
    last_error: Option<String>,
}

impl CaptureBackend for V4l2Backend {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn open(
        &self,
        camera_id: CameraId,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let path = self.device_path(camera_id);
        let unavailable = |what: &str, err: std::io::Error| {
            DeviceError::DeviceUnavailable(camera_id, format!("{} {}: {}", what, path, err))
        };

        let mut device = v4l::Device::with_path(&path).map_err(|e| unavailable("open", e))?;

        let mut format = device.format().map_err(|e| unavailable("read format of", e))?;
        format.width = settings.width;
        format.height = settings.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = device
            .set_format(&format)
            .map_err(|e| unavailable("set format on", e))?;
        if format.fourcc != v4l::FourCC::new(b"RGB3") {
            return Err(DeviceError::DeviceUnavailable(
                camera_id,
                format!("{} does not support RGB3 capture", path),
            ));
        }

        if settings.frame_rate > 0 {
            let params = v4l::video::capture::Parameters::with_fps(settings.frame_rate);
            if let Err(err) = device.set_params(&params) {
                warn!("Failed to set {}fps on {}: {}", settings.frame_rate, path, err);
            }
        }

        let read_timeout = settings.read_timeout;
        let state = StreamStateTryBuilder {
            device,
            stream_builder: |device| {
                let mut stream =
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)?;
                stream.set_timeout(read_timeout);
                Ok::<_, std::io::Error>(stream)
            },
        }
        .try_build()
        .map_err(|e| unavailable("create buffer stream for", e))?;

        info!(
            "V4L2 camera {} connected at {} ({}x{})",
            camera_id, path, format.width, format.height
        );

        Ok(Box::new(V4l2Device {
            path,
            width: format.width,
            height: format.height,
            state: Some(state),
            last_error: None,
        }))
    }
}

impl CaptureDevice for V4l2Device {
    fn read(&mut self, timeout: Duration) -> Result<RgbImage, DeviceError> {
        use v4l::io::traits::CaptureStream;

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| DeviceError::ReadFailed(format!("{} is released", self.path)))?;

        let result = state.with_mut(|fields| {
            fields
                .stream
                .next()
                .map(|(buf, _meta)| buf.to_vec())
        });

        let pixels = match result {
            Ok(pixels) => pixels,
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                self.last_error = Some(err.to_string());
                return Err(DeviceError::ReadTimeout(timeout.as_millis() as u64));
            }
            Err(err) => {
                self.last_error = Some(err.to_string());
                return Err(DeviceError::ReadFailed(err.to_string()));
            }
        };

        self.last_error = None;
        RgbImage::from_raw(self.width, self.height, pixels).ok_or_else(|| {
            DeviceError::ReadFailed(format!(
                "{} delivered a buffer that does not match {}x{} RGB",
                self.path, self.width, self.height
            ))
        })
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            info!("V4L2 device {} released", self.path);
        }
    }

    fn is_healthy(&self) -> bool {
        self.state.is_some() && self.last_error.is_none()
    }
}

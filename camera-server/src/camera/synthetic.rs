// 摄像头视频流服务 - 模拟采集后端
//
// 生成渐变背景加移动方块的测试画面，用于开发和演示环境。

use super::device::{CaptureBackend, CaptureDevice, CaptureSettings};
use common::{CameraId, DeviceError};
use image::{Rgb, RgbImage};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::info;

/// 模拟采集后端
///
/// 只有配置中列出的ID可以打开，其余ID表现为设备不存在。
#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    cameras: BTreeSet<CameraId>,
}

impl SyntheticBackend {
    pub fn new(cameras: impl IntoIterator<Item = CameraId>) -> Self {
        Self {
            cameras: cameras.into_iter().collect(),
        }
    }
}

impl CaptureBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open(
        &self,
        camera_id: CameraId,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        if !self.cameras.contains(&camera_id) {
            return Err(DeviceError::DeviceUnavailable(
                camera_id,
                "no synthetic device with this id".to_string(),
            ));
        }

        info!(
            "Synthetic camera {} connected ({}x{})",
            camera_id, settings.width, settings.height
        );

        Ok(Box::new(SyntheticDevice {
            camera_id,
            width: settings.width,
            height: settings.height,
            frame_count: 0,
        }))
    }
}

struct SyntheticDevice {
    camera_id: CameraId,
    width: u32,
    height: u32,
    frame_count: u64,
}

impl SyntheticDevice {
    fn render(&self) -> RgbImage {
        let (width, height) = (self.width, self.height);
        let tint = (self.camera_id.wrapping_mul(70) % 256) as u8;

        let mut image = RgbImage::from_fn(width, height, |x, y| {
            let r = (x * 255 / width.max(1)) as u8;
            let g = (y * 255 / height.max(1)) as u8;
            Rgb([r, g, tint])
        });

        // 方块沿水平方向往返移动
        let block = (width.min(height) / 6).max(1);
        let travel = width.saturating_sub(block).max(1) as u64;
        let phase = (self.frame_count * 4) % (travel * 2);
        let left = (if phase < travel { phase } else { travel * 2 - phase }) as u32;
        let top = height.saturating_sub(block) / 2;

        for y in top..(top + block).min(height) {
            for x in left..(left + block).min(width) {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }

        image
    }
}

impl CaptureDevice for SyntheticDevice {
    fn read(&mut self, _timeout: Duration) -> Result<RgbImage, DeviceError> {
        self.frame_count += 1;
        Ok(self.render())
    }

    fn release(&mut self) {
        info!("Synthetic camera {} disconnected", self.camera_id);
    }
}

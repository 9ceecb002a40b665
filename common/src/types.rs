use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 摄像头ID（按探测顺序分配，进程生命周期内稳定）
pub type CameraId = u32;

/// 采集设备句柄状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Closed,
    Open,
    Faulted,
}

/// 检测框
///
/// 像素坐标，满足 `x1 < x2`、`y1 < y2`，并裁剪在帧范围内。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetectionBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
    pub class_id: u32,
}

impl DetectionBox {
    /// 由检测器的原始坐标构造检测框
    ///
    /// 坐标可能为负数、颠倒或越界（检测器输出不可信），这里统一
    /// 规整为左上/右下顺序并裁剪到 `width x height` 之内。
    /// 裁剪后面积为零时返回 `None`。
    pub fn clipped(
        x1: i64,
        y1: i64,
        x2: i64,
        y2: i64,
        class_id: u32,
        width: u32,
        height: u32,
    ) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }

        let max_x = i64::from(width - 1);
        let max_y = i64::from(height - 1);

        let (left, right) = if x1 <= x2 { (x1, x2) } else { (x2, x1) };
        let (top, bottom) = if y1 <= y2 { (y1, y2) } else { (y2, y1) };

        let left = left.clamp(0, max_x);
        let right = right.clamp(0, max_x);
        let top = top.clamp(0, max_y);
        let bottom = bottom.clamp(0, max_y);

        if left >= right || top >= bottom {
            return None;
        }

        Some(Self {
            x1: left as u32,
            y1: top as u32,
            x2: right as u32,
            y2: bottom as u32,
            class_id,
        })
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }
}

/// 摄像头状态（用于API返回和诊断日志）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraStatus {
    pub camera_id: CameraId,
    pub enabled: bool,
    pub device_state: DeviceState,
    pub consecutive_failures: u32,
    pub frames_read: u64,
    /// 最近一次成功读帧时间
    pub last_frame_at: Option<DateTime<Utc>>,
}

impl CameraStatus {
    /// 禁用的摄像头不能持有已打开的设备
    ///
    /// 启用但设备已关闭是合法的（重连失败后暂时不可用）。
    pub fn is_consistent(&self) -> bool {
        self.enabled || self.device_state == DeviceState::Closed
    }
}

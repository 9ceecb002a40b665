// 摄像头视频流服务 - 摄像头模块

pub mod device;
pub mod health;
pub mod pool;
pub mod reconnect;
pub mod synthetic;

#[cfg(feature = "v4l2")]
pub mod v4l2;

#[cfg(test)]
pub(crate) mod mock;

pub use device::{Capture, CaptureBackend, CaptureDevice, CaptureSettings, DeviceHandle};
pub use health::{check_enabled_cameras, spawn_health_monitor};
pub use pool::{CameraPool, HealthCheckConfig, PoolConfig};
pub use reconnect::ReconnectPolicy;
pub use synthetic::SyntheticBackend;

#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Backend;

use crate::types::CameraId;
use thiserror::Error;

/// 采集设备错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// 设备无法打开，或打开后探测读帧失败
    #[error("Camera device {0} unavailable: {1}")]
    DeviceUnavailable(CameraId, String),

    #[error("Read timed out after {0}ms")]
    ReadTimeout(u64),

    #[error("Read failed: {0}")]
    ReadFailed(String),
}

/// 摄像头池错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Unknown camera: {0}")]
    CameraUnknown(CameraId),

    #[error("Camera {0} is disabled")]
    CameraDisabled(CameraId),

    #[error("Camera {0} could not be opened: {1}")]
    CameraUnavailable(CameraId, DeviceError),

    #[error("No frame available from camera {0}")]
    FrameUnavailable(CameraId),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type PoolResult<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            PoolError::CameraUnknown(7),
            PoolError::CameraDisabled(1),
            PoolError::CameraUnavailable(2, DeviceError::DeviceUnavailable(2, "busy".into())),
            PoolError::FrameUnavailable(0),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
        assert_eq!(
            PoolError::CameraUnavailable(2, DeviceError::ReadTimeout(3000)).to_string(),
            "Camera 2 could not be opened: Read timed out after 3000ms"
        );
    }
}

// 摄像头视频流服务 - 配置
//
// 全部配置来自环境变量（启动时先加载 .env），每个组件拿到自己的子配置。

use crate::camera::{CaptureSettings, HealthCheckConfig, PoolConfig, ReconnectPolicy};
use crate::streaming::{FrameSourceConfig, StreamConfig};
use common::CameraId;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEV_JWT_SECRET: &str = "dev-secret";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Missing required setting {0}")]
    Missing(&'static str),
}

/// 采集后端
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureBackendKind {
    Synthetic { cameras: BTreeSet<CameraId> },
    V4l2 { device_prefix: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    Motion,
    Http,
}

#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub enabled: bool,
    pub detector: DetectorKind,
    pub url: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// 未配置 JWT_SECRET，使用开发密钥
    pub using_dev_secret: bool,
    pub token_ttl: Duration,
    /// 为空表示只保存在内存
    pub user_store_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_host: String,
    pub http_port: u16,
    pub backend: CaptureBackendKind,
    pub pool: PoolConfig,
    pub sources: FrameSourceConfig,
    pub stream: StreamConfig,
    pub detection: DetectionConfig,
    pub auth: AuthConfig,
    /// 周期性健康诊断间隔，`None` 表示关闭
    pub health_check_interval: Option<Duration>,
    pub require_camera: bool,
}

/// 环境变量读取器
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &'static str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string())
    }

    fn string(&self, key: &'static str, default: &str) -> String {
        self.raw(key)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(key).filter(|v| !v.is_empty()) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn bool(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.raw(key).filter(|v| !v.is_empty()) {
            None => Ok(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key,
                    value,
                    reason: "expected a boolean".to_string(),
                }),
            },
        }
    }

    fn positive<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default + Copy + std::fmt::Display,
        T::Err: std::fmt::Display,
    {
        let value = self.parse(key, default)?;
        if value <= T::default() {
            return Err(ConfigError::Invalid {
                key,
                value: value.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }
}

fn parse_camera_list(key: &'static str, value: &str) -> Result<BTreeSet<CameraId>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<CameraId>().map_err(|e| ConfigError::Invalid {
                key,
                value: value.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

impl Config {
    /// 从进程环境变量加载
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let backend = match env.string("CAPTURE_BACKEND", "synthetic").as_str() {
            "synthetic" => CaptureBackendKind::Synthetic {
                cameras: parse_camera_list(
                    "SYNTHETIC_CAMERAS",
                    &env.raw("SYNTHETIC_CAMERAS").unwrap_or_else(|| "0".to_string()),
                )?,
            },
            "v4l2" => {
                if !cfg!(feature = "v4l2") {
                    return Err(ConfigError::Invalid {
                        key: "CAPTURE_BACKEND",
                        value: "v4l2".to_string(),
                        reason: "built without the v4l2 feature".to_string(),
                    });
                }
                CaptureBackendKind::V4l2 {
                    device_prefix: env.string("V4L2_DEVICE_PREFIX", "/dev/video"),
                }
            }
            other => {
                return Err(ConfigError::Invalid {
                    key: "CAPTURE_BACKEND",
                    value: other.to_string(),
                    reason: "expected synthetic or v4l2".to_string(),
                })
            }
        };

        let frame_rate: u32 = env.positive("FRAME_RATE", 30)?;
        let capture = CaptureSettings {
            width: env.positive("FRAME_WIDTH", 640)?,
            height: env.positive("FRAME_HEIGHT", 480)?,
            frame_rate,
            read_timeout: Duration::from_millis(env.positive("READ_TIMEOUT_MS", 3000)?),
        };

        let health = HealthCheckConfig {
            samples: env.positive("HEALTH_SAMPLES", 5)?,
            failure_threshold: env.positive("HEALTH_FAILURE_THRESHOLD", 2)?,
        };

        let pool = PoolConfig {
            probe_range: env.positive("PROBE_RANGE", 3)?,
            capture,
            reconnect: ReconnectPolicy::fixed(
                env.positive("RECONNECT_ATTEMPTS", 3)?,
                Duration::from_millis(env.parse("RECONNECT_BACKOFF_MS", 1000)?),
            ),
            health,
        };

        let jpeg_quality: u8 = env.positive("JPEG_QUALITY", 80)?;
        if jpeg_quality > 100 {
            return Err(ConfigError::Invalid {
                key: "JPEG_QUALITY",
                value: jpeg_quality.to_string(),
                reason: "must be between 1 and 100".to_string(),
            });
        }

        let stream = StreamConfig {
            poll_interval: Duration::from_millis(env.positive("STREAM_POLL_INTERVAL_MS", 100)?),
            jpeg_quality,
        };

        let detector = match env.string("DETECTOR", "motion").as_str() {
            "motion" => DetectorKind::Motion,
            "http" => DetectorKind::Http,
            other => {
                return Err(ConfigError::Invalid {
                    key: "DETECTOR",
                    value: other.to_string(),
                    reason: "expected motion or http".to_string(),
                })
            }
        };
        let detection = DetectionConfig {
            enabled: env.bool("DETECTION_ENABLED", true)?,
            detector,
            url: env.raw("DETECTOR_URL").filter(|v| !v.is_empty()),
            timeout: Duration::from_millis(env.positive("DETECTION_TIMEOUT_MS", 2000)?),
        };
        if detection.enabled && detector == DetectorKind::Http && detection.url.is_none() {
            return Err(ConfigError::Missing("DETECTOR_URL"));
        }

        let jwt_secret = env.raw("JWT_SECRET").filter(|v| !v.is_empty());
        let auth = AuthConfig {
            using_dev_secret: jwt_secret.is_none(),
            jwt_secret: jwt_secret.unwrap_or_else(|| DEV_JWT_SECRET.to_string()),
            token_ttl: Duration::from_secs(env.positive("TOKEN_TTL_SECS", 3600)?),
            user_store_path: match env.raw("USER_STORE_PATH") {
                Some(path) if path.is_empty() => None,
                Some(path) => Some(PathBuf::from(path)),
                None => Some(PathBuf::from("users.json")),
            },
        };

        let health_interval: u64 = env.parse("HEALTH_CHECK_INTERVAL_SECS", 60)?;

        Ok(Self {
            http_host: env.string("HTTP_HOST", "0.0.0.0"),
            http_port: env.parse("HTTP_PORT", 5000)?,
            backend,
            pool,
            sources: FrameSourceConfig {
                frame_rate,
                ..FrameSourceConfig::default()
            },
            stream,
            detection,
            auth,
            health_check_interval: (health_interval > 0)
                .then(|| Duration::from_secs(health_interval)),
            require_camera: env.bool("REQUIRE_CAMERA", false)?,
        })
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }
}

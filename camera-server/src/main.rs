use anyhow::{bail, Context, Result};
use camera_server::auth::{CredentialStore, JwtAuth};
use camera_server::camera::{spawn_health_monitor, CameraPool, CaptureBackend, SyntheticBackend};
use camera_server::config::{CaptureBackendKind, Config, DetectionConfig, DetectorKind};
use camera_server::detection::{
    DetectionStage, Detector, HttpDetector, HttpDetectorConfig, MotionDetector,
};
use camera_server::http::{AppState, HttpServer};
use camera_server::streaming::{FrameSourceManager, StreamMultiplexer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env 不存在时忽略
    let _ = dotenvy::dotenv();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,camera_server=debug")),
        )
        .with_target(false)
        .init();

    info!("🚀 Camera server starting...");

    // 加载配置
    let config = Config::load().context("invalid configuration")?;
    info!("✓ Configuration loaded");
    if config.auth.using_dev_secret {
        warn!("⚠️  JWT_SECRET not set, using development secret");
    }

    // 摄像头池
    let backend = build_backend(&config)?;
    let pool = CameraPool::new(backend, config.pool.clone());
    let discovered = pool.discover().await;
    if discovered.is_empty() {
        if config.require_camera {
            bail!("no cameras discovered and REQUIRE_CAMERA is set");
        }
        warn!("⚠️  No cameras discovered, continuing without video");
    } else {
        info!("✓ Cameras discovered: {:?}", discovered);
    }

    // 检测与帧源
    let detection = build_detection(&config.detection, config.stream.jpeg_quality)?;
    let sources = FrameSourceManager::new(pool.clone(), detection, config.sources.clone());
    let started = sources.start_enabled().await;
    info!("✓ Frame sources running for {:?}", started);

    // 认证
    let auth = Arc::new(JwtAuth::new(&config.auth.jwt_secret, config.auth.token_ttl));
    let users = match &config.auth.user_store_path {
        Some(path) => Arc::new(
            CredentialStore::open(path.clone())
                .await
                .with_context(|| format!("failed to open user store {}", path.display()))?,
        ),
        None => Arc::new(CredentialStore::in_memory()),
    };
    info!("✓ Credential store ready ({} users)", users.len());

    let multiplexer = StreamMultiplexer::new(sources.clone(), auth.clone(), config.stream.clone());

    // 周期性健康诊断
    let cancel = CancellationToken::new();
    let monitor = config
        .health_check_interval
        .map(|interval| spawn_health_monitor(pool.clone(), interval, cancel.clone()));

    // 启动HTTP服务器
    let addr: SocketAddr = config
        .http_addr()
        .parse()
        .with_context(|| format!("invalid listen address {}", config.http_addr()))?;
    let state = AppState::new(sources.clone(), multiplexer, auth, users);
    let server = HttpServer::new(addr, state);

    info!("✓ HTTP server listening on {}", addr);
    info!("🎉 Camera server ready!");

    if let Err(e) = server.run(shutdown_signal()).await {
        error!("HTTP server error: {}", e);
    }

    // 先停帧源再释放设备
    info!("🛑 Shutting down...");
    cancel.cancel();
    sources.stop_all().await;
    pool.shutdown().await;
    if let Some(monitor) = monitor {
        let _ = monitor.await;
    }
    info!("✓ All cameras released");

    Ok(())
}

fn build_backend(config: &Config) -> Result<Arc<dyn CaptureBackend>> {
    match &config.backend {
        CaptureBackendKind::Synthetic { cameras } => {
            info!("Using synthetic capture backend for cameras {:?}", cameras);
            Ok(Arc::new(SyntheticBackend::new(cameras.iter().copied())))
        }
        #[cfg(feature = "v4l2")]
        CaptureBackendKind::V4l2 { device_prefix } => {
            info!("Using V4L2 capture backend ({}N)", device_prefix);
            Ok(Arc::new(camera_server::camera::V4l2Backend::new(
                device_prefix.clone(),
            )))
        }
        #[cfg(not(feature = "v4l2"))]
        CaptureBackendKind::V4l2 { .. } => {
            bail!("CAPTURE_BACKEND=v4l2 requires building with the `v4l2` feature")
        }
    }
}

fn build_detection(config: &DetectionConfig, jpeg_quality: u8) -> Result<DetectionStage> {
    if !config.enabled {
        info!("Detection disabled");
        return Ok(DetectionStage::disabled());
    }

    let detector: Arc<dyn Detector> = match config.detector {
        DetectorKind::Motion => Arc::new(MotionDetector::default()),
        DetectorKind::Http => {
            let url = config
                .url
                .clone()
                .context("DETECTOR=http requires DETECTOR_URL")?;
            Arc::new(HttpDetector::new(HttpDetectorConfig {
                url,
                timeout: config.timeout,
                jpeg_quality,
            })?)
        }
    };

    let stage = DetectionStage::new(detector, config.timeout);
    info!(
        "✓ Detection enabled ({})",
        stage.detector_name().unwrap_or("unknown")
    );
    Ok(stage)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}

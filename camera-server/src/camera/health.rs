// 摄像头视频流服务 - 周期性健康诊断
//
// 定时对所有启用的摄像头执行健康检查并记录结果，不改变启用状态。

use super::pool::CameraPool;
use common::CameraId;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 对所有启用的摄像头做一轮健康检查，返回不健康的ID
pub async fn check_enabled_cameras(pool: &CameraPool) -> Vec<CameraId> {
    let mut unhealthy = Vec::new();

    for id in pool.camera_ids() {
        if !pool.is_enabled(id).await {
            continue;
        }

        match pool.health_check(id).await {
            Ok(true) => debug!("Camera {} healthy", id),
            Ok(false) => {
                warn!("Camera {} failed health check", id);
                unhealthy.push(id);
            }
            // 检查期间被禁用
            Err(e) => debug!("Camera {} skipped health check: {}", id, e),
        }
    }

    unhealthy
}

/// 启动后台诊断任务
pub fn spawn_health_monitor(
    pool: CameraPool,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval 的第一次 tick 立即完成，启动时不检查
        ticker.tick().await;

        info!("Camera health monitor started (every {:?})", interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let unhealthy = check_enabled_cameras(&pool).await;
                    if !unhealthy.is_empty() {
                        warn!("Unhealthy cameras: {:?}", unhealthy);
                    }
                }
            }
        }

        info!("Camera health monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::mock::MockBackend;
    use crate::camera::{CaptureSettings, PoolConfig, ReconnectPolicy};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reports_only_failing_enabled_cameras() {
        let backend = Arc::new(MockBackend::with_devices(&[0, 1, 2]));
        let pool = CameraPool::new(
            backend.clone(),
            PoolConfig {
                capture: CaptureSettings {
                    width: 8,
                    height: 8,
                    ..CaptureSettings::default()
                },
                reconnect: ReconnectPolicy::fixed(2, Duration::from_millis(1)),
                ..PoolConfig::default()
            },
        );
        pool.discover().await;

        pool.toggle(2).await.unwrap();
        backend.fail_all_reads(1, true);
        backend.fail_all_reads(2, true);

        assert_eq!(check_enabled_cameras(&pool).await, vec![1]);
        // 禁用的摄像头没有被读过
        let status = pool.status(2).await.unwrap();
        assert!(!status.enabled);
    }

    #[tokio::test]
    async fn test_monitor_stops_on_cancel() {
        let pool = CameraPool::new(Arc::new(MockBackend::default()), PoolConfig::default());
        let cancel = CancellationToken::new();
        let handle = spawn_health_monitor(pool, Duration::from_millis(10), cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

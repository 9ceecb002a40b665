// 帧率控制器
//
// 按固定周期节拍：上一次节拍之后不足一个周期则睡眠补齐，已经超时则立即继续。

use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 帧率控制器
///
/// FrameSource 用它控制读帧节奏，每个客户端流用它控制推送节奏。
#[derive(Debug)]
pub struct FrameRatePacer {
    /// 节拍周期
    interval: Duration,
    /// 上次节拍时间
    last_tick: Option<Instant>,
    /// 超时多少才告警
    late_warn_threshold: Duration,
}

impl FrameRatePacer {
    /// 按帧率创建
    ///
    /// # 参数
    ///
    /// * `target_fps` - 目标帧率，0 按 30fps 处理
    pub fn from_fps(target_fps: u32) -> Self {
        let fps = if target_fps == 0 { 30 } else { target_fps };
        Self::from_interval(Duration::from_secs_f64(1.0 / fps as f64))
    }

    /// 按周期创建
    pub fn from_interval(interval: Duration) -> Self {
        debug!("Creating FrameRatePacer: interval={:?}", interval);

        Self {
            interval,
            last_tick: None,
            late_warn_threshold: interval.max(Duration::from_millis(10)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 等待直到下一次节拍
    ///
    /// 第一次调用不等待。
    pub async fn wait_for_next_frame(&mut self) {
        if let Some(last) = self.last_tick {
            let elapsed = last.elapsed();

            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            } else {
                let overtime = elapsed - self.interval;
                if overtime > self.late_warn_threshold {
                    warn!(
                        "Tick is late by {:.3}ms (interval: {:.3}ms)",
                        overtime.as_secs_f64() * 1000.0,
                        self.interval.as_secs_f64() * 1000.0
                    );
                }
            }
        }

        self.last_tick = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_from_fps() {
        let pacer = FrameRatePacer::from_fps(30);
        let ms = pacer.interval().as_secs_f64() * 1000.0;
        assert!((ms - 33.333).abs() < 0.01);

        let pacer = FrameRatePacer::from_fps(0);
        assert_eq!(pacer.interval(), FrameRatePacer::from_fps(30).interval());
    }

    #[tokio::test]
    async fn test_first_wait_is_immediate() {
        let mut pacer = FrameRatePacer::from_interval(Duration::from_secs(10));

        let start = Instant::now();
        pacer.wait_for_next_frame().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_enforces_interval() {
        let mut pacer = FrameRatePacer::from_interval(Duration::from_millis(40));

        let start = Instant::now();
        pacer.wait_for_next_frame().await;
        pacer.wait_for_next_frame().await;
        pacer.wait_for_next_frame().await;

        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}

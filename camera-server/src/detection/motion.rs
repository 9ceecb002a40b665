// 帧差运动检测
//
// 把画面缩成粗粒度灰度网格，与同一摄像头上一帧的网格逐格比较，
// 变化超过阈值的格子合并为一个外接框。

use super::{DetectionError, Detector, RawDetection};
use async_trait::async_trait;
use common::CameraId;
use dashmap::DashMap;
use image::RgbImage;

/// 运动检测输出的类别ID
pub const MOTION_CLASS_ID: u32 = 0;

struct GridState {
    cells: Vec<u8>,
    columns: u32,
    rows: u32,
}

pub struct MotionDetector {
    /// 网格单元边长（像素）
    cell_size: u32,
    /// 灰度差阈值
    threshold: u8,
    previous: DashMap<CameraId, GridState>,
}

impl Default for MotionDetector {
    fn default() -> Self {
        Self::new(16, 24)
    }
}

impl MotionDetector {
    pub fn new(cell_size: u32, threshold: u8) -> Self {
        Self {
            cell_size: cell_size.max(1),
            threshold,
            previous: DashMap::new(),
        }
    }

    fn grid(&self, image: &RgbImage) -> GridState {
        let (width, height) = image.dimensions();
        let columns = width.div_ceil(self.cell_size);
        let rows = height.div_ceil(self.cell_size);
        let mut cells = Vec::with_capacity((columns * rows) as usize);

        for row in 0..rows {
            for column in 0..columns {
                // 取单元中心像素的亮度
                let x = (column * self.cell_size + self.cell_size / 2).min(width - 1);
                let y = (row * self.cell_size + self.cell_size / 2).min(height - 1);
                let [r, g, b] = image.get_pixel(x, y).0;
                let luma = (u32::from(r) * 299 + u32::from(g) * 587 + u32::from(b) * 114) / 1000;
                cells.push(luma as u8);
            }
        }

        GridState {
            cells,
            columns,
            rows,
        }
    }

    fn changed_region(&self, previous: &GridState, current: &GridState) -> Option<(u32, u32, u32, u32)> {
        if previous.columns != current.columns || previous.rows != current.rows {
            return None;
        }

        let mut region: Option<(u32, u32, u32, u32)> = None;
        for (index, (before, after)) in previous.cells.iter().zip(&current.cells).enumerate() {
            if before.abs_diff(*after) < self.threshold {
                continue;
            }
            let column = index as u32 % current.columns;
            let row = index as u32 / current.columns;
            region = Some(match region {
                None => (column, row, column, row),
                Some((c1, r1, c2, r2)) => (c1.min(column), r1.min(row), c2.max(column), r2.max(row)),
            });
        }

        region
    }
}

#[async_trait]
impl Detector for MotionDetector {
    fn name(&self) -> &'static str {
        "motion"
    }

    async fn detect(
        &self,
        camera_id: CameraId,
        image: &RgbImage,
    ) -> Result<Vec<RawDetection>, DetectionError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let current = self.grid(image);
        let region = self
            .previous
            .get(&camera_id)
            .and_then(|previous| self.changed_region(&previous, &current));
        self.previous.insert(camera_id, current);

        let Some((c1, r1, c2, r2)) = region else {
            return Ok(Vec::new());
        };

        let cell = i64::from(self.cell_size);
        Ok(vec![RawDetection {
            x1: i64::from(c1) * cell,
            y1: i64::from(r1) * cell,
            x2: (i64::from(c2) + 1) * cell,
            y2: (i64::from(r2) + 1) * cell,
            class_id: MOTION_CLASS_ID,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn scene(block_at: Option<(u32, u32)>) -> RgbImage {
        let mut image = RgbImage::from_pixel(128, 96, Rgb([20, 20, 20]));
        if let Some((left, top)) = block_at {
            for y in top..top + 32 {
                for x in left..left + 32 {
                    image.put_pixel(x, y, Rgb([250, 250, 250]));
                }
            }
        }
        image
    }

    #[tokio::test]
    async fn test_first_frame_has_no_motion() {
        let detector = MotionDetector::default();
        assert!(detector.detect(0, &scene(None)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_static_scene_has_no_motion() {
        let detector = MotionDetector::default();
        detector.detect(0, &scene(Some((16, 16)))).await.unwrap();
        assert!(detector.detect(0, &scene(Some((16, 16)))).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_moving_block_is_boxed() {
        let detector = MotionDetector::default();
        detector.detect(0, &scene(None)).await.unwrap();

        let boxes = detector.detect(0, &scene(Some((64, 32)))).await.unwrap();
        assert_eq!(
            boxes,
            vec![RawDetection { x1: 64, y1: 32, x2: 96, y2: 64, class_id: MOTION_CLASS_ID }]
        );
    }

    #[tokio::test]
    async fn test_change_below_threshold_is_ignored() {
        let detector = MotionDetector::default();
        detector.detect(0, &scene(None)).await.unwrap();

        let dimmer = RgbImage::from_pixel(128, 96, Rgb([30, 30, 30]));
        assert!(detector.detect(0, &dimmer).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cameras_are_tracked_separately() {
        let detector = MotionDetector::default();
        detector.detect(0, &scene(None)).await.unwrap();

        // 摄像头1的第一帧没有参照
        assert!(detector.detect(1, &scene(Some((0, 0)))).await.unwrap().is_empty());
    }
}

// 检测框绘制：2像素宽的绿色矩形

use common::DetectionBox;
use image::{Rgb, RgbImage};

pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const BOX_THICKNESS: u32 = 2;

/// 在画面上绘制检测框（框向内加粗，不越出画面）
pub fn draw_boxes(image: &mut RgbImage, boxes: &[DetectionBox]) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }

    for b in boxes {
        let x2 = b.x2.min(width - 1);
        let y2 = b.y2.min(height - 1);
        if b.x1 > x2 || b.y1 > y2 {
            continue;
        }

        for t in 0..BOX_THICKNESS {
            let top = (b.y1 + t).min(y2);
            let bottom = y2.saturating_sub(t).max(b.y1);
            let left = (b.x1 + t).min(x2);
            let right = x2.saturating_sub(t).max(b.x1);

            for x in b.x1..=x2 {
                image.put_pixel(x, top, BOX_COLOR);
                image.put_pixel(x, bottom, BOX_COLOR);
            }
            for y in b.y1..=y2 {
                image.put_pixel(left, y, BOX_COLOR);
                image.put_pixel(right, y, BOX_COLOR);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_outline_is_two_pixels_wide() {
        let mut image = RgbImage::new(40, 30);
        let b = DetectionBox { x1: 5, y1: 5, x2: 20, y2: 15, class_id: 0 };

        draw_boxes(&mut image, &[b]);

        assert_eq!(*image.get_pixel(5, 5), BOX_COLOR);
        assert_eq!(*image.get_pixel(6, 10), BOX_COLOR);
        assert_eq!(*image.get_pixel(19, 10), BOX_COLOR);
        assert_eq!(*image.get_pixel(12, 14), BOX_COLOR);
        // 内部和外部不受影响
        assert_eq!(*image.get_pixel(7, 10), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(12, 10), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(4, 5), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_box_on_frame_edge() {
        let mut image = RgbImage::new(10, 10);
        let b = DetectionBox { x1: 0, y1: 0, x2: 9, y2: 9, class_id: 1 };

        draw_boxes(&mut image, &[b]);

        assert_eq!(*image.get_pixel(9, 9), BOX_COLOR);
        assert_eq!(*image.get_pixel(0, 9), BOX_COLOR);
        assert_eq!(*image.get_pixel(5, 5), Rgb([0, 0, 0]));
    }
}

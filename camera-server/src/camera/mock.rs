// 测试用采集后端：记录打开/关闭/读帧次数，并可注入失败

use super::device::{CaptureBackend, CaptureDevice, CaptureSettings};
use common::{CameraId, DeviceError};
use dashmap::DashMap;
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub struct DeviceCounters {
    present: AtomicBool,
    open_attempts: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
    reads: AtomicUsize,
    fail_opens: AtomicUsize,
    fail_reads: AtomicUsize,
    always_fail_reads: AtomicBool,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Default)]
pub struct MockBackend {
    devices: DashMap<CameraId, Arc<DeviceCounters>>,
    read_delay: Option<Duration>,
}

impl MockBackend {
    pub fn with_devices(ids: &[CameraId]) -> Self {
        let backend = Self::default();
        for id in ids {
            backend.set_present(*id, true);
        }
        backend
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    fn counters(&self, id: CameraId) -> Arc<DeviceCounters> {
        self.devices.entry(id).or_default().clone()
    }

    pub fn set_present(&self, id: CameraId, present: bool) {
        self.counters(id).present.store(present, Ordering::SeqCst);
    }

    pub fn fail_next_opens(&self, id: CameraId, n: usize) {
        self.counters(id).fail_opens.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_reads(&self, id: CameraId, n: usize) {
        self.counters(id).fail_reads.store(n, Ordering::SeqCst);
    }

    pub fn fail_all_reads(&self, id: CameraId, fail: bool) {
        self.counters(id).always_fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn open_attempts(&self, id: CameraId) -> usize {
        self.counters(id).open_attempts.load(Ordering::SeqCst)
    }

    pub fn opens(&self, id: CameraId) -> usize {
        self.counters(id).opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self, id: CameraId) -> usize {
        self.counters(id).closes.load(Ordering::SeqCst)
    }

    pub fn reads(&self, id: CameraId) -> usize {
        self.counters(id).reads.load(Ordering::SeqCst)
    }

    /// 当前仍处于打开状态的原生设备数
    pub fn open_handles(&self, id: CameraId) -> usize {
        self.opens(id) - self.closes(id)
    }
}

impl CaptureBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn open(
        &self,
        camera_id: CameraId,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        let counters = self.counters(camera_id);
        counters.open_attempts.fetch_add(1, Ordering::SeqCst);

        if !counters.present.load(Ordering::SeqCst) || take_one(&counters.fail_opens) {
            return Err(DeviceError::DeviceUnavailable(
                camera_id,
                "mock device not present".to_string(),
            ));
        }

        counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockDevice {
            counters,
            width: settings.width,
            height: settings.height,
            read_delay: self.read_delay,
        }))
    }
}

struct MockDevice {
    counters: Arc<DeviceCounters>,
    width: u32,
    height: u32,
    read_delay: Option<Duration>,
}

impl CaptureDevice for MockDevice {
    fn read(&mut self, timeout: Duration) -> Result<RgbImage, DeviceError> {
        let n = self.counters.reads.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.read_delay {
            std::thread::sleep(delay);
        }

        if self.counters.always_fail_reads.load(Ordering::SeqCst)
            || take_one(&self.counters.fail_reads)
        {
            return Err(DeviceError::ReadTimeout(timeout.as_millis() as u64));
        }

        let shade = (n % 256) as u8;
        Ok(RgbImage::from_pixel(self.width, self.height, Rgb([shade, shade, shade])))
    }

    fn release(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

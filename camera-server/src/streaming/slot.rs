// 摄像头视频流服务 - 最新帧槽位
//
// 每个摄像头一个单槽缓冲：写端整体替换，读端随时取快照。
// 没有队列，慢读者只会看到重复或过期的帧，不会阻塞写端。

use super::frame::Frame;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("Stale frame: sequence {attempted} is not newer than {current}")]
    StaleSequence { current: u64, attempted: u64 },
}

/// 写端，只由对应摄像头的 FrameSource 持有
#[derive(Debug)]
pub struct LatestFrameSlot {
    tx: watch::Sender<Option<Arc<Frame>>>,
}

/// 读端，可任意克隆
#[derive(Debug, Clone)]
pub struct SlotReader {
    rx: watch::Receiver<Option<Arc<Frame>>>,
}

impl LatestFrameSlot {
    pub fn new() -> (Self, SlotReader) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, SlotReader { rx })
    }

    /// 发布新帧，序号必须严格大于当前帧
    pub fn publish(&self, frame: Frame) -> Result<(), SlotError> {
        let attempted = frame.sequence;
        let mut stale = None;
        let frame = Arc::new(frame);

        self.tx.send_if_modified(|current| {
            let current_sequence = current.as_ref().map(|f| f.sequence);
            if let Some(seq) = current_sequence.filter(|seq| *seq >= attempted) {
                stale = Some(seq);
                return false;
            }
            *current = Some(frame);
            true
        });

        match stale {
            Some(current) => Err(SlotError::StaleSequence { current, attempted }),
            None => Ok(()),
        }
    }
}

impl SlotReader {
    /// 当前帧快照，不持有槽位内部锁
    pub fn snapshot(&self) -> Option<Arc<Frame>> {
        self.rx.borrow().clone()
    }

    /// 写端已被丢弃（FrameSource 已停止）
    pub fn is_closed(&self) -> bool {
        self.rx.has_changed().is_err()
    }
}

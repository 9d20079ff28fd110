// 帧分类 - 把采集端的原始样本变成带序号的媒体帧
//
// # 核心组件
//
// - `SampleClassifier`: 判定关键帧、分配序号、丢弃空帧
// - `TimestampNormalizer`: 纳秒 → 100纳秒换算以及缺失时间戳补全
//
// 关键帧判定只看采集端的 DELTA_UNIT 标志：没有该标志的样本就是关键帧。

pub mod timestamp;

pub use timestamp::{NormalizedTimestamps, TimestampNormalizer};

use common::{BufferFlags, MediaSample};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace};

use crate::capture::RawSample;

/// 样本被分类器丢弃的原因
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SampleRejected {
    #[error("Empty frame dropped (pts={pts})")]
    EmptyFrame { pts: u64 },
}

/// 分类统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassifierStats {
    pub classified: u64,
    pub key_frames: u64,
    pub dropped_empty: u64,
    pub extrapolated_timestamps: u64,
}

/// 帧分类器
///
/// 每个会话一个实例，由会话驱动器按到达顺序逐个调用，序号因此严格递增且没有空洞。
pub struct SampleClassifier {
    next_sequence: u64,
    timestamps: TimestampNormalizer,
    stats: ClassifierStats,
}

impl SampleClassifier {
    pub fn new(frame_rate: u32) -> Self {
        Self {
            next_sequence: 0,
            timestamps: TimestampNormalizer::new(frame_rate),
            stats: ClassifierStats::default(),
        }
    }

    /// 分类一个原始样本
    ///
    /// 空负载返回 `SampleRejected::EmptyFrame`，不占用序号。
    pub fn classify(&mut self, raw: RawSample) -> Result<MediaSample, SampleRejected> {
        if raw.payload.is_empty() {
            self.stats.dropped_empty += 1;
            debug!("Dropping empty frame (pts={})", raw.pts);
            return Err(SampleRejected::EmptyFrame { pts: raw.pts });
        }

        let is_key_frame = raw.flags & BufferFlags::DELTA_UNIT == 0;
        let ts = self.timestamps.normalize(raw.pts, raw.dts, raw.duration);

        let sequence_index = self.next_sequence;
        self.next_sequence += 1;

        self.stats.classified += 1;
        if is_key_frame {
            self.stats.key_frames += 1;
        }
        self.stats.extrapolated_timestamps = self.timestamps.extrapolated();

        trace!(
            "Classified frame #{}: key={}, pts={}, dts={}, size={}",
            sequence_index,
            is_key_frame,
            ts.presentation,
            ts.decode,
            raw.payload.len()
        );

        Ok(MediaSample {
            sequence_index,
            is_key_frame,
            presentation_timestamp: ts.presentation,
            decode_timestamp: ts.decode,
            duration: ts.duration,
            payload: raw.payload,
        })
    }

    /// 下一帧将分配的序号
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn stats(&self) -> &ClassifierStats {
        &self.stats
    }
}

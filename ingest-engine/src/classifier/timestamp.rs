// 时间戳归一化实现
//
// 采集端使用纳秒时间（GStreamer clock time，未知时为 CLOCK_TIME_NONE），
// 接收端使用100纳秒单位。本模块负责单位换算和缺失时间戳的补全。

use common::{CLOCK_TIME_NONE, HUNDREDS_OF_NANOS_IN_A_SECOND, NANOS_PER_TIMESCALE_UNIT};
use tracing::{debug, warn};

/// 归一化后的时间戳（100纳秒单位）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedTimestamps {
    pub presentation: u64,
    pub decode: u64,
    pub duration: u64,
}

/// 时间戳归一化器
///
/// - DTS 缺失时等于 PTS，永远不会留空
/// - PTS 缺失时优先使用 DTS，两者都缺失时由上一帧外推
/// - 时长缺失时使用目标帧率对应的名义帧时长
pub struct TimestampNormalizer {
    /// 名义帧时长（100纳秒）
    nominal_duration: u64,
    /// 上一帧的 PTS
    last_presentation: Option<u64>,
    /// 上一帧的 DTS
    last_decode: Option<u64>,
    /// 上一帧的时长
    last_duration: u64,
    /// 外推次数
    extrapolated: u64,
}

impl TimestampNormalizer {
    /// 创建时间戳归一化器
    ///
    /// # 参数
    ///
    /// * `frame_rate` - 目标帧率，用来计算名义帧时长
    pub fn new(frame_rate: u32) -> Self {
        let nominal_duration = if frame_rate > 0 {
            HUNDREDS_OF_NANOS_IN_A_SECOND / frame_rate as u64
        } else {
            HUNDREDS_OF_NANOS_IN_A_SECOND / 25
        };

        Self {
            nominal_duration,
            last_presentation: None,
            last_decode: None,
            last_duration: nominal_duration,
            extrapolated: 0,
        }
    }

    /// 名义帧时长（100纳秒）
    pub fn nominal_duration(&self) -> u64 {
        self.nominal_duration
    }

    /// 外推过的帧数
    pub fn extrapolated(&self) -> u64 {
        self.extrapolated
    }

    /// 采集端时间是否有效
    pub fn is_known(clock_time: u64) -> bool {
        clock_time != CLOCK_TIME_NONE
    }

    /// 转换时间戳：纳秒 → 100纳秒
    pub fn to_timescale(clock_time_ns: u64) -> u64 {
        clock_time_ns / NANOS_PER_TIMESCALE_UNIT
    }

    /// 归一化一帧的时间戳
    ///
    /// # 参数
    ///
    /// * `pts_ns` - 采集端 PTS（纳秒，可能为 CLOCK_TIME_NONE）
    /// * `dts_ns` - 采集端 DTS（纳秒，可能为 CLOCK_TIME_NONE）
    /// * `duration_ns` - 采集端时长（纳秒，可能为 CLOCK_TIME_NONE）
    pub fn normalize(&mut self, pts_ns: u64, dts_ns: u64, duration_ns: u64) -> NormalizedTimestamps {
        let decode_known = Self::is_known(dts_ns);

        let presentation = if Self::is_known(pts_ns) {
            Self::to_timescale(pts_ns)
        } else if decode_known {
            Self::to_timescale(dts_ns)
        } else {
            self.extrapolated += 1;
            let extrapolated = self
                .last_presentation
                .map(|last| last + self.last_duration)
                .unwrap_or(0);
            debug!("Sample without timestamps, extrapolated pts={}", extrapolated);
            extrapolated
        };

        let decode = if decode_known {
            Self::to_timescale(dts_ns)
        } else {
            presentation
        };

        let duration = if Self::is_known(duration_ns) && duration_ns > 0 {
            Self::to_timescale(duration_ns)
        } else {
            self.nominal_duration
        };

        if let Some(last_decode) = self.last_decode {
            if decode < last_decode {
                warn!(
                    "Decode timestamp went backwards: {} < {} (previous)",
                    decode, last_decode
                );
            }
        }

        self.last_presentation = Some(presentation);
        self.last_decode = Some(decode);
        self.last_duration = duration;

        NormalizedTimestamps {
            presentation,
            decode,
            duration,
        }
    }
}

use bytes::Bytes;
use std::fmt;

/// 每秒包含的100纳秒单位数（接收端时间刻度）
pub const HUNDREDS_OF_NANOS_IN_A_SECOND: u64 = 10_000_000;
/// 每毫秒包含的100纳秒单位数
pub const HUNDREDS_OF_NANOS_IN_A_MILLISECOND: u64 = 10_000;
/// 采集端纳秒 → 接收端100纳秒单位的换算因子
pub const NANOS_PER_TIMESCALE_UNIT: u64 = 100;
/// 采集端"时间未知"哨兵值（与GStreamer的 GST_CLOCK_TIME_NONE 相同）
pub const CLOCK_TIME_NONE: u64 = u64::MAX;

/// 采集端缓冲区标志位
///
/// 位定义与GStreamer的 GstBufferFlags 保持一致，
/// 这样采集适配层可以直接透传 `buffer.flags().bits()`。
#[allow(non_snake_case)]
pub mod BufferFlags {
    pub const LIVE: u32 = 1 << 4;
    pub const DECODE_ONLY: u32 = 1 << 5;
    pub const DISCONT: u32 = 1 << 6;
    pub const RESYNC: u32 = 1 << 7;
    pub const CORRUPTED: u32 = 1 << 8;
    pub const MARKER: u32 = 1 << 9;
    pub const HEADER: u32 = 1 << 10;
    pub const GAP: u32 = 1 << 11;
    pub const DROPPABLE: u32 = 1 << 12;
    /// 差分单元（P/B帧）。没有此标志的样本是关键帧。
    pub const DELTA_UNIT: u32 = 1 << 13;
}

/// 交给接收端的帧标志位
#[allow(non_snake_case)]
pub mod FrameFlags {
    pub const NONE: u8 = 0;
    pub const KEY_FRAME: u8 = 0b0000_0001;
}

/// 一个已分类的压缩访问单元
///
/// 时间戳和时长均使用接收端的100纳秒单位。
/// `payload` 的所有权从采集端转移到引擎，再转移到接收端，任何时刻只有一个持有者，
/// 所以这里刻意不实现 `Clone`。
#[derive(PartialEq, Eq)]
pub struct MediaSample {
    pub sequence_index: u64,
    pub is_key_frame: bool,
    pub presentation_timestamp: u64,
    pub decode_timestamp: u64,
    pub duration: u64,
    pub payload: Vec<u8>,
}

impl MediaSample {
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn flags(&self) -> u8 {
        if self.is_key_frame {
            FrameFlags::KEY_FRAME
        } else {
            FrameFlags::NONE
        }
    }

    /// 取出负载，消费掉帧记录
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

impl fmt::Debug for MediaSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSample")
            .field("sequence_index", &self.sequence_index)
            .field("is_key_frame", &self.is_key_frame)
            .field("pts", &self.presentation_timestamp)
            .field("dts", &self.decode_timestamp)
            .field("duration", &self.duration)
            .field("size", &self.payload.len())
            .finish()
    }
}

/// 解码器初始化数据（例如 avcC 中的 SPS/PPS）
///
/// 每个会话最多产生一次，产生后不可变。
#[derive(Clone, PartialEq, Eq)]
pub struct CodecConfiguration(Bytes);

impl CodecConfiguration {
    /// 从采集端借出的字节中复制一份
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(data))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl fmt::Debug for CodecConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview: Vec<String> = self.0.iter().take(8).map(|b| format!("{:02x}", b)).collect();
        write!(f, "CodecConfiguration({} bytes: {}..)", self.0.len(), preview.join(" "))
    }
}

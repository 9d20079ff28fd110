// 帧分发器
//
// 对每一帧：先经过离散时间段节流器，再交给当前注册的接收端。
// 解码器配置在第一帧真正送达接收端之前投递，之后不再投递。
// 没有接收端时帧被静默丢弃；接收端返回错误时不重试。

use serde::Serialize;
use std::sync::{Arc, RwLock};
use tokio::time::Duration;
use tracing::{debug, warn};

use common::{CodecConfiguration, MediaSample};

use crate::error::IngestError;
use crate::sink::FrameSink;
use crate::throttle::DiscreteTimePeriodsThrottler;

/// 接收端注册槽位，引擎和分发器共享
///
/// 注册/替换在任意线程上发生，分发时只在读锁内克隆一次 `Arc`。
pub type SinkSlot = Arc<RwLock<Option<Arc<dyn FrameSink>>>>;

/// 分发结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 已送达接收端
    Delivered,
    /// 没有注册接收端，帧被丢弃
    NoSink,
}

/// 分发统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub frames_delivered: u64,
    pub key_frames_delivered: u64,
    pub bytes_delivered: u64,
    pub frames_without_sink: u64,
    pub sink_errors: u64,
    pub throttled_frames: u64,
    /// 节流累计等待时间（微秒）
    pub throttle_wait_us: u64,
    pub codec_configuration_delivered: bool,
}

/// 帧分发器
pub struct FrameDispatcher {
    throttler: DiscreteTimePeriodsThrottler,
    sinks: SinkSlot,
    pending_codec_configuration: Option<CodecConfiguration>,
    stats: DispatchStats,
}

impl FrameDispatcher {
    pub fn new(throttler: DiscreteTimePeriodsThrottler, sinks: SinkSlot) -> Self {
        Self {
            throttler,
            sinks,
            pending_codec_configuration: None,
            stats: DispatchStats::default(),
        }
    }

    /// 登记待投递的解码器配置
    pub fn set_codec_configuration(&mut self, configuration: CodecConfiguration) {
        if self.stats.codec_configuration_delivered {
            debug!("Codec configuration already delivered, ignoring");
            return;
        }
        self.pending_codec_configuration = Some(configuration);
    }

    pub fn has_pending_codec_configuration(&self) -> bool {
        self.pending_codec_configuration.is_some()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn throttler(&self) -> &DiscreteTimePeriodsThrottler {
        &self.throttler
    }

    fn current_sink(&self) -> Option<Arc<dyn FrameSink>> {
        self.sinks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record_wait(&mut self, waited: Duration) {
        if !waited.is_zero() {
            self.stats.throttled_frames += 1;
            self.stats.throttle_wait_us += waited.as_micros() as u64;
        }
    }

    /// 节流并分发一帧
    ///
    /// 接收端的错误以 `IngestError::SinkDispatch` 返回；帧在出错时已被消费，不会重发。
    pub async fn dispatch(&mut self, frame: MediaSample) -> Result<DispatchOutcome, IngestError> {
        let waited = self.throttler.throttle().await;
        self.record_wait(waited);

        let Some(sink) = self.current_sink() else {
            self.stats.frames_without_sink += 1;
            debug!("No sink registered, dropping frame #{}", frame.sequence_index);
            return Ok(DispatchOutcome::NoSink);
        };

        if let Some(configuration) = self.pending_codec_configuration.take() {
            debug!("Delivering codec configuration ({} bytes)", configuration.len());
            if let Err(source) = sink.on_codec_configuration(configuration).await {
                self.stats.sink_errors += 1;
                warn!("Sink rejected codec configuration: {}", source);
                return Err(IngestError::SinkDispatch {
                    sequence_index: None,
                    source,
                });
            }
            self.stats.codec_configuration_delivered = true;
        }

        let sequence_index = frame.sequence_index;
        let is_key_frame = frame.is_key_frame;
        let size = frame.size() as u64;

        match sink.on_frame(frame).await {
            Ok(()) => {
                self.stats.frames_delivered += 1;
                self.stats.bytes_delivered += size;
                if is_key_frame {
                    self.stats.key_frames_delivered += 1;
                }
                Ok(DispatchOutcome::Delivered)
            }
            Err(source) => {
                self.stats.sink_errors += 1;
                warn!("Sink rejected frame #{}: {}", sequence_index, source);
                Err(IngestError::SinkDispatch {
                    sequence_index: Some(sequence_index),
                    source,
                })
            }
        }
    }
}

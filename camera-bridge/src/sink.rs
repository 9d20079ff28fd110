// 日志接收端
//
// 不上传任何数据，只统计并记录收到的帧，用于现场验证摄像头和节流参数。

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

use common::{CodecConfiguration, MediaSample, SinkError};
use ingest_engine::FrameSink;

/// 接收统计快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SinkSnapshot {
    pub frames: u64,
    pub key_frames: u64,
    pub bytes: u64,
    pub last_sequence_index: Option<u64>,
    pub codec_configuration_bytes: Option<u64>,
}

#[derive(Default)]
pub struct LoggingSink {
    frames: AtomicU64,
    key_frames: AtomicU64,
    bytes: AtomicU64,
    last_sequence_index: AtomicU64,
    codec_configured: AtomicBool,
    codec_configuration_bytes: AtomicU64,
}

impl LoggingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SinkSnapshot {
        let frames = self.frames.load(Ordering::Relaxed);
        SinkSnapshot {
            frames,
            key_frames: self.key_frames.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            last_sequence_index: (frames > 0).then(|| self.last_sequence_index.load(Ordering::Relaxed)),
            codec_configuration_bytes: self
                .codec_configured
                .load(Ordering::Relaxed)
                .then(|| self.codec_configuration_bytes.load(Ordering::Relaxed)),
        }
    }
}

#[async_trait]
impl FrameSink for LoggingSink {
    async fn on_codec_configuration(&self, configuration: CodecConfiguration) -> Result<(), SinkError> {
        info!("📋 Codec configuration received: {:?}", configuration);
        self.codec_configuration_bytes
            .store(configuration.len() as u64, Ordering::Relaxed);
        self.codec_configured.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn on_frame(&self, frame: MediaSample) -> Result<(), SinkError> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(frame.size() as u64, Ordering::Relaxed);
        self.last_sequence_index
            .store(frame.sequence_index, Ordering::Relaxed);

        if frame.is_key_frame {
            self.key_frames.fetch_add(1, Ordering::Relaxed);
            debug!("🔑 {:?}", frame);
        }
        Ok(())
    }
}

// 合成采集管线（模拟版本）
//
// 不需要摄像头和GStreamer，按 `stub://` 地址里的参数生成模拟的H.264访问单元：
//
//   stub://lobby?fps=30&gop=30&frames=300&frame_size=4096&burst=1
//
// 样本使用 avc 格式（4字节长度前缀），SPS/PPS 只出现在流格式的 codec_data（avcC）里。

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{BufferFlags, CaptureError, StreamLocator, CLOCK_TIME_NONE};

use super::{CapturePipeline, IngestHandle, RawSample, StreamFormat};

/// SPS (baseline profile, 1280x720)
const SPS: [u8; 13] = [
    0x67, 0x42, 0xC0, 0x1F, 0xDA, 0x01, 0x40, 0x16, 0xE8, 0x06, 0xD0, 0xA1, 0x35,
];

/// PPS
const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];

/// IDR slice 头
const IDR_NAL_HEADER: u8 = 0x65;

/// P slice 头
const NON_IDR_NAL_HEADER: u8 = 0x41;

/// 合成管线参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticConfig {
    /// 源帧率
    pub fps: u32,
    /// 关键帧间隔（帧数）
    pub gop: u32,
    /// 生成的帧数，达到后报告流结束；`None` 表示不限
    pub frames: Option<u64>,
    /// 每帧字节数（包含长度前缀）
    pub frame_size: usize,
    /// 每个节拍连续投递的帧数
    pub burst: u32,
    /// 每隔多少帧插入一个空帧，0 表示不插入
    pub empty_every: u64,
    /// 流格式中是否携带 codec_data
    pub codec_data: bool,
    /// 生成多少帧后报告传输错误
    pub fail_after: Option<u64>,
    /// 挂接时直接失败
    pub fail_on_attach: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            fps: 25,
            gop: 25,
            frames: None,
            frame_size: 2048,
            burst: 1,
            empty_every: 0,
            codec_data: true,
            fail_after: None,
            fail_on_attach: false,
        }
    }
}

fn invalid(reason: String) -> CaptureError {
    CaptureError::AttachFailed { reason }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, CaptureError> {
    value
        .parse()
        .map_err(|_| invalid(format!("Invalid value for '{}': {}", key, value)))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, CaptureError> {
    match value {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(invalid(format!("Invalid value for '{}': {}", key, value))),
    }
}

impl SyntheticConfig {
    /// 从 `stub://` 地址解析参数，未出现的参数使用默认值
    pub fn from_locator(locator: &StreamLocator) -> Result<Self, CaptureError> {
        if locator.scheme() != Some("stub") {
            return Err(CaptureError::UnsupportedLocator {
                locator: locator.to_string(),
            });
        }

        let mut config = Self::default();
        let Some((_, query)) = locator.as_str().split_once('?') else {
            return Ok(config);
        };

        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "fps" => config.fps = parse_number(key, value)?,
                "gop" => config.gop = parse_number(key, value)?,
                "frames" => config.frames = Some(parse_number(key, value)?),
                "frame_size" => config.frame_size = parse_number(key, value)?,
                "burst" => config.burst = parse_number(key, value)?,
                "empty_every" => config.empty_every = parse_number(key, value)?,
                "codec_data" => config.codec_data = parse_flag(key, value)?,
                "fail_after" => config.fail_after = Some(parse_number(key, value)?),
                "fail" if value == "attach" => config.fail_on_attach = true,
                _ => warn!("Ignoring unknown synthetic stream parameter '{}'", key),
            }
        }

        if config.fps == 0 || config.gop == 0 || config.burst == 0 {
            return Err(invalid(
                "fps, gop and burst must be greater than 0".to_string(),
            ));
        }

        Ok(config)
    }

    /// 源帧时长（纳秒）
    pub fn frame_duration_ns(&self) -> u64 {
        1_000_000_000 / self.fps as u64
    }

    /// 节拍间隔：每个节拍投递 `burst` 帧
    fn tick_interval(&self) -> Duration {
        Duration::from_nanos(self.frame_duration_ns() * self.burst as u64)
    }

    /// avcC 解码器配置记录
    pub fn avc_decoder_configuration() -> Vec<u8> {
        let mut record = vec![0x01, SPS[1], SPS[2], SPS[3], 0xFF, 0xE1];
        record.extend_from_slice(&(SPS.len() as u16).to_be_bytes());
        record.extend_from_slice(&SPS);
        record.push(0x01);
        record.extend_from_slice(&(PPS.len() as u16).to_be_bytes());
        record.extend_from_slice(&PPS);
        record
    }

    fn stream_format(&self) -> StreamFormat {
        let format = StreamFormat::new("video/x-h264").with_resolution(1280, 720);
        if self.codec_data {
            format.with_codec_data(Self::avc_decoder_configuration())
        } else {
            format
        }
    }

    /// 生成第 `index` 帧
    pub fn sample(&self, index: u64) -> RawSample {
        let is_key_frame = index % self.gop as u64 == 0;
        let pts = index * self.frame_duration_ns();

        let payload = if self.empty_every > 0 && index > 0 && index % self.empty_every == 0 {
            Vec::new()
        } else {
            let nal_size = self.frame_size.saturating_sub(4).max(1);
            let mut payload = Vec::with_capacity(nal_size + 4);
            payload.extend_from_slice(&(nal_size as u32).to_be_bytes());
            payload.push(if is_key_frame {
                IDR_NAL_HEADER
            } else {
                NON_IDR_NAL_HEADER
            });
            payload.extend((1..nal_size).map(|i| ((index + i as u64) % 256) as u8));
            payload
        };

        let flags = if is_key_frame {
            BufferFlags::LIVE
        } else {
            BufferFlags::LIVE | BufferFlags::DELTA_UNIT
        };

        // rtph264depay 不设置 DTS
        RawSample::new(payload, pts)
            .with_flags(flags)
            .with_dts(CLOCK_TIME_NONE)
            .with_duration(self.frame_duration_ns())
            .with_format(self.stream_format())
    }
}

/// 合成采集管线
pub struct SyntheticPipeline {
    config: SyntheticConfig,
    ingest: Option<IngestHandle>,
    cancel: CancellationToken,
    task: Option<JoinHandle<u64>>,
}

impl SyntheticPipeline {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            ingest: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }
}

/// 生成任务，返回已投递的帧数
async fn generate(config: SyntheticConfig, ingest: IngestHandle, cancel: CancellationToken) -> u64 {
    let mut ticker = interval(config.tick_interval());
    let mut index = 0u64;

    info!(
        "🎥 Synthetic stream started: {} fps, gop {}, {} bytes/frame",
        config.fps, config.gop, config.frame_size
    );

    'outer: loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for _ in 0..config.burst {
            if config.frames.is_some_and(|limit| index >= limit) {
                info!("Synthetic stream finished after {} frames", index);
                ingest.end_of_stream();
                break 'outer;
            }
            if config.fail_after.is_some_and(|limit| index >= limit) {
                ingest.error(format!("synthetic transport failure after {} frames", index));
                break 'outer;
            }

            let sample = config.sample(index);
            let result = tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                result = ingest.send(sample) => result,
            };
            if let Err(e) = result {
                debug!("Synthetic stream stopped: {}", e);
                break 'outer;
            }

            if index % 100 == 0 {
                debug!("📤 Synthetic frame #{} delivered", index);
            }
            index += 1;
        }
    }

    info!("✓ Synthetic stream stopped (total frames: {})", index);
    index
}

#[async_trait]
impl CapturePipeline for SyntheticPipeline {
    async fn attach(&mut self, locator: &StreamLocator, ingest: IngestHandle) -> Result<(), CaptureError> {
        if locator.scheme() != Some("stub") {
            return Err(CaptureError::UnsupportedLocator {
                locator: locator.to_string(),
            });
        }
        if self.config.fail_on_attach {
            return Err(CaptureError::AttachFailed {
                reason: format!("camera {} unreachable", locator),
            });
        }

        debug!("Synthetic pipeline attached to {}", locator);
        self.ingest = Some(ingest);
        Ok(())
    }

    async fn start(&mut self) -> Result<(), CaptureError> {
        let ingest = self.ingest.clone().ok_or(CaptureError::NotAttached)?;
        if self.task.is_some() {
            return Err(CaptureError::StartFailed {
                reason: "synthetic stream already started".to_string(),
            });
        }

        self.cancel = CancellationToken::new();
        let task = tokio::spawn(generate(self.config.clone(), ingest, self.cancel.clone()));
        self.task = Some(task);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        self.cancel.cancel();
        self.ingest = None;

        if let Some(task) = self.task.take() {
            match task.await {
                Ok(frames) => debug!("Synthetic generator joined after {} frames", frames),
                Err(e) => {
                    return Err(CaptureError::StopFailed {
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(())
    }
}

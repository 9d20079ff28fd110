// GStreamer RTSP 采集管线
//
// 管线：rtspsrc ! rtph264depay ! h264parse ! video/x-h264,stream-format=avc,alignment=au ! appsink
//
// appsink 的 new_sample 回调运行在 GStreamer 的流线程上，直接使用阻塞投递；
// 总线消息（EOS / Error）由单独的监视线程转成投递入口上的通知。
// `start` 等到第一个样本（caps 已协商）或总线报错才返回，超时视为启动失败。

use async_trait::async_trait;
use gstreamer::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use common::{CaptureError, StreamLocator, CLOCK_TIME_NONE};

use super::{CapturePipeline, IngestHandle, RawSample, StreamFormat};

const APPSINK_NAME: &str = "camera_sink";

/// 总线轮询间隔
const BUS_POLL_INTERVAL_MS: u64 = 100;

/// 等待摄像头送出第一个样本的时间
const START_TIMEOUT: Duration = Duration::from_secs(10);

/// 停止时等待阻塞中的回调被取走的时间
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// 管线就绪状态
#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

fn settle(readiness: &watch::Sender<Readiness>, outcome: Readiness) {
    readiness.send_if_modified(|current| {
        if *current == Readiness::Pending {
            *current = outcome;
            true
        } else {
            false
        }
    });
}

/// GStreamer RTSP 采集管线
pub struct GstreamerPipeline {
    pipeline: Option<gstreamer::Pipeline>,
    ingest: Option<IngestHandle>,
    bus_watch: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    readiness: Option<Arc<watch::Sender<Readiness>>>,
}

impl Default for GstreamerPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl GstreamerPipeline {
    pub fn new() -> Self {
        Self {
            pipeline: None,
            ingest: None,
            bus_watch: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            readiness: None,
        }
    }

    fn build(locator: &StreamLocator) -> Result<(gstreamer::Pipeline, gstreamer_app::AppSink), CaptureError> {
        gstreamer::init().map_err(|e| attach_failed(format!("initialize gstreamer: {}", e)))?;

        let description = format!(
            "rtspsrc location=\"{}\" latency=0 ! rtph264depay ! h264parse ! \
             video/x-h264,stream-format=avc,alignment=au ! appsink name={} sync=false",
            locator.as_str(),
            APPSINK_NAME
        );

        let pipeline = gstreamer::parse::launch(&description)
            .map_err(|e| attach_failed(format!("build RTSP pipeline: {}", e)))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| attach_failed("RTSP pipeline is not a Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name(APPSINK_NAME)
            .ok_or_else(|| attach_failed("appsink element missing from pipeline".to_string()))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| attach_failed("appsink element has unexpected type".to_string()))?;

        let caps = gstreamer::Caps::builder("video/x-h264")
            .field("stream-format", "avc")
            .field("alignment", "au")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(false);
        appsink.set_sync(false);

        Ok((pipeline, appsink))
    }

    fn spawn_bus_watch(
        &mut self,
        pipeline: &gstreamer::Pipeline,
        ingest: IngestHandle,
        readiness: Arc<watch::Sender<Readiness>>,
    ) -> Result<(), CaptureError> {
        let bus = pipeline
            .bus()
            .ok_or_else(|| CaptureError::StartFailed {
                reason: "pipeline has no bus".to_string(),
            })?;
        let shutdown = Arc::clone(&self.shutdown);

        let handle = std::thread::Builder::new()
            .name("gst-bus-watch".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    let Some(message) = bus.timed_pop(gstreamer::ClockTime::from_mseconds(BUS_POLL_INTERVAL_MS)) else {
                        continue;
                    };
                    use gstreamer::MessageView;
                    match message.view() {
                        MessageView::Eos(..) => {
                            settle(&readiness, Readiness::Failed("end of stream before first sample".to_string()));
                            ingest.end_of_stream();
                            break;
                        }
                        MessageView::Error(err) => {
                            let reason = format!(
                                "gstreamer error from {:?}: {}",
                                err.src().map(|s| s.path_string()),
                                err.error()
                            );
                            settle(&readiness, Readiness::Failed(reason.clone()));
                            ingest.error(reason);
                            break;
                        }
                        _ => {}
                    }
                }
                debug!("Bus watch thread exiting");
            })
            .map_err(|e| CaptureError::StartFailed {
                reason: format!("spawn bus watch thread: {}", e),
            })?;

        self.bus_watch = Some(handle);
        Ok(())
    }
}

fn attach_failed(reason: String) -> CaptureError {
    CaptureError::AttachFailed { reason }
}

fn clock_time_ns(time: Option<gstreamer::ClockTime>) -> u64 {
    time.map(|t| t.nseconds()).unwrap_or(CLOCK_TIME_NONE)
}

fn stream_format(caps: &gstreamer::CapsRef) -> Option<StreamFormat> {
    let structure = caps.structure(0)?;
    let mut format = StreamFormat::new(structure.name().to_string());

    if let (Ok(width), Ok(height)) = (structure.get::<i32>("width"), structure.get::<i32>("height")) {
        format = format.with_resolution(width.max(0) as u32, height.max(0) as u32);
    }

    if let Ok(codec_data) = structure.get::<gstreamer::Buffer>("codec_data") {
        if let Ok(map) = codec_data.map_readable() {
            format = format.with_codec_data(map.as_slice().to_vec());
        }
    }

    Some(format)
}

/// 把 appsink 的样本复制成 `RawSample`
fn to_raw_sample(sample: &gstreamer::Sample) -> Option<RawSample> {
    let buffer = sample.buffer()?;
    let map = buffer.map_readable().ok()?;

    let mut raw = RawSample::new(map.as_slice().to_vec(), clock_time_ns(buffer.pts()))
        .with_flags(buffer.flags().bits())
        .with_dts(clock_time_ns(buffer.dts()))
        .with_duration(clock_time_ns(buffer.duration()));

    if let Some(format) = sample.caps().and_then(stream_format) {
        raw = raw.with_format(format);
    }
    Some(raw)
}

#[async_trait]
impl CapturePipeline for GstreamerPipeline {
    async fn attach(&mut self, locator: &StreamLocator, ingest: IngestHandle) -> Result<(), CaptureError> {
        if !matches!(locator.scheme(), Some("rtsp") | Some("rtsps")) {
            return Err(CaptureError::UnsupportedLocator {
                locator: locator.to_string(),
            });
        }

        let (pipeline, appsink) = Self::build(locator)?;

        let readiness = Arc::new(watch::channel(Readiness::Pending).0);
        let callback_readiness = Arc::clone(&readiness);
        let callback_ingest = ingest.clone();
        let callback_shutdown = Arc::clone(&self.shutdown);
        appsink.set_callbacks(
            gstreamer_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gstreamer::FlowError::Eos)?;
                    if callback_shutdown.load(Ordering::Acquire) {
                        return Err(gstreamer::FlowError::Flushing);
                    }
                    match to_raw_sample(&sample) {
                        Some(raw) => {
                            settle(&callback_readiness, Readiness::Ready);
                            if let Err(e) = callback_ingest.ingest(raw) {
                                debug!("Sample discarded: {}", e);
                            }
                        }
                        None => warn!("Unable to map appsink sample"),
                    }
                    Ok(gstreamer::FlowSuccess::Ok)
                })
                .build(),
        );

        info!("GStreamer pipeline attached to {}", locator);
        self.shutdown.store(false, Ordering::Release);
        self.pipeline = Some(pipeline);
        self.ingest = Some(ingest);
        self.readiness = Some(readiness);
        Ok(())
    }

    async fn start(&mut self) -> Result<(), CaptureError> {
        let pipeline = self.pipeline.clone().ok_or(CaptureError::NotAttached)?;
        let ingest = self.ingest.clone().ok_or(CaptureError::NotAttached)?;
        let readiness = self.readiness.clone().ok_or(CaptureError::NotAttached)?;
        let mut ready = readiness.subscribe();

        self.spawn_bus_watch(&pipeline, ingest, readiness)?;
        let change = tokio::task::spawn_blocking(move || pipeline.set_state(gstreamer::State::Playing))
            .await
            .map_err(|e| CaptureError::StartFailed {
                reason: format!("set RTSP pipeline to Playing: {}", e),
            })?
            .map_err(|e| CaptureError::StartFailed {
                reason: format!("set RTSP pipeline to Playing: {}", e),
            })?;
        debug!("Pipeline state change to Playing: {:?}", change);

        let outcome = match tokio::time::timeout(START_TIMEOUT, ready.wait_for(|r| *r != Readiness::Pending)).await {
            Ok(Ok(outcome)) => outcome.clone(),
            Ok(Err(_)) => Readiness::Failed("readiness channel closed".to_string()),
            Err(_) => Readiness::Failed(format!("no sample from camera within {:?}", START_TIMEOUT)),
        };

        match outcome {
            Readiness::Ready => {
                info!("GStreamer pipeline playing, first sample received");
                Ok(())
            }
            Readiness::Failed(reason) => {
                warn!("GStreamer pipeline failed to start: {}", reason);
                Err(CaptureError::StartFailed { reason })
            }
            Readiness::Pending => Err(CaptureError::StartFailed {
                reason: "pipeline never became ready".to_string(),
            }),
        }
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        self.shutdown.store(true, Ordering::Release);
        self.readiness = None;

        // 先让阻塞在满队列上的回调完成或失败，流线程才能退出
        if let Some(ingest) = self.ingest.take() {
            if !ingest.wait_drained(STOP_DRAIN_TIMEOUT).await {
                warn!("Capture callbacks still blocked on a full queue, closing ingest");
            }
            ingest.close();
        }

        let mut result = Ok(());
        if let Some(pipeline) = self.pipeline.take() {
            let teardown = tokio::task::spawn_blocking(move || pipeline.set_state(gstreamer::State::Null)).await;
            let failure = match teardown {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failure {
                result = Err(CaptureError::StopFailed {
                    reason: format!("set RTSP pipeline to Null: {}", reason),
                });
            }
        }

        if let Some(handle) = self.bus_watch.take() {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!("Bus watch thread did not exit cleanly");
            }
        }

        info!("GStreamer pipeline stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::CaptureEngine;
    use crate::error::IngestError;
    use crate::session::SessionState;

    #[test]
    fn test_first_readiness_outcome_wins() {
        let (readiness, receiver) = watch::channel(Readiness::Pending);
        settle(&readiness, Readiness::Ready);
        settle(&readiness, Readiness::Failed("late error".to_string()));
        assert_eq!(*receiver.borrow(), Readiness::Ready);
    }

    #[tokio::test]
    async fn test_stop_without_attach() {
        let mut pipeline = GstreamerPipeline::new();
        assert!(matches!(pipeline.start().await, Err(CaptureError::NotAttached)));
        assert!(pipeline.stop().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore = "requires the GStreamer RTSP plugins"]
    async fn test_unreachable_camera_fails_start() {
        let locator = StreamLocator::new("rtsp://127.0.0.1:1/unreachable");
        let mut engine = CaptureEngine::new(
            EngineConfig::new(locator, 25),
            Box::new(GstreamerPipeline::new()),
        )
        .unwrap();

        let result = engine.start().await;
        assert!(matches!(
            result,
            Err(IngestError::PipelineInitialization(CaptureError::StartFailed { .. }))
        ));
        assert_eq!(engine.state(), SessionState::Failed);
        assert_eq!(engine.stop().await, SessionState::Failed);
    }
}

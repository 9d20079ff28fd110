// 摄像头帧接入引擎 - 引擎与会话驱动器
//
// # 组件关系
//
// ```text
// 采集管线 ──IngestHandle──▶ 有界队列 ──▶ SessionDriver
//                                          ├─ CodecConfigurationExtractor（第一个样本）
//                                          ├─ SampleClassifier（关键帧/序号/时间戳）
//                                          └─ FrameDispatcher（节流 → FrameSink）
// ```
//
// `CaptureEngine` 负责会话生命周期（start/stop）和接收端注册；
// `SessionDriver` 按到达顺序逐个处理样本，会话离开 Running 后把已接受的样本处理完再结束。

use serde::Serialize;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::capture::{CapturePipeline, InFlight, IngestHandle, RawSample};
use crate::classifier::{ClassifierStats, SampleClassifier, SampleRejected};
use crate::codec_config::CodecConfigurationExtractor;
use crate::config::EngineConfig;
use crate::dispatcher::{DispatchOutcome, DispatchStats, FrameDispatcher, SinkSlot};
use crate::error::IngestError;
use crate::session::{CaptureSession, SessionSignal, SessionState, SessionStateMachine, Termination};
use crate::sink::FrameSink;
use crate::throttle::DiscreteTimePeriodsThrottler;

/// 驱动器处理一个事件后的进展
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// 帧已送达接收端
    Delivered { sequence_index: u64, is_key_frame: bool },
    /// 帧已分类，但没有注册接收端
    NoSink { sequence_index: u64 },
    /// 样本被分类器丢弃
    Dropped(SampleRejected),
    /// 会话结束，队列已清空
    Finished(Termination),
}

/// 会话摘要
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session: CaptureSession,
    pub stream_name: String,
    pub termination: Termination,
    pub classifier: ClassifierStats,
    pub dispatch: DispatchStats,
}

/// 会话驱动器
///
/// 由 `CaptureEngine::start` 创建，可以交给单独的任务运行。
/// `run` 在接收端出错时提前返回错误，会话不受影响，可以再次调用 `run` 继续处理。
pub struct SessionDriver {
    session: CaptureSession,
    stream_name: String,
    events: mpsc::Receiver<RawSample>,
    state: Arc<SessionStateMachine>,
    signal: Arc<SessionSignal>,
    in_flight: Arc<InFlight>,
    state_changes: watch::Receiver<SessionState>,
    extractor: CodecConfigurationExtractor,
    classifier: SampleClassifier,
    dispatcher: FrameDispatcher,
    finished: Option<Termination>,
}

impl SessionDriver {
    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// 等待下一个样本；会话离开 Running 后只取已经接受的样本
    async fn next_sample(&mut self) -> Option<RawSample> {
        let generation = self.signal.generation();
        loop {
            if !self.state.is_current(generation) {
                self.discard_superseded();
                return None;
            }
            if self.state.accepts_samples_for(generation).is_err() {
                return self.drain_next().await;
            }

            tokio::select! {
                biased;
                sample = self.events.recv() => {
                    match sample {
                        Some(sample) => return Some(sample),
                        None => {
                            // 所有投递入口都已释放，视为流结束
                            debug!("All ingest handles dropped");
                            self.state.mark_end_of_stream_for(generation);
                            return None;
                        }
                    }
                }
                changed = self.state_changes.changed() => {
                    if changed.is_err() {
                        return self.drain_next().await;
                    }
                }
            }
        }
    }

    /// 取出队列中剩余的样本，包括仍在等待队列空位的在途投递
    async fn drain_next(&mut self) -> Option<RawSample> {
        loop {
            let idle = self.in_flight.notified();
            if let Ok(sample) = self.events.try_recv() {
                return Some(sample);
            }
            if self.in_flight.count() == 0 {
                return self.events.try_recv().ok();
            }

            tokio::select! {
                sample = self.events.recv() => return sample,
                _ = idle => {}
            }
        }
    }

    /// 会话已被新会话取代：剩余样本属于旧会话，不再分发给当前接收端
    fn discard_superseded(&mut self) {
        self.events.close();
        let mut discarded = 0u64;
        while self.events.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(
                "Capture session {} superseded, discarded {} queued samples",
                self.session.session_id, discarded
            );
        }
    }

    fn finish(&mut self) -> Termination {
        self.events.close();
        let termination = self.signal.termination().unwrap_or(Termination::Stopped);
        info!(
            "Capture session {} finished: {:?} ({} frames classified, {} delivered)",
            self.session.session_id,
            termination,
            self.classifier.stats().classified,
            self.dispatcher.stats().frames_delivered
        );
        self.finished = Some(termination.clone());
        termination
    }

    async fn handle_sample(&mut self, raw: RawSample) -> Result<Progress, IngestError> {
        if let Some(configuration) = self.extractor.observe(&raw) {
            self.dispatcher.set_codec_configuration(configuration);
        }

        let frame = match self.classifier.classify(raw) {
            Ok(frame) => frame,
            Err(rejected) => return Ok(Progress::Dropped(rejected)),
        };

        let sequence_index = frame.sequence_index;
        let is_key_frame = frame.is_key_frame;

        match self.dispatcher.dispatch(frame).await? {
            DispatchOutcome::Delivered => Ok(Progress::Delivered {
                sequence_index,
                is_key_frame,
            }),
            DispatchOutcome::NoSink => Ok(Progress::NoSink { sequence_index }),
        }
    }

    /// 处理下一个事件
    pub async fn process_next(&mut self) -> Result<Progress, IngestError> {
        if let Some(termination) = &self.finished {
            return Ok(Progress::Finished(termination.clone()));
        }

        match self.next_sample().await {
            Some(raw) => self.handle_sample(raw).await,
            None => Ok(Progress::Finished(self.finish())),
        }
    }

    /// 处理事件直到会话结束
    pub async fn run(&mut self) -> Result<SessionSummary, IngestError> {
        loop {
            if let Progress::Finished(_) = self.process_next().await? {
                return Ok(self.summary());
            }
        }
    }

    /// 当前统计
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session: self.session.clone(),
            stream_name: self.stream_name.clone(),
            termination: self
                .finished
                .clone()
                .or_else(|| self.signal.termination())
                .unwrap_or(Termination::Stopped),
            classifier: self.classifier.stats().clone(),
            dispatch: self.dispatcher.stats().clone(),
        }
    }
}

/// 摄像头帧接入引擎
pub struct CaptureEngine {
    config: EngineConfig,
    pipeline: Box<dyn CapturePipeline>,
    state: Arc<SessionStateMachine>,
    sinks: SinkSlot,
    session: Option<CaptureSession>,
    pipeline_attached: bool,
}

impl CaptureEngine {
    /// 创建引擎，配置无效时立即失败
    pub fn new(config: EngineConfig, pipeline: Box<dyn CapturePipeline>) -> Result<Self, IngestError> {
        config.validate()?;

        info!(
            "Capture engine created for {} ({} fps, {} Hz discreteness)",
            config.locator, config.frame_rate, config.discreteness_hz
        );

        Ok(Self {
            config,
            pipeline,
            state: Arc::new(SessionStateMachine::new()),
            sinks: Arc::new(RwLock::new(None)),
            session: None,
            pipeline_attached: false,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state.state()
    }

    /// 共享的会话状态机，可用于订阅状态变化
    pub fn state_machine(&self) -> Arc<SessionStateMachine> {
        Arc::clone(&self.state)
    }

    /// 最近一次启动的会话
    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }

    /// 注册或替换接收端，可在任意时刻调用
    pub fn register_sink(&self, sink: Arc<dyn FrameSink>) {
        *self
            .sinks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sink);
        debug!("Frame sink registered");
    }

    /// 注销接收端，之后的帧被静默丢弃
    pub fn clear_sink(&self) {
        *self
            .sinks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        debug!("Frame sink cleared");
    }

    async fn release_pipeline(&mut self) {
        if !self.pipeline_attached {
            return;
        }
        if let Err(e) = self.pipeline.stop().await {
            warn!("Failed to stop capture pipeline: {}", e);
        }
        self.pipeline_attached = false;
    }

    /// 启动会话
    ///
    /// 挂接并启动采集管线，成功后返回驱动器。会话正在运行时返回 `AlreadyRunning`。
    pub async fn start(&mut self) -> Result<SessionDriver, IngestError> {
        let signal = self.state.begin_start()?;

        let session = CaptureSession::new(self.config.frame_rate, self.config.discreteness_hz);
        info!(
            "Starting capture session {} for stream '{}' ({})",
            session.session_id, self.config.stream_name, self.config.locator
        );

        let throttler = match DiscreteTimePeriodsThrottler::new(
            self.config.frame_rate,
            self.config.discreteness_hz,
        ) {
            Ok(throttler) => throttler,
            Err(e) => {
                self.state.mark_failed(&e.to_string());
                return Err(e);
            }
        };

        let state_changes = self.state.subscribe();
        let (sender, events) = mpsc::channel(self.config.queue_capacity);
        let in_flight = Arc::new(InFlight::default());
        let ingest = IngestHandle::new(
            sender,
            Arc::clone(&self.state),
            Arc::clone(&signal),
            Arc::clone(&in_flight),
        );

        // 上一次会话失败后可能还没有释放管线
        self.release_pipeline().await;

        if let Err(e) = self.pipeline.attach(&self.config.locator, ingest).await {
            error!("Failed to attach capture pipeline: {}", e);
            self.state.mark_failed(&e.to_string());
            return Err(IngestError::PipelineInitialization(e));
        }
        self.pipeline_attached = true;

        if let Err(e) = self.pipeline.start().await {
            error!("Failed to start capture pipeline: {}", e);
            self.state.mark_failed(&e.to_string());
            self.release_pipeline().await;
            return Err(IngestError::PipelineInitialization(e));
        }

        match self.state.mark_running() {
            Ok(()) => info!("Capture session {} running", session.session_id),
            Err(current) => warn!(
                "Capture session {} ended during initialization ({})",
                session.session_id, current
            ),
        }

        self.session = Some(session.clone());

        Ok(SessionDriver {
            session,
            stream_name: self.config.stream_name.clone(),
            events,
            state: Arc::clone(&self.state),
            signal,
            in_flight,
            state_changes,
            extractor: CodecConfigurationExtractor::new(),
            classifier: SampleClassifier::new(self.config.frame_rate),
            dispatcher: FrameDispatcher::new(throttler, Arc::clone(&self.sinks)),
            finished: None,
        })
    }

    /// 停止会话并释放采集管线
    ///
    /// 空闲、已停止或已失败时状态不变，只释放仍然挂接的管线。
    /// 返回停止后的状态。
    pub async fn stop(&mut self) -> SessionState {
        if self.state.begin_stop() {
            info!("Stopping capture session");
            self.release_pipeline().await;
            self.state.finish_stop();
        } else {
            // 流结束或失败后管线可能仍然挂接
            debug!("stop() in state {}, releasing pipeline only", self.state.state());
            self.release_pipeline().await;
        }
        self.state.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{SyntheticConfig, SyntheticPipeline};
    use common::StreamLocator;

    fn engine(config: SyntheticConfig) -> CaptureEngine {
        CaptureEngine::new(
            EngineConfig::new(StreamLocator::new("stub://camera"), 25),
            Box::new(SyntheticPipeline::new(config)),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let result = CaptureEngine::new(
            EngineConfig::new(StreamLocator::new("stub://camera"), 0),
            Box::new(SyntheticPipeline::new(SyntheticConfig::default())),
        );
        assert!(matches!(result, Err(IngestError::InvalidRate(0))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop() {
        let mut engine = engine(SyntheticConfig::default());
        assert_eq!(engine.state(), SessionState::Idle);

        let _driver = engine.start().await.unwrap();
        assert_eq!(engine.state(), SessionState::Running);
        assert!(engine.session().is_some());

        assert_eq!(engine.stop().await, SessionState::Stopped);
        assert_eq!(engine.stop().await, SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_before_finish() {
        let mut engine = engine(SyntheticConfig::default());
        let driver = engine.start().await.unwrap();

        let summary = driver.summary();
        assert_eq!(summary.stream_name, "camera-stream");
        assert_eq!(summary.classifier.classified, 0);
        assert!(!driver.is_finished());
        engine.stop().await;
    }
}

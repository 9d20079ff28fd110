// 摄像头帧接入引擎 - 采集管线抽象
//
// 采集管线（解复用、解包、RTSP握手）是外部协作方，本模块只定义边界：
//
// - `CapturePipeline`: 引擎消费的挂接/启动/停止接口
// - `IngestHandle`: 引擎暴露给采集端的显式投递入口
// - `RawSample` / `StreamFormat`: 采集端投递的原始数据
//
// 采集端在自己的线程上回调，引擎把每次回调变成一个有序事件，
// 由会话驱动器逐个处理，回调之间不共享可变状态。

pub mod synthetic;

#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, Notify};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::IngestError;
use crate::session::{SessionSignal, SessionState, SessionStateMachine};
use common::{CaptureError, StreamLocator, CLOCK_TIME_NONE};

pub use synthetic::{SyntheticConfig, SyntheticPipeline};

#[cfg(feature = "rtsp-gstreamer")]
pub use rtsp::GstreamerPipeline;

/// 流格式描述（对应GStreamer的caps）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFormat {
    /// 媒体类型，例如 `video/x-h264`
    pub media_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// 带外解码器配置（avcC），由采集端持有，引擎只会复制
    pub codec_data: Option<Vec<u8>>,
}

impl StreamFormat {
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            width: None,
            height: None,
            codec_data: None,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_codec_data(mut self, codec_data: Vec<u8>) -> Self {
        self.codec_data = Some(codec_data);
        self
    }
}

/// 采集端投递的原始样本
///
/// 时间均为纳秒，未知时为 `CLOCK_TIME_NONE`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSample {
    pub payload: Vec<u8>,
    /// 采集端缓冲区标志（见 `common::BufferFlags`）
    pub flags: u32,
    pub pts: u64,
    pub dts: u64,
    pub duration: u64,
    pub format: Option<StreamFormat>,
}

impl RawSample {
    pub fn new(payload: Vec<u8>, pts: u64) -> Self {
        Self {
            payload,
            flags: 0,
            pts,
            dts: CLOCK_TIME_NONE,
            duration: CLOCK_TIME_NONE,
            format: None,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_dts(mut self, dts: u64) -> Self {
        self.dts = dts;
        self
    }

    pub fn with_duration(mut self, duration: u64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_format(mut self, format: StreamFormat) -> Self {
        self.format = Some(format);
        self
    }
}

/// 在途投递计数
///
/// 已通过状态检查、仍在等待队列空位的投递。驱动器结束前要等它们全部落地。
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// 等待所有在途投递完成
    pub(crate) async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.count() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// 在途数降为0时完成的通知（创建后即可接收唤醒）
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.idle.notified()
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// 引擎暴露给采集端的投递入口
///
/// 绑定到一次会话，可以克隆后交给任意数量的采集线程。会话离开 Initializing/Running
/// 或被新会话取代后，新的投递和通知都会被忽略。已经通过检查的投递会等到驱动器取走。
#[derive(Clone)]
pub struct IngestHandle {
    sender: mpsc::Sender<RawSample>,
    state: Arc<SessionStateMachine>,
    signal: Arc<SessionSignal>,
    in_flight: Arc<InFlight>,
    closed: CancellationToken,
}

impl IngestHandle {
    pub(crate) fn new(
        sender: mpsc::Sender<RawSample>,
        state: Arc<SessionStateMachine>,
        signal: Arc<SessionSignal>,
        in_flight: Arc<InFlight>,
    ) -> Self {
        Self {
            sender,
            state,
            signal,
            in_flight,
            closed: CancellationToken::new(),
        }
    }

    fn check_accepting(&self) -> Result<(), IngestError> {
        self.state
            .accepts_samples_for(self.signal.generation())
            .map_err(IngestError::SessionNotRunning)
    }

    fn queue_closed(&self) -> IngestError {
        debug!("Ingest queue closed, sample discarded");
        match self.state.accepts_samples_for(self.signal.generation()) {
            Err(state) => IngestError::SessionNotRunning(state),
            Ok(()) => IngestError::SessionNotRunning(SessionState::Stopped),
        }
    }

    async fn deliver(&self, sample: RawSample) -> Result<(), IngestError> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                debug!("Ingest handle closed while waiting for queue space");
                Err(self.queue_closed())
            }
            result = self.sender.send(sample) => result.map_err(|_| self.queue_closed()),
        }
    }

    /// 在采集端的原生回调线程上投递样本
    ///
    /// 队列满时阻塞调用线程，节流延迟因此会反压到采集回调上；`close` 会唤醒阻塞的调用。
    /// 不能在异步运行时的上下文中调用，异步调用方请使用 `send`。
    pub fn ingest(&self, sample: RawSample) -> Result<(), IngestError> {
        let _guard = self.in_flight.enter();
        self.check_accepting()?;
        futures::executor::block_on(self.deliver(sample))
    }

    /// 异步投递样本
    pub async fn send(&self, sample: RawSample) -> Result<(), IngestError> {
        let _guard = self.in_flight.enter();
        self.check_accepting()?;
        self.deliver(sample).await
    }

    /// 采集端报告流结束
    pub fn end_of_stream(&self) {
        if !self.state.mark_end_of_stream_for(self.signal.generation()) {
            debug!(
                "End of stream ignored for session generation {} (state {})",
                self.signal.generation(),
                self.state.state()
            );
        }
    }

    /// 采集端报告传输错误
    pub fn error(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.state.mark_failed_for(self.signal.generation(), &reason) {
            warn!(
                "Pipeline error ignored for session generation {} (state {}): {}",
                self.signal.generation(),
                self.state.state(),
                reason
            );
        }
    }

    /// 会话是否仍在接收样本
    pub fn is_accepting(&self) -> bool {
        self.check_accepting().is_ok()
    }

    /// 等待在途投递被驱动器取走，最多等待 `timeout`
    ///
    /// 返回 `false` 表示超时，仍有投递阻塞在队列上。
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.in_flight.wait_idle())
            .await
            .is_ok()
    }

    /// 关闭投递入口：唤醒所有阻塞的投递并让它们失败
    ///
    /// 管线拆除前调用，避免流线程卡在满队列上。影响所有克隆。
    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// 采集管线接口
///
/// `attach` 之后管线通过 `IngestHandle` 投递样本；`stop` 负责断开管线并释放摄像头资源，
/// 返回之后不能再有新的投递。
#[async_trait]
pub trait CapturePipeline: Send {
    /// 挂接到流地址
    async fn attach(&mut self, locator: &StreamLocator, ingest: IngestHandle) -> Result<(), CaptureError>;

    /// 启动管线，返回即表示管线已就绪
    async fn start(&mut self) -> Result<(), CaptureError>;

    /// 停止并断开管线
    async fn stop(&mut self) -> Result<(), CaptureError>;
}

/// 根据流地址选择采集管线
///
/// - `stub://` 使用合成管线
/// - `rtsp://` / `rtsps://` 需要 `rtsp-gstreamer` 特性
pub fn pipeline_for_locator(locator: &StreamLocator) -> Result<Box<dyn CapturePipeline>, CaptureError> {
    match locator.scheme() {
        Some("stub") => Ok(Box::new(SyntheticPipeline::new(SyntheticConfig::from_locator(locator)?))),
        #[cfg(feature = "rtsp-gstreamer")]
        Some("rtsp") | Some("rtsps") => Ok(Box::new(GstreamerPipeline::new())),
        _ => Err(CaptureError::UnsupportedLocator {
            locator: locator.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_for(state: &Arc<SessionStateMachine>, capacity: usize) -> (IngestHandle, mpsc::Receiver<RawSample>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = IngestHandle::new(
            tx,
            Arc::clone(state),
            state.current_signal(),
            Arc::new(InFlight::default()),
        );
        (handle, rx)
    }

    #[test]
    fn test_raw_sample_defaults() {
        let sample = RawSample::new(vec![1, 2, 3], 40_000_000);
        assert_eq!(sample.flags, 0);
        assert_eq!(sample.dts, CLOCK_TIME_NONE);
        assert_eq!(sample.duration, CLOCK_TIME_NONE);
        assert!(sample.format.is_none());
    }

    #[tokio::test]
    async fn test_handle_rejects_when_idle() {
        let state = Arc::new(SessionStateMachine::new());
        let (handle, _rx) = handle_for(&state, 4);

        let result = handle.send(RawSample::new(vec![1], 0)).await;
        assert!(matches!(result, Err(IngestError::SessionNotRunning(SessionState::Idle))));
        assert!(!handle.is_accepting());
    }

    #[tokio::test]
    async fn test_handle_accepts_while_initializing_and_running() {
        let state = Arc::new(SessionStateMachine::new());
        state.begin_start().unwrap();
        let (handle, mut rx) = handle_for(&state, 4);

        handle.send(RawSample::new(vec![1], 0)).await.unwrap();
        state.mark_running().unwrap();
        handle.send(RawSample::new(vec![2], 1)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().payload, vec![1]);
        assert_eq!(rx.recv().await.unwrap().payload, vec![2]);
    }

    #[test]
    fn test_blocking_ingest_from_callback_thread() {
        let state = Arc::new(SessionStateMachine::new());
        state.begin_start().unwrap();
        state.mark_running().unwrap();
        let (handle, mut rx) = handle_for(&state, 4);

        let callback_handle = handle.clone();
        std::thread::spawn(move || {
            callback_handle.ingest(RawSample::new(vec![9; 8], 0)).unwrap();
            callback_handle.end_of_stream();
        })
        .join()
        .unwrap();

        assert_eq!(rx.try_recv().unwrap().payload.len(), 8);
        assert_eq!(state.state(), SessionState::Stopped);
        assert!(handle.ingest(RawSample::new(vec![1], 0)).is_err());
    }

    #[test]
    fn test_pipeline_error_fails_session() {
        let state = Arc::new(SessionStateMachine::new());
        state.begin_start().unwrap();
        state.mark_running().unwrap();
        let (handle, _rx) = handle_for(&state, 4);

        handle.error("connection reset by peer");
        assert_eq!(state.state(), SessionState::Failed);
    }

    #[test]
    fn test_handle_ignored_after_new_session() {
        let state = Arc::new(SessionStateMachine::new());
        state.begin_start().unwrap();
        state.mark_running().unwrap();
        let (previous, _previous_rx) = handle_for(&state, 4);
        previous.end_of_stream();
        assert_eq!(state.state(), SessionState::Stopped);

        state.begin_start().unwrap();
        state.mark_running().unwrap();
        let (current, mut rx) = handle_for(&state, 4);

        previous.error("late transport error");
        previous.end_of_stream();
        assert_eq!(state.state(), SessionState::Running);
        assert!(!previous.is_accepting());
        assert!(matches!(
            previous.ingest(RawSample::new(vec![1], 0)),
            Err(IngestError::SessionNotRunning(SessionState::Stopped))
        ));

        current.ingest(RawSample::new(vec![2], 0)).unwrap();
        assert_eq!(rx.try_recv().unwrap().payload, vec![2]);
    }

    #[test]
    fn test_close_releases_blocked_ingest() {
        let state = Arc::new(SessionStateMachine::new());
        state.begin_start().unwrap();
        state.mark_running().unwrap();
        let (handle, _rx) = handle_for(&state, 1);
        handle.ingest(RawSample::new(vec![1], 0)).unwrap();

        let callback_handle = handle.clone();
        let blocked = std::thread::spawn(move || callback_handle.ingest(RawSample::new(vec![2], 1)));

        while handle.in_flight.count() == 0 {
            std::thread::yield_now();
        }
        handle.close();

        assert!(blocked.join().unwrap().is_err());
        assert_eq!(handle.in_flight.count(), 0);
    }

    #[tokio::test]
    async fn test_wait_drained_times_out_while_blocked() {
        let state = Arc::new(SessionStateMachine::new());
        state.begin_start().unwrap();
        state.mark_running().unwrap();
        let (handle, mut rx) = handle_for(&state, 1);
        handle.send(RawSample::new(vec![1], 0)).await.unwrap();

        let sender = handle.clone();
        let blocked = tokio::spawn(async move { sender.send(RawSample::new(vec![2], 1)).await });
        while handle.in_flight.count() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(!handle.wait_drained(Duration::from_millis(20)).await);
        assert_eq!(rx.recv().await.unwrap().payload, vec![1]);
        assert!(blocked.await.unwrap().is_ok());
        assert!(handle.wait_drained(Duration::from_millis(20)).await);
    }

    #[test]
    fn test_pipeline_for_locator() {
        assert!(pipeline_for_locator(&StreamLocator::new("stub://camera")).is_ok());
        assert!(matches!(
            pipeline_for_locator(&StreamLocator::new("http://camera/mjpeg")),
            Err(CaptureError::UnsupportedLocator { .. })
        ));
    }
}

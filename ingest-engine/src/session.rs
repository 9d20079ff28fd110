// 摄像头帧接入引擎 - 会话状态机
//
// 状态流转：Idle → Initializing → Running → Stopping → Stopped，
// 初始化或运行期间发生不可恢复的管线错误时进入 Failed。
//
// 状态通过 `tokio::sync::watch` 发布：启动线程、采集回调线程和驱动任务
// 都能看到同一份状态，每次迁移都是一次原子的"检查并设置"。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::IngestError;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// 尚未启动
    Idle,
    /// 正在挂接并启动采集管线
    Initializing,
    /// 正在接收和分发帧
    Running,
    /// 正在停止
    Stopping,
    /// 已停止
    Stopped,
    /// 管线失败
    Failed,
}

impl SessionState {
    /// 是否允许调用 `start()`
    pub fn can_start(self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Stopped | SessionState::Failed
        )
    }

    /// 采集端投递的样本是否会被接受
    pub fn accepts_samples(self) -> bool {
        matches!(self, SessionState::Initializing | SessionState::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Initializing => "initializing",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 会话结束原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// 采集端报告流结束（正常结束）
    EndOfStream,
    /// 采集端报告传输错误
    PipelineError(String),
    /// 调用方主动停止
    Stopped,
}

/// 一次采集会话的描述信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSession {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub frame_rate: u32,
    pub discreteness: u32,
}

impl CaptureSession {
    pub fn new(frame_rate: u32, discreteness: u32) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            frame_rate,
            discreteness,
        }
    }
}

/// 单次会话的终止信号
///
/// 每次 `begin_start` 生成一个新的信号，代号单调递增。
/// 采集端和驱动器只持有自己会话的信号，旧会话的通知不会影响新会话。
#[derive(Debug)]
pub struct SessionSignal {
    generation: u64,
    termination: Mutex<Option<Termination>>,
}

impl SessionSignal {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            termination: Mutex::new(None),
        }
    }

    /// 会话代号
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 本会话的结束原因，会话尚未结束时为 `None`
    pub fn termination(&self) -> Option<Termination> {
        self.termination
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, termination: Termination) {
        *self
            .termination
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(termination);
    }
}

/// 会话状态机
///
/// 可以通过 `Arc` 在线程间共享；所有迁移方法都只接受 `&self`。
#[derive(Debug)]
pub struct SessionStateMachine {
    state: watch::Sender<SessionState>,
    /// 当前（最近一次启动的）会话
    current: Mutex<Arc<SessionSignal>>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            state,
            current: Mutex::new(Arc::new(SessionSignal::new(0))),
        }
    }

    /// 当前状态
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// 当前会话的信号
    pub fn current_signal(&self) -> Arc<SessionSignal> {
        Arc::clone(&self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    fn current_generation(&self) -> u64 {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .generation
    }

    /// 最近一次会话的结束原因，会话尚未结束时为 `None`
    pub fn termination(&self) -> Option<Termination> {
        self.current_signal().termination()
    }

    /// 指定代号的会话是否仍是当前会话
    pub fn is_current(&self, generation: u64) -> bool {
        let _state = self.state.borrow();
        self.current_generation() == generation
    }

    /// 指定会话是否仍在接收样本；否则返回观察到的状态
    ///
    /// 旧会话的代号在新会话运行时也会被拒绝。
    pub fn accepts_samples_for(&self, generation: u64) -> Result<(), SessionState> {
        let state = self.state.borrow();
        if self.current_generation() != generation {
            // 旧会话已经结束
            return Err(SessionState::Stopped);
        }
        if state.accepts_samples() {
            Ok(())
        } else {
            Err(*state)
        }
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// 原子迁移：当前状态属于 `from` 时切换到 `to`，并在同一临界区内记录结束原因
    ///
    /// 指定 `generation` 时只对该代号的会话生效。
    /// 成功时返回迁移前的状态，失败时返回当前状态。
    fn transition(
        &self,
        generation: Option<u64>,
        from: &[SessionState],
        to: SessionState,
        termination: Option<Termination>,
    ) -> Result<SessionState, SessionState> {
        let mut outcome = Err(SessionState::Idle);
        self.state.send_if_modified(|state| {
            let current = self.current_signal();
            let same_session = generation.map_or(true, |g| g == current.generation);
            if same_session && from.contains(state) {
                outcome = Ok(*state);
                *state = to;
                if let Some(termination) = termination {
                    current.record(termination);
                }
                true
            } else {
                outcome = Err(*state);
                false
            }
        });

        if let Ok(previous) = outcome {
            debug!("Session state: {} -> {}", previous, to);
        }
        outcome
    }

    /// 开始启动：Idle/Stopped/Failed → Initializing
    ///
    /// 返回新会话的信号。
    pub fn begin_start(&self) -> Result<Arc<SessionSignal>, IngestError> {
        let mut started = None;
        let mut rejected = SessionState::Idle;
        self.state.send_if_modified(|state| {
            if state.can_start() {
                let mut current = self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let signal = Arc::new(SessionSignal::new(current.generation + 1));
                *current = Arc::clone(&signal);
                started = Some(signal);
                *state = SessionState::Initializing;
                true
            } else {
                rejected = *state;
                false
            }
        });

        match started {
            Some(signal) => {
                debug!("Session state: -> {} (generation {})", SessionState::Initializing, signal.generation);
                Ok(signal)
            }
            None => {
                warn!("Rejecting start request, session is {}", rejected);
                Err(IngestError::AlreadyRunning(rejected))
            }
        }
    }

    /// 管线就绪：Initializing → Running
    ///
    /// 初始化期间被并发停止时返回当前状态。
    pub fn mark_running(&self) -> Result<(), SessionState> {
        self.transition(None, &[SessionState::Initializing], SessionState::Running, None)
            .map(|_| ())
    }

    /// 当前会话失败：Initializing/Running → Failed
    pub fn mark_failed(&self, reason: &str) -> bool {
        self.fail(None, reason)
    }

    /// 指定会话失败；会话已被取代时忽略
    pub fn mark_failed_for(&self, generation: u64, reason: &str) -> bool {
        self.fail(Some(generation), reason)
    }

    fn fail(&self, generation: Option<u64>, reason: &str) -> bool {
        match self.transition(
            generation,
            &[SessionState::Initializing, SessionState::Running],
            SessionState::Failed,
            Some(Termination::PipelineError(reason.to_string())),
        ) {
            Ok(previous) => {
                warn!("Capture session failed while {}: {}", previous, reason);
                true
            }
            Err(_) => false,
        }
    }

    /// 当前会话流结束：Initializing/Running → Stopped
    pub fn mark_end_of_stream(&self) -> bool {
        self.end_of_stream(None)
    }

    /// 指定会话流结束；会话已被取代时忽略
    pub fn mark_end_of_stream_for(&self, generation: u64) -> bool {
        self.end_of_stream(Some(generation))
    }

    fn end_of_stream(&self, generation: Option<u64>) -> bool {
        match self.transition(
            generation,
            &[SessionState::Initializing, SessionState::Running],
            SessionState::Stopped,
            Some(Termination::EndOfStream),
        ) {
            Ok(_) => {
                info!("Capture stream reached end of stream");
                true
            }
            Err(_) => false,
        }
    }

    /// 开始停止：Running/Initializing → Stopping
    ///
    /// 返回 `false` 表示本次调用无需做任何事（空闲、已停止或已失败）。
    pub fn begin_stop(&self) -> bool {
        self.transition(
            None,
            &[SessionState::Running, SessionState::Initializing],
            SessionState::Stopping,
            None,
        )
        .is_ok()
    }

    /// 完成停止：Stopping → Stopped
    pub fn finish_stop(&self) {
        let _ = self.transition(
            None,
            &[SessionState::Stopping],
            SessionState::Stopped,
            Some(Termination::Stopped),
        );
    }

    /// 等待进入终止状态（Stopped 或 Failed）
    pub async fn wait_for_terminal(&self) -> SessionState {
        let mut receiver = self.subscribe();
        let result = receiver.wait_for(|state| state.is_terminal()).await;
        match result {
            Ok(state) => *state,
            // 发送端随状态机一起存在，借用期间不会关闭
            Err(_) => self.state(),
        }
    }
}

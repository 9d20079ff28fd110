// 摄像头帧接入引擎 - 错误类型定义
//
// 本模块定义了引擎对调用方可见的错误类型。
// 稳态路径上的空帧不属于错误，由分类器在本地吸收（见 `classifier::SampleRejected`）。

use std::io;
use thiserror::Error;

use crate::session::SessionState;
use common::{CaptureError, SinkError};

/// 引擎错误类型
#[derive(Debug, Clone, Error)]
pub enum IngestError {
    // ========== 配置错误 ==========
    /// 目标帧率必须大于0
    #[error("Invalid target frame rate: {0} (must be greater than 0)")]
    InvalidRate(u32),

    /// 离散度必须大于0且不小于目标帧率
    #[error("Invalid discreteness factor: {discreteness} (must be >= frame rate {rate} and > 0)")]
    InvalidDiscreteness { rate: u32, discreteness: u32 },

    /// 配置文件或配置项错误
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ========== 会话错误 ==========
    /// 会话已在运行，不允许重复启动
    #[error("Capture session is already running (state: {0})")]
    AlreadyRunning(SessionState),

    /// 会话不在可接收样本的状态
    #[error("Capture session is not running (state: {0})")]
    SessionNotRunning(SessionState),

    /// 采集管线挂接或启动失败
    #[error("Failed to initialize capture pipeline: {0}")]
    PipelineInitialization(#[source] CaptureError),

    // ========== 分发错误 ==========
    /// 接收端回调失败，不会重试
    #[error("Sink dispatch failed (frame: {sequence_index:?}): {source}")]
    SinkDispatch {
        sequence_index: Option<u64>,
        #[source]
        source: SinkError,
    },
}

impl IngestError {
    /// 是否属于无法继续推进的致命错误
    ///
    /// 致命错误只包括配置错误和管线初始化失败；
    /// 接收端分发失败由驱动循环的调用方决定是否停止会话。
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::InvalidRate(_)
                | IngestError::InvalidDiscreteness { .. }
                | IngestError::Configuration(_)
                | IngestError::PipelineInitialization(_)
        )
    }
}

/// 错误转换：从 std::io::Error
impl From<io::Error> for IngestError {
    fn from(error: io::Error) -> Self {
        IngestError::Configuration(format!("IO error: {}", error))
    }
}

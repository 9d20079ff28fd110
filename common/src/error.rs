use thiserror::Error;

/// 采集管线（外部协作方）报告的错误
#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("Unsupported stream locator: {locator}")]
    UnsupportedLocator { locator: String },

    #[error("Failed to attach capture pipeline: {reason}")]
    AttachFailed { reason: String },

    #[error("Failed to start capture pipeline: {reason}")]
    StartFailed { reason: String },

    #[error("Failed to stop capture pipeline: {reason}")]
    StopFailed { reason: String },

    #[error("Capture pipeline is not attached")]
    NotAttached,
}

/// 帧接收端（外部协作方）报告的错误
#[derive(Error, Debug, Clone)]
pub enum SinkError {
    #[error("Frame rejected by sink: {reason}")]
    Rejected { reason: String },

    #[error("Sink is closed")]
    Closed,

    #[error("Sink error: {message}")]
    Other { message: String },
}

// 帧接收端接口
//
// 接收端是外部协作方（例如视频流上传SDK），引擎只通过 `FrameSink` 与之交互。
// 回调在驱动任务上按帧序号顺序调用，同一时刻只有一个回调在执行。

use async_trait::async_trait;
use tokio::sync::mpsc;

use common::{CodecConfiguration, MediaSample, SinkError};

/// 帧接收端
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// 接收解码器配置，每个会话最多一次，且先于第一帧
    async fn on_codec_configuration(&self, configuration: CodecConfiguration) -> Result<(), SinkError>;

    /// 接收一帧，帧负载的所有权转移给接收端
    async fn on_frame(&self, frame: MediaSample) -> Result<(), SinkError>;
}

/// 通过通道转交给接收端的事件
#[derive(Debug)]
pub enum SinkEvent {
    CodecConfiguration(CodecConfiguration),
    Frame(MediaSample),
}

/// 把回调转成通道消息的接收端
///
/// 适合接收端有自己的消费线程的场景。通道满时回调会等待，
/// 通道关闭时返回 `SinkError::Closed`。
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<SinkEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SinkEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn on_codec_configuration(&self, configuration: CodecConfiguration) -> Result<(), SinkError> {
        self.sender
            .send(SinkEvent::CodecConfiguration(configuration))
            .await
            .map_err(|_| SinkError::Closed)
    }

    async fn on_frame(&self, frame: MediaSample) -> Result<(), SinkError> {
        self.sender
            .send(SinkEvent::Frame(frame))
            .await
            .map_err(|_| SinkError::Closed)
    }
}

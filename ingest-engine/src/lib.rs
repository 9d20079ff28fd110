pub mod capture;
pub mod classifier;
pub mod codec_config;
pub mod config;
pub mod dispatcher;
pub mod engine;
#[cfg(test)]
mod engine_test;
pub mod error;
pub mod session;
pub mod sink;
pub mod throttle;

pub use capture::{pipeline_for_locator, CapturePipeline, IngestHandle, RawSample, StreamFormat};
pub use classifier::{ClassifierStats, SampleClassifier, SampleRejected};
pub use codec_config::CodecConfigurationExtractor;
pub use config::EngineConfig;
pub use dispatcher::{DispatchOutcome, DispatchStats, FrameDispatcher};
pub use engine::{CaptureEngine, Progress, SessionDriver, SessionSummary};
pub use error::IngestError;
pub use session::{CaptureSession, SessionSignal, SessionState, SessionStateMachine, Termination};
pub use sink::{ChannelSink, FrameSink, SinkEvent};
pub use throttle::DiscreteTimePeriodsThrottler;

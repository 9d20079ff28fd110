// 解码器配置提取
//
// 每个会话只在第一个样本上检查一次流格式：带有 codec_data 时复制一份，
// 之后的样本不再检查（中途变化的 codec_data 会被忽略）。

use common::CodecConfiguration;
use tracing::{debug, info};

use crate::capture::RawSample;

/// 一次性解码器配置提取器
#[derive(Debug, Default)]
pub struct CodecConfigurationExtractor {
    inspected: bool,
    configuration: Option<CodecConfiguration>,
}

impl CodecConfigurationExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 观察一个样本
    ///
    /// 只有会话的第一个样本（包括空样本）会被检查；检查到 codec_data 时返回其副本，
    /// 其余情况返回 `None`。
    pub fn observe(&mut self, sample: &RawSample) -> Option<CodecConfiguration> {
        if self.inspected {
            return None;
        }
        self.inspected = true;

        let codec_data = sample
            .format
            .as_ref()
            .and_then(|format| format.codec_data.as_deref())
            .filter(|data| !data.is_empty());

        match codec_data {
            Some(data) => {
                let configuration = CodecConfiguration::copy_from_slice(data);
                info!("Codec configuration extracted ({} bytes)", configuration.len());
                self.configuration = Some(configuration.clone());
                Some(configuration)
            }
            None => {
                debug!("First sample carries no codec data");
                None
            }
        }
    }

    /// 是否已经检查过第一个样本
    pub fn is_inspected(&self) -> bool {
        self.inspected
    }

    /// 已提取的配置
    pub fn configuration(&self) -> Option<&CodecConfiguration> {
        self.configuration.as_ref()
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use common::{IpCamera, StreamLocator, StreamType};
use ingest_engine::EngineConfig;

/// 桥接程序配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BridgeConfig {
    /// 引擎配置
    pub engine: EngineConfig,

    /// 摄像头地址；设置后用它组装RTSP地址，覆盖 `engine.locator`
    pub camera: Option<IpCamera>,

    /// 日志和统计
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 默认日志级别（RUST_LOG 优先）
    pub level: String,

    /// 统计输出间隔（秒），0 表示不输出
    pub stats_interval_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            stats_interval_secs: 5,
        }
    }
}

impl BridgeConfig {
    /// 加载配置：配置文件（可选）→ 环境变量覆盖
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            None => BridgeConfig::default(),
        };

        EnvConfigOverride::apply_overrides(&mut config);
        Ok(config)
    }

    /// 生成最终的引擎配置并校验
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut engine = self.engine.clone();

        if let Some(camera) = &self.camera {
            engine.locator = camera
                .compose_stream_url(StreamType::Rtsp)
                .context("Camera does not provide an RTSP stream")?;
        }

        engine.validate()?;
        Ok(engine)
    }

    pub fn set_locator(&mut self, locator: impl Into<String>) {
        self.engine.locator = StreamLocator::new(locator);
        self.camera = None;
    }
}

/// 环境变量覆盖
pub struct EnvConfigOverride;

impl EnvConfigOverride {
    pub fn apply_overrides(config: &mut BridgeConfig) {
        Self::apply_from(config, |key| std::env::var(key).ok());
    }

    /// 从任意来源读取覆盖项，便于测试
    pub fn apply_from(config: &mut BridgeConfig, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(locator) = lookup("CAMERA_BRIDGE_LOCATOR") {
            config.set_locator(locator);
        }
        if let Some(name) = lookup("CAMERA_BRIDGE_STREAM_NAME") {
            config.engine.stream_name = name;
        }
        if let Some(rate) = lookup("CAMERA_BRIDGE_FRAME_RATE").and_then(|v| v.parse().ok()) {
            config.engine.frame_rate = rate;
        }
        if let Some(hz) = lookup("CAMERA_BRIDGE_DISCRETENESS").and_then(|v| v.parse().ok()) {
            config.engine.discreteness_hz = hz;
        }
        if let Some(level) = lookup("CAMERA_BRIDGE_LOG_LEVEL") {
            config.logging.level = level;
        }

        // 摄像头凭据
        if let Some(ip) = lookup("CAMERA_BRIDGE_CAMERA_IP") {
            let mut camera = IpCamera::new(ip);
            if let (Some(user), Some(pass)) = (
                lookup("CAMERA_BRIDGE_CAMERA_USER"),
                lookup("CAMERA_BRIDGE_CAMERA_PASSWORD"),
            ) {
                camera = camera.with_credentials(user, pass);
            }
            if let Some(path) = lookup("CAMERA_BRIDGE_CAMERA_RTSP_PATH") {
                camera = camera.with_rtsp_path(path);
            }
            config.camera = Some(camera);
        }
    }
}

mod config;
mod sink;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use common::IpCamera;
use ingest_engine::{pipeline_for_locator, CaptureEngine, SessionDriver, SessionSummary};

use crate::config::BridgeConfig;
use crate::sink::LoggingSink;

fn cli() -> Command {
    Command::new("camera-bridge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Pulls H.264 frames from an IP camera and paces them to a target frame rate")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .env("CAMERA_BRIDGE_CONFIG")
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("locator")
                .short('l')
                .long("locator")
                .value_name("URL")
                .help("Stream locator (rtsp://... or stub://...)"),
        )
        .arg(
            Arg::new("camera")
                .long("camera")
                .value_name("HOST[:PORT]")
                .help("Camera address; composes an RTSP locator")
                .conflicts_with("locator"),
        )
        .arg(Arg::new("user").long("user").value_name("USER").requires("camera"))
        .arg(
            Arg::new("password")
                .long("password")
                .value_name("PASSWORD")
                .env("CAMERA_BRIDGE_CAMERA_PASSWORD")
                .hide_env_values(true),
        )
        .arg(
            Arg::new("rtsp-path")
                .long("rtsp-path")
                .value_name("PATH")
                .requires("camera"),
        )
        .arg(
            Arg::new("frame-rate")
                .short('r')
                .long("frame-rate")
                .value_name("FPS")
                .value_parser(clap::value_parser!(u32))
                .help("Target frame rate"),
        )
        .arg(
            Arg::new("discreteness")
                .long("discreteness")
                .value_name("HZ")
                .value_parser(clap::value_parser!(u32))
                .help("Throttling periods per second"),
        )
        .arg(Arg::new("stream-name").long("stream-name").value_name("NAME"))
}

/// 驱动会话直到结束；接收端错误只记录，致命错误提前结束
async fn drive_session(mut driver: SessionDriver) -> SessionSummary {
    loop {
        match driver.run().await {
            Ok(summary) => return summary,
            Err(e) if e.is_fatal() => {
                error!("❌ {}", e);
                return driver.summary();
            }
            // 接收端错误不终止会话
            Err(e) => warn!("⚠️  {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    // 加载配置：文件 → 环境变量 → 命令行
    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let mut config = BridgeConfig::load(config_path.as_deref()).await?;

    if let Some(locator) = matches.get_one::<String>("locator") {
        config.set_locator(locator.clone());
    }
    if let Some(host) = matches.get_one::<String>("camera") {
        let mut camera = IpCamera::new(host.clone());
        if let (Some(user), Some(password)) = (
            matches.get_one::<String>("user"),
            matches.get_one::<String>("password"),
        ) {
            camera = camera.with_credentials(user.clone(), password.clone());
        }
        if let Some(path) = matches.get_one::<String>("rtsp-path") {
            camera = camera.with_rtsp_path(path.clone());
        }
        config.camera = Some(camera);
    }
    if let Some(rate) = matches.get_one::<u32>("frame-rate") {
        config.engine.frame_rate = *rate;
    }
    if let Some(hz) = matches.get_one::<u32>("discreteness") {
        config.engine.discreteness_hz = *hz;
    }
    if let Some(name) = matches.get_one::<String>("stream-name") {
        config.engine.stream_name = name.clone();
    }

    // 初始化日志 - 使用环境变量 RUST_LOG 控制级别
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_target(false)
        .init();

    info!("🎥 Camera bridge starting...");

    let engine_config = config.engine_config()?;
    info!("✓ Configuration loaded");
    info!("  Stream: {}", engine_config.stream_name);
    info!("  Locator: {}", engine_config.locator);
    info!("  Target: {} fps ({} Hz)", engine_config.frame_rate, engine_config.discreteness_hz);

    let pipeline = pipeline_for_locator(&engine_config.locator)
        .with_context(|| format!("No capture pipeline for {}", engine_config.locator))?;
    let mut engine = CaptureEngine::new(engine_config, pipeline)?;

    let sink = Arc::new(LoggingSink::new());
    engine.register_sink(sink.clone());

    let driver = engine.start().await?;
    info!("✅ Capture session {} running", driver.session().session_id);
    info!("   Press Ctrl+C to stop");

    let mut driver_task = tokio::spawn(drive_session(driver));

    // 周期性统计
    let stats_sink = Arc::clone(&sink);
    let stats_interval = config.logging.stats_interval_secs;
    let stats_task = tokio::spawn(async move {
        if stats_interval == 0 {
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snapshot = stats_sink.snapshot();
            info!(
                "📊 {} frames ({} key), {:.2} MB, last #{:?}",
                snapshot.frames,
                snapshot.key_frames,
                snapshot.bytes as f64 / 1_000_000.0,
                snapshot.last_sequence_index
            );
        }
    });

    let summary = tokio::select! {
        result = &mut driver_task => result.context("Session driver task failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("⏹️ Ctrl+C received, stopping...");
            engine.stop().await;
            driver_task.await.context("Session driver task failed")?
        }
    };

    // 流结束或失败后释放管线
    let final_state = engine.stop().await;
    stats_task.abort();

    info!("✓ Session finished in state {}", final_state);
    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize session summary: {}", e),
    }

    Ok(())
}

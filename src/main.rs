mod audio;
mod channel;
mod config;
mod controller;
mod error;
mod net_link;
mod protocol;
mod session_config;
mod turn;
mod ui_bridge;

use audio::{AudioOutput, AudioSource, CapturePipeline, PlaybackScheduler};
use channel::{ConversationKind, SessionChannel, TranscriptionKind, TranscriptionSettings};
use config::Config;
use controller::{ControllerSinks, ConversationController};
use net_link::{LinkEvent, Transport, WsTransport};
use session_config::HttpConfigSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use ui_bridge::{UiBridge, UiCommand};

// 录音计时刷新间隔
const RECORDING_TICK_MS: u64 = 100;

#[cfg(feature = "device")]
fn open_audio(config: &Config) -> anyhow::Result<(Box<dyn AudioSource>, audio::playback::OutputFactory)> {
    let source = audio::AlsaSource::new(config.capture_device);
    let playback_device = config.playback_device;
    // 播放设备在第一次有音频时才打开
    let factory: audio::playback::OutputFactory = Box::new(move || {
        let output = audio::AlsaOutput::open(playback_device)?;
        Ok(Box::new(output) as Box<dyn AudioOutput>)
    });
    Ok((Box::new(source), factory))
}

#[cfg(not(feature = "device"))]
fn open_audio(config: &Config) -> anyhow::Result<(Box<dyn AudioSource>, audio::playback::OutputFactory)> {
    // 无声卡构建：用 WAV 文件当麦克风，播放只走时钟
    let source = audio::WavFileSource::open(config.input_wav)?;
    let factory: audio::playback::OutputFactory =
        Box::new(|| Ok(Box::new(audio::ClockOutput::new()) as Box<dyn AudioOutput>));
    Ok((Box::new(source), factory))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new().map_err(anyhow::Error::msg)?;
    log::info!(
        "{} v{} starting, client id {}",
        Config::app_name(),
        Config::app_version(),
        config.client_id
    );

    let access_token = Some(config.access_token.to_string()).filter(|t| !t.is_empty());

    // 事件通道：两条会话各自一个队列，保证各自按到达顺序处理
    let (tx_conversation, mut rx_conversation) = mpsc::channel::<LinkEvent>(100);
    let (tx_transcription, mut rx_transcription) = mpsc::channel::<LinkEvent>(100);

    // 录音线程、定时器、显示输出
    let (tx_capture, mut rx_capture) = mpsc::unbounded_channel();
    let (tx_timer, mut rx_timer) = mpsc::unbounded_channel();
    let (tx_display, mut rx_display) = mpsc::unbounded_channel();

    // UI进程通道
    let (tx_ui, mut rx_ui) = mpsc::channel::<UiCommand>(100);

    let ui_bridge = Arc::new(UiBridge::new(&config, tx_ui).await?);
    let ui_bridge_clone = ui_bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = ui_bridge_clone.run().await {
            log::error!("UiBridge error: {}", e);
        }
    });

    let transport: Arc<dyn Transport> =
        Arc::new(WsTransport::new(access_token.clone(), config.client_id.clone()));

    let conversation = SessionChannel::new(
        ConversationKind::new(None),
        config.conversation_ws_url,
        transport.clone(),
        tx_conversation,
    );
    let transcription = SessionChannel::new(
        TranscriptionKind::new(TranscriptionSettings {
            model: config.transcription_model.to_string(),
            language: config.transcription_language.to_string(),
            noise_reduction: config.transcription_noise_reduction.to_string(),
        }),
        config.transcription_ws_url,
        transport,
        tx_transcription,
    );

    let (source, output_factory) = open_audio(&config)?;

    let mut controller = ConversationController::new(
        conversation,
        transcription,
        CapturePipeline::new(source),
        PlaybackScheduler::new(output_factory),
        Arc::new(HttpConfigSource::new(config.session_config_url, access_token)),
        ControllerSinks {
            capture_tx: tx_capture,
            timer_tx: tx_timer,
            display_tx: tx_display,
        },
    );

    // 启动即连接
    controller.connect().await;

    let mut recording_tick = tokio::time::interval(Duration::from_millis(RECORDING_TICK_MS));
    recording_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // 主循环
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Ctrl+C received, shutting down");
                controller.shutdown();
                break;
            }
            Some(event) = rx_conversation.recv() => {
                controller.handle_conversation_event(event);
            }
            Some(event) = rx_transcription.recv() => {
                controller.handle_transcription_event(event);
            }
            Some(event) = rx_capture.recv() => {
                controller.handle_capture_event(event);
            }
            Some(event) = rx_timer.recv() => {
                controller.handle_timer(event);
            }
            Some(command) = rx_ui.recv() => {
                controller.handle_ui_command(command).await;
            }
            Some(event) = rx_display.recv() => {
                if let Err(e) = ui_bridge.send_event(&event).await {
                    log::warn!("Failed to send to UI: {}", e);
                }
            }
            _ = recording_tick.tick() => {
                controller.tick_recording();
            }
        }
    }

    // 把关闭前产生的日志行也送出去
    while let Ok(event) = rx_display.try_recv() {
        let _ = ui_bridge.send_event(&event).await;
    }

    Ok(())
}

use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    server: Server,
    audio: Audio,
    ui: Ui,
    transcription: Transcription,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Server {
    session_config_url: String,
    conversation_ws_url: String,
    transcription_ws_url: String,
    access_token: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    input_wav: String,
}

#[derive(Deserialize)]
struct Ui {
    local_port: u16,
    remote_port: u16,
    buffer_size: usize,
}

#[derive(Deserialize)]
struct Transcription {
    model: String,
    language: String,
    noise_reduction: String,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 服务端配置
    println!("cargo:rustc-env=SESSION_CONFIG_URL={}", config.server.session_config_url);
    println!("cargo:rustc-env=CONVERSATION_WS_URL={}", config.server.conversation_ws_url);
    println!("cargo:rustc-env=TRANSCRIPTION_WS_URL={}", config.server.transcription_ws_url);
    println!("cargo:rustc-env=ACCESS_TOKEN={}", config.server.access_token);

    // 音频设备
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=INPUT_WAV={}", config.audio.input_wav);

    // UI 桥配置
    println!("cargo:rustc-env=UI_LOCAL_PORT={}", config.ui.local_port);
    println!("cargo:rustc-env=UI_REMOTE_PORT={}", config.ui.remote_port);
    println!("cargo:rustc-env=UI_BUFFER_SIZE={}", config.ui.buffer_size);

    // 转写会话参数
    println!("cargo:rustc-env=TRANSCRIPTION_MODEL={}", config.transcription.model);
    println!("cargo:rustc-env=TRANSCRIPTION_LANGUAGE={}", config.transcription.language);
    println!("cargo:rustc-env=TRANSCRIPTION_NOISE_REDUCTION={}", config.transcription.noise_reduction);

    if std::env::var_os("CARGO_FEATURE_DEVICE").is_some() {
        link_speexdsp();
    }
}

fn link_speexdsp() {
    let target = std::env::var("TARGET").unwrap_or_default();

    if target.contains("musl") {
        // musl 目标：使用手动编译的静态库，不依赖 pkg-config
        if let Ok(sysroot) = std::env::var("MUSL_SYSROOT") {
            println!("cargo:rustc-link-search=native={}/usr/lib", sysroot);
        }
        println!("cargo:rustc-link-lib=static=speexdsp");
        return;
    }

    // ALSA 由 alsa-sys 自动链接，speexdsp 通过 pkg-config 查找
    pkg_config::Config::new()
        .probe("speexdsp")
        .expect("Failed to find speexdsp. Please install libspeexdsp-dev.");
}

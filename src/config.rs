use serde::Serialize;

#[derive(Debug, Serialize, Clone)]
pub struct Config {
    // 服务端配置
    pub session_config_url: &'static str,
    pub conversation_ws_url: &'static str,
    pub transcription_ws_url: &'static str,
    pub access_token: &'static str,

    // 音频设备配置
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    pub input_wav: &'static str,

    // UI进程配置
    pub ui_local_port: u16,
    pub ui_remote_port: u16,
    pub ui_buffer_size: usize,

    // 转写会话参数
    pub transcription_model: &'static str,
    pub transcription_language: &'static str,
    pub transcription_noise_reduction: &'static str,

    // 客户端标识（运行时生成）
    pub client_id: String,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            session_config_url: env!("SESSION_CONFIG_URL"),
            conversation_ws_url: env!("CONVERSATION_WS_URL"),
            transcription_ws_url: env!("TRANSCRIPTION_WS_URL"),
            access_token: env!("ACCESS_TOKEN"),

            capture_device: env!("CAPTURE_DEVICE"),
            playback_device: env!("PLAYBACK_DEVICE"),
            input_wav: env!("INPUT_WAV"),

            ui_local_port: env!("UI_LOCAL_PORT").parse()
                .map_err(|_| "Failed to parse UI_LOCAL_PORT")?,
            ui_remote_port: env!("UI_REMOTE_PORT").parse()
                .map_err(|_| "Failed to parse UI_REMOTE_PORT")?,
            ui_buffer_size: env!("UI_BUFFER_SIZE").parse()
                .map_err(|_| "Failed to parse UI_BUFFER_SIZE")?,

            transcription_model: env!("TRANSCRIPTION_MODEL"),
            transcription_language: env!("TRANSCRIPTION_LANGUAGE"),
            transcription_noise_reduction: env!("TRANSCRIPTION_NOISE_REDUCTION"),

            client_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    pub fn app_name() -> &'static str {
        env!("APP_NAME")
    }

    pub fn app_version() -> &'static str {
        env!("APP_VERSION")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_time_values_parse() {
        let config = Config::new().unwrap();
        assert!(config.conversation_ws_url.starts_with("ws"));
        assert!(config.transcription_ws_url.starts_with("ws"));
        assert!(config.ui_buffer_size > 0);
        assert!(!config.client_id.is_empty());
    }

    #[test]
    fn each_config_gets_its_own_client_id() {
        let a = Config::new().unwrap();
        let b = Config::new().unwrap();
        assert_ne!(a.client_id, b.client_id);
    }
}

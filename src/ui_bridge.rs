use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayTarget {
    Recording,
    Response,
}

/// Commands accepted from the display process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiCommand {
    Connect,
    Disconnect,
    Record { action: RecordAction },
    Text { text: String },
    Replay { target: ReplayTarget },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Success,
    Error,
}

/// Everything the display process renders. `Log` lines are append-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisplayEvent {
    Log { text: String },
    Transcription { text: String },
    Status { level: StatusLevel, text: String },
    Recording { active: bool, time: String },
}

pub struct UiBridge {
    socket: UdpSocket,
    target_addr: SocketAddr,
    buffer_size: usize,
    tx: mpsc::Sender<UiCommand>,
}

impl UiBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<UiCommand>) -> anyhow::Result<Self> {
        let local_addr = format!("0.0.0.0:{}", config.ui_local_port);
        let socket = UdpSocket::bind(&local_addr).await?;
        let target_addr: SocketAddr = format!("127.0.0.1:{}", config.ui_remote_port).parse()?;
        log::info!("UI bridge listening on {}, display at {}", local_addr, target_addr);

        Ok(Self {
            socket,
            target_addr,
            buffer_size: config.ui_buffer_size,
            tx,
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, addr) = self.socket.recv_from(&mut buf).await?;
            let Some(command) = parse_command(&buf[..len]) else {
                log::warn!("Ignoring UI datagram from {}", addr);
                continue;
            };
            if self.tx.send(command).await.is_err() {
                log::info!("Controller gone, UI bridge exiting");
                return Ok(());
            }
        }
    }

    pub async fn send_event(&self, event: &DisplayEvent) -> anyhow::Result<()> {
        let text = serde_json::to_string(event)?;
        self.socket.send_to(text.as_bytes(), self.target_addr).await?;
        Ok(())
    }
}

pub fn parse_command(datagram: &[u8]) -> Option<UiCommand> {
    let text = std::str::from_utf8(datagram).ok()?;
    match serde_json::from_str(text.trim()) {
        Ok(command) => Some(command),
        Err(e) => {
            log::debug!("Bad UI command {:?}: {}", text, e);
            None
        }
    }
}

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Delay between the websocket opening and `Connected` being reported.
/// Some backends drop messages written immediately after the upgrade.
pub const OPEN_GUARD_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    Connected,
    Text(String),
    /// Remote closed the connection. `clean` is true for a close handshake.
    Closed { clean: bool, reason: String },
    /// Connect failed or the connection broke.
    Failed(String),
}

/// Event tagged with the link that produced it, so a channel can ignore a
/// link it has already abandoned.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub link: u64,
    pub event: NetEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetCommand {
    SendText(String),
}

/// Opens duplex text connections. The websocket implementation lives here;
/// tests substitute an in-memory one.
pub trait Transport: Send + Sync {
    fn open(
        &self,
        link: u64,
        url: &str,
        events: mpsc::Sender<LinkEvent>,
        commands: mpsc::Receiver<NetCommand>,
        cancel: CancellationToken,
    );
}

/// Websocket transport: one spawned [`NetLink`] task per connection.
pub struct WsTransport {
    access_token: Option<String>,
    client_id: String,
}

impl WsTransport {
    pub fn new(access_token: Option<String>, client_id: impl Into<String>) -> Self {
        Self {
            access_token: access_token.filter(|t| !t.is_empty()),
            client_id: client_id.into(),
        }
    }
}

impl Transport for WsTransport {
    fn open(
        &self,
        link: u64,
        url: &str,
        events: mpsc::Sender<LinkEvent>,
        commands: mpsc::Receiver<NetCommand>,
        cancel: CancellationToken,
    ) {
        let net_link = NetLink {
            link,
            url: url.to_string(),
            access_token: self.access_token.clone(),
            client_id: self.client_id.clone(),
            tx: events,
            rx_cmd: commands,
            cancel,
        };
        tokio::spawn(net_link.run());
    }
}

pub struct NetLink {
    link: u64,
    url: String,
    access_token: Option<String>,
    client_id: String,
    tx: mpsc::Sender<LinkEvent>,
    rx_cmd: mpsc::Receiver<NetCommand>,
    cancel: CancellationToken,
}

impl NetLink {
    // 连接断开后不自动重连，由上层决定是否重新 connect
    pub async fn run(mut self) {
        let outcome = match self.connect_and_loop().await {
            Ok(Some(event)) => event,
            // 本地主动断开，通道已处于 Closed，无需上报
            Ok(None) => {
                log::debug!("Link {} closed locally", self.link);
                return;
            }
            Err(e) => {
                log::warn!("Link {} to {} failed: {:#}", self.link, self.url, e);
                NetEvent::Failed(e.to_string())
            }
        };
        self.emit(outcome).await;
    }

    async fn emit(&self, event: NetEvent) -> bool {
        self.tx
            .send(LinkEvent {
                link: self.link,
                event,
            })
            .await
            .is_ok()
    }

    // 建立连接并进入读写主循环
    // Ok(None): cancelled locally; Ok(Some): remote close
    async fn connect_and_loop(&mut self) -> anyhow::Result<Option<NetEvent>> {
        let url = Url::parse(&self.url)?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => anyhow::bail!("URL has no host: {}", self.url),
        };

        let mut builder = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(self.url.as_str())
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .header("Client-Id", &self.client_id);
        if let Some(token) = &self.access_token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        let request = builder.body(())?;

        log::info!("Connecting to {}...", self.url);
        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(None),
            res = connect_async(request) => res?,
        };
        let (ws_stream, _) = connected;
        let (mut write, mut read) = ws_stream.split();
        log::info!("Connected to {}", self.url);

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(None);
            }
            _ = tokio::time::sleep(tokio::time::Duration::from_millis(OPEN_GUARD_MS)) => {}
        }
        if !self.emit(NetEvent::Connected).await {
            return Ok(None);
        }

        // 主循环，处理读取和写入
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(None);
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if !self.emit(NetEvent::Text(text.to_string())).await {
                                return Ok(None);
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| format!("{} - {}", u16::from(f.code), f.reason))
                                .unwrap_or_default();
                            log::info!("Server closed connection: {}", reason);
                            return Ok(Some(NetEvent::Closed { clean: true, reason }));
                        }
                        Some(Ok(Message::Binary(data))) => {
                            log::debug!("Ignoring {} byte binary frame", data.len());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            return Ok(Some(NetEvent::Closed {
                                clean: false,
                                reason: "stream ended".to_string(),
                            }));
                        }
                    }
                }
                cmd = self.rx_cmd.recv() => {
                    match cmd {
                        Some(NetCommand::SendText(text)) => {
                            write.send(Message::Text(text.into())).await?;
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refused_connection_reports_failed() {
        let (tx, mut rx) = mpsc::channel(8);
        let (_cmd_tx, cmd_rx) = mpsc::channel(8);
        WsTransport::new(None, "test-client").open(
            3,
            "ws://127.0.0.1:9/realtime",
            tx,
            cmd_rx,
            CancellationToken::new(),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.link, 3);
        assert!(matches!(event.event, NetEvent::Failed(_)));
    }

    #[tokio::test]
    async fn cancelled_link_reports_nothing() {
        let (tx, mut rx) = mpsc::channel(8);
        let (_cmd_tx, cmd_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        WsTransport::new(Some(String::new()), "test-client").open(
            1,
            "ws://127.0.0.1:9/realtime",
            tx,
            cmd_rx,
            cancel,
        );
        // sender dropped when the task exits without emitting
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn invalid_url_reports_failed() {
        let (tx, mut rx) = mpsc::channel(8);
        let (_cmd_tx, cmd_rx) = mpsc::channel(8);
        WsTransport::new(None, "c").open(0, "not a url", tx, cmd_rx, CancellationToken::new());
        assert!(matches!(rx.recv().await.unwrap().event, NetEvent::Failed(_)));
    }
}

#![allow(dead_code)]

use beam_common::ServerMessage;
use beamd::config::ServerConfig;
use beamd::ServerState;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub fn test_config() -> ServerConfig {
    ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        ws_path: "/ws".to_string(),
        allowed_origins: vec![],
        production: false,
        ice_servers: serde_json::json!([]),
        max_conns: 1000,
        max_conns_ip: 100,
        metrics_enabled: false,
        metrics_token: None,
        msg_rate: 100.0,
        msg_burst: 100,
        http_window: 60,
        static_max: 300,
        config_max: 60,
        static_dir: None,
        redis_url: None,
        redis_prefix: "beam:".to_string(),
        node_id: "node-test".to_string(),
        idle_timeout: 60,
        ping_interval: 30,
        log_level: "info".to_string(),
        hsts: false,
        hsts_max_age: 31_536_000,
    }
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    start_server_with_config(test_config()).await
}

pub async fn start_server_with_config(config: ServerConfig) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState::new(config));

    let state_clone = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(e) = beamd::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state)
}

type WsTx = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;
type WsRx =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

#[derive(Debug)]
pub struct TestClient {
    pub ws_tx: WsTx,
    pub ws_rx: WsRx,
    pub code: String,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr) -> Self {
        Self::try_connect(addr, None).await.expect("connect failed")
    }

    pub async fn connect_with_origin(addr: &SocketAddr, origin: &str) -> Self {
        Self::try_connect(addr, Some(origin))
            .await
            .expect("connect failed")
    }

    /// Attempts the upgrade, returning the handshake error instead of
    /// panicking so rejection tests can inspect it.
    pub async fn try_connect(
        addr: &SocketAddr,
        origin: Option<&str>,
    ) -> Result<Self, tokio_tungstenite::tungstenite::Error> {
        let url = format!("ws://{addr}/ws");
        let mut req = url.into_client_request().unwrap();
        if let Some(origin) = origin {
            req.headers_mut()
                .insert("Origin", origin.parse().unwrap());
        }
        let (ws, _) = tokio_tungstenite::connect_async(req).await?;
        let (ws_tx, mut ws_rx) = ws.split();

        let welcome = tokio::time::timeout(Duration::from_secs(5), ws_rx.next())
            .await
            .expect("timeout waiting for welcome")
            .expect("connection closed before welcome")
            .expect("welcome read failed");
        let Message::Text(text) = welcome else {
            panic!("expected text welcome frame, got {welcome:?}");
        };
        let ServerMessage::Welcome { id } = ServerMessage::from_json(&text).unwrap() else {
            panic!("expected welcome, got {text}");
        };

        Ok(Self {
            ws_tx,
            ws_rx,
            code: id,
        })
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    pub async fn send_signal(&mut self, to: &str, payload: Value) {
        let frame = serde_json::json!({ "to": to, "payload": payload });
        self.send_raw(&frame.to_string()).await;
    }

    pub async fn recv_message(&mut self) -> ServerMessage {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for message")
                .expect("connection closed")
                .expect("read failed");
            match msg {
                Message::Text(text) => return ServerMessage::from_json(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    /// Receives the next relayed signal, asserting its shape.
    pub async fn recv_signal(&mut self) -> (String, Value) {
        match self.recv_message().await {
            ServerMessage::Signal { from, payload } => (from, payload),
            other => panic!("expected signal, got {other:?}"),
        }
    }

    pub async fn recv_message_timeout(&mut self, timeout: Duration) -> Option<ServerMessage> {
        tokio::time::timeout(timeout, self.recv_message()).await.ok()
    }

    /// Waits for the server to close the connection and returns the close
    /// frame, if any was negotiated.
    pub async fn expect_close(&mut self, timeout: Duration) -> Option<CloseFrame<'static>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .expect("timed out waiting for close");
            match tokio::time::timeout(remaining, self.ws_rx.next()).await {
                Ok(Some(Ok(Message::Close(frame)))) => {
                    return frame.map(|f| CloseFrame {
                        code: f.code,
                        reason: f.reason.into_owned().into(),
                    })
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(_)) | None) => return None,
                Err(_) => panic!("timed out waiting for close"),
            }
        }
    }
}

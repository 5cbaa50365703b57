//! Common test utilities
//!
//! Boots a real server on an ephemeral port and offers both the library
//! client and a raw frame-level WebSocket connection.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use ruby_agent_lib::config::{AgentConfig, ClientConfig};
use ruby_agent_lib::provider::{Provider, SharedProviderFactory};
use ruby_agent_lib::{AppState, RubyClient, RubyServer, ServerFrame};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Upper bound for any single wait in the integration tests
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(provider: Arc<dyn Provider>) -> Self {
        Self::start_with(provider, |_| {}).await
    }

    pub async fn start_with<F>(provider: Arc<dyn Provider>, configure: F) -> Self
    where
        F: FnOnce(&mut AgentConfig),
    {
        init_tracing();

        let mut config = AgentConfig::default();
        configure(&mut config);
        let server =
            RubyServer::with_provider_factory(config, Arc::new(SharedProviderFactory(provider)));
        let state = server.state().clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            server
                .serve_with_shutdown(listener, async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            inactivity_timeout_secs: 5,
            ..ClientConfig::for_server(format!("http://{}", self.addr))
        }
    }

    pub fn client(&self) -> RubyClient {
        RubyClient::new(self.client_config())
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Wait until the session's stream lease has been released
    pub async fn wait_until_idle(&self, session_id: &str) {
        tokio::time::timeout(STEP_TIMEOUT, async {
            while self.state.sessions.is_streaming(session_id).unwrap() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session never became idle");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.handle.abort();
    }
}

/// Frame-level WebSocket connection for protocol tests
pub struct RawConnection {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RawConnection {
    pub async fn connect(server: &TestServer) -> Self {
        let (socket, _) = connect_async(server.ws_url()).await.unwrap();
        Self { socket }
    }

    pub async fn send_text(&mut self, text: &str) {
        self.socket
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    pub async fn send_json(&mut self, value: Value) {
        self.send_text(&value.to_string()).await;
    }

    pub async fn next_frame(&mut self) -> ServerFrame {
        loop {
            let message = tokio::time::timeout(STEP_TIMEOUT, self.socket.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection closed")
                .unwrap();
            if let Message::Text(text) = message {
                return ServerFrame::parse(&text).unwrap();
            }
        }
    }

    /// Frames up to and including the first terminal frame
    pub async fn frames_until_end(&mut self) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        loop {
            let frame = self.next_frame().await;
            let terminal = frame.is_terminal();
            frames.push(frame);
            if terminal {
                return frames;
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}

/// Concatenated `stream_chunk` content
pub fn chunk_text(frames: &[ServerFrame]) -> String {
    frames
        .iter()
        .filter_map(|frame| match frame {
            ServerFrame::StreamChunk { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

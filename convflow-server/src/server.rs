//! TCP line transport.
//!
//! Each connection carries JSON lines: one [`IncomingMessage`] per inbound
//! line and one [`OutgoingReply`] (or [`ErrorLine`]) per outbound line. Lines
//! of one connection are dispatched in arrival order; connections are served
//! concurrently.
//!
//! [`IncomingMessage`]: crate::message::IncomingMessage
//! [`OutgoingReply`]: crate::message::OutgoingReply

use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::message::ErrorLine;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7402)),
            idle_timeout: Duration::from_secs(300),
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn from_network(network: &crate::config::NetworkConfig) -> Self {
        Self {
            bind_addr: network.bind_addr,
            idle_timeout: network.idle_timeout(),
            max_connections: network.max_connections,
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub messages_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// TCP server for convflow.
pub struct Server {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig, dispatcher: Arc<Dispatcher>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            dispatcher,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let dispatcher = self.dispatcher.clone();
                            let stats = self.stats.clone();
                            let idle_timeout = self.config.idle_timeout;
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let result = Self::handle_connection(
                                    tcp_stream,
                                    addr,
                                    dispatcher,
                                    stats.clone(),
                                    idle_timeout,
                                    &mut conn_shutdown,
                                )
                                .await;

                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Handles a single connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        stats: Arc<ServerStats>,
        idle_timeout: Duration,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        tracing::info!("Client connected: {}", addr);

        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        loop {
            tokio::select! {
                line = tokio::time::timeout(idle_timeout, lines.next_line()) => {
                    let line = match line {
                        Ok(Ok(Some(line))) => line,
                        Ok(Ok(None)) => {
                            tracing::debug!("[{}] Connection closed by client", addr);
                            return Ok(());
                        }
                        Ok(Err(e)) => return Err(ServerError::Io(e)),
                        Err(_) => {
                            tracing::debug!("[{}] Idle timeout", addr);
                            return Ok(());
                        }
                    };

                    if line.trim().is_empty() {
                        continue;
                    }

                    stats.messages_total.fetch_add(1, Ordering::Relaxed);
                    match dispatcher.dispatch_line(&line) {
                        Ok(Some(reply)) => write_json_line(&mut writer, &reply).await?,
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!("[{}] Rejected line: {}", addr, e);
                            stats.errors_total.fetch_add(1, Ordering::Relaxed);
                            let error = ErrorLine {
                                error: e.to_string(),
                                code: e.error_code().to_string(),
                            };
                            write_json_line(&mut writer, &error).await?;
                        }
                    }
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    return Err(ServerError::ShuttingDown);
                }
            }
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

async fn write_json_line<W, T>(writer: &mut W, value: &T) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use convflow_core::{ConversationRuntime, FlowBuilder, PromptAction};
    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn test_dispatcher() -> Arc<Dispatcher> {
        let def = FlowBuilder::named("survey")
            .start(PromptAction::new("gender?").with_options([["Boy", "Girl", "Other"]]))
            .attach_reply("age?", r"^(Boy|Girl|Other)$")
            .unwrap()
            .stop_with("thanks", r"^\d+$")
            .unwrap()
            .chain_conversation("cancelled")
            .unwrap();
        Arc::new(Dispatcher::new(Arc::new(ConversationRuntime::new(
            Arc::new(def),
        ))))
    }

    async fn start_server() -> (Arc<Server>, SocketAddr, tokio::task::JoinHandle<()>) {
        start_server_with(ServerConfig::new).await
    }

    async fn start_server_with(
        config: impl FnOnce(SocketAddr) -> ServerConfig,
    ) -> (Arc<Server>, SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(config(addr), test_dispatcher()));
        let task = {
            let server = server.clone();
            tokio::spawn(async move {
                tokio_test::assert_ok!(server.serve(listener).await);
            })
        };
        (server, addr, task)
    }

    #[tokio::test]
    async fn test_server_basic() {
        let server = Server::new(ServerConfig::default(), test_dispatcher());
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_conversation_over_tcp() {
        let (server, addr, task) = start_server().await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let send = |text: &str| {
            let line = format!("{{\"chat_id\": 1, \"user_id\": 2, \"text\": \"{}\"}}\n", text);
            line.into_bytes()
        };

        writer.write_all(&send("/start")).await.unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["text"], "gender?");
        assert_eq!(reply["one_time_keyboard"], true);

        // Unmatched input produces no line; the next reply belongs to "Boy".
        writer.write_all(&send("Purple")).await.unwrap();
        writer.write_all(&send("Boy")).await.unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["text"], "age?");
        assert_eq!(reply["result"], "advanced");

        writer.write_all(&send("9")).await.unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["text"], "thanks");
        assert_eq!(reply["remove_keyboard"], true);

        writer.write_all(b"garbage\n").await.unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["code"], "BAD_REQUEST");

        assert!(server.is_running());
        assert!(server.stats().messages_total.load(Ordering::Relaxed) >= 5);

        server.shutdown();
        task.await.unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let (server, addr, task) = start_server_with(|addr| ServerConfig {
            idle_timeout: Duration::from_millis(50),
            ..ServerConfig::new(addr)
        })
        .await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, _writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let eof = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("server did not close the idle connection");
        assert!(matches!(eof, Ok(None)));

        server.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_cap_rejects_extra_clients() {
        let (server, addr, task) = start_server_with(|addr| ServerConfig {
            max_connections: 1,
            ..ServerConfig::new(addr)
        })
        .await;

        let first = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = first.into_split();
        let mut first_lines = BufReader::new(reader).lines();
        writer
            .write_all(b"{\"chat_id\": 1, \"user_id\": 1, \"text\": \"/start\"}\n")
            .await
            .unwrap();
        let reply = first_lines.next_line().await.unwrap().unwrap();
        assert!(reply.contains("gender?"));

        let second = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = second.into_split();
        let mut second_lines = BufReader::new(reader).lines();
        // The write may fail once the server has dropped the socket
        let _ = writer
            .write_all(b"{\"chat_id\": 2, \"user_id\": 2, \"text\": \"/start\"}\n")
            .await;
        let rejected = tokio::time::timeout(Duration::from_secs(2), second_lines.next_line())
            .await
            .expect("rejected connection was left open");
        assert!(matches!(rejected, Ok(None) | Err(_)));

        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 1);
        assert_eq!(server.stats().connections_active.load(Ordering::Relaxed), 1);

        server.shutdown();
        task.await.unwrap();
    }
}

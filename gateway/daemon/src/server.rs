//! Unix Socket Server
//!
//! Accepts local connections and serves the line protocol from
//! [`crate::protocol`]. Each connection runs in its own task; requests on a
//! connection are answered in order. Closing the connection cancels any
//! request still being processed for it.
//!
//! # Security
//!
//! The socket is created with mode 0600 so only the owning user can connect.
//! Callers are trusted to assert `user_id` and `tier`.

use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use gateway_core::Gateway;

use crate::protocol::{self, DaemonRequest, DaemonResponse, ProtocolError};

/// Server tuning
#[derive(Clone, Copy, Debug)]
pub struct ServerConfig {
    /// Connections served at once; extra connections are refused
    pub max_connections: usize,
    /// Longest accepted request line
    pub max_line_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_line_bytes: 1024 * 1024,
        }
    }
}

/// Unique identifier for one client connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", &self.0.to_string()[..8])
    }
}

/// Book-keeping for a live connection
struct ConnectionState {
    connected_at: Instant,
    requests: u64,
    handle: Option<JoinHandle<()>>,
}

/// Daemon server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Socket setup or accept failure
    #[error("socket error on {path}: {source}")]
    Socket {
        /// Socket path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// Serves the gateway on a Unix socket
pub struct DaemonServer {
    socket_path: PathBuf,
    gateway: Arc<Gateway>,
    config: ServerConfig,
    connections: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl DaemonServer {
    /// New server; nothing is bound until [`DaemonServer::run`]
    #[must_use]
    pub fn new(socket_path: PathBuf, gateway: Arc<Gateway>, config: ServerConfig) -> Self {
        Self {
            socket_path,
            gateway,
            config,
            connections: Arc::new(DashMap::new()),
        }
    }

    fn socket_error(&self, source: std::io::Error) -> ServerError {
        ServerError::Socket {
            path: self.socket_path.clone(),
            source,
        }
    }

    /// Create the parent directory and remove a stale socket file
    fn prepare_socket(&self) -> Result<(), ServerError> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.socket_error(e))?;
        }
        if self.socket_path.exists() {
            warn!(path = %self.socket_path.display(), "Removing stale socket");
            std::fs::remove_file(&self.socket_path).map_err(|e| self.socket_error(e))?;
        }
        Ok(())
    }

    /// Bind the socket
    pub fn bind(&self) -> Result<UnixListener, ServerError> {
        self.prepare_socket()?;
        let listener = UnixListener::bind(&self.socket_path).map_err(|e| self.socket_error(e))?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| self.socket_error(e))?;
        info!(path = %self.socket_path.display(), "Listening");
        Ok(listener)
    }

    /// Bind and serve until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener, shutdown).await;
        self.shutdown();
        Ok(())
    }

    /// Accept loop over an already bound listener
    pub async fn serve(&self, listener: UnixListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => self.accept(stream, &shutdown),
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
            }
        }
    }

    fn accept(&self, stream: UnixStream, shutdown: &CancellationToken) {
        self.connections.retain(|_, state| {
            state
                .handle
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
        });
        if self.connections.len() >= self.config.max_connections {
            warn!(
                max = self.config.max_connections,
                "Connection limit reached, refusing client"
            );
            return;
        }

        let conn_id = ConnectionId::new();
        self.connections.insert(
            conn_id,
            ConnectionState {
                connected_at: Instant::now(),
                requests: 0,
                handle: None,
            },
        );

        let connection = Connection {
            id: conn_id,
            gateway: Arc::clone(&self.gateway),
            connections: Arc::clone(&self.connections),
            max_line_bytes: self.config.max_line_bytes,
            cancel: shutdown.child_token(),
        };
        let handle = tokio::spawn(
            connection
                .run(stream)
                .instrument(info_span!("connection", %conn_id)),
        );
        if let Some(mut state) = self.connections.get_mut(&conn_id) {
            state.handle = Some(handle);
        }
    }

    /// Abort open connections and remove the socket file
    pub fn shutdown(&self) {
        for entry in self.connections.iter() {
            if let Some(handle) = &entry.handle {
                handle.abort();
            }
        }
        self.connections.clear();

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(error = %e, path = %self.socket_path.display(), "Failed to remove socket");
            }
        }
    }
}

/// Request lines read ahead of the one being answered
const READ_AHEAD: usize = 16;

/// What the reader hands to the responder
enum Inbound {
    Line(String),
    TooLong,
}

/// One client connection
struct Connection {
    id: ConnectionId,
    gateway: Arc<Gateway>,
    connections: Arc<DashMap<ConnectionId, ConnectionState>>,
    max_line_bytes: usize,
    cancel: CancellationToken,
}

impl Connection {
    /// Answer request lines in order while a separate reader watches the socket
    ///
    /// The reader keeps reading while a request is in flight, so a client
    /// hanging up cancels its outstanding requests instead of leaving them to
    /// run to completion.
    async fn run(self, stream: UnixStream) {
        debug!("Client connected");
        let (read_half, mut write_half) = stream.into_split();
        // Cancelled on hang-up or server shutdown
        let hangup = self.cancel.child_token();
        let (lines_tx, mut lines) = mpsc::channel(READ_AHEAD);
        let reader = tokio::spawn(
            read_lines(read_half, self.max_line_bytes, lines_tx, hangup.clone())
                .in_current_span(),
        );

        while let Some(inbound) = lines.recv().await {
            let response = match inbound {
                Inbound::Line(line) => self.respond(&line, hangup.child_token()).await,
                Inbound::TooLong => ProtocolError::LineTooLong {
                    limit: self.max_line_bytes,
                }
                .to_response(),
            };
            if let Some(mut state) = self.connections.get_mut(&self.id) {
                state.requests += 1;
            }
            if let Err(e) = write_response(&mut write_half, &response).await {
                warn!(error = %e, "Failed to write response, closing connection");
                break;
            }
        }

        hangup.cancel();
        if let Err(e) = reader.await {
            warn!(error = %e, "Connection reader ended abnormally");
        }

        if let Some((_, state)) = self.connections.remove(&self.id) {
            debug!(
                requests = state.requests,
                connected_ms = state.connected_at.elapsed().as_millis(),
                "Client disconnected"
            );
        }
    }

    async fn respond(&self, line: &str, cancel: CancellationToken) -> DaemonResponse {
        match protocol::parse_request(line) {
            Ok(request) => dispatch(&self.gateway, request, cancel).await,
            Err(e) => {
                debug!(error = %e, "Rejected malformed request");
                e.to_response()
            }
        }
    }
}

/// Read request lines until the client hangs up, a line is too long or
/// `hangup` fires
///
/// End of input and read errors cancel `hangup`. An oversized line stops
/// reading but lets requests already queued finish.
async fn read_lines(
    read_half: OwnedReadHalf,
    limit: usize,
    lines: mpsc::Sender<Inbound>,
    hangup: CancellationToken,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        let mut line = String::new();
        let mut limited = (&mut reader).take(limit as u64 + 1);
        let read = tokio::select! {
            () = hangup.cancelled() => return,
            read = limited.read_line(&mut line) => read,
        };
        let inbound = match read {
            Ok(0) => {
                debug!("Client closed its end");
                break;
            }
            Ok(_) if line.len() > limit && !line.ends_with('\n') => {
                // The responder closes the connection after answering this
                if lines.send(Inbound::TooLong).await.is_err() {
                    debug!("Responder gone, dropping oversized line notice");
                }
                return;
            }
            Ok(_) if line.trim().is_empty() => continue,
            Ok(_) => Inbound::Line(line),
            Err(e) => {
                warn!(error = %e, "Failed to read from client");
                break;
            }
        };
        if lines.send(inbound).await.is_err() {
            return;
        }
    }
    hangup.cancel();
}

/// Run one request against the gateway
pub async fn dispatch(
    gateway: &Gateway,
    request: DaemonRequest,
    cancel: CancellationToken,
) -> DaemonResponse {
    match request {
        DaemonRequest::Chat {
            request_id,
            user_id,
            tier,
            prompt,
            system_prompt,
            temperature,
            max_tokens,
        } => {
            let mut chat = protocol::chat_request(request_id, user_id, tier, prompt)
                .with_cancellation(cancel);
            if let Some(system) = system_prompt {
                chat = chat.with_system(system);
            }
            if let Some(temperature) = temperature {
                chat = chat.with_temperature(temperature);
            }
            if let Some(max_tokens) = max_tokens {
                chat = chat.with_max_tokens(max_tokens);
            }
            let request_id = chat.inbound.request_id.clone();
            let response = gateway.handle_chat(chat).await;
            protocol::chat_response(request_id, response)
        }
        DaemonRequest::Route {
            user_id,
            tier,
            prompt,
        } => {
            let ctx = protocol::routing_context(user_id, tier.as_deref(), prompt);
            match gateway.route(&ctx) {
                Ok(decision) => DaemonResponse::Route { decision },
                Err(e) => protocol::error_response(Some(ctx.request_id), &e, Default::default()),
            }
        }
        DaemonRequest::Stats => DaemonResponse::Stats {
            stats: Box::new(gateway.stats()),
        },
    }
}

async fn write_response<W>(writer: &mut W, response: &DaemonResponse) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(response)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}

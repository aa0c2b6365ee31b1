//! Connection driver: owns the WebSocket, every state transition, and the
//! reconnect timer.
//!
//! Public methods on [`RealtimeChannel`](crate::RealtimeChannel) never touch
//! the socket. They enqueue a [`Command`] and the driver applies commands,
//! inbound frames, open results and timer expiries one at a time, so every
//! transition and every dispatch happens in a single task turn.
//!
//! Outbound frames go through a per-connection writer task, so the driver
//! never waits on the socket.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;

use crate::config::ChannelConfig;
use crate::registry::Registry;
use crate::types::{ConnectionState, Envelope, Error};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Type aliases for WebSocket split halves
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type WsRead = futures_util::stream::SplitStream<WsStream>;
type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

type OpenFuture = Pin<Box<dyn Future<Output = Result<(WsWrite, WsRead), Error>> + Send>>;

/// Outbound half of an open connection. Frames are written by a dedicated
/// task so a peer that stops reading never blocks the driver loop.
struct Writer {
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// State shared between the handle and the driver
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    pub config: ChannelConfig,
    pub registry: Arc<Registry>,
    pub state: watch::Sender<ConnectionState>,
    pub attempts: AtomicU32,
}

impl Shared {
    pub(crate) fn new(config: ChannelConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            registry: Arc::new(Registry::default()),
            state,
            attempts: AtomicU32::new(0),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

pub(crate) enum Command {
    Connect,
    Disconnect,
    Send(String),
}

// ---------------------------------------------------------------------------
// WebSocket connect helper
// ---------------------------------------------------------------------------

async fn open_transport(url: String, timeout: Duration) -> Result<(WsWrite, WsRead), Error> {
    let (ws, _resp) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| Error::Timeout)??;
    Ok(ws.split())
}

/// Write queued frames until the queue closes, then send a close frame.
/// Returns early when a write fails or stalls past `write_timeout`.
async fn run_writer(
    mut ws_write: WsWrite,
    mut outbound: mpsc::UnboundedReceiver<String>,
    write_timeout: Duration,
) {
    while let Some(text) = outbound.recv().await {
        let frame = tungstenite::Message::Text(text.into());
        match tokio::time::timeout(write_timeout, ws_write.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("Failed to send message: {e}");
                return;
            }
            Err(_) => {
                tracing::warn!(?write_timeout, "Outbound write stalled, dropping connection");
                return;
            }
        }
    }
    if let Err(e) = ws_write.close().await {
        tracing::debug!("Error closing WebSocket: {e}");
    }
}

async fn writer_exit(writer: &mut Option<Writer>) {
    match writer {
        Some(writer) => {
            let _ = (&mut writer.task).await;
        }
        None => std::future::pending().await,
    }
}

async fn next_frame(
    read: &mut Option<WsRead>,
) -> Option<Result<tungstenite::Message, tungstenite::Error>> {
    match read {
        Some(read) => read.next().await,
        None => std::future::pending().await,
    }
}

async fn finish_open(pending: &mut Option<OpenFuture>) -> Result<(WsWrite, WsRead), Error> {
    match pending {
        Some(open) => open.await,
        None => std::future::pending().await,
    }
}

async fn reconnect_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Driver task
// ---------------------------------------------------------------------------

pub(crate) struct Driver {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    writer: Option<Writer>,
    ws_read: Option<WsRead>,
    pending_open: Option<OpenFuture>,
    reconnect_at: Option<Instant>,
}

impl Driver {
    pub(crate) fn new(shared: Arc<Shared>, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        Self {
            shared,
            commands,
            writer: None,
            ws_read: None,
            pending_open: None,
            reconnect_at: None,
        }
    }

    /// Runs until every channel handle has been dropped.
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            tracing::debug!("All channel handles dropped, stopping driver");
                            self.close_transport();
                            return;
                        }
                    }
                }

                result = finish_open(&mut self.pending_open) => {
                    self.pending_open = None;
                    self.on_open_result(result);
                }

                frame = next_frame(&mut self.ws_read) => {
                    self.on_frame(frame);
                }

                _ = writer_exit(&mut self.writer) => {
                    self.on_unplanned_close();
                }

                _ = reconnect_timer(self.reconnect_at) => {
                    let attempt = self.shared.attempts.load(Ordering::Acquire);
                    tracing::info!(attempt, "Reconnecting");
                    self.begin_open();
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => match self.shared.state() {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    tracing::debug!("connect() ignored: already connecting or connected");
                }
                ConnectionState::Disconnected => self.begin_open(),
            },
            Command::Disconnect => self.disconnect(),
            Command::Send(text) => self.send(text),
        }
    }

    fn begin_open(&mut self) {
        self.reconnect_at = None;
        self.shared.state.send_replace(ConnectionState::Connecting);
        let config = &self.shared.config;
        tracing::debug!(url = %config.url, "Opening connection");
        self.pending_open = Some(Box::pin(open_transport(
            config.url.clone(),
            config.connect_timeout,
        )));
    }

    fn on_open_result(&mut self, result: Result<(WsWrite, WsRead), Error>) {
        match result {
            Ok((ws_write, ws_read)) => {
                let (outbound, queue) = mpsc::unbounded_channel();
                let task = tokio::spawn(run_writer(
                    ws_write,
                    queue,
                    self.shared.config.write_timeout,
                ));
                self.writer = Some(Writer { outbound, task });
                self.ws_read = Some(ws_read);
                self.shared.attempts.store(0, Ordering::Release);
                self.shared.state.send_replace(ConnectionState::Connected);
                tracing::info!(url = %self.shared.config.url, "Connected");
                self.emit_status(true);
            }
            Err(e) => {
                tracing::warn!("Connection attempt failed: {e}");
                self.on_unplanned_close();
            }
        }
    }

    fn on_frame(&mut self, frame: Option<Result<tungstenite::Message, tungstenite::Error>>) {
        match frame {
            Some(Ok(tungstenite::Message::Text(text))) => {
                self.shared.registry.dispatch_frame(text.as_str());
            }
            Some(Ok(tungstenite::Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => {
                    self.shared.registry.dispatch_frame(text);
                }
                Err(e) => tracing::warn!("Discarding non-UTF-8 binary frame: {e}"),
            },
            Some(Ok(tungstenite::Message::Close(close))) => {
                tracing::info!(?close, "Server sent close frame");
            }
            Some(Ok(_)) => {
                // Ping/pong control frames are answered by tungstenite
            }
            Some(Err(e)) => {
                tracing::warn!("WebSocket error: {e}");
                self.on_unplanned_close();
            }
            None => {
                tracing::info!("WebSocket stream ended");
                self.on_unplanned_close();
            }
        }
    }

    /// Transport lost (or never opened) without a `disconnect()` call.
    fn on_unplanned_close(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.task.abort();
        }
        self.ws_read = None;
        let previous = self.shared.state.send_replace(ConnectionState::Disconnected);
        self.schedule_reconnect();
        if previous != ConnectionState::Disconnected {
            self.emit_status(false);
        }
    }

    fn schedule_reconnect(&mut self) {
        let policy = &self.shared.config.reconnect;
        let attempts = self.shared.attempts.load(Ordering::Acquire);
        if attempts < policy.max_attempts {
            let attempt = attempts + 1;
            self.shared.attempts.store(attempt, Ordering::Release);
            let delay = policy.delay_for(attempt);
            tracing::info!(
                attempt,
                max_attempts = policy.max_attempts,
                ?delay,
                "Scheduling reconnect"
            );
            self.reconnect_at = Some(Instant::now() + delay);
        } else {
            tracing::warn!(
                max_attempts = policy.max_attempts,
                "Reconnect attempts exhausted, staying disconnected until connect() is called"
            );
        }
    }

    fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.pending_open = None;
        self.shared.attempts.store(0, Ordering::Release);
        self.close_transport();
        let previous = self.shared.state.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            tracing::info!("Disconnected by request");
            self.emit_status(false);
        }
    }

    fn send(&mut self, text: String) {
        let Some(writer) = self.writer.as_ref() else {
            tracing::debug!("Dropping outbound message: not connected");
            return;
        };
        if writer.outbound.send(text).is_err() {
            // Writer already exited; its exit arm drives the reconnect.
            tracing::debug!("Dropping outbound message: writer stopped");
        }
    }

    /// Let the writer flush what is queued and send a close frame, bounded by
    /// `CLOSE_TIMEOUT`. Never waits on the socket itself.
    fn close_transport(&mut self) {
        self.ws_read = None;
        if let Some(Writer { outbound, mut task }) = self.writer.take() {
            drop(outbound);
            tokio::spawn(async move {
                if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                    tracing::debug!("Timed out closing WebSocket");
                    task.abort();
                }
            });
        }
    }

    fn emit_status(&self, connected: bool) {
        self.shared
            .registry
            .dispatch(&Envelope::connection_status(connected));
    }
}

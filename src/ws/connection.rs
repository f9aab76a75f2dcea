#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;

use backoff::backoff::{Backoff as _, Constant};
use tokio::io::{BufReader, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::config::Config;
use super::error::WsError;
use super::frame::{CLOSE_NORMAL, FrameReader, FrameWriter, Inbound, Limits, OpCode};
use super::handshake::{self, Negotiated};
use super::keepalive::{Keepalive, Signals};
use super::traits::{BoxedTransport, Connector, Listener};
use super::transport::{Endpoint, TcpConnector, TlsConnector};
use crate::Result;
use crate::error::{Error, Kind};

/// Buffered transport the handshake runs on. Bytes the server sends right after the upgrade
/// response stay in the buffer and are read as frames.
type Stream = BufReader<BoxedTransport>;
type Reader = FrameReader<ReadHalf<Stream>>;
type Writer = FrameWriter<WriteHalf<Stream>>;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting out the reconnect delay after a connection ended
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
    /// [`Client::stop`] was called, or a TLS failure ended the client for good
    Stopped,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Outbound half of the current connection, shared by callers of [`Client::write`], the read
/// loop (PONG and close echoes) and the keepalive task.
///
/// The lock serializes whole frames, so frames from different tasks never interleave on the
/// wire. Holds nothing while no connection is open, in which case sends are dropped.
///
/// A peer that stops reading can park a send inside the lock indefinitely. [`close`] cancels
/// the abort token first, which releases such a send before the writer is taken out.
///
/// [`close`]: Self::close
#[derive(Clone, Default)]
pub(crate) struct SharedWriter {
    slot: Arc<Mutex<Option<Writer>>>,
    /// Replaced on every [`install`](Self::install); cancelled by [`close`](Self::close)
    abort: Arc<StdMutex<CancellationToken>>,
}

/// A frame waiting for the writer lock.
#[derive(Clone, Copy)]
enum Outbound<'payload> {
    Text(&'payload str),
    Control(OpCode, &'payload [u8]),
}

impl SharedWriter {
    pub(crate) async fn install(&self, writer: Writer) {
        let mut slot = self.slot.lock().await;
        *self.abort.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        *slot = Some(writer);
    }

    pub(crate) async fn send_text(&self, message: &str) -> Result<()> {
        self.send(Outbound::Text(message)).await
    }

    pub(crate) async fn send_control(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        self.send(Outbound::Control(opcode, payload)).await
    }

    async fn send(&self, frame: Outbound<'_>) -> Result<()> {
        let abort = self.abort_token();

        let mut slot = tokio::select! {
            biased;
            () = abort.cancelled() => {
                Self::dropped();
                return Ok(());
            }
            slot = self.slot.lock() => slot,
        };
        let Some(writer) = slot.as_mut() else {
            #[cfg(feature = "tracing")]
            if matches!(frame, Outbound::Text(_)) {
                tracing::debug!("No open connection, dropping outbound message");
            }
            return Ok(());
        };

        let result = tokio::select! {
            biased;
            () = abort.cancelled() => {
                // A partial frame may be on the wire
                *slot = None;
                Self::dropped();
                return Ok(());
            }
            result = async {
                match frame {
                    Outbound::Text(message) => writer.write_text(message).await,
                    Outbound::Control(opcode, payload) => {
                        writer.write_control(opcode, payload).await
                    }
                }
            } => result,
        };
        Self::discard_on_io_error(&mut slot, &result);
        result
    }

    /// Releases any send stuck on the current writer, then takes the writer out and drops it,
    /// closing the outbound half of the transport.
    pub(crate) async fn close(&self) {
        self.abort_token().cancel();
        drop(self.slot.lock().await.take());
    }

    fn abort_token(&self) -> CancellationToken {
        self.abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn dropped() {
        #[cfg(feature = "tracing")]
        tracing::debug!("Connection closing, dropping outbound frame");
    }

    /// A failed write leaves the stream in an unknown state, so nothing else is sent on it.
    fn discard_on_io_error(slot: &mut Option<Writer>, result: &Result<()>) {
        if let Err(e) = result
            && e.kind() == Kind::Io
        {
            *slot = None;
        }
    }
}

/// One connection attempt, from dialing until the socket is closed.
#[derive(Debug)]
struct Connection {
    /// Child of the client's stop token; cancelled by a deliberate local close
    local_close: CancellationToken,
    /// Cancelled by the keepalive when the PONG deadline passes
    pong_deadline: CancellationToken,
    /// Cancelled when an outbound write hits a dead socket
    write_failed: CancellationToken,
    /// Cancelled once the connection is fully torn down
    ended: CancellationToken,
    /// [`Client::disconnect`] sent a close frame on this connection
    close_requested: AtomicBool,
    /// The upgrade completed and [`Listener::on_open`] was called
    opened: AtomicBool,
}

impl Connection {
    fn new(stop: &CancellationToken) -> Self {
        Self {
            local_close: stop.child_token(),
            pong_deadline: CancellationToken::new(),
            write_failed: CancellationToken::new(),
            ended: CancellationToken::new(),
            close_requested: AtomicBool::new(false),
            opened: AtomicBool::new(false),
        }
    }

    /// Whether this side chose to end the connection, in which case its failures are not
    /// reported.
    fn closed_locally(&self) -> bool {
        self.close_requested.load(Ordering::Acquire) || self.local_close.is_cancelled()
    }
}

struct ClientInner {
    endpoint: Endpoint,
    config: Config,
    listener: Box<dyn Listener>,
    connector: Box<dyn Connector>,
    /// Cancelled by [`Client::stop`] or a fatal failure; never reset
    stop: CancellationToken,
    /// Guards against two concurrent [`Client::start`] loops
    running: AtomicBool,
    writer: SharedWriter,
    current: StdMutex<Option<Arc<Connection>>>,
    /// Watch channel sender for state changes
    state_tx: watch::Sender<ConnectionState>,
    /// Keeps the channel open so state updates are never lost
    state_rx: watch::Receiver<ConnectionState>,
}

/// A WebSocket client that keeps one connection to its endpoint alive.
///
/// [`start`](Self::start) drives the connection: it dials, performs the upgrade, delivers
/// messages to the [`Listener`] and reconnects after every failure or close until
/// [`stop`](Self::stop) is called. [`write`](Self::write) and
/// [`disconnect`](Self::disconnect) may be called concurrently from other tasks.
///
/// # Example
///
/// ```no_run
/// use chatsocket::ws::{Client, Listener, config::Config};
///
/// struct Echo;
///
/// impl Listener for Echo {
///     fn on_message(&self, text: String) {
///         println!("{text}");
///     }
/// }
///
/// # async fn run() -> chatsocket::Result<()> {
/// let client = Client::new("wss://chat.example.com/socket", Echo, Config::default())?;
///
/// let driver = client.clone();
/// tokio::spawn(async move { driver.start().await });
///
/// client.write("PING :hello").await?;
/// client.stop();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Creates a client for `url`, using TLS for `wss://` and plain TCP for `ws://`.
    ///
    /// Nothing is dialed until [`start`](Self::start) runs.
    pub fn new<L: Listener>(url: &str, listener: L, config: Config) -> Result<Self> {
        let endpoint = Endpoint::parse(url)?;
        if endpoint.is_tls() {
            let connector = TlsConnector::new(&config.trust)?;
            Self::build(endpoint, listener, config, Box::new(connector))
        } else {
            Self::build(endpoint, listener, config, Box::new(TcpConnector))
        }
    }

    /// Creates a client that opens its transports through `connector`.
    pub fn with_connector<L: Listener, C: Connector>(
        url: &str,
        listener: L,
        config: Config,
        connector: C,
    ) -> Result<Self> {
        Self::build(Endpoint::parse(url)?, listener, config, Box::new(connector))
    }

    fn build<L: Listener>(
        endpoint: Endpoint,
        listener: L,
        config: Config,
        connector: Box<dyn Connector>,
    ) -> Result<Self> {
        validate_headers(&config.headers)?;
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            inner: Arc::new(ClientInner {
                endpoint,
                config,
                listener: Box::new(listener),
                connector,
                stop: CancellationToken::new(),
                running: AtomicBool::new(false),
                writer: SharedWriter::default(),
                current: StdMutex::new(None),
                state_tx,
                state_rx,
            }),
        })
    }

    /// Runs the connection loop until [`stop`](Self::stop) is called or a TLS failure occurs.
    ///
    /// Every failure other than one following a local close is reported through
    /// [`Listener::on_failure`], after which the client waits the reconnect delay and dials
    /// again. Returns immediately if the client was already stopped, and fails if another
    /// `start` is running on this client.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::AcqRel) {
            return Err(Error::validation("client is already running"));
        }
        let _running = RunningGuard(&inner.running);

        let mut backoff: Constant = inner.config.reconnect.clone().into();
        let mut attempt = 0_u32;

        while !inner.stop.is_cancelled() {
            self.set_state(ConnectionState::Connecting);

            let connection = Arc::new(Connection::new(&inner.stop));
            self.set_current(Some(Arc::clone(&connection)));
            let outcome = self.run_connection(&connection).await;
            inner.writer.close().await;
            self.set_current(None);
            connection.ended.cancel();

            if connection.opened.load(Ordering::Acquire) {
                attempt = 0;
                backoff.reset();
            }

            match outcome {
                Ok(()) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(endpoint = %inner.endpoint, "Connection closed");
                }
                Err(e) if connection.closed_locally() => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(error = %e, "Ignoring failure after local close");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
                Err(e) => {
                    let fatal = e.is_fatal();
                    #[cfg(feature = "tracing")]
                    tracing::warn!(endpoint = %inner.endpoint, error = %e, "Connection failed");
                    inner.listener.on_failure(e);

                    if fatal {
                        #[cfg(feature = "tracing")]
                        tracing::error!("TLS failure, not reconnecting");
                        inner.stop.cancel();
                        break;
                    }
                }
            }

            if inner.stop.is_cancelled() {
                break;
            }

            attempt = attempt.saturating_add(1);
            self.set_state(ConnectionState::Reconnecting { attempt });

            if let Some(delay) = backoff.next_backoff() {
                #[cfg(feature = "tracing")]
                tracing::debug!(attempt, ?delay, "Reconnecting");
                tokio::select! {
                    () = inner.stop.cancelled() => break,
                    () = sleep(delay) => {}
                }
            }
        }

        self.set_state(ConnectionState::Stopped);
        Ok(())
    }

    /// Dials, upgrades and reads until the connection ends.
    ///
    /// `Ok` means the connection ended without a failure to report: a close handshake, a clean
    /// end of stream, or a local close.
    async fn run_connection(&self, connection: &Connection) -> Result<()> {
        let inner = &self.inner;

        let (mut reader, negotiated) = tokio::select! {
            () = connection.local_close.cancelled() => return Ok(()),
            opened = self.open() => opened?,
        };

        connection.opened.store(true, Ordering::Release);
        self.set_state(ConnectionState::Connected {
            since: Instant::now(),
        });
        #[cfg(feature = "tracing")]
        tracing::info!(
            endpoint = %inner.endpoint,
            compression = negotiated.compression,
            "WebSocket connected"
        );
        #[cfg(not(feature = "tracing"))]
        let _ = &negotiated;

        let keepalive = inner.config.keepalive.then(|| {
            Keepalive::spawn(
                inner.writer.clone(),
                inner.config.ping_interval,
                inner.config.pong_timeout,
                connection.local_close.child_token(),
                Signals {
                    expired: connection.pong_deadline.clone(),
                    write_failed: connection.write_failed.clone(),
                },
            )
        });

        inner.listener.on_open();

        self.read_loop(&mut reader, connection, keepalive.as_ref())
            .await
    }

    async fn open(&self) -> Result<(Reader, Negotiated)> {
        let inner = &self.inner;

        let transport = inner.connector.connect(&inner.endpoint).await?;
        let mut stream = BufReader::new(transport);
        let negotiated =
            handshake::perform(&mut stream, &inner.endpoint, &inner.config.headers).await?;

        let (read_half, write_half) = tokio::io::split(stream);
        inner
            .writer
            .install(FrameWriter::new(write_half, negotiated.compression))
            .await;

        let limits = Limits {
            max_frame_size: inner.config.max_frame_size,
            max_message_size: inner.config.max_message_size,
        };
        let reader = FrameReader::with_limits(read_half, negotiated.compression, limits);

        Ok((reader, negotiated))
    }

    async fn read_loop(
        &self,
        reader: &mut Reader,
        connection: &Connection,
        keepalive: Option<&Keepalive>,
    ) -> Result<()> {
        loop {
            let inbound = tokio::select! {
                ended = interrupted(connection) => return ended,
                inbound = reader.read_frame() => inbound?,
            };

            let Some(inbound) = inbound else {
                #[cfg(feature = "tracing")]
                tracing::debug!("Server ended the stream without a close frame");
                return Ok(());
            };

            // Answering a PING waits on the writer, which a stalled write can hold
            let finished = tokio::select! {
                ended = interrupted(connection) => return ended,
                finished = self.dispatch(inbound, connection, keepalive) => finished?,
            };
            if finished {
                return Ok(());
            }
        }
    }

    /// Handles one inbound frame. Returns `true` once the server closed the connection.
    async fn dispatch(
        &self,
        inbound: Inbound,
        connection: &Connection,
        keepalive: Option<&Keepalive>,
    ) -> Result<bool> {
        match inbound {
            Inbound::Message(text) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(%text, "Received WebSocket text message");
                self.inner.listener.on_message(text);
            }
            Inbound::Ping(payload) => {
                self.inner
                    .writer
                    .send_control(OpCode::Pong, &payload)
                    .await?;
            }
            Inbound::Pong(_) => {
                if let Some(keepalive) = keepalive {
                    keepalive.pong_received();
                }
            }
            Inbound::Close(payload) => {
                self.answer_close(connection, &payload).await;
                return Ok(true);
            }
            Inbound::Fragment | Inbound::Ignored => {}
        }
        Ok(false)
    }

    /// Completes a closing handshake started by the server.
    async fn answer_close(&self, connection: &Connection, payload: &[u8]) {
        if connection.close_requested.load(Ordering::Acquire) {
            // Our close frame went out first, this is the echo
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            code = payload
                .get(..2)
                .and_then(|code| <[u8; 2]>::try_from(code).ok())
                .map(u16::from_be_bytes),
            "Server closed the connection"
        );

        let status = payload.get(..2).unwrap_or_default();
        if let Err(e) = self.inner.writer.send_control(OpCode::Close, status).await {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %e, "Unable to echo close frame");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    /// Sends `message` as one text frame.
    ///
    /// Dropped without error while no connection is open or after [`stop`](Self::stop). A
    /// failed write tears the connection down, which the reconnect loop then reports and
    /// recovers from.
    pub async fn write(&self, message: &str) -> Result<()> {
        if self.inner.stop.is_cancelled() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Client stopped, dropping outbound message");
            return Ok(());
        }

        let result = self.inner.writer.send_text(message).await;
        if let Err(e) = &result
            && e.kind() == Kind::Io
            && let Some(connection) = self.current()
        {
            connection.write_failed.cancel();
        }
        result
    }

    /// Stops the client: the current connection is torn down and no further attempts are made.
    ///
    /// Returns immediately; [`start`](Self::start) finishes shortly after.
    pub fn stop(&self) {
        #[cfg(feature = "tracing")]
        tracing::info!(endpoint = %self.inner.endpoint, "Stopping client");
        self.inner.stop.cancel();
    }

    /// Closes the current connection with status 1000 and waits (up to the configured close
    /// timeout) for the server to answer before closing the socket.
    ///
    /// The client stays active and reconnects after the usual delay; failures caused by this
    /// close are not reported.
    pub async fn disconnect(&self) {
        let Some(connection) = self.current() else {
            return;
        };

        connection.close_requested.store(true, Ordering::Release);
        let closing = async {
            if let Err(e) = self
                .inner
                .writer
                .send_control(OpCode::Close, &CLOSE_NORMAL.to_be_bytes())
                .await
            {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, "Unable to send close frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
            connection.ended.cancelled().await;
        };

        // The deadline also covers sending the close frame, which waits behind any stalled write
        if timeout(self.inner.config.close_timeout, closing)
            .await
            .is_err()
        {
            #[cfg(feature = "tracing")]
            tracing::debug!("Server did not finish the closing handshake in time");
            connection.local_close.cancel();
        }
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    ///
    /// Returns a receiver that notifies when the connection state changes.
    /// This is useful for detecting reconnections.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether [`stop`](Self::stop) was called or a fatal failure ended the client.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state_tx.send_replace(state);
    }

    fn current(&self) -> Option<Arc<Connection>> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current(&self, connection: Option<Arc<Connection>>) {
        *self
            .inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = connection;
    }
}

/// Resolves once something outside the read loop ends `connection`.
async fn interrupted(connection: &Connection) -> Result<()> {
    tokio::select! {
        () = connection.local_close.cancelled() => Ok(()),
        () = connection.pong_deadline.cancelled() => Err(WsError::PongTimeout.into()),
        () = connection.write_failed.cancelled() => Err(WsError::ConnectionClosed.into()),
    }
}

/// Clears the running flag when [`Client::start`] returns or its future is dropped.
struct RunningGuard<'flag>(&'flag AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Rejects headers that would corrupt the upgrade request.
fn validate_headers(headers: &[(String, String)]) -> Result<()> {
    for (name, value) in headers {
        if name.is_empty() || name.contains([':', ' ', '\t']) {
            return Err(Error::validation(format!("invalid header name {name:?}")));
        }
        if name.contains(['\r', '\n']) || value.contains(['\r', '\n']) {
            return Err(Error::validation(format!(
                "header {name:?} contains a line break"
            )));
        }
    }
    Ok(())
}

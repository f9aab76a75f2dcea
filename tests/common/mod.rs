#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Deeply nested uses in sub-modules are falsely flagged as being unused"
)]

use std::net::SocketAddr;
use std::time::Duration;

use chatsocket::Result;
use chatsocket::error::Error;
use chatsocket::ws::config::{Config, ReconnectConfig};
use chatsocket::ws::handshake::accept_key;
use chatsocket::ws::{Client, Listener};
use futures_util::{SinkExt as _, StreamExt as _};
use tokio::io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Upper bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(3);

pub const OP_CONTINUATION: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xA;

/// How the raw server answers the upgrade request.
#[derive(Debug, Clone, Copy)]
pub enum Upgrade {
    Accept { deflate: bool },
    /// 101 with a digest that does not match the client key
    WrongAccept,
    /// A non-101 response with this status line
    Status(&'static str),
}

/// Bare TCP server speaking just enough RFC 6455 to script a conversation frame by frame.
pub struct RawServer {
    pub addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<RawConnection>,
}

impl RawServer {
    pub async fn start(upgrade: Upgrade) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connection_tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let mut stream = BufReader::new(stream);
                let Some(request) = read_request(&mut stream).await else {
                    continue;
                };
                let key = header(&request, "Sec-WebSocket-Key").unwrap_or_default();

                let response = match upgrade {
                    Upgrade::Accept { deflate } => {
                        let extensions = if deflate {
                            "Sec-WebSocket-Extensions: permessage-deflate; \
                             client_no_context_takeover; server_no_context_takeover\r\n"
                        } else {
                            ""
                        };
                        format!(
                            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
                             Connection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n{extensions}\r\n",
                            accept_key(&key)
                        )
                    }
                    Upgrade::WrongAccept => format!(
                        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
                         Connection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
                        accept_key("not the key")
                    ),
                    Upgrade::Status(status_line) => {
                        format!("{status_line}\r\nContent-Length: 0\r\n\r\n")
                    }
                };

                if stream.get_mut().write_all(response.as_bytes()).await.is_err() {
                    continue;
                }
                if connection_tx.send(RawConnection { stream, request }).is_err() {
                    break;
                }
            }
        });

        Self { addr, connections }
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}/chat", self.addr)
    }

    /// Waits for the next client to finish its upgrade request.
    pub async fn accept(&mut self) -> RawConnection {
        timeout(TIMEOUT, self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .unwrap()
    }

    /// Returns a connection that already arrived, without waiting.
    pub fn try_accept(&mut self) -> Option<RawConnection> {
        self.connections.try_recv().ok()
    }
}

async fn read_request(stream: &mut BufReader<TcpStream>) -> Option<Vec<String>> {
    let mut request = Vec::new();
    loop {
        let mut line = String::new();
        if stream.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let line = line.trim_end().to_owned();
        if line.is_empty() {
            return Some(request);
        }
        request.push(line);
    }
}

fn header(request: &[String], name: &str) -> Option<String> {
    request.iter().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_owned())
    })
}

/// A frame as the client put it on the wire, unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFrame {
    pub fin: bool,
    pub rsv1: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// Server side of one upgraded connection.
pub struct RawConnection {
    stream: BufReader<TcpStream>,
    /// Request line and headers of the upgrade request
    pub request: Vec<String>,
}

impl RawConnection {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        header(&self.request, name)
    }

    pub async fn send(&mut self, frame: &[u8]) {
        self.stream.get_mut().write_all(frame).await.unwrap();
    }

    pub async fn read_frame(&mut self) -> ClientFrame {
        timeout(TIMEOUT, self.read_frame_inner())
            .await
            .expect("timed out waiting for a client frame")
    }

    async fn read_frame_inner(&mut self) -> ClientFrame {
        let mut head = [0_u8; 2];
        self.stream.read_exact(&mut head).await.unwrap();
        assert!(head[1] & 0x80 != 0, "client frames must be masked");

        let len = match head[1] & 0x7F {
            126 => u64::from(self.stream.read_u16().await.unwrap()),
            127 => self.stream.read_u64().await.unwrap(),
            len => u64::from(len),
        };

        let mut key = [0_u8; 4];
        self.stream.read_exact(&mut key).await.unwrap();
        let mut payload = vec![0_u8; usize::try_from(len).unwrap()];
        self.stream.read_exact(&mut payload).await.unwrap();
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }

        ClientFrame {
            fin: head[0] & 0x80 != 0,
            rsv1: head[0] & 0x40 != 0,
            opcode: head[0] & 0x0F,
            payload,
        }
    }

    /// Asserts the client sends nothing for `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        let mut byte = [0_u8; 1];
        let read = timeout(window, self.stream.read(&mut byte)).await;
        assert!(read.is_err(), "unexpected client bytes: {read:?}");
    }

    /// Waits until the client closes its side of the TCP connection.
    pub async fn expect_eof(&mut self) {
        let mut rest = Vec::new();
        timeout(TIMEOUT, self.stream.read_to_end(&mut rest))
            .await
            .expect("client never closed the socket")
            .ok();
    }
}

/// Encodes an unmasked server frame.
#[must_use]
pub fn server_frame(fin: bool, rsv1: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![(u8::from(fin) << 7) | (u8::from(rsv1) << 6) | opcode];
    match payload.len() {
        len if len < 126 => frame.push(u8::try_from(len).unwrap()),
        len if len <= usize::from(u16::MAX) => {
            frame.push(126);
            frame.extend_from_slice(&u16::try_from(len).unwrap().to_be_bytes());
        }
        len => {
            frame.push(127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(payload);
    frame
}

#[must_use]
pub fn text(payload: &str) -> Vec<u8> {
    server_frame(true, false, OP_TEXT, payload.as_bytes())
}

/// tokio-tungstenite echo server, standing in for a third-party WebSocket implementation.
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };

            tokio::spawn(async move {
                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (mut write, mut read) = ws_stream.split();
                while let Some(Ok(message)) = read.next().await {
                    if message.is_text() && write.send(message).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

/// Everything a [`Listener`] was told, in order.
#[derive(Debug)]
pub enum Event {
    Open,
    Message(String),
    Failure(Error),
}

pub struct ChannelListener(mpsc::UnboundedSender<Event>);

impl Listener for ChannelListener {
    fn on_open(&self) {
        _ = self.0.send(Event::Open);
    }

    fn on_message(&self, text: String) {
        _ = self.0.send(Event::Message(text));
    }

    fn on_failure(&self, error: Error) {
        _ = self.0.send(Event::Failure(error));
    }
}

pub struct Events(mpsc::UnboundedReceiver<Event>);

impl Events {
    pub async fn next(&mut self) -> Event {
        timeout(TIMEOUT, self.0.recv())
            .await
            .expect("timed out waiting for a listener event")
            .unwrap()
    }

    pub async fn opened(&mut self) {
        match self.next().await {
            Event::Open => {}
            other => panic!("expected open, got {other:?}"),
        }
    }

    pub async fn message(&mut self) -> String {
        match self.next().await {
            Event::Message(text) => text,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    pub async fn failure(&mut self) -> Error {
        match self.next().await {
            Event::Failure(error) => error,
            other => panic!("expected a failure, got {other:?}"),
        }
    }

    /// Asserts no event arrives for `window`.
    pub async fn expect_none(&mut self, window: Duration) {
        let next = timeout(window, self.0.recv()).await;
        assert!(next.is_err(), "unexpected listener event: {next:?}");
    }
}

#[must_use]
pub fn listener() -> (ChannelListener, Events) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelListener(tx), Events(rx))
}

/// Defaults with a short reconnect delay so tests observe reconnection quickly.
#[must_use]
pub fn fast_config() -> Config {
    Config::builder()
        .reconnect(ReconnectConfig::with_delay(Duration::from_millis(50)))
        .build()
}

/// Runs [`Client::start`] in the background.
#[must_use]
pub fn spawn(client: &Client) -> JoinHandle<Result<()>> {
    let client = client.clone();
    tokio::spawn(async move { client.start().await })
}

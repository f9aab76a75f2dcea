//! RFC 6455 framing for the client side of a connection.
//!
//! [`FrameReader`] owns the inbound half of the stream and turns frames into [`Inbound`]
//! events, reassembling fragmented messages and inflating permessage-deflate payloads.
//! [`FrameWriter`] owns the outbound half; every frame it emits is masked with a fresh key.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use std::io;
use std::mem;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use super::deflate::{self, COMPRESSION_THRESHOLD};
use super::error::WsError;
use crate::Result;

const FIN_BIT: u8 = 0b1000_0000;
const RSV1_BIT: u8 = 0b0100_0000;
const OPCODE_MASK: u8 = 0b0000_1111;
const CONTROL_BIT: u8 = 0b0000_1000;
const MASK_BIT: u8 = 0b1000_0000;
const LEN_MASK: u8 = 0b0111_1111;

const MAX_INLINE_LEN: u8 = 125;
const LEN_16_MARKER: u8 = 126;
const LEN_64_MARKER: u8 = 127;

/// Status code sent when this client closes a connection on purpose.
pub const CLOSE_NORMAL: u16 = 1000;

/// WebSocket opcodes as defined in RFC 6455 Section 5.2.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Any value RFC 6455 leaves reserved. Frames carrying one are consumed and dropped.
    Reserved(u8),
}

impl OpCode {
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & OPCODE_MASK {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(bits) => bits & OPCODE_MASK,
        }
    }

    /// Control frames are the ones whose opcode has the high bit set.
    #[must_use]
    pub fn is_control(self) -> bool {
        self.bits() & CONTROL_BIT != 0
    }
}

/// Transient per-frame header values.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    /// permessage-deflate marker. Only meaningful when compression was negotiated.
    pub rsv1: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub len: u64,
}

/// What one inbound frame amounted to.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete text message
    Message(String),
    /// A data fragment was buffered; the message is not complete yet
    Fragment,
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// Close frame with its raw payload (status code and reason)
    Close(Vec<u8>),
    /// Frame consumed without producing anything: reserved opcodes and binary messages
    Ignored,
}

/// Size limits applied while reading.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub(crate) max_frame_size: usize,
    pub(crate) max_message_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_size: usize::MAX,
            max_message_size: usize::MAX,
        }
    }
}

/// Reassembly state for the single message that may be in flight on a connection.
#[derive(Debug, Default)]
struct ReadState {
    /// permessage-deflate was negotiated for this connection
    compression: bool,
    /// The first fragment of the in-flight message had RSV1 set
    next_frame_compressed: bool,
    /// Opcode of the first fragment of the in-flight message
    kind: Option<OpCode>,
    /// Payload bytes received so far (still compressed when `next_frame_compressed`)
    message: Vec<u8>,
}

impl ReadState {
    fn reset(&mut self) {
        self.next_frame_compressed = false;
        self.kind = None;
        self.message = Vec::new();
    }
}

/// Parses server frames off the inbound half of a connection.
#[derive(Debug)]
pub struct FrameReader<R> {
    source: R,
    state: ReadState,
    limits: Limits,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// `compression` is whether permessage-deflate was negotiated in the handshake.
    pub fn new(source: R, compression: bool) -> Self {
        Self::with_limits(source, compression, Limits::default())
    }

    pub(crate) fn with_limits(source: R, compression: bool, limits: Limits) -> Self {
        Self {
            source,
            state: ReadState {
                compression,
                ..ReadState::default()
            },
            limits,
        }
    }

    /// Reads exactly one frame.
    ///
    /// Returns `Ok(None)` when the peer ends the stream cleanly on a frame boundary. Running
    /// out of bytes inside a frame is an [`io::ErrorKind::UnexpectedEof`] error.
    pub async fn read_frame(&mut self) -> Result<Option<Inbound>> {
        let Some(header) = self.read_header().await? else {
            return Ok(None);
        };

        let len = usize::try_from(header.len)
            .ok()
            .filter(|len| *len <= self.limits.max_frame_size)
            .ok_or(WsError::FrameTooLarge {
                len: header.len,
                max: self.limits.max_frame_size,
            })?;

        let mut payload = vec![0; len];
        if len > 0 {
            self.source.read_exact(&mut payload).await?;
        }
        if let Some(key) = header.mask {
            apply_mask(&mut payload, key);
        }

        let inbound = match header.opcode {
            OpCode::Ping => Inbound::Ping(payload),
            OpCode::Pong => Inbound::Pong(payload),
            OpCode::Close => Inbound::Close(payload),
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                self.on_data(header, payload)?
            }
            OpCode::Reserved(_) => Inbound::Ignored,
        };

        Ok(Some(inbound))
    }

    async fn read_header(&mut self) -> Result<Option<FrameHeader>> {
        let first = match self.source.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let second = self.source.read_u8().await?;

        let len = match second & LEN_MASK {
            LEN_16_MARKER => u64::from(self.source.read_u16().await?),
            LEN_64_MARKER => self.source.read_u64().await?,
            short => u64::from(short),
        };

        // Servers must not mask, but a masked frame is still well formed.
        let mask = if second & MASK_BIT == 0 {
            None
        } else {
            let mut key = [0; 4];
            self.source.read_exact(&mut key).await?;
            Some(key)
        };

        Ok(Some(FrameHeader {
            fin: first & FIN_BIT != 0,
            rsv1: first & RSV1_BIT != 0,
            opcode: OpCode::from_bits(first),
            mask,
            len,
        }))
    }

    fn on_data(&mut self, header: FrameHeader, payload: Vec<u8>) -> Result<Inbound> {
        let state = &mut self.state;

        let compressed = if header.opcode == OpCode::Continuation {
            state.next_frame_compressed
        } else {
            if !state.message.is_empty() {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    dropped = state.message.len(),
                    "New message started before the previous one finished"
                );
                state.reset();
            }
            state.kind = Some(header.opcode);
            state.compression && header.rsv1
        };

        if state.message.len().saturating_add(payload.len()) > self.limits.max_message_size {
            state.reset();
            return Err(WsError::MessageTooLarge {
                max: self.limits.max_message_size,
            }
            .into());
        }
        state.message.extend_from_slice(&payload);

        if !header.fin {
            if header.opcode != OpCode::Continuation {
                state.next_frame_compressed = compressed;
            }
            return Ok(Inbound::Fragment);
        }

        let kind = state.kind.unwrap_or(OpCode::Text);
        let assembled = mem::take(&mut state.message);
        state.reset();

        let bytes = if compressed {
            deflate::decompress(&assembled, self.limits.max_message_size)?
        } else {
            assembled
        };

        if kind == OpCode::Binary {
            #[cfg(feature = "tracing")]
            tracing::trace!(len = bytes.len(), "Dropping binary message");
            return Ok(Inbound::Ignored);
        }
        if bytes.len() > self.limits.max_message_size {
            return Err(WsError::MessageTooLarge {
                max: self.limits.max_message_size,
            }
            .into());
        }

        let text = String::from_utf8(bytes).map_err(|_utf8| WsError::InvalidUtf8)?;
        Ok(Inbound::Message(text))
    }
}

/// Serializes client frames onto the outbound half of a connection.
#[derive(Debug)]
pub struct FrameWriter<W> {
    sink: W,
    compression: bool,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// `compression` is whether permessage-deflate was negotiated in the handshake.
    pub fn new(sink: W, compression: bool) -> Self {
        Self { sink, compression }
    }

    /// Sends `message` as a single text frame, deflated when compression was negotiated and
    /// the message is at least [`COMPRESSION_THRESHOLD`] bytes long.
    pub async fn write_text(&mut self, message: &str) -> Result<()> {
        let bytes = message.as_bytes();
        if self.compression && bytes.len() >= COMPRESSION_THRESHOLD {
            let compressed = deflate::compress(bytes)?;
            self.write_frame(OpCode::Text, true, &compressed).await
        } else {
            self.write_frame(OpCode::Text, false, bytes).await
        }
    }

    /// Sends a ping, pong or close frame.
    pub async fn write_control(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        debug_assert!(opcode.is_control(), "{opcode:?} is not a control opcode");
        self.write_frame(opcode, false, payload).await
    }

    async fn write_frame(&mut self, opcode: OpCode, rsv1: bool, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(opcode, rsv1, payload, rand::random());
        self.sink.write_all(&frame).await?;
        self.sink.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.sink.shutdown().await
    }
}

/// Encodes a final (FIN) frame with the mask bit set, masking `payload` with `key`.
#[must_use]
pub fn encode_frame(opcode: OpCode, rsv1: bool, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(len + 14);

    let mut first = FIN_BIT | opcode.bits();
    if rsv1 {
        first |= RSV1_BIT;
    }
    frame.push(first);

    if let Ok(short) = u8::try_from(len)
        && short <= MAX_INLINE_LEN
    {
        frame.push(MASK_BIT | short);
    } else if let Ok(medium) = u16::try_from(len) {
        frame.push(MASK_BIT | LEN_16_MARKER);
        frame.extend_from_slice(&medium.to_be_bytes());
    } else {
        frame.push(MASK_BIT | LEN_64_MARKER);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    frame.extend_from_slice(&key);
    let start = frame.len();
    frame.extend_from_slice(payload);
    apply_mask(&mut frame[start..], key);

    frame
}

/// Apply XOR mask to payload data per RFC 6455 Section 5.3.
///
/// This operation is reversible (applying the same mask twice yields the original data).
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

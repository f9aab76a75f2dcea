//! permessage-deflate (RFC 7692) payload transforms, no context takeover.
//!
//! Every message gets a fresh raw (headerless) DEFLATE stream in each direction, so no
//! dictionary survives between messages.

use std::io::Write as _;
use std::mem;

use flate2::Compression;
use flate2::write::{DeflateDecoder, DeflateEncoder};

use super::error::WsError;

/// Outgoing text messages shorter than this are sent uncompressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Tail removed by the sender and restored by the receiver.
pub const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Empty stored block left at the end of a sync flush when the block header is byte aligned.
const EMPTY_BLOCK: [u8; 5] = [0x00, 0x00, 0x00, 0xff, 0xff];

/// Compresses one message payload.
///
/// The stream is sync-flushed. When it ends with an aligned empty stored block the trailing
/// `00 00 ff ff` is stripped; otherwise a single `0x00` byte is appended, which opens a new
/// stored block that the receiver's tail completes.
pub fn compress(payload: &[u8]) -> Result<Vec<u8>, WsError> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::default());
    encoder.write_all(payload).map_err(WsError::Compression)?;
    encoder.flush().map_err(WsError::Compression)?;

    // Dropping the encoder finishes the stream into the emptied buffer, which is discarded.
    let mut output = mem::take(encoder.get_mut());
    if output.ends_with(&EMPTY_BLOCK) {
        output.truncate(output.len() - DEFLATE_TAIL.len());
    } else {
        output.push(0x00);
    }

    Ok(output)
}

/// Inflates one message payload (all of its fragments concatenated or a single frame).
///
/// Fails with [`WsError::MessageTooLarge`] as soon as the output passes `max_size`, so a
/// small compressed frame cannot expand into an arbitrarily large buffer.
pub fn decompress(payload: &[u8], max_size: usize) -> Result<Vec<u8>, WsError> {
    let capacity = payload.len().saturating_mul(3).min(max_size);
    let mut decoder = DeflateDecoder::new(Vec::with_capacity(capacity));
    if feed(&mut decoder, payload, max_size)? {
        feed(&mut decoder, &DEFLATE_TAIL, max_size)?;
    }
    decoder.flush().map_err(WsError::Compression)?;
    ensure_within(&decoder, max_size)?;

    Ok(mem::take(decoder.get_mut()))
}

/// Writes `input` into the decoder, returning `false` once a final block ended the stream.
/// Bytes after a BFINAL block are ignored.
///
/// Each `write` inflates at most one internal buffer's worth, so checking the output between
/// writes bounds it.
fn feed(
    decoder: &mut DeflateDecoder<Vec<u8>>,
    mut input: &[u8],
    max_size: usize,
) -> Result<bool, WsError> {
    while !input.is_empty() {
        let written = decoder.write(input).map_err(WsError::Compression)?;
        ensure_within(decoder, max_size)?;
        if written == 0 {
            return Ok(false);
        }
        input = &input[written..];
    }
    Ok(true)
}

fn ensure_within(decoder: &DeflateDecoder<Vec<u8>>, max_size: usize) -> Result<(), WsError> {
    if decoder.get_ref().len() > max_size {
        return Err(WsError::MessageTooLarge { max: max_size });
    }
    Ok(())
}

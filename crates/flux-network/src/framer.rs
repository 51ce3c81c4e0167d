//! Framer (C4): drains a peer's ring buffer into complete frames.
//!
//! TCP frames are read out of a [`CircularBuffer`] fed by the raw byte
//! stream; malformed frames are discarded and the buffer resynced past the
//! next `0x00` sentinel. UDP has no ring — each datagram is a standalone
//! frame candidate, dropped silently if malformed.

use tracing::debug;

use crate::{
    codec::{self, Decoded},
    frame::{HEADER_SIZE_TCP, SENTINEL},
    pool::BytePool,
    reassembly::Reassembler,
    ring::CircularBuffer,
};

/// One fully decoded, already-reassembled frame ready for dispatch.
pub struct ReadyFrame {
    pub command_id: u16,
    pub response_id: u32,
    pub payload: Vec<u8>,
}

fn handle_decoded(
    decoded: Decoded<'_>,
    pool: &BytePool,
    reassembler: &mut Reassembler,
    on_frame: &mut impl FnMut(ReadyFrame),
) {
    match decoded.chunk {
        Some(chunk) => {
            if let Some(full) = reassembler.accept_chunk(
                pool,
                chunk.packet_id,
                &decoded.payload,
                chunk.chunk_offset,
                chunk.total_length,
            ) {
                on_frame(ReadyFrame {
                    command_id: decoded.command_id,
                    response_id: decoded.response_id,
                    payload: full,
                });
            }
        }
        None => on_frame(ReadyFrame {
            command_id: decoded.command_id,
            response_id: decoded.response_id,
            payload: decoded.payload.into_owned(),
        }),
    }
}

/// Advances `ring` past the next sentinel, discarding everything before it.
/// Returns whether one was found; if not, the buffer is left untouched so
/// the caller can wait for more bytes.
fn resync(ring: &mut CircularBuffer) -> bool {
    let found = ring.skip_until(0, SENTINEL);
    if found {
        debug!("tcp: resynced past corrupted frame");
    } else {
        debug!("tcp: sentinel not found yet, waiting for more bytes to resync");
    }
    found
}

/// Drains every complete frame currently sitting in `ring`, handing each to
/// `on_frame`. Chunked frames are buffered in `reassembler` until complete.
/// Returns once the ring holds no further complete frame.
pub fn pump_tcp(
    ring: &mut CircularBuffer,
    pool: &BytePool,
    reassembler: &mut Reassembler,
    max_payload_size: usize,
    mut on_frame: impl FnMut(ReadyFrame),
) {
    loop {
        let Some(header) = ring.peek_header(0) else { return };

        if header.payload_length as usize > max_payload_size {
            debug!(
                payload_length = header.payload_length,
                max_payload_size, "tcp: header claims payload larger than max, resyncing"
            );
            if !resync(ring) {
                return;
            }
            continue;
        }

        let frame_len = HEADER_SIZE_TCP + header.extension_len() + header.payload_length as usize;
        if ring.len() < frame_len + 1 {
            return;
        }

        if ring.peek_byte(frame_len) != Some(SENTINEL) {
            debug!("tcp: missing sentinel at expected frame boundary, resyncing");
            if !resync(ring) {
                return;
            }
            continue;
        }

        let mut raw = pool.rent(frame_len);
        ring.peek(&mut raw, 0);

        match codec::decode(&raw, max_payload_size) {
            Ok(decoded) => {
                handle_decoded(decoded, pool, reassembler, &mut on_frame);
                ring.advance(frame_len + 1);
                pool.put(raw);
            }
            Err(e) => {
                pool.put(raw);
                debug!(?e, "tcp: frame decode failed, resyncing");
                if !resync(ring) {
                    return;
                }
            }
        }
    }
}

/// Decodes a single UDP datagram, handing it to `on_frame` if well-formed.
/// Malformed datagrams are dropped silently — there's no stream to resync.
pub fn decode_udp(
    datagram: &[u8],
    pool: &BytePool,
    reassembler: &mut Reassembler,
    max_payload_size: usize,
    mut on_frame: impl FnMut(ReadyFrame),
) {
    let Ok(decoded) = codec::decode(datagram, max_payload_size) else { return };
    handle_decoded(decoded, pool, reassembler, &mut on_frame);
}

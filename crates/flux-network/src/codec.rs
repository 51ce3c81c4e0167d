//! Payload envelope codec (C2): length prefix, optional checksum, optional
//! compression, terminating sentinel.
//!
//! The wire's `Lz4` compression bit is kept as named in the reserved framing
//! (see `frame::CompressionMode`); the bytes behind it come from `zstd`, the
//! compressor already used elsewhere in this workspace for bulk byte
//! payloads. It is swapped in behind the same narrow `compress`/`decompress`
//! interface the original LZ4 primitive would have occupied.

use std::borrow::Cow;

use crate::{
    error::{DecodeError, FramingError},
    frame::{
        ChunkInfo, CompressionMode, EncryptionMode, FrameHeader, HEADER_SIZE_TCP, HeaderByte,
        RESPONSE_ID_SIZE, CHUNK_FIELDS_SIZE,
    },
};

/// zstd compression level used for the `Lz4` wire bit. Level 1 favours
/// speed over ratio, matching LZ4's own tradeoff.
const COMPRESSION_LEVEL: i32 = 1;

/// Either half of the codec can fail; both are always handled the same way
/// by the framer (discard the frame, resync on TCP).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    Framing(FramingError),
    Decode(DecodeError),
}

impl From<FramingError> for CodecError {
    fn from(e: FramingError) -> Self {
        Self::Framing(e)
    }
}

impl From<DecodeError> for CodecError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// Folds a 32-bit sum-of-bytes accumulator down into 16 bits.
#[inline]
fn fold_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// 16-bit sum-of-bytes checksum, covering everything passed in.
pub fn checksum16(bytes: &[u8]) -> u16 {
    let sum: u32 = bytes.iter().fold(0u32, |acc, &b| acc + b as u32);
    fold_checksum(sum)
}

/// Checksum of a frame whose 2-byte checksum field (at offset 5..7) is
/// treated as zero, matching what `encode` summed before patching it in.
fn checksum16_over_frame(frame_bytes: &[u8]) -> u16 {
    let sum: u32 = frame_bytes
        .iter()
        .enumerate()
        .fold(0u32, |acc, (i, &b)| if (5..7).contains(&i) { acc } else { acc + b as u32 });
    fold_checksum(sum)
}

/// Compresses `payload`, returning `None` if the compressed form isn't
/// strictly smaller (the caller should then send the payload uncompressed).
pub fn compress(payload: &[u8]) -> Option<Vec<u8>> {
    let compressed = zstd::encode_all(payload, COMPRESSION_LEVEL).ok()?;
    (compressed.len() < payload.len()).then_some(compressed)
}

/// Decompresses `bytes`. zstd's frame format carries its own content size,
/// so no separate expected-length field travels on our wire; pass `Some`
/// when the caller already knows the length to validate against (round-trip
/// tests), `None` otherwise.
pub fn decompress(bytes: &[u8], expected_len: Option<usize>) -> Result<Vec<u8>, DecodeError> {
    let out = zstd::decode_all(bytes).map_err(|_| DecodeError::DecompressFailure)?;
    if let Some(expected) = expected_len {
        if out.len() != expected {
            return Err(DecodeError::DecompressFailure);
        }
    }
    Ok(out)
}

/// Parameters for [`encode`].
pub struct EncodeParams<'a> {
    pub command_id: u16,
    /// 0 means "not a response to a prior request".
    pub response_id: u32,
    pub payload: &'a [u8],
    pub compression: CompressionMode,
    pub chunk: Option<ChunkInfo>,
}

/// Encodes a frame into `out`, appending the `0x00` sentinel iff `tcp` is
/// true. Returns the number of bytes appended.
///
/// Compression is only applied, and the `Lz4` bit only set, when the
/// compressed form is strictly smaller than the original payload.
pub fn encode(
    out: &mut Vec<u8>,
    params: &EncodeParams<'_>,
    max_payload_size: usize,
    tcp: bool,
) -> Result<usize, FramingError> {
    let start = out.len();

    let compressed;
    let (body, compression_used): (&[u8], CompressionMode) = match params.compression {
        CompressionMode::Lz4 => match compress(params.payload) {
            Some(c) => {
                compressed = c;
                (&compressed, CompressionMode::Lz4)
            }
            None => (params.payload, CompressionMode::None),
        },
        CompressionMode::None => (params.payload, CompressionMode::None),
    };

    if body.len() > max_payload_size || body.len() > u16::MAX as usize {
        return Err(FramingError::PayloadTooLarge(
            body.len().min(u16::MAX as usize) as u16,
            max_payload_size,
        ));
    }

    let header_byte = HeaderByte::new(
        compression_used,
        EncryptionMode::None,
        params.response_id != 0,
        params.chunk.is_some(),
    );

    out.push(header_byte.0);
    out.extend_from_slice(&params.command_id.to_le_bytes());
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    // Checksum placeholder, patched below once the full frame is laid out.
    out.extend_from_slice(&0u16.to_le_bytes());

    if let Some(c) = params.chunk {
        out.extend_from_slice(&c.packet_id.to_le_bytes());
        out.extend_from_slice(&c.chunk_offset.to_le_bytes());
        out.extend_from_slice(&c.total_length.to_le_bytes());
    }
    if params.response_id != 0 {
        out.extend_from_slice(&params.response_id.to_le_bytes());
    }
    out.extend_from_slice(body);

    let checksum_pos = start + 5;
    let checksum = checksum16_over_frame(&out[start..]);
    out[checksum_pos..checksum_pos + 2].copy_from_slice(&checksum.to_le_bytes());

    if tcp {
        out.push(crate::frame::SENTINEL);
    }

    Ok(out.len() - start)
}

/// Encodes `payload` as one unchunked frame, or — when it exceeds
/// `max_payload_size` — as successive chunked frames sharing a freshly
/// allocated `packet_id` (via `next_packet_id`), each carrying at most
/// `max_payload_size` bytes. `emit` is called once per produced frame, in
/// order.
///
/// Chunks are always sent uncompressed: the reassembler places each chunk's
/// bytes at `buffer[chunk_offset..]` by contract, which only lines up if
/// `chunk_offset` addresses the *uncompressed* message. Compression is only
/// ever applied to the single-frame case.
pub fn encode_message(
    out: &mut Vec<u8>,
    command_id: u16,
    response_id: u32,
    payload: &[u8],
    compression: CompressionMode,
    max_payload_size: usize,
    tcp: bool,
    mut next_packet_id: impl FnMut() -> u32,
    mut emit: impl FnMut(&[u8]),
) -> Result<(), FramingError> {
    if payload.len() <= max_payload_size {
        out.clear();
        let params = EncodeParams { command_id, response_id, payload, compression, chunk: None };
        encode(out, &params, max_payload_size, tcp)?;
        emit(out);
        return Ok(());
    }

    if payload.len() > u32::MAX as usize {
        return Err(FramingError::PayloadTooLarge(u16::MAX, max_payload_size));
    }

    let packet_id = next_packet_id();
    let total_length = payload.len() as u32;
    for chunk_offset in (0..payload.len()).step_by(max_payload_size) {
        let chunk_end = (chunk_offset + max_payload_size).min(payload.len());
        let chunk = ChunkInfo { packet_id, chunk_offset: chunk_offset as u32, total_length };
        out.clear();
        let params = EncodeParams {
            command_id,
            response_id,
            payload: &payload[chunk_offset..chunk_end],
            compression: CompressionMode::None,
            chunk: Some(chunk),
        };
        encode(out, &params, max_payload_size, tcp)?;
        emit(out);
    }
    Ok(())
}

/// A fully decoded frame: command, optional response correlation, optional
/// chunk placement, and the (possibly decompressed) payload.
pub struct Decoded<'a> {
    pub command_id: u16,
    pub response_id: u32,
    pub chunk: Option<ChunkInfo>,
    pub payload: Cow<'a, [u8]>,
}

/// Decodes a single frame out of `frame_bytes`, which must start at the
/// header byte and run exactly through the end of the payload (the caller
/// strips any trailing sentinel before calling this). Verifies the
/// checksum, rejects nonzero encryption, and decompresses the payload if
/// indicated — the decompressed length becomes the payload length reported
/// to the caller.
pub fn decode(frame_bytes: &[u8], max_payload_size: usize) -> Result<Decoded<'_>, CodecError> {
    debug_assert!(frame_bytes.len() >= HEADER_SIZE_TCP);
    let mut header_raw = [0u8; HEADER_SIZE_TCP];
    header_raw.copy_from_slice(&frame_bytes[..HEADER_SIZE_TCP]);
    let header = FrameHeader::parse(&header_raw);

    if checksum16_over_frame(frame_bytes) != header.checksum {
        return Err(FramingError::ChecksumMismatch.into());
    }

    if header.payload_length as usize > max_payload_size {
        return Err(FramingError::PayloadTooLarge(header.payload_length, max_payload_size).into());
    }

    if header.header_byte.encryption_bits() != 0 {
        return Err(DecodeError::UnsupportedEncryption(header.header_byte.encryption_bits()).into());
    }

    if frame_bytes.len() < HEADER_SIZE_TCP + header.extension_len() {
        return Err(FramingError::PayloadTooLarge(header.payload_length, max_payload_size).into());
    }

    let mut cursor = HEADER_SIZE_TCP;
    let chunk = if header.header_byte.is_chunked() {
        let raw = &frame_bytes[cursor..cursor + CHUNK_FIELDS_SIZE];
        cursor += CHUNK_FIELDS_SIZE;
        Some(ChunkInfo {
            packet_id: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            chunk_offset: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            total_length: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
        })
    } else {
        None
    };

    let response_id = if header.header_byte.is_response() {
        let raw = &frame_bytes[cursor..cursor + RESPONSE_ID_SIZE];
        cursor += RESPONSE_ID_SIZE;
        u32::from_le_bytes(raw.try_into().unwrap())
    } else {
        0
    };

    if frame_bytes.len() < cursor + header.payload_length as usize {
        return Err(FramingError::PayloadTooLarge(header.payload_length, max_payload_size).into());
    }
    let body = &frame_bytes[cursor..cursor + header.payload_length as usize];

    let payload = match CompressionMode::from_bits(header.header_byte.compression_bits()) {
        Some(CompressionMode::None) => Cow::Borrowed(body),
        Some(CompressionMode::Lz4) => Cow::Owned(decompress(body, None)?),
        None => return Err(DecodeError::UnknownCompression(header.header_byte.compression_bits()).into()),
    };

    Ok(Decoded { command_id: header.command_id, response_id, chunk, payload })
}

//! Host <-> headset wire format.
//!
//! Every datagram is an 18-byte header followed by a bincode [`Message`]
//! body. Video frames are split into [`VideoChunk`]s small enough for one
//! datagram, and every FEC group of data packets is followed by one XOR
//! parity packet so a single loss can be repaired without a retransmit.

#![forbid(unsafe_code)]

pub mod messages;

pub use messages::*;

use bincode::Options as _;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const TETHER_VERSION: u16 = 1;

/// Physical packet header (18 bytes)
/// [Magic (2B)][Version (2B)][SessionId (4B)][PacketId (8B)][Csum (2B)]
pub const HEADER_SIZE: usize = 18;

pub const TETHER_MAGIC: [u8; 2] = [0x54, 0x48]; // 'TH'

/// Upper bound for a decoded message body. Keeps hostile length prefixes
/// from allocating.
pub const MAX_MESSAGE_BYTES: u64 = 64 * 1024;

/// Conservative datagram size that avoids IP fragmentation.
pub const MAX_DATAGRAM_SIZE: usize = 1200;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("packet too short: {0}")]
    TooShort(usize),
    #[error("invalid magic: {0:?}")]
    InvalidMagic([u8; 2]),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u16),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("message encode error: {0}")]
    Encode(String),
    #[error("message decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalPacket {
    pub version: u16,
    pub session_id: u32,
    pub packet_id: u64,
    pub payload: Bytes,
}

impl PhysicalPacket {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&TETHER_MAGIC);
        buf.put_u16(self.version);
        buf.put_u32(self.session_id);
        buf.put_u64(self.packet_id);

        let csum_pos = buf.len();
        buf.put_u16(0);
        buf.put_slice(&self.payload);

        // Checksum covers the header only; payload integrity is the FEC's job.
        let csum = header_checksum(&buf[..csum_pos]);
        let mut csum_slot = &mut buf[csum_pos..csum_pos + 2];
        csum_slot.put_u16(csum);

        buf.freeze()
    }

    pub fn decode(bytes: Bytes) -> Result<Self, WireError> {
        if bytes.len() < HEADER_SIZE {
            return Err(WireError::TooShort(bytes.len()));
        }

        if bytes[0..2] != TETHER_MAGIC {
            return Err(WireError::InvalidMagic([bytes[0], bytes[1]]));
        }

        let mut header = &bytes[2..HEADER_SIZE];
        let version = header.get_u16();
        if version != TETHER_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let session_id = header.get_u32();
        let packet_id = header.get_u64();
        let csum = header.get_u16();

        if header_checksum(&bytes[..HEADER_SIZE - 2]) != csum {
            return Err(WireError::ChecksumMismatch);
        }

        let mut payload = bytes;
        payload.advance(HEADER_SIZE);

        Ok(Self {
            version,
            session_id,
            packet_id,
            payload,
        })
    }
}

fn header_checksum(header: &[u8]) -> u16 {
    let mut state = crc16::State::<crc16::KERMIT>::new();
    state.update(header);
    state.get()
}

fn codec_options() -> impl bincode::Options {
    bincode::DefaultOptions::new().with_limit(MAX_MESSAGE_BYTES)
}

pub fn encode_msg(msg: &Message) -> Result<Vec<u8>, WireError> {
    codec_options()
        .serialize(msg)
        .map_err(|err| WireError::Encode(err.to_string()))
}

pub fn decode_msg(bytes: &[u8]) -> Result<Message, WireError> {
    codec_options()
        .deserialize(bytes)
        .map_err(|err| WireError::Decode(err.to_string()))
}

/// Serialize `msg` and wrap it in a physical packet.
pub fn encode_packet(session_id: u32, packet_id: u64, msg: &Message) -> Result<Bytes, WireError> {
    let payload = encode_msg(msg)?;
    Ok(PhysicalPacket {
        version: TETHER_VERSION,
        session_id,
        packet_id,
        payload: Bytes::from(payload),
    }
    .encode())
}

/// Inverse of [`encode_packet`].
pub fn decode_packet(bytes: Bytes) -> Result<(PhysicalPacket, Message), WireError> {
    let packet = PhysicalPacket::decode(bytes)?;
    let msg = decode_msg(&packet.payload)?;
    Ok((packet, msg))
}

pub fn chunk_video_payload(
    frame_index: u64,
    presentation_ts_ns: u64,
    keyframe: bool,
    payload: &[u8],
    max_payload: usize,
    encode_us: u32,
) -> Result<Vec<VideoChunk>, ChunkError> {
    if max_payload == 0 {
        return Err(ChunkError::InvalidMaxPayload);
    }
    // An empty frame still needs one chunk so the receiver sees the boundary.
    let chunk_count = payload.len().div_ceil(max_payload).max(1);
    if chunk_count > u32::MAX as usize {
        return Err(ChunkError::TooManyChunks);
    }
    let mut chunks = Vec::with_capacity(chunk_count);
    if payload.is_empty() {
        chunks.push(VideoChunk {
            frame_index,
            chunk_index: 0,
            chunk_count: 1,
            presentation_ts_ns,
            keyframe,
            encode_us,
            payload: Vec::new(),
        });
        return Ok(chunks);
    }
    for (index, chunk) in payload.chunks(max_payload).enumerate() {
        chunks.push(VideoChunk {
            frame_index,
            chunk_index: index as u32,
            chunk_count: chunk_count as u32,
            presentation_ts_ns,
            keyframe,
            encode_us,
            payload: chunk.to_vec(),
        });
    }
    Ok(chunks)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("max payload must be non-zero")]
    InvalidMaxPayload,
    #[error("too many chunks for a single frame")]
    TooManyChunks,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FecError {
    #[error("shard count must be at least 2")]
    InvalidShardCount,
}

/// Builds one XOR parity packet per `shard_count - 1` data packets.
#[derive(Debug, Clone)]
pub struct FecBuilder {
    shard_count: u32,
    group_id: u64,
    first_packet_id: Option<u64>,
    payloads: Vec<Vec<u8>>,
    shard_lengths: Vec<u32>,
    max_payload_len: usize,
}

impl FecBuilder {
    pub fn new(shard_count: u32) -> Result<Self, FecError> {
        if shard_count < 2 {
            return Err(FecError::InvalidShardCount);
        }
        Ok(Self {
            shard_count,
            group_id: 0,
            first_packet_id: None,
            payloads: Vec::with_capacity(shard_count as usize),
            shard_lengths: Vec::with_capacity(shard_count as usize),
            max_payload_len: 0,
        })
    }

    /// Add a data packet. Returns the parity packet once the group is full.
    pub fn push(&mut self, packet_id: u64, payload: &[u8]) -> Option<FecPacket> {
        if self.payloads.is_empty() {
            self.first_packet_id = Some(packet_id);
        }

        self.max_payload_len = self.max_payload_len.max(payload.len());
        self.shard_lengths.push(payload.len() as u32);
        self.payloads.push(payload.to_vec());

        if self.payloads.len() == (self.shard_count - 1) as usize {
            self.emit(packet_id)
        } else {
            None
        }
    }

    /// Close a partial group (end of frame) so its tail is protected too.
    pub fn finish(&mut self) -> Option<FecPacket> {
        let last = self.first_packet_id?;
        self.emit(last)
    }

    fn emit(&mut self, last_packet_id: u64) -> Option<FecPacket> {
        let parity_payload = xor_parity(&self.payloads, self.max_payload_len);
        let packet = FecPacket {
            group_id: self.group_id,
            first_packet_id: self.first_packet_id.unwrap_or(last_packet_id),
            shard_count: self.payloads.len() as u32 + 1,
            parity_index: self.payloads.len() as u32,
            payload: parity_payload,
            shard_lengths: self.shard_lengths.clone(),
        };
        self.group_id = self.group_id.wrapping_add(1);
        self.reset();
        Some(packet)
    }

    /// Drop a partial group without emitting parity. The group id is kept.
    pub fn reset(&mut self) {
        self.payloads.clear();
        self.shard_lengths.clear();
        self.max_payload_len = 0;
        self.first_packet_id = None;
    }
}

impl FecPacket {
    /// Rebuild the single missing data shard of this group, if exactly one
    /// is missing. Returns `(packet_id, payload)`.
    pub fn recover<'a, F>(&self, lookup: F) -> Option<(u64, Vec<u8>)>
    where
        F: Fn(u64) -> Option<&'a [u8]>,
    {
        let mut missing = None;
        let mut recovered = self.payload.clone();
        for (offset, len) in self.shard_lengths.iter().enumerate() {
            let packet_id = self.first_packet_id.wrapping_add(offset as u64);
            match lookup(packet_id) {
                Some(shard) => xor_in_place(&mut recovered, shard, self.payload.len()),
                None if missing.is_some() => return None,
                None => missing = Some((packet_id, *len as usize)),
            }
        }
        let (packet_id, len) = missing?;
        recovered.truncate(len);
        Some((packet_id, recovered))
    }
}

fn xor_parity(payloads: &[Vec<u8>], max_len: usize) -> Vec<u8> {
    let mut parity = vec![0u8; max_len];
    for payload in payloads {
        xor_in_place(&mut parity, payload, max_len);
    }
    parity
}

fn xor_in_place(target: &mut [u8], payload: &[u8], max_len: usize) {
    let len = payload.len().min(max_len).min(target.len());
    for (dst, src) in target[..len].iter_mut().zip(&payload[..len]) {
        *dst ^= src;
    }
}

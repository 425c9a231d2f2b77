//! The envelope: the framed, checksummed, optionally compressed message unit.
//!
//! Wire format (all integers big-endian):
//!
//! ```text
//! ┌──────────────┬─────────────────────────────────────────────┐
//! │ total length │ u32: byte length of everything that follows  │
//! ├──────────────┼─────────────────────────────────────────────┤
//! │ body         │ packet table, possibly compressed            │
//! └──────────────┴─────────────────────────────────────────────┘
//!
//! packet table:
//!   len_0 (u32) len_1 (u32) ... len_n (u32)   one per packet, up front
//!   packet_0 packet_1 ... packet_n            concatenated bytes
//!
//!   packet 0: main flag (1 byte)     packet 2: checksum id (base58 text)
//!   packet 1: sender id (base58)     packet 3: timestamp (base58 text)
//!   packets 4+: payload
//! ```
//!
//! The checksum id is computed over the plaintext payload plus timestamp
//! before any compression is applied, and compression is attempted only on
//! the body, never the outer length. That ordering is load-bearing: the id
//! must not change when two peers negotiate different compression.

use crate::base58::{self, Base58Error};
use crate::codec::{pack_value, unpack_value, CodecError};
use crate::compression::{CompressionError, Method, Registry};
use crate::identity::{MessageId, NodeId};

/// An immutable wire message. The checksum id is computed eagerly at
/// construction; no field mutates after that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    kind: u8,
    sender: NodeId,
    time: u64,
    payload: Vec<Vec<u8>>,
    id: MessageId,
    compression_fail: bool,
}

impl Envelope {
    pub fn new(kind: u8, sender: NodeId, payload: Vec<Vec<u8>>, time: u64) -> Self {
        let id = MessageId::compute(&payload, time);
        Self {
            kind,
            sender,
            time,
            payload,
            id,
            compression_fail: false,
        }
    }

    /// Main flag byte (packet 0).
    pub fn kind(&self) -> u8 {
        self.kind
    }

    pub fn sender(&self) -> &NodeId {
        &self.sender
    }

    /// Unix timestamp the sender stamped this message with.
    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Payload packets; by convention packet 0 holds the sub-flag.
    pub fn payload(&self) -> &[Vec<u8>] {
        &self.payload
    }

    /// Set when decode had compression candidates but none of them applied.
    /// The message still parsed, so the body was evidently plaintext; callers
    /// may use this to trigger a renegotiate.
    pub fn compression_fail(&self) -> bool {
        self.compression_fail
    }

    /// All packets in wire order, metadata header included.
    pub fn packets(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::with_capacity(4 + self.payload.len());
        out.push(vec![self.kind]);
        out.push(self.sender.to_base58().into_bytes());
        out.push(self.id.to_base58().into_bytes());
        out.push(base58::to_base58(self.time).into_bytes());
        out.extend(self.payload.iter().cloned());
        out
    }

    /// Serialize, compressing with the first method shared with `remote`, and
    /// prepend the total length.
    pub fn encode(&self, remote: &[Method], registry: &Registry) -> Result<Vec<u8>, EnvelopeError> {
        let mut body = packet_table(&self.packets())?;
        if let Some(method) = registry.first_common(remote) {
            body = registry.compress(&body, method)?;
        }
        let mut out = pack_value(4, body.len() as u64)?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse one frame. `sizeless` skips the outer length check for callers
    /// that already stripped it. `remote` is the candidate compression list
    /// the peer may have used, tried in local preference order.
    pub fn decode(
        buf: &[u8],
        sizeless: bool,
        remote: &[Method],
        registry: &Registry,
    ) -> Result<Envelope, EnvelopeError> {
        let body = if sizeless {
            buf
        } else {
            if buf.len() < 4 {
                return Err(EnvelopeError::FrameLengthMismatch {
                    declared: 0,
                    actual: buf.len(),
                });
            }
            let declared = unpack_value(&buf[..4])? as usize;
            if declared != buf.len() - 4 {
                return Err(EnvelopeError::FrameLengthMismatch {
                    declared,
                    actual: buf.len() - 4,
                });
            }
            &buf[4..]
        };

        // A failed decompression attempt is not fatal here: the body may have
        // been plaintext all along, and if it was not, the packet table or
        // checksum below will reject it.
        let mut compression_fail = false;
        let mut plain = None;
        for method in registry.negotiate(remote) {
            match registry.decompress(body, method) {
                Ok(bytes) => {
                    compression_fail = false;
                    plain = Some(bytes);
                    break;
                }
                Err(_) => {
                    compression_fail = true;
                }
            }
        }
        let plain = plain.unwrap_or_else(|| body.to_vec());

        let packets = split_packet_table(&plain)?;
        if packets.len() < 4 {
            return Err(EnvelopeError::MalformedPacketTable);
        }
        if packets[0].len() != 1 {
            return Err(EnvelopeError::MalformedPacketTable);
        }
        let kind = packets[0][0];
        let sender = NodeId::from_base58(text_packet(&packets[1])?)?;
        let checksum = text_packet(&packets[2])?.to_owned();
        let time = base58::from_base58(text_packet(&packets[3])?)?;
        let payload: Vec<Vec<u8>> = packets[4..].to_vec();

        let mut env = Envelope::new(kind, sender, payload, time);
        if env.id.to_base58() != checksum {
            return Err(EnvelopeError::IntegrityCheckFailed);
        }
        env.compression_fail = compression_fail;
        Ok(env)
    }
}

/// Concatenated per-packet length headers followed by the packet bytes.
fn packet_table(packets: &[Vec<u8>]) -> Result<Vec<u8>, EnvelopeError> {
    let mut out = Vec::new();
    for packet in packets {
        out.extend_from_slice(&pack_value(4, packet.len() as u64)?);
    }
    for packet in packets {
        out.extend_from_slice(packet);
    }
    Ok(out)
}

fn split_packet_table(body: &[u8]) -> Result<Vec<Vec<u8>>, EnvelopeError> {
    let mut lens = Vec::new();
    let mut processed = 0usize;
    let mut expected = body.len();
    while processed != expected {
        if processed > expected || processed + 4 > body.len() {
            return Err(EnvelopeError::MalformedPacketTable);
        }
        let len = unpack_value(&body[processed..processed + 4])? as usize;
        processed += 4;
        expected = expected
            .checked_sub(len)
            .ok_or(EnvelopeError::MalformedPacketTable)?;
        lens.push(len);
    }
    let mut packets = Vec::with_capacity(lens.len());
    let mut at = processed;
    for len in lens {
        // Bounds already proven by the length walk above.
        packets.push(body[at..at + len].to_vec());
        at += len;
    }
    Ok(packets)
}

fn text_packet(packet: &[u8]) -> Result<&str, EnvelopeError> {
    std::str::from_utf8(packet).map_err(|_| EnvelopeError::MalformedPacketTable)
}

/// Error building or parsing an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The outer length prefix disagrees with the buffer. Fatal to the
    /// connection: the stream can no longer be resynchronized.
    #[error("declared frame length {declared} does not match {actual} bytes")]
    FrameLengthMismatch { declared: usize, actual: usize },
    /// The packet length table does not add up.
    #[error("malformed packet table")]
    MalformedPacketTable,
    /// The transmitted checksum does not match the recomputed message id.
    /// Recoverable: the peer can be asked to renegotiate and resend.
    #[error("integrity check failed")]
    IntegrityCheckFailed,
    #[error(transparent)]
    Base58(#[from] Base58Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Compression(#[from] CompressionError),
}

//! Wire protocol: connect-time parameters, control messages, and the
//! immediate-data encoding.
//!
//! Two wire forms exist. A 4-byte private payload rides in the native
//! connect/accept call and gates the handshake on magic/version. After
//! establishment, fixed-size control messages travel on the two-sided
//! send/receive channel: one SETUP per direction describing the sender's
//! sink region, then FC messages reporting read progress. Bulk data never
//! uses this channel; it is written one-sided with a 32-bit immediate
//! carrying `{bytes_sent: 28 bits, acks_received: 4 bits}`.

use bytes::{Buf, BufMut};
use std::io;

/// Magic byte embedded in the private connect/accept payload.
pub const PROTOCOL_MAGIC: u8 = 0xC0;
/// Protocol revision; both sides must match exactly.
pub const PROTOCOL_VERSION: u8 = 0x03;

/// Maximum byte count representable in the 28-bit immediate field.
pub const MAX_BYTES_PER_WRITE: u32 = (1 << 28) - 1;
/// Maximum ack count representable in the 4-bit immediate field.
pub const MAX_ACKS_PER_IMM: u32 = (1 << 4) - 1;

/// Control messages are encoded into fixed-size pool buffers.
pub const MSG_BUF_SIZE: usize = 32;

const OP_SETUP: u8 = 1 << 0;
const OP_FC: u8 = 1 << 1;

const SETUP_PAYLOAD_LEN: u8 = 24;
const FC_PAYLOAD_LEN: u8 = 8;

/// Private parameters embedded in the native connect/accept call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParams {
    pub magic: u8,
    pub version: u8,
    pub depth: u16,
}

impl ConnParams {
    pub const WIRE_LEN: usize = 4;

    /// Parameters for a local endpoint with the given queue depth.
    pub fn local(depth: u16) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            depth,
        }
    }

    /// True iff magic and version both match this build.
    pub fn compatible(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0] = self.magic;
        out[1] = self.version;
        out[2..4].copy_from_slice(&self.depth.to_le_bytes());
        out
    }

    /// Decode from received private data. The transport may pad the payload,
    /// so trailing bytes are tolerated; too-short data is an error.
    pub fn decode(mut data: &[u8]) -> io::Result<Self> {
        if data.len() < Self::WIRE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("connect payload too short: {} bytes", data.len()),
            ));
        }
        let magic = data.get_u8();
        let version = data.get_u8();
        let depth = data.get_u16_le();
        Ok(Self {
            magic,
            version,
            depth,
        })
    }
}

/// A message on the two-sided control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Describes the sender's sink region for one-sided writes.
    Setup { base: u64, len: u64, key: u64 },
    /// Reports read progress back to the writer.
    FlowControl {
        bytes_received: u32,
        writes_received: u32,
    },
}

impl ControlMessage {
    /// Encode into `buf`, returning the wire length.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        assert!(buf.len() >= MSG_BUF_SIZE);
        let mut w = &mut buf[..];
        match *self {
            ControlMessage::Setup { base, len, key } => {
                w.put_u8(OP_SETUP);
                w.put_u8(SETUP_PAYLOAD_LEN);
                w.put_u64_le(base);
                w.put_u64_le(len);
                w.put_u64_le(key);
                2 + SETUP_PAYLOAD_LEN as usize
            }
            ControlMessage::FlowControl {
                bytes_received,
                writes_received,
            } => {
                w.put_u8(OP_FC);
                w.put_u8(FC_PAYLOAD_LEN);
                w.put_u32_le(bytes_received);
                w.put_u32_le(writes_received);
                2 + FC_PAYLOAD_LEN as usize
            }
        }
    }

    /// Decode a received control message. The length byte must match the
    /// opcode's payload exactly; anything else is malformed.
    pub fn decode(mut data: &[u8]) -> io::Result<Self> {
        if data.len() < 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("control message too short: {} bytes", data.len()),
            ));
        }
        let opcode = data.get_u8();
        let length = data.get_u8();
        if data.len() < length as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "control message truncated",
            ));
        }
        match (opcode, length) {
            (OP_SETUP, SETUP_PAYLOAD_LEN) => Ok(ControlMessage::Setup {
                base: data.get_u64_le(),
                len: data.get_u64_le(),
                key: data.get_u64_le(),
            }),
            (OP_FC, FC_PAYLOAD_LEN) => Ok(ControlMessage::FlowControl {
                bytes_received: data.get_u32_le(),
                writes_received: data.get_u32_le(),
            }),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid control message: opcode={opcode:#04x} length={length}"),
            )),
        }
    }
}

/// Pack write progress into the 32-bit immediate value carried by an RDMA
/// write: low 28 bits are the byte count, high 4 bits the ack count.
#[inline]
pub fn pack_imm(bytes_sent: u32, acks: u32) -> u32 {
    debug_assert!(bytes_sent <= MAX_BYTES_PER_WRITE);
    debug_assert!(acks <= MAX_ACKS_PER_IMM);
    (acks << 28) | (bytes_sent & MAX_BYTES_PER_WRITE)
}

/// Unpack an immediate value into `(bytes_sent, acks)`.
#[inline]
pub fn unpack_imm(imm: u32) -> (u32, u32) {
    (imm & MAX_BYTES_PER_WRITE, imm >> 28)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_params_round_trip() {
        let p = ConnParams::local(256);
        let decoded = ConnParams::decode(&p.encode()).unwrap();
        assert_eq!(p, decoded);
        assert!(decoded.compatible());
    }

    #[test]
    fn conn_params_tolerate_padding() {
        // rdmacm pads private data to a transport-dependent size.
        let mut padded = [0u8; 56];
        padded[..4].copy_from_slice(&ConnParams::local(64).encode());
        let decoded = ConnParams::decode(&padded).unwrap();
        assert_eq!(decoded.depth, 64);
        assert!(decoded.compatible());
    }

    #[test]
    fn conn_params_mismatch_detected() {
        let p = ConnParams {
            magic: 0x55,
            version: PROTOCOL_VERSION,
            depth: 16,
        };
        assert!(!p.compatible());
        let p = ConnParams {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION + 1,
            depth: 16,
        };
        assert!(!p.compatible());
        assert!(ConnParams::decode(&[0xC0, 0x03]).is_err());
    }

    #[test]
    fn setup_round_trip() {
        let mut buf = [0u8; MSG_BUF_SIZE];
        let msg = ControlMessage::Setup {
            base: 0x7f00_dead_beef_0000,
            len: 1 << 22,
            key: 0x12345,
        };
        let n = msg.encode(&mut buf);
        assert_eq!(n, 26);
        assert_eq!(ControlMessage::decode(&buf[..n]).unwrap(), msg);
    }

    #[test]
    fn fc_round_trip() {
        let mut buf = [0u8; MSG_BUF_SIZE];
        let msg = ControlMessage::FlowControl {
            bytes_received: 65536,
            writes_received: 3,
        };
        let n = msg.encode(&mut buf);
        assert_eq!(n, 10);
        assert_eq!(ControlMessage::decode(&buf[..n]).unwrap(), msg);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(ControlMessage::decode(&[]).is_err());
        assert!(ControlMessage::decode(&[0xff, 8, 0, 0]).is_err());
        // SETUP opcode with an FC-sized payload.
        assert!(ControlMessage::decode(&[OP_SETUP, FC_PAYLOAD_LEN, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        // Declared length exceeds what was received.
        assert!(ControlMessage::decode(&[OP_FC, FC_PAYLOAD_LEN, 1, 2]).is_err());
    }

    #[test]
    fn imm_round_trip() {
        let imm = pack_imm(MAX_BYTES_PER_WRITE, MAX_ACKS_PER_IMM);
        assert_eq!(unpack_imm(imm), (MAX_BYTES_PER_WRITE, MAX_ACKS_PER_IMM));

        let imm = pack_imm(1, 0);
        assert_eq!(unpack_imm(imm), (1, 0));

        let imm = pack_imm(0x0ABC_DEF0, 7);
        assert_eq!(unpack_imm(imm), (0x0ABC_DEF0, 7));
    }
}

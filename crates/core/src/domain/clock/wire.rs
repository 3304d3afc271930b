//! Datagram encoding of clock messages
//!
//! Layout: `b"HA"`, one tag byte, then the fields big-endian.

use thiserror::Error;

use super::{NodeId, Timestamp};

const MAGIC: [u8; 2] = *b"HA";

const TAG_ANNOUNCE: u8 = 0x01;
const TAG_SYNC_REQUEST: u8 = 0x02;
const TAG_SYNC_RESPONSE: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("Datagram too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Not a clock datagram")]
    BadMagic,

    #[error("Unknown message tag 0x{0:02x}")]
    UnknownTag(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMessage {
    /// Election announcement; `instance` is unique per process
    Announce { node_id: NodeId, instance: u64 },
    /// Slave to master, `origin` is t1
    SyncRequest { seq: u32, origin: Timestamp },
    /// Master to slave, `receive` is t2 and `transmit` is t3
    SyncResponse {
        seq: u32,
        receive: Timestamp,
        transmit: Timestamp,
    },
}

impl ClockMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(23);
        buf.extend_from_slice(&MAGIC);
        match self {
            ClockMessage::Announce { node_id, instance } => {
                buf.push(TAG_ANNOUNCE);
                buf.extend_from_slice(&node_id.0.to_be_bytes());
                buf.extend_from_slice(&instance.to_be_bytes());
            }
            ClockMessage::SyncRequest { seq, origin } => {
                buf.push(TAG_SYNC_REQUEST);
                buf.extend_from_slice(&seq.to_be_bytes());
                buf.extend_from_slice(&origin.0.to_be_bytes());
            }
            ClockMessage::SyncResponse {
                seq,
                receive,
                transmit,
            } => {
                buf.push(TAG_SYNC_RESPONSE);
                buf.extend_from_slice(&seq.to_be_bytes());
                buf.extend_from_slice(&receive.0.to_be_bytes());
                buf.extend_from_slice(&transmit.0.to_be_bytes());
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < 3 {
            return Err(WireError::TooShort {
                expected: 3,
                actual: data.len(),
            });
        }
        if data[..2] != MAGIC {
            return Err(WireError::BadMagic);
        }
        let mut reader = Reader {
            data: &data[3..],
            consumed: 3,
        };
        match data[2] {
            TAG_ANNOUNCE => Ok(ClockMessage::Announce {
                node_id: NodeId(reader.u64()?),
                instance: reader.u64()?,
            }),
            TAG_SYNC_REQUEST => Ok(ClockMessage::SyncRequest {
                seq: reader.u32()?,
                origin: Timestamp(reader.i64()?),
            }),
            TAG_SYNC_RESPONSE => Ok(ClockMessage::SyncResponse {
                seq: reader.u32()?,
                receive: Timestamp(reader.i64()?),
                transmit: Timestamp(reader.i64()?),
            }),
            tag => Err(WireError::UnknownTag(tag)),
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    consumed: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        if self.data.len() < N {
            return Err(WireError::TooShort {
                expected: self.consumed + N,
                actual: self.consumed + self.data.len(),
            });
        }
        let (head, rest) = self.data.split_at(N);
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        self.data = rest;
        self.consumed += N;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        self.take::<4>().map(u32::from_be_bytes)
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        self.take::<8>().map(u64::from_be_bytes)
    }

    fn i64(&mut self) -> Result<i64, WireError> {
        self.take::<8>().map(i64::from_be_bytes)
    }
}

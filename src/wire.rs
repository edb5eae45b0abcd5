use crate::errors::ReturnCode;
use crate::index::MASTER_KEY_BYTES;
use std::io::{self, Read, Write};
use thiserror::Error;

pub const OP_ADD: u32 = 1;
pub const OP_READ: u32 = 2;
pub const OP_READ_FENCE: u32 = 3;

/// Permits writing to a fenced ledger; used only by the client recovery path.
pub const FLAG_RECOVERY_WRITE: u32 = 0x1;
pub const FLAG_HIGH_PRIORITY: u32 = 0x2;

/// On READ, requests the last entry whose offset this bookie has indexed.
pub const ENTRY_ID_LAST: u64 = u64::MAX;

/// Frames never exceed this; larger lengths are rejected before allocation.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// One parsed client request. ADD carries the self-identifying payload
/// (first 16 bytes are `ledgerId || entryId`, big-endian) exactly as it will
/// be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Add {
        master_key: [u8; MASTER_KEY_BYTES],
        flags: u32,
        payload: Vec<u8>,
    },
    Read {
        ledger_id: u64,
        entry_id: u64,
        flags: u32,
    },
    ReadFence {
        ledger_id: u64,
        entry_id: u64,
        master_key: [u8; MASTER_KEY_BYTES],
    },
}

impl Request {
    pub fn op(&self) -> u32 {
        match self {
            Request::Add { .. } => OP_ADD,
            Request::Read { .. } => OP_READ,
            Request::ReadFence { .. } => OP_READ_FENCE,
        }
    }

    pub fn ledger_id(&self) -> u64 {
        match self {
            Request::Add { payload, .. } if payload.len() >= 16 => be_u64(&payload[0..8]),
            Request::Add { .. } => 0,
            Request::Read { ledger_id, .. } | Request::ReadFence { ledger_id, .. } => *ledger_id,
        }
    }

    pub fn entry_id(&self) -> u64 {
        match self {
            Request::Add { payload, .. } if payload.len() >= 16 => be_u64(&payload[8..16]),
            Request::Add { .. } => 0,
            Request::Read { entry_id, .. } | Request::ReadFence { entry_id, .. } => *entry_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Request::Add {
                master_key,
                flags,
                payload,
            } => {
                body.extend_from_slice(master_key);
                body.extend_from_slice(&flags.to_be_bytes());
                body.extend_from_slice(payload);
            }
            Request::Read {
                ledger_id,
                entry_id,
                flags,
            } => {
                body.extend_from_slice(&ledger_id.to_be_bytes());
                body.extend_from_slice(&entry_id.to_be_bytes());
                body.extend_from_slice(&flags.to_be_bytes());
            }
            Request::ReadFence {
                ledger_id,
                entry_id,
                master_key,
            } => {
                body.extend_from_slice(&ledger_id.to_be_bytes());
                body.extend_from_slice(&entry_id.to_be_bytes());
                body.extend_from_slice(master_key);
            }
        }
        frame(self.op(), &body)
    }

    pub fn decode(op: u32, body: &[u8]) -> Result<Self, WireError> {
        match op {
            OP_ADD => {
                if body.len() < MASTER_KEY_BYTES + 4 + 16 {
                    return Err(WireError::Truncated { op });
                }
                let mut master_key = [0u8; MASTER_KEY_BYTES];
                master_key.copy_from_slice(&body[0..MASTER_KEY_BYTES]);
                let flags = be_u32(&body[MASTER_KEY_BYTES..MASTER_KEY_BYTES + 4]);
                Ok(Request::Add {
                    master_key,
                    flags,
                    payload: body[MASTER_KEY_BYTES + 4..].to_vec(),
                })
            }
            OP_READ => {
                if body.len() < 20 {
                    return Err(WireError::Truncated { op });
                }
                Ok(Request::Read {
                    ledger_id: be_u64(&body[0..8]),
                    entry_id: be_u64(&body[8..16]),
                    flags: be_u32(&body[16..20]),
                })
            }
            OP_READ_FENCE => {
                if body.len() < 16 + MASTER_KEY_BYTES {
                    return Err(WireError::Truncated { op });
                }
                let mut master_key = [0u8; MASTER_KEY_BYTES];
                master_key.copy_from_slice(&body[16..16 + MASTER_KEY_BYTES]);
                Ok(Request::ReadFence {
                    ledger_id: be_u64(&body[0..8]),
                    entry_id: be_u64(&body[8..16]),
                    master_key,
                })
            }
            other => Err(WireError::UnknownOp { op: other }),
        }
    }
}

/// Response to any request: return code, the entry coordinates, and the
/// payload for successful reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub rc: ReturnCode,
    pub ledger_id: u64,
    pub entry_id: u64,
    pub payload: Option<Vec<u8>>,
}

impl Response {
    pub fn error(rc: ReturnCode, ledger_id: u64, entry_id: u64) -> Self {
        Self {
            rc,
            ledger_id,
            entry_id,
            payload: None,
        }
    }

    pub fn encode(&self, op: u32) -> Vec<u8> {
        let mut body = Vec::with_capacity(20);
        body.extend_from_slice(&(self.rc as u32).to_be_bytes());
        body.extend_from_slice(&self.ledger_id.to_be_bytes());
        body.extend_from_slice(&self.entry_id.to_be_bytes());
        if let Some(payload) = &self.payload {
            body.extend_from_slice(payload);
        }
        frame(op, &body)
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        if body.len() < 20 {
            return Err(WireError::Truncated { op: 0 });
        }
        let rc_raw = be_u32(&body[0..4]);
        let rc = ReturnCode::from_u32(rc_raw).ok_or(WireError::UnknownReturnCode { rc: rc_raw })?;
        let payload = if body.len() > 20 {
            Some(body[20..].to_vec())
        } else {
            None
        };
        Ok(Response {
            rc,
            ledger_id: be_u64(&body[4..12]),
            entry_id: be_u64(&body[12..20]),
            payload,
        })
    }
}

fn frame(op: u32, body: &[u8]) -> Vec<u8> {
    let total_len = 4 + body.len();
    let mut out = Vec::with_capacity(4 + total_len);
    out.extend_from_slice(&(total_len as u32).to_be_bytes());
    out.extend_from_slice(&op.to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

fn be_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

/// Reads one `u32 totalLen | u32 opType | body` frame. Returns `None` on a
/// clean EOF at a frame boundary.
pub fn read_frame(stream: &mut impl Read) -> Result<Option<(u32, Vec<u8>)>, WireError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(WireError::Io(err)),
    }
    let total_len = u32::from_be_bytes(len_buf) as usize;
    if !(4..=MAX_FRAME_BYTES).contains(&total_len) {
        return Err(WireError::FrameLength { len: total_len });
    }
    let mut op_buf = [0u8; 4];
    stream.read_exact(&mut op_buf)?;
    let mut body = vec![0u8; total_len - 4];
    stream.read_exact(&mut body)?;
    Ok(Some((u32::from_be_bytes(op_buf), body)))
}

pub fn write_frame(stream: &mut impl Write, frame: &[u8]) -> Result<(), WireError> {
    stream.write_all(frame)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid frame length {len}")]
    FrameLength { len: usize },
    #[error("unknown operation {op}")]
    UnknownOp { op: u32 },
    #[error("truncated body for operation {op}")]
    Truncated { op: u32 },
    #[error("unknown return code {rc}")]
    UnknownReturnCode { rc: u32 },
}

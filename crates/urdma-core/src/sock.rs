//! Control-channel messages between client processes and the daemon
//!
//! One message per SOCK_SEQPACKET datagram. Every message starts with an
//! 8-byte header; all multi-byte fields are big-endian.
//!
//! ```text
//! 0       4        6        8
//! +-------+--------+--------+----------------
//! |opcode | dev_id | qp_id  | body ...
//! +-------+--------+--------+----------------
//! ```
//!
//! | opcode          | body                     | total |
//! |-----------------|--------------------------|-------|
//! | HELLO_REQ       | req_core_count: u32      | 12    |
//! | HELLO_RESP      | core_mask: u32[4]        | 24    |
//! | CREATE_QP_REQ   | none                     | 8     |
//! | CREATE_QP_RESP  | handle: u64              | 16    |
//! | DESTROY_QP_REQ  | none                     | 8     |

use crate::core_mask::{CoreMask, CORE_MASK_WORDS};
use crate::error::{Error, Result};

/// Size of the fixed message header
pub const HEADER_LEN: usize = 8;

pub const HELLO_REQ_LEN: usize = HEADER_LEN + 4;
pub const HELLO_RESP_LEN: usize = HEADER_LEN + 4 * CORE_MASK_WORDS;
pub const CREATE_QP_RESP_LEN: usize = HEADER_LEN + 8;

/// Largest message either side sends
pub const MAX_MSG_LEN: usize = HELLO_RESP_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    HelloReq = 1,
    HelloResp = 2,
    CreateQpReq = 3,
    CreateQpResp = 4,
    DestroyQpReq = 5,
}

impl TryFrom<u32> for Opcode {
    type Error = Error;

    fn try_from(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Opcode::HelloReq),
            2 => Ok(Opcode::HelloResp),
            3 => Ok(Opcode::CreateQpReq),
            4 => Ok(Opcode::CreateQpResp),
            5 => Ok(Opcode::DestroyQpReq),
            other => Err(Error::UnknownOpcode(other)),
        }
    }
}

/// Fixed message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: u32,
    pub dev_id: u16,
    pub qp_id: u16,
}

impl Header {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        need(buf, HEADER_LEN)?;
        Ok(Header {
            opcode: be_u32(buf, 0),
            dev_id: be_u16(buf, 4),
            qp_id: be_u16(buf, 6),
        })
    }

    fn put(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.opcode.to_be_bytes());
        out.extend_from_slice(&self.dev_id.to_be_bytes());
        out.extend_from_slice(&self.qp_id.to_be_bytes());
    }
}

/// Client -> daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Hello { core_count: u32 },
    CreateQp { dev_id: u16 },
    DestroyQp { dev_id: u16, qp_id: u16 },
}

impl Request {
    /// Decode one datagram
    ///
    /// Response opcodes are not valid requests and decode as
    /// [`Error::UnknownOpcode`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let hdr = Header::decode(buf)?;
        match Opcode::try_from(hdr.opcode)? {
            Opcode::HelloReq => {
                need(buf, HELLO_REQ_LEN)?;
                Ok(Request::Hello { core_count: be_u32(buf, HEADER_LEN) })
            }
            Opcode::CreateQpReq => Ok(Request::CreateQp { dev_id: hdr.dev_id }),
            Opcode::DestroyQpReq => Ok(Request::DestroyQp {
                dev_id: hdr.dev_id,
                qp_id: hdr.qp_id,
            }),
            Opcode::HelloResp | Opcode::CreateQpResp => Err(Error::UnknownOpcode(hdr.opcode)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HELLO_REQ_LEN);
        match *self {
            Request::Hello { core_count } => {
                Header { opcode: Opcode::HelloReq as u32, dev_id: 0, qp_id: 0 }.put(&mut out);
                out.extend_from_slice(&core_count.to_be_bytes());
            }
            Request::CreateQp { dev_id } => {
                Header { opcode: Opcode::CreateQpReq as u32, dev_id, qp_id: 0 }.put(&mut out);
            }
            Request::DestroyQp { dev_id, qp_id } => {
                Header { opcode: Opcode::DestroyQpReq as u32, dev_id, qp_id }.put(&mut out);
            }
        }
        out
    }
}

/// Daemon -> client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Hello { mask: CoreMask },
    CreateQp { dev_id: u16, qp_id: u16, handle: u64 },
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_MSG_LEN);
        match *self {
            Response::Hello { mask } => {
                Header { opcode: Opcode::HelloResp as u32, dev_id: 0, qp_id: 0 }.put(&mut out);
                for word in mask.words() {
                    out.extend_from_slice(&word.to_be_bytes());
                }
            }
            Response::CreateQp { dev_id, qp_id, handle } => {
                Header { opcode: Opcode::CreateQpResp as u32, dev_id, qp_id }.put(&mut out);
                out.extend_from_slice(&handle.to_be_bytes());
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let hdr = Header::decode(buf)?;
        match Opcode::try_from(hdr.opcode)? {
            Opcode::HelloResp => {
                need(buf, HELLO_RESP_LEN)?;
                let mut words = [0u32; CORE_MASK_WORDS];
                for (i, w) in words.iter_mut().enumerate() {
                    *w = be_u32(buf, HEADER_LEN + 4 * i);
                }
                Ok(Response::Hello { mask: CoreMask::from_words(words) })
            }
            Opcode::CreateQpResp => {
                need(buf, CREATE_QP_RESP_LEN)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[HEADER_LEN..CREATE_QP_RESP_LEN]);
                Ok(Response::CreateQp {
                    dev_id: hdr.dev_id,
                    qp_id: hdr.qp_id,
                    handle: u64::from_be_bytes(raw),
                })
            }
            _ => Err(Error::UnknownOpcode(hdr.opcode)),
        }
    }
}

/// Opaque handle returned in `CREATE_QP_RESP`
#[inline]
pub const fn qp_handle(dev_id: u16, qp_id: u16) -> u64 {
    ((dev_id as u64) << 32) | qp_id as u64
}

#[inline]
fn need(buf: &[u8], expected: usize) -> Result<()> {
    if buf.len() < expected {
        return Err(Error::ShortMessage { expected, got: buf.len() });
    }
    Ok(())
}

#[inline]
fn be_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

#[inline]
fn be_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

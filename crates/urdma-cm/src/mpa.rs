//! MPA handshake frames
//!
//! ```text
//! 0                16      17      18          20
//! +----------------+-------+-------+-----------+------------------------+
//! | key (16 bytes) | flags |  rev  | pd_len BE | private data, padded 4 |
//! +----------------+-------+-------+-----------+------------------------+
//! ```
//!
//! The request and the reply share the header shape and differ only in
//! the key. A reply with the reject flag set refuses the connection.

use std::io::{self, Read};

use urdma_core::error::{Error, Result};

pub const MPA_HEADER_LEN: usize = 20;
pub const MPA_REVISION: u8 = 1;

pub const MPA_KEY_REQ: &[u8; 16] = b"MPA ID Req Frame";
pub const MPA_KEY_REP: &[u8; 16] = b"MPA ID Rep Frame";

pub const FLAG_MARKERS: u8 = 0x80;
pub const FLAG_CRC: u8 = 0x40;
pub const FLAG_REJECT: u8 = 0x20;

/// Which MPA frame a header carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Reply,
}

impl FrameKind {
    const fn key(self) -> &'static [u8; 16] {
        match self {
            FrameKind::Request => MPA_KEY_REQ,
            FrameKind::Reply => MPA_KEY_REP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpaHeader {
    pub kind: FrameKind,
    pub flags: u8,
    pub revision: u8,
    pub pd_len: u16,
}

impl MpaHeader {
    #[inline]
    pub fn is_reject(&self) -> bool {
        self.flags & FLAG_REJECT != 0
    }

    pub fn encode(&self) -> [u8; MPA_HEADER_LEN] {
        let mut out = [0u8; MPA_HEADER_LEN];
        out[..16].copy_from_slice(self.kind.key());
        out[16] = self.flags;
        out[17] = self.revision;
        out[18..20].copy_from_slice(&self.pd_len.to_be_bytes());
        out
    }

    /// Parse and validate a header
    ///
    /// Fails with `ProtocolViolation` on a wrong key, an unsupported
    /// revision, or a private data length above `pdata_max`.
    pub fn decode(buf: &[u8; MPA_HEADER_LEN], expected: FrameKind, pdata_max: usize) -> Result<Self> {
        if &buf[..16] != expected.key() {
            return Err(Error::protocol(format!("bad MPA key, expected {:?} frame", expected)));
        }
        let revision = buf[17];
        if revision != MPA_REVISION {
            return Err(Error::protocol(format!("unsupported MPA revision {}", revision)));
        }
        let pd_len = u16::from_be_bytes([buf[18], buf[19]]);
        if pd_len as usize > pdata_max {
            return Err(Error::protocol(format!(
                "private data length {} exceeds maximum {}",
                pd_len, pdata_max
            )));
        }
        Ok(MpaHeader { kind: expected, flags: buf[16], revision, pd_len })
    }
}

/// Round up to a multiple of 4
#[inline]
pub const fn padded_len(n: usize) -> usize {
    (n + 3) & !3
}

/// Build a complete frame: header, private data, zero padding
pub fn encode_frame(kind: FrameKind, flags: u8, pdata: &[u8], pdata_max: usize) -> Result<Vec<u8>> {
    if pdata.len() > pdata_max {
        return Err(Error::InvalidArgument(format!(
            "private data length {} exceeds maximum {}",
            pdata.len(),
            pdata_max
        )));
    }
    let hdr = MpaHeader {
        kind,
        flags,
        revision: MPA_REVISION,
        pd_len: pdata.len() as u16,
    };
    let mut out = Vec::with_capacity(MPA_HEADER_LEN + padded_len(pdata.len()));
    out.extend_from_slice(&hdr.encode());
    out.extend_from_slice(pdata);
    out.resize(MPA_HEADER_LEN + padded_len(pdata.len()), 0);
    Ok(out)
}

/// Outcome of a receive attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Socket drained before the frame was complete
    Incomplete,
    Complete,
}

/// Incremental reader for one MPA frame
///
/// Reads never go past the end of the frame, so bytes the peer sends
/// after its handshake stay in the socket.
pub struct MpaReceiver {
    buf: Box<[u8]>,
    rcvd: usize,
    header: Option<MpaHeader>,
    expected: FrameKind,
    pdata_max: usize,
}

impl MpaReceiver {
    pub fn new(expected: FrameKind, pdata_max: usize) -> Self {
        Self {
            buf: vec![0u8; MPA_HEADER_LEN + padded_len(pdata_max)].into_boxed_slice(),
            rcvd: 0,
            header: None,
            expected,
            pdata_max,
        }
    }

    /// Start over, expecting a frame of `expected` kind
    pub fn reset(&mut self, expected: FrameKind) {
        self.rcvd = 0;
        self.header = None;
        self.expected = expected;
    }

    /// Bytes received so far
    #[inline]
    pub fn received(&self) -> usize {
        self.rcvd
    }

    pub fn header(&self) -> Option<&MpaHeader> {
        self.header.as_ref()
    }

    /// Private data of a complete frame (without padding)
    pub fn private_data(&self) -> &[u8] {
        match self.header {
            Some(h) => &self.buf[MPA_HEADER_LEN..MPA_HEADER_LEN + h.pd_len as usize],
            None => &[],
        }
    }

    /// Pull as much of the frame as `src` has available
    ///
    /// `Err(PeerClosed)` on EOF, `ProtocolViolation` on a bad header.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> Result<Progress> {
        loop {
            let want = match self.header {
                None => MPA_HEADER_LEN,
                Some(h) => MPA_HEADER_LEN + padded_len(h.pd_len as usize),
            };
            if self.header.is_some() && self.rcvd == want {
                return Ok(Progress::Complete);
            }

            match src.read(&mut self.buf[self.rcvd..want]) {
                Ok(0) => return Err(Error::PeerClosed),
                Ok(n) => {
                    self.rcvd += n;
                    if self.header.is_none() && self.rcvd == MPA_HEADER_LEN {
                        let mut raw = [0u8; MPA_HEADER_LEN];
                        raw.copy_from_slice(&self.buf[..MPA_HEADER_LEN]);
                        self.header = Some(MpaHeader::decode(&raw, self.expected, self.pdata_max)?);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::Incomplete),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use urdma_core::constants::PDATA_LEN_MAX;

    /// Hands out data in fixed chunks, then reports WouldBlock
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        budget: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            if self.pos == self.data.len() {
                return Ok(0);
            }
            self.budget -= 1;
            let n = buf.len().min(self.chunk).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_frame_padding() {
        let frame = encode_frame(FrameKind::Request, 0, b"hello", PDATA_LEN_MAX).unwrap();
        assert_eq!(frame.len(), MPA_HEADER_LEN + 8);
        assert_eq!(&frame[..16], MPA_KEY_REQ);
        assert_eq!(&frame[18..20], &[0, 5]);
        assert_eq!(&frame[25..], &[0, 0, 0]);
    }

    #[test]
    fn test_oversized_outbound_pdata() {
        let pdata = vec![0u8; PDATA_LEN_MAX + 1];
        assert!(encode_frame(FrameKind::Reply, 0, &pdata, PDATA_LEN_MAX).is_err());
    }

    #[test]
    fn test_partial_reads_accumulate() {
        let frame = encode_frame(FrameKind::Request, 0, b"abcdefg", PDATA_LEN_MAX).unwrap();
        let mut src = Trickle { data: frame, pos: 0, chunk: 3, budget: 2 };
        let mut rx = MpaReceiver::new(FrameKind::Request, PDATA_LEN_MAX);

        assert_eq!(rx.read_from(&mut src).unwrap(), Progress::Incomplete);
        assert_eq!(rx.received(), 6);
        assert!(rx.header().is_none());

        src.budget = 100;
        assert_eq!(rx.read_from(&mut src).unwrap(), Progress::Complete);
        assert_eq!(rx.private_data(), b"abcdefg");
        assert_eq!(rx.header().unwrap().pd_len, 7);
    }

    #[test]
    fn test_reader_stops_at_frame_end() {
        let mut data = encode_frame(FrameKind::Reply, 0, b"ok", PDATA_LEN_MAX).unwrap();
        let frame_len = data.len();
        data.extend_from_slice(b"rdma payload");
        let mut src = Trickle { data, pos: 0, chunk: 64, budget: 100 };
        let mut rx = MpaReceiver::new(FrameKind::Reply, PDATA_LEN_MAX);

        assert_eq!(rx.read_from(&mut src).unwrap(), Progress::Complete);
        assert_eq!(src.pos, frame_len);
    }

    #[test]
    fn test_wrong_key_is_protocol_violation() {
        let frame = encode_frame(FrameKind::Reply, 0, b"", PDATA_LEN_MAX).unwrap();
        let mut src = Trickle { data: frame, pos: 0, chunk: 64, budget: 100 };
        let mut rx = MpaReceiver::new(FrameKind::Request, PDATA_LEN_MAX);
        assert!(matches!(rx.read_from(&mut src), Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn test_declared_length_over_max() {
        let mut hdr = MpaHeader {
            kind: FrameKind::Request,
            flags: 0,
            revision: MPA_REVISION,
            pd_len: 0,
        }
        .encode();
        hdr[18..20].copy_from_slice(&600u16.to_be_bytes());
        let err = MpaHeader::decode(&hdr, FrameKind::Request, PDATA_LEN_MAX).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn test_eof_mid_frame() {
        let frame = encode_frame(FrameKind::Request, 0, b"", PDATA_LEN_MAX).unwrap();
        let mut src = Trickle { data: frame[..10].to_vec(), pos: 0, chunk: 64, budget: 100 };
        let mut rx = MpaReceiver::new(FrameKind::Request, PDATA_LEN_MAX);
        assert!(matches!(rx.read_from(&mut src), Err(Error::PeerClosed)));
    }

    #[test]
    fn test_reject_flag() {
        let frame = encode_frame(FrameKind::Reply, FLAG_REJECT, b"no", PDATA_LEN_MAX).unwrap();
        let mut src = Trickle { data: frame, pos: 0, chunk: 64, budget: 100 };
        let mut rx = MpaReceiver::new(FrameKind::Reply, PDATA_LEN_MAX);
        rx.read_from(&mut src).unwrap();
        assert!(rx.header().unwrap().is_reject());
    }
}

//! Frame encoding/decoding for tubes
//!
//! Frame format (big endian):
//! ```text
//! +--------+--------+--------+--------+
//! | TubeID | Flags  |   Length (2B)   |
//! +--------+--------+--------+--------+
//! |      Ack number / Window+Type     |
//! +--------+--------+--------+--------+
//! |          Frame number (4B)        |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```
//!
//! Frames carrying REQ or RESP are initiate frames: bytes 4-5 hold the
//! advertised window size, byte 6 the tube type and byte 7 is reserved.

use super::TubeType;
use crate::protocol::{ProtocolError, FRAME_HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::ops::BitOr;

/// Flag bits carried in byte 1 of every frame
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    /// Request to open a tube
    pub const REQ: Flags = Flags(0x01);
    /// Response to an open request
    pub const RESP: Flags = Flags(0x02);
    /// Frame belongs to a reliable tube
    pub const RELIABLE: Flags = Flags(0x04);
    /// Ack number field is valid
    pub const ACK: Flags = Flags(0x08);
    /// Sender has finished writing
    pub const FIN: Flags = Flags(0x10);

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True if every bit of `other` is set
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: Flags, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }

    /// REQ or RESP is set
    pub const fn is_initiate(self) -> bool {
        self.0 & (Self::REQ.0 | Self::RESP.0) != 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Flags::REQ, "REQ"),
            (Flags::RESP, "RESP"),
            (Flags::RELIABLE, "REL"),
            (Flags::ACK, "ACK"),
            (Flags::FIN, "FIN"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Flags({})", set.join("|"))
    }
}

/// A data frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Tube the frame belongs to
    pub tube_id: u8,
    /// Flag bits
    pub flags: Flags,
    /// Next frame number the sender of this frame expects to receive
    pub ack_no: u32,
    /// Frame number
    pub frame_no: u32,
    /// Payload data
    pub data: Bytes,
}

/// A tube open request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateFrame {
    /// Tube being opened
    pub tube_id: u8,
    /// Flag bits (REQ or RESP always set)
    pub flags: Flags,
    /// Receive window advertised by the sender of this frame
    pub window_size: u16,
    /// Application-defined tube type
    pub tube_type: TubeType,
    /// Frame number (always 0 for initiate frames)
    pub frame_no: u32,
    /// Payload data
    pub data: Bytes,
}

/// Either frame shape, as decoded from one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(Frame),
    Initiate(InitiateFrame),
}

/// Validate the header and return (flags, payload) for a raw datagram
fn split_header(buf: &[u8]) -> Result<(Flags, Bytes), ProtocolError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(ProtocolError::MalformedFrame(format!(
            "{} bytes is shorter than the {} byte header",
            buf.len(),
            FRAME_HEADER_SIZE
        )));
    }

    let data_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() - FRAME_HEADER_SIZE < data_len {
        return Err(ProtocolError::MalformedFrame(format!(
            "declared length {} exceeds remaining {} bytes",
            data_len,
            buf.len() - FRAME_HEADER_SIZE
        )));
    }

    let data = Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + data_len]);
    Ok((Flags::from_bits(buf[1]), data))
}

impl Frame {
    /// Create a data frame
    pub fn new(tube_id: u8, flags: Flags, ack_no: u32, frame_no: u32, data: Bytes) -> Self {
        Self {
            tube_id,
            flags,
            ack_no,
            frame_no,
            data,
        }
    }

    pub fn has_flags(&self, flags: Flags) -> bool {
        self.flags.contains(flags)
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u8(self.tube_id);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.data.len() as u16);
        buf.put_u32(self.ack_no);
        buf.put_u32(self.frame_no);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decode a frame from one datagram
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (flags, data) = split_header(buf)?;
        let mut header = &buf[4..FRAME_HEADER_SIZE];
        let ack_no = header.get_u32();
        let frame_no = header.get_u32();

        Ok(Self {
            tube_id: buf[0],
            flags,
            ack_no,
            frame_no,
            data,
        })
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.data.len()
    }
}

impl InitiateFrame {
    /// Create an open request
    pub fn request(tube_id: u8, tube_type: TubeType, window_size: u16, reliable: bool) -> Self {
        let mut flags = Flags::REQ | Flags::ACK;
        flags.set(Flags::RELIABLE, reliable);
        Self::with_flags(tube_id, tube_type, window_size, flags)
    }

    /// Create the response to an open request
    pub fn response(tube_id: u8, tube_type: TubeType, window_size: u16, reliable: bool) -> Self {
        let mut flags = Flags::RESP | Flags::ACK;
        flags.set(Flags::RELIABLE, reliable);
        Self::with_flags(tube_id, tube_type, window_size, flags)
    }

    fn with_flags(tube_id: u8, tube_type: TubeType, window_size: u16, flags: Flags) -> Self {
        Self {
            tube_id,
            flags,
            window_size,
            tube_type,
            frame_no: 0,
            data: Bytes::new(),
        }
    }

    pub fn has_flags(&self, flags: Flags) -> bool {
        self.flags.contains(flags)
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.data.len());
        buf.put_u8(self.tube_id);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.data.len() as u16);
        buf.put_u16(self.window_size);
        buf.put_u8(self.tube_type.0);
        buf.put_u8(0);
        buf.put_u32(self.frame_no);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decode an initiate frame from one datagram
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (flags, data) = split_header(buf)?;
        let mut header = &buf[4..FRAME_HEADER_SIZE];
        let window_size = header.get_u16();
        let tube_type = TubeType(header.get_u8());
        header.advance(1);
        let frame_no = header.get_u32();

        Ok(Self {
            tube_id: buf[0],
            flags,
            window_size,
            tube_type,
            frame_no,
            data,
        })
    }
}

impl Packet {
    /// Decode one datagram, picking the frame shape from the REQ/RESP bits
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() >= 2 && Flags::from_bits(buf[1]).is_initiate() {
            InitiateFrame::decode(buf).map(Packet::Initiate)
        } else {
            Frame::decode(buf).map(Packet::Data)
        }
    }

    pub fn tube_id(&self) -> u8 {
        match self {
            Packet::Data(frame) => frame.tube_id,
            Packet::Initiate(frame) => frame.tube_id,
        }
    }

    pub fn flags(&self) -> Flags {
        match self {
            Packet::Data(frame) => frame.flags,
            Packet::Initiate(frame) => frame.flags,
        }
    }
}

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::{ChannelId, Error, Result, Seq, MAX_EXTRA_DATA};
use super::crc::crc16;

/// Start-of-frame marker
pub const FRAME_START: u8 = 0x7E;

/// Marker, length, flags, sequence and function bytes
pub const HEADER_LEN: usize = 5;

/// Length of each CRC trailer
pub const CRC_LEN: usize = 2;

/// Header plus its CRC
pub const FRAME_OVERHEAD: usize = HEADER_LEN + CRC_LEN;

/// Largest frame on the wire
pub const MAX_FRAME_LEN: usize = FRAME_OVERHEAD + MAX_EXTRA_DATA + CRC_LEN;

pub const OFFSET_LENGTH: usize = 1;
pub const OFFSET_FLAGS: usize = 2;
pub const OFFSET_SEQ: usize = 3;
pub const OFFSET_FUNCTION: usize = 4;
pub const OFFSET_HEADER_CRC: usize = 5;

pub const CHANNEL_MASK: u8 = 0x0F;
pub const C_BIT: u8 = 0x10;
pub const Q_BIT: u8 = 0x20;
pub const RESERVED_BITS: u8 = 0xC0;

/// Control frame function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlType {
    /// Receiver ready
    Rr = 0x01,
    /// Receiver not ready
    Rnr = 0x05,
    /// Negative acknowledgment, go back to N(R)
    Reject = 0x09,
    Reset = 0x1B,
    ResetConfirm = 0x1F,
    Restart = 0xFB,
    RestartConfirm = 0xFF,
    /// Diagnostic, one byte of code
    Diag = 0xF1,
}

impl ControlType {
    pub const ALL: [ControlType; 8] = [
        ControlType::Rr,
        ControlType::Rnr,
        ControlType::Reject,
        ControlType::Reset,
        ControlType::ResetConfirm,
        ControlType::Restart,
        ControlType::RestartConfirm,
        ControlType::Diag,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    /// RR, RNR and REJECT
    pub fn is_flow(self) -> bool {
        matches!(self, ControlType::Rr | ControlType::Rnr | ControlType::Reject)
    }
}

impl TryFrom<u8> for ControlType {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        ControlType::ALL
            .into_iter()
            .find(|t| t.code() == code)
            .ok_or_else(|| Error::protocol(format!("unknown control type 0x{:02X}", code)))
    }
}

/// Reason carried by RESET and RESTART
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    DteOriginated,
    OutOfOrder,
    RemoteProcedureError,
    LocalProcedureError,
    Congestion,
    Other(u8),
}

impl Cause {
    pub fn code(self) -> u8 {
        match self {
            Cause::DteOriginated => 0x00,
            Cause::OutOfOrder => 0x01,
            Cause::RemoteProcedureError => 0x03,
            Cause::LocalProcedureError => 0x05,
            Cause::Congestion => 0x07,
            Cause::Other(code) => code,
        }
    }
}

impl From<u8> for Cause {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Cause::DteOriginated,
            0x01 => Cause::OutOfOrder,
            0x03 => Cause::RemoteProcedureError,
            0x05 => Cause::LocalProcedureError,
            0x07 => Cause::Congestion,
            other => Cause::Other(other),
        }
    }
}

/// Diagnostic code carried by DIAG, and optionally by RESET/RESTART
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    NoInformation,
    /// Qualifier or reserved bits not valid for the frame
    InvalidFlags,
    DataOnControlChannel,
    UnknownControlType,
    /// Restart on a session channel, or reset on channel 0
    WrongChannel,
    MalformedCause,
    UnexpectedConfirm,
    /// Extra data of an unsequenced control frame failed its CRC
    DataCrcError,
    OutOfWindow,
    InvalidAck,
    RetransmitExhausted,
    Other(u8),
}

impl Diagnostic {
    pub fn code(self) -> u8 {
        match self {
            Diagnostic::NoInformation => 0x00,
            Diagnostic::InvalidFlags => 0x10,
            Diagnostic::DataOnControlChannel => 0x11,
            Diagnostic::UnknownControlType => 0x12,
            Diagnostic::WrongChannel => 0x13,
            Diagnostic::MalformedCause => 0x14,
            Diagnostic::UnexpectedConfirm => 0x15,
            Diagnostic::DataCrcError => 0x16,
            Diagnostic::OutOfWindow => 0x20,
            Diagnostic::InvalidAck => 0x21,
            Diagnostic::RetransmitExhausted => 0x30,
            Diagnostic::Other(code) => code,
        }
    }
}

impl From<u8> for Diagnostic {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Diagnostic::NoInformation,
            0x10 => Diagnostic::InvalidFlags,
            0x11 => Diagnostic::DataOnControlChannel,
            0x12 => Diagnostic::UnknownControlType,
            0x13 => Diagnostic::WrongChannel,
            0x14 => Diagnostic::MalformedCause,
            0x15 => Diagnostic::UnexpectedConfirm,
            0x16 => Diagnostic::DataCrcError,
            0x20 => Diagnostic::OutOfWindow,
            0x21 => Diagnostic::InvalidAck,
            0x30 => Diagnostic::RetransmitExhausted,
            other => Diagnostic::Other(other),
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub channel: ChannelId,
    /// C-bit: control frame
    pub control: bool,
    /// Q-bit: signalling rather than user data
    pub qualifier: bool,
    /// The two reserved flag bits, as received
    pub reserved: u8,
    /// N(S), low nibble of the sequence byte
    pub ns: Seq,
    /// N(R), high nibble of the sequence byte
    pub nr: Seq,
    /// Control type code, or session packet type for data frames
    pub function: u8,
    /// Extra data length
    pub length: u8,
}

impl Header {
    /// Decodes the four header bytes that follow the marker
    pub fn from_bytes(bytes: [u8; HEADER_LEN - 1]) -> Self {
        let [length, flags, seq, function] = bytes;
        Header {
            channel: ChannelId::from_nibble(flags),
            control: flags & C_BIT != 0,
            qualifier: flags & Q_BIT != 0,
            reserved: flags & RESERVED_BITS,
            ns: Seq::new(seq & 0x0F),
            nr: Seq::new(seq >> 4),
            function,
            length,
        }
    }

    /// The four header bytes that follow the marker
    pub fn to_bytes(&self) -> [u8; HEADER_LEN - 1] {
        [self.length, self.flags(), self.seq_byte(), self.function]
    }

    pub fn flags(&self) -> u8 {
        let mut flags = self.channel.number() & CHANNEL_MASK;
        if self.control {
            flags |= C_BIT;
        }
        if self.qualifier {
            flags |= Q_BIT;
        }
        flags | (self.reserved & RESERVED_BITS)
    }

    pub fn seq_byte(&self) -> u8 {
        seq_byte(self.ns, self.nr)
    }

    /// Control type, if this is a control frame with a known code
    pub fn control_type(&self) -> Option<ControlType> {
        if self.control {
            ControlType::try_from(self.function).ok()
        } else {
            None
        }
    }

    /// CRC over the length..function bytes
    pub fn crc(&self) -> u16 {
        crc16(&self.to_bytes())
    }

    /// Whether this frame consumes a sequence number
    pub fn is_sequenced(&self) -> bool {
        if !self.control {
            return true;
        }
        self.channel.is_control() && self.function == ControlType::Diag.code()
    }
}

/// Packs N(S) into the low nibble and N(R) into the high nibble
pub fn seq_byte(ns: Seq, nr: Seq) -> u8 {
    ns.value() | (nr.value() << 4)
}

/// One frame: header plus up to 61 bytes of extra data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub data: Bytes,
}

impl Frame {
    /// Builds a control frame; sequence fields start at zero
    pub fn control(channel: ChannelId, ctype: ControlType, data: &[u8]) -> Result<Self> {
        Self::build(channel, true, false, ctype.code(), data)
    }

    /// Builds a data frame; sequence fields are stamped at transmit time
    pub fn data(channel: ChannelId, qualifier: bool, function: u8, data: &[u8]) -> Result<Self> {
        Self::build(channel, false, qualifier, function, data)
    }

    fn build(channel: ChannelId, control: bool, qualifier: bool, function: u8, data: &[u8]) -> Result<Self> {
        if data.len() > MAX_EXTRA_DATA {
            return Err(Error::protocol(format!(
                "extra data of {} bytes exceeds {}",
                data.len(),
                MAX_EXTRA_DATA
            )));
        }
        Ok(Frame {
            header: Header {
                channel,
                control,
                qualifier,
                reserved: 0,
                ns: Seq::default(),
                nr: Seq::default(),
                function,
                length: data.len() as u8,
            },
            data: Bytes::copy_from_slice(data),
        })
    }

    pub fn control_type(&self) -> Option<ControlType> {
        self.header.control_type()
    }

    /// Bytes this frame occupies on the wire
    pub fn encoded_len(&self) -> usize {
        if self.data.is_empty() {
            FRAME_OVERHEAD
        } else {
            FRAME_OVERHEAD + self.data.len() + CRC_LEN
        }
    }

    /// Writes the frame, CRCs high byte first
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(FRAME_START);
        let header = self.header.to_bytes();
        dst.put_slice(&header);
        dst.put_u16(crc16(&header));
        if !self.data.is_empty() {
            dst.put_slice(&self.data);
            dst.put_u16(crc16(&self.data));
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut out);
        out.freeze()
    }
}

//! Link-layer PDU: a 7-byte header (`flag | address | length | control |
//! header crc`), then `length` payload bytes and a payload CRC when the
//! length is non-zero. Multi-byte fields are little-endian, both CRCs are
//! CRC-16/XMODEM.
//!
//! The control byte uses HDLC-style packing:
//!
//! ```text
//! Information:  bit0 = 0,  bits[3:1] = seq, bit4 = poll, bits[7:5] = ack
//! Supervisory:  bits[1:0] = 01, bits[3:2] = function, bit4 = final, bits[7:5] = ack
//! Unnumbered:   bits[1:0] = 11, bits[4:2] = function
//! ```

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, Table, CRC_16_XMODEM};
use std::fmt;

pub const FLAG: u8 = 0x14;
pub const HEADER_SIZE: usize = 7;
pub const CRC_SIZE: usize = 2;

pub(crate) const CRC16: Crc<u16, Table<1>> = Crc::<u16, Table<1>>::new(&CRC_16_XMODEM);

const SEQ_MASK: u8 = 0x07;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SupervisoryKind {
    /// Acknowledges everything before the carried ack number.
    ReceiveReady = 0,
    /// Requests retransmission starting at the carried ack number.
    Reject = 1,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UnnumberedKind {
    /// One-shot payload outside the ARQ window (system endpoint only).
    Information = 0,
    /// Requests a reset of the addressed endpoint.
    Reset = 1,
    /// Acknowledges a previously received reset request.
    Ack = 2,
    PollFinal = 3,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Control {
    Information { seq: u8, ack: u8, poll: bool },
    Supervisory { kind: SupervisoryKind, ack: u8, fin: bool },
    Unnumbered { kind: UnnumberedKind },
}

/// Control byte that does not parse as any known frame type. Counted as a
/// protocol violation by the link core.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InvalidControl(pub u8);

impl fmt::Display for InvalidControl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid control byte {:#04x}", self.0)
    }
}

impl Control {
    #[inline]
    pub fn encode(self) -> u8 {
        match self {
            Control::Information { seq, ack, poll } => {
                ((ack & SEQ_MASK) << 5) | ((poll as u8) << 4) | ((seq & SEQ_MASK) << 1)
            }
            Control::Supervisory { kind, ack, fin } => {
                ((ack & SEQ_MASK) << 5) | ((fin as u8) << 4) | ((kind as u8) << 2) | 0b01
            }
            Control::Unnumbered { kind } => ((kind as u8) << 2) | 0b11,
        }
    }

    pub fn decode(byte: u8) -> Result<Control, InvalidControl> {
        if byte & 0x01 == 0 {
            return Ok(Control::Information {
                seq: (byte >> 1) & SEQ_MASK,
                poll: byte & 0x10 != 0,
                ack: (byte >> 5) & SEQ_MASK,
            });
        }

        if byte & 0b11 == 0b01 {
            let kind = match (byte >> 2) & 0b11 {
                0 => SupervisoryKind::ReceiveReady,
                1 => SupervisoryKind::Reject,
                _ => return Err(InvalidControl(byte)),
            };
            return Ok(Control::Supervisory {
                kind,
                fin: byte & 0x10 != 0,
                ack: (byte >> 5) & SEQ_MASK,
            });
        }

        // Unnumbered frames leave the ack bits unused; anything set there is
        // a corrupted or foreign control byte.
        if byte & 0xe0 != 0 {
            return Err(InvalidControl(byte));
        }

        let kind = match (byte >> 2) & 0b111 {
            0 => UnnumberedKind::Information,
            1 => UnnumberedKind::Reset,
            2 => UnnumberedKind::Ack,
            3 => UnnumberedKind::PollFinal,
            _ => return Err(InvalidControl(byte)),
        };

        Ok(Control::Unnumbered { kind })
    }
}

/// A fully parsed link frame. Produced by the framer, consumed by the link
/// core; payloads are owned so frames can cross module boundaries freely.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub address: u8,
    pub control: Control,
    pub payload: Vec<u8>,
}

impl Frame {
    #[inline]
    pub fn new(address: u8, control: Control, payload: Vec<u8>) -> Frame {
        Frame {
            address,
            control,
            payload,
        }
    }

    /// A frame without payload (supervisory and most unnumbered frames).
    #[inline]
    pub fn control_only(address: u8, control: Control) -> Frame {
        Frame::new(address, control, Vec::new())
    }
}

/// Builds the 7 header bytes for the given address/control/length, including
/// the header CRC. Also used as AEAD associated data, where `length` already
/// accounts for the authentication tag.
pub fn encode_header(address: u8, control: Control, length: u16) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0] = FLAG;
    header[1] = address;
    LittleEndian::write_u16(&mut header[2..4], length);
    header[4] = control.encode();
    let crc = CRC16.checksum(&header[..5]);
    LittleEndian::write_u16(&mut header[5..7], crc);
    header
}

//! Byte-stream to frame conversion. The decoder consumes whatever the driver
//! read and emits validated frames plus accounting events for everything it
//! had to throw away; the encoder is the exact inverse.

use crate::frame::{encode_header, Control, Frame, CRC16, CRC_SIZE, FLAG, HEADER_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

#[derive(Debug, Eq, PartialEq)]
pub enum DecodeEvent {
    Frame(Frame),
    /// Header validated but the payload CRC did not. The link core answers
    /// with a REJ so the sender retransmits.
    CorruptPayload { address: u8, control: Control },
    /// Header validated but the control byte does not parse. Counted as a
    /// protocol violation upstream.
    InvalidControl { address: u8, raw: u8 },
    /// Bytes discarded while hunting for a frame boundary.
    Garbage(usize),
}

/// Payload exceeds the negotiated MTU; nothing was written.
#[derive(Debug, Eq, PartialEq)]
pub struct OversizedPayload {
    pub size: usize,
    pub mtu: usize,
}

impl fmt::Display for OversizedPayload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "payload of {} bytes exceeds mtu {}", self.size, self.mtu)
    }
}

impl std::error::Error for OversizedPayload {}

/// Serializes a frame into a contiguous wire buffer.
pub fn encode(frame: &Frame, mtu: usize) -> Result<Vec<u8>, OversizedPayload> {
    if frame.payload.len() > mtu {
        return Err(OversizedPayload {
            size: frame.payload.len(),
            mtu,
        });
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + frame.payload.len() + CRC_SIZE);
    out.extend_from_slice(&encode_header(
        frame.address,
        frame.control,
        frame.payload.len() as u16,
    ));

    if !frame.payload.is_empty() {
        out.extend_from_slice(&frame.payload);
        let crc = CRC16.checksum(&frame.payload);
        let mut trailer = [0u8; CRC_SIZE];
        LittleEndian::write_u16(&mut trailer, crc);
        out.extend_from_slice(&trailer);
    }

    Ok(out)
}

/// Streaming decoder. Push raw bytes in, pull events out until `None`.
pub struct Decoder {
    mtu: usize,
    buf: Vec<u8>,
    cursor: usize,
    pending_garbage: usize,
}

impl Decoder {
    pub fn new(mtu: usize) -> Decoder {
        Decoder {
            mtu,
            buf: Vec::new(),
            cursor: 0,
            pending_garbage: 0,
        }
    }

    /// Appends raw bytes read off the wire.
    pub fn push(&mut self, bytes: &[u8]) {
        // Reclaim consumed prefix before growing.
        if self.cursor > 0 {
            self.buf.drain(..self.cursor);
            self.cursor = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    #[inline]
    fn remaining(&self) -> &[u8] {
        &self.buf[self.cursor..]
    }

    #[inline]
    fn consume(&mut self, count: usize) {
        self.cursor += count;
    }

    #[inline]
    fn discard(&mut self, count: usize) {
        self.cursor += count;
        self.pending_garbage += count;
    }

    #[inline]
    fn flush_garbage(&mut self) -> Option<DecodeEvent> {
        if self.pending_garbage > 0 {
            let count = self.pending_garbage;
            self.pending_garbage = 0;
            Some(DecodeEvent::Garbage(count))
        } else {
            None
        }
    }

    /// Returns the next decoded event, or `None` once more bytes are needed.
    pub fn next_event(&mut self) -> Option<DecodeEvent> {
        loop {
            let data = self.remaining();

            if data.is_empty() {
                return self.flush_garbage();
            }

            if data[0] != FLAG {
                self.discard(1);
                continue;
            }

            // At a flag byte: report the skipped run before decoding further.
            if let Some(event) = self.flush_garbage() {
                return Some(event);
            }
            let data = self.remaining();

            if data.len() < HEADER_SIZE {
                return None;
            }

            let header_crc = LittleEndian::read_u16(&data[5..7]);
            if CRC16.checksum(&data[..5]) != header_crc {
                self.discard(HEADER_SIZE);
                continue;
            }

            let length = LittleEndian::read_u16(&data[2..4]) as usize;
            if length > self.mtu {
                // The length cannot be trusted to skip the alleged payload;
                // drop the header and hunt for the next flag.
                self.discard(HEADER_SIZE);
                continue;
            }

            let total = if length == 0 {
                HEADER_SIZE
            } else {
                HEADER_SIZE + length + CRC_SIZE
            };

            if data.len() < total {
                return None;
            }

            let address = data[1];
            let raw_control = data[4];

            let control = match Control::decode(raw_control) {
                Ok(control) => control,
                Err(_) => {
                    self.consume(total);
                    return Some(DecodeEvent::InvalidControl {
                        address,
                        raw: raw_control,
                    });
                }
            };

            if length == 0 {
                self.consume(total);
                return Some(DecodeEvent::Frame(Frame::control_only(address, control)));
            }

            let payload = &data[HEADER_SIZE..HEADER_SIZE + length];
            let payload_crc = LittleEndian::read_u16(&data[HEADER_SIZE + length..total]);

            if CRC16.checksum(payload) != payload_crc {
                self.consume(total);
                return Some(DecodeEvent::CorruptPayload { address, control });
            }

            let payload = payload.to_vec();
            self.consume(total);
            return Some(DecodeEvent::Frame(Frame::new(address, control, payload)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{SupervisoryKind, UnnumberedKind};

    const MTU: usize = ingot::MAX_PAYLOAD;

    fn information(payload: &[u8]) -> Frame {
        Frame::new(
            5,
            Control::Information {
                seq: 1,
                ack: 2,
                poll: true,
            },
            payload.to_vec(),
        )
    }

    fn decode_all(decoder: &mut Decoder, bytes: &[u8]) -> Vec<DecodeEvent> {
        decoder.push(bytes);
        let mut events = Vec::new();
        while let Some(event) = decoder.next_event() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let frame = information(b"ping");
        let wire = encode(&frame, MTU).unwrap();

        let mut decoder = Decoder::new(MTU);
        let events = decode_all(&mut decoder, &wire);

        assert_eq!(events, vec![DecodeEvent::Frame(frame)]);
    }

    #[test]
    fn test_zero_length_frame_has_no_payload_crc() {
        let frame = Frame::control_only(
            3,
            Control::Supervisory {
                kind: SupervisoryKind::ReceiveReady,
                ack: 4,
                fin: false,
            },
        );
        let wire = encode(&frame, MTU).unwrap();
        assert_eq!(wire.len(), HEADER_SIZE);

        let mut decoder = Decoder::new(MTU);
        assert_eq!(decode_all(&mut decoder, &wire), vec![DecodeEvent::Frame(frame)]);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let frame = information(&vec![0u8; MTU + 1]);
        assert_eq!(
            encode(&frame, MTU),
            Err(OversizedPayload {
                size: MTU + 1,
                mtu: MTU
            })
        );
    }

    #[test]
    fn test_resync_over_leading_garbage() {
        let frame = information(b"data");
        let mut wire = vec![0x00, 0x42, 0x99];
        wire.extend(encode(&frame, MTU).unwrap());

        let mut decoder = Decoder::new(MTU);
        let events = decode_all(&mut decoder, &wire);

        assert_eq!(
            events,
            vec![DecodeEvent::Garbage(3), DecodeEvent::Frame(frame)]
        );
    }

    #[test]
    fn test_header_crc_mismatch_discards_header() {
        let frame = information(b"data");
        let mut wire = encode(&frame, MTU).unwrap();
        wire[1] ^= 0xff;
        wire.extend(encode(&frame, MTU).unwrap());

        let mut decoder = Decoder::new(MTU);
        let events = decode_all(&mut decoder, &wire);

        // The corrupted copy is consumed as garbage, the clean copy decodes.
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], DecodeEvent::Garbage(_)));
        assert_eq!(events[1], DecodeEvent::Frame(frame));
    }

    #[test]
    fn test_payload_crc_mismatch_reports_corruption() {
        let frame = information(b"payload");
        let mut wire = encode(&frame, MTU).unwrap();
        // Flip a payload byte; header stays intact.
        wire[HEADER_SIZE + 2] ^= 0x01;

        let mut decoder = Decoder::new(MTU);
        let events = decode_all(&mut decoder, &wire);

        assert_eq!(
            events,
            vec![DecodeEvent::CorruptPayload {
                address: frame.address,
                control: frame.control,
            }]
        );
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let frame = information(b"split across reads");
        let wire = encode(&frame, MTU).unwrap();
        let (head, tail) = wire.split_at(HEADER_SIZE + 3);

        let mut decoder = Decoder::new(MTU);
        assert_eq!(decode_all(&mut decoder, head), vec![]);
        assert_eq!(decode_all(&mut decoder, tail), vec![DecodeEvent::Frame(frame)]);
    }

    #[test]
    fn test_oversized_length_field_resyncs() {
        let mut decoder = Decoder::new(64);

        // Hand-build a header claiming a payload larger than the MTU.
        let control = Control::Unnumbered {
            kind: UnnumberedKind::Information,
        };
        let header = encode_header(1, control, 65);
        let follow = Frame::control_only(
            2,
            Control::Unnumbered {
                kind: UnnumberedKind::Ack,
            },
        );

        let mut wire = header.to_vec();
        wire.extend(encode(&follow, 64).unwrap());

        let events = decode_all(&mut decoder, &wire);
        assert_eq!(
            events,
            vec![
                DecodeEvent::Garbage(HEADER_SIZE),
                DecodeEvent::Frame(follow)
            ]
        );
    }

    #[test]
    fn test_invalid_control_surfaces_with_address() {
        // Valid header CRC around an impossible control byte.
        let mut header = [0u8; HEADER_SIZE];
        header[0] = FLAG;
        header[1] = 7;
        LittleEndian::write_u16(&mut header[2..4], 0);
        header[4] = 0xe3; // unnumbered pattern with ack bits set
        let crc = CRC16.checksum(&header[..5]);
        LittleEndian::write_u16(&mut header[5..7], crc);

        let mut decoder = Decoder::new(MTU);
        let events = decode_all(&mut decoder, &header);

        assert_eq!(
            events,
            vec![DecodeEvent::InvalidControl {
                address: 7,
                raw: 0xe3
            }]
        );
    }

    #[test]
    fn test_back_to_back_frames() {
        let first = information(b"first");
        let second = Frame::control_only(
            0,
            Control::Unnumbered {
                kind: UnnumberedKind::Reset,
            },
        );

        let mut wire = encode(&first, MTU).unwrap();
        wire.extend(encode(&second, MTU).unwrap());

        let mut decoder = Decoder::new(MTU);
        assert_eq!(
            decode_all(&mut decoder, &wire),
            vec![DecodeEvent::Frame(first), DecodeEvent::Frame(second)]
        );
    }
}

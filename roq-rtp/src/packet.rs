use std::fmt;

use bytes::{Buf, Bytes};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::Header;

/// Packet represents an RTP Packet
///
/// Padding is stripped on unmarshal and `header.padding` cleared, so a parsed
/// packet marshals back to the same header and payload without the padding.
#[derive(Debug, Eq, PartialEq, Default, Clone)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = "RTP PACKET:\n".to_string();

        out += format!("\tVersion: {}\n", self.header.version).as_str();
        out += format!("\tMarker: {}\n", self.header.marker).as_str();
        out += format!("\tPayload Type: {}\n", self.header.payload_type).as_str();
        out += format!("\tSequence Number: {}\n", self.header.sequence_number).as_str();
        out += format!("\tTimestamp: {}\n", self.header.timestamp).as_str();
        out += format!("\tSSRC: {} ({:x})\n", self.header.ssrc, self.header.ssrc).as_str();
        out += format!("\tPayload Length: {}\n", self.payload.len()).as_str();

        write!(f, "{out}")
    }
}

impl Unmarshal for Packet {
    /// Unmarshal parses the passed byte slice and stores the result in the Packet this method is called upon
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let mut header = Header::unmarshal(raw_packet)?;
        let payload_len = raw_packet.remaining();
        let payload = raw_packet.copy_to_bytes(payload_len);
        if header.padding {
            if payload_len == 0 {
                return Err(Error::ErrShortPacket);
            }
            let padding_len = payload[payload_len - 1] as usize;
            if padding_len == 0 || padding_len > payload_len {
                return Err(Error::ErrInvalidPadding);
            }
            header.padding = false;
            Ok(Packet {
                header,
                payload: payload.slice(..payload_len - padding_len),
            })
        } else {
            Ok(Packet { header, payload })
        }
    }
}

impl MarshalSize for Packet {
    /// MarshalSize returns the size of the packet once marshaled.
    fn marshal_size(&self) -> usize {
        self.header.marshal_size() + self.payload.len()
    }
}

impl Marshal for Packet {
    /// MarshalTo serializes the packet and writes to the buffer.
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.marshal_size() {
            return Err(Error::ErrBufferTooSmall);
        }

        let n = self.header.marshal_to(buf)?;
        let end = n + self.payload.len();
        buf[n..end].copy_from_slice(&self.payload);

        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(seq: u16, marker: bool, payload: &'static [u8]) -> Packet {
        Packet {
            header: Header {
                version: 2,
                marker,
                payload_type: 96,
                sequence_number: seq,
                timestamp: 3000,
                ssrc: 0x1234_5678,
                ..Default::default()
            },
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_packet_marshal_unmarshal() -> Result<()> {
        let packet = make_packet(65535, true, &[0x98, 0x36, 0xbe, 0x88, 0x9e]);
        let raw = packet.marshal()?;
        assert_eq!(raw.len(), 12 + 5);

        let mut buf = raw.freeze();
        let parsed = Packet::unmarshal(&mut buf)?;
        assert_eq!(parsed, packet);

        Ok(())
    }

    #[test]
    fn test_packet_padding_is_stripped() -> Result<()> {
        let raw: &[u8] = &[
            0xa0, 0x60, 0x00, 0x01, 0x00, 0x00, 0x0b, 0xb8, 0x12, 0x34, 0x56, 0x78, 0xde, 0xad,
            0x00, 0x00, 0x03,
        ];
        let mut buf = raw;
        let packet = Packet::unmarshal(&mut buf)?;
        assert!(!packet.header.padding);
        assert_eq!(&packet.payload[..], &[0xde, 0xad]);

        Ok(())
    }

    #[test]
    fn test_packet_padding_longer_than_payload() {
        let raw: &[u8] = &[
            0xa0, 0x60, 0x00, 0x01, 0x00, 0x00, 0x0b, 0xb8, 0x12, 0x34, 0x56, 0x78, 0x00, 0x09,
        ];
        let mut buf = raw;
        assert_eq!(Packet::unmarshal(&mut buf), Err(Error::ErrInvalidPadding));
    }

    #[test]
    fn test_packet_marshal_to_small_buffer() {
        let packet = make_packet(1, false, &[1, 2, 3]);
        let mut buf = [0u8; 14];
        assert_eq!(packet.marshal_to(&mut buf), Err(Error::ErrBufferTooSmall));
    }
}

//! GTP1-U header encoding/decoding
//!
//! The wire format is the minimal GTP-U header of 3GPP TS 29.281:
//!
//! ```text
//! +--------+--------+--------+--------+
//! | flags  |  type  |     length      |
//! +--------+--------+--------+--------+
//! |               TEID                |
//! +--------+--------+--------+--------+
//! ```
//!
//! `flags` is fixed at 0x30 (version 1, protocol type GTP, no optional
//! fields) and `type` at 0xFF (T-PDU). `length` is the inner payload
//! length in network byte order. Anything else is rejected on decode.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// GTP-U default UDP port.
pub const GTP1U_PORT: u16 = 2152;

/// The only flags byte accepted on the wire: version 1, PT=GTP,
/// E/S/PN all clear.
pub const GTP1_FLAGS: u8 = 0x30;

/// T-PDU (G-PDU) message type; the only type carried on this path.
pub const GTP1_MSGTYPE_TPDU: u8 = 0xFF;

/// GTP-U codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GtpError {
    /// Datagram shorter than the fixed header
    #[error("buffer too short: need {needed} bytes, have {available}")]
    BufferTooShort {
        /// Number of bytes needed
        needed: usize,
        /// Number of bytes available
        available: usize,
    },
    /// Flags byte differs from 0x30
    #[error("unexpected GTP flags: {0:#04x}")]
    InvalidFlags(u8),
    /// Message type differs from T-PDU
    #[error("unexpected GTP message type: {0:#04x}")]
    InvalidMessageType(u8),
    /// Header length field claims more payload than was received
    #[error("short GTP message: header claims {claimed} payload bytes, {available} received")]
    TruncatedPayload {
        /// Payload length from the header
        claimed: usize,
        /// Payload bytes actually present
        available: usize,
    },
    /// Payload too large for the 16-bit length field
    #[error("payload too large for GTP length field: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Plain GTP1-U header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gtp1Header {
    /// Tunnel Endpoint Identifier
    pub teid: u32,
    /// Inner payload length
    pub length: u16,
}

impl Gtp1Header {
    /// Encoded header size in bytes.
    pub const SIZE: usize = 8;

    /// Create a T-PDU header for a payload of the given length.
    ///
    /// # Errors
    ///
    /// Returns `GtpError::PayloadTooLarge` if the payload does not fit
    /// the 16-bit length field.
    pub fn g_pdu(teid: u32, payload_len: usize) -> Result<Self, GtpError> {
        let length = u16::try_from(payload_len)
            .map_err(|_| GtpError::PayloadTooLarge(payload_len))?;
        Ok(Self { teid, length })
    }

    /// Encode the header into a fixed-size array.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        self.write_into(&mut buf);
        buf
    }

    /// Write the header into the first 8 bytes of `buf`.
    ///
    /// Used by the uplink path to fill a reserved prefix in front of a
    /// frame that is already in place.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`Self::SIZE`] (caller-reserved
    /// prefix).
    pub fn write_into(&self, buf: &mut [u8]) {
        buf[0] = GTP1_FLAGS;
        buf[1] = GTP1_MSGTYPE_TPDU;
        buf[2..4].copy_from_slice(&self.length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.teid.to_be_bytes());
    }

    /// Encode a complete T-PDU packet (header + payload).
    ///
    /// Convenience for tests and callers that do not manage their own
    /// buffers. Payloads beyond 65535 bytes are truncated by the
    /// caller's contract; data-plane buffers are MTU-bounded.
    pub fn encode_packet(teid: u32, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE + payload.len());
        buf.put_u8(GTP1_FLAGS);
        buf.put_u8(GTP1_MSGTYPE_TPDU);
        buf.put_u16(payload.len() as u16);
        buf.put_u32(teid);
        buf.put_slice(payload);
        buf
    }

    /// Decode and validate a header from a received datagram.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram is shorter than the header, the
    /// flags byte is not 0x30, the message type is not T-PDU, or the
    /// length field claims more payload than the datagram carries.
    pub fn decode(datagram: &[u8]) -> Result<Self, GtpError> {
        if datagram.len() < Self::SIZE {
            return Err(GtpError::BufferTooShort {
                needed: Self::SIZE,
                available: datagram.len(),
            });
        }

        if datagram[0] != GTP1_FLAGS {
            return Err(GtpError::InvalidFlags(datagram[0]));
        }
        if datagram[1] != GTP1_MSGTYPE_TPDU {
            return Err(GtpError::InvalidMessageType(datagram[1]));
        }

        let length = u16::from_be_bytes([datagram[2], datagram[3]]);
        let teid = u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);

        if Self::SIZE + length as usize > datagram.len() {
            return Err(GtpError::TruncatedPayload {
                claimed: length as usize,
                available: datagram.len() - Self::SIZE,
            });
        }

        Ok(Self { teid, length })
    }

    /// The inner payload of a datagram this header was decoded from:
    /// exactly `length` bytes after the header. Trailing datagram bytes
    /// beyond the claimed length are not part of the payload.
    pub fn payload<'a>(&self, datagram: &'a [u8]) -> &'a [u8] {
        &datagram[Self::SIZE..Self::SIZE + self.length as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_minimal_packet() {
        let packet = Gtp1Header::encode_packet(0x12345678, b"hello");
        let decoded = Gtp1Header::decode(&packet).unwrap();

        assert_eq!(decoded.teid, 0x12345678);
        assert_eq!(decoded.length, 5);
        assert_eq!(decoded.payload(&packet), b"hello");
    }

    #[test]
    fn test_wire_layout() {
        let packet = Gtp1Header::encode_packet(1, &[0xAA, 0xBB]);
        assert_eq!(&packet[..], &[0x30, 0xFF, 0x00, 0x02, 0, 0, 0, 1, 0xAA, 0xBB]);
    }

    #[test]
    fn test_write_into_prefix() {
        let mut buf = vec![0u8; Gtp1Header::SIZE + 4];
        buf[8..].copy_from_slice(&[1, 2, 3, 4]);
        let header = Gtp1Header::g_pdu(0xDEADBEEF, 4).unwrap();
        header.write_into(&mut buf);

        let decoded = Gtp1Header::decode(&buf).unwrap();
        assert_eq!(decoded.teid, 0xDEADBEEF);
        assert_eq!(decoded.payload(&buf), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_decode_short_datagram() {
        let result = Gtp1Header::decode(&[0x30, 0xFF, 0x00]);
        assert_eq!(
            result,
            Err(GtpError::BufferTooShort {
                needed: 8,
                available: 3
            })
        );
    }

    #[test]
    fn test_decode_rejects_sequence_flag() {
        // Version 1 with the S bit set is not acceptable on this path.
        let mut packet = Gtp1Header::encode_packet(1, b"x").to_vec();
        packet[0] = 0x32;
        assert_eq!(Gtp1Header::decode(&packet), Err(GtpError::InvalidFlags(0x32)));
    }

    #[test]
    fn test_decode_rejects_gtp0() {
        let mut packet = Gtp1Header::encode_packet(1, b"x").to_vec();
        packet[0] = 0x1e;
        assert_eq!(Gtp1Header::decode(&packet), Err(GtpError::InvalidFlags(0x1e)));
    }

    #[test]
    fn test_decode_rejects_echo_request() {
        let mut packet = Gtp1Header::encode_packet(1, &[]).to_vec();
        packet[1] = 0x01;
        assert_eq!(
            Gtp1Header::decode(&packet),
            Err(GtpError::InvalidMessageType(0x01))
        );
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let mut packet = Gtp1Header::encode_packet(1, b"abcd").to_vec();
        // Claim more payload than the datagram carries.
        packet[2..4].copy_from_slice(&100u16.to_be_bytes());
        assert_eq!(
            Gtp1Header::decode(&packet),
            Err(GtpError::TruncatedPayload {
                claimed: 100,
                available: 4
            })
        );
    }

    #[test]
    fn test_payload_ignores_trailing_bytes() {
        // A datagram longer than header+length yields exactly `length`
        // payload bytes.
        let mut packet = Gtp1Header::encode_packet(7, b"abcd").to_vec();
        packet.extend_from_slice(b"zz");
        let header = Gtp1Header::decode(&packet).unwrap();
        assert_eq!(header.payload(&packet), b"abcd");
    }

    #[test]
    fn test_g_pdu_rejects_oversized_payload() {
        assert_eq!(
            Gtp1Header::g_pdu(1, 70000),
            Err(GtpError::PayloadTooLarge(70000))
        );
    }
}

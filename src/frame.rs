//! Modbus TCP frame (ADU) encoding and decoding.
//!
//! An ADU is a 7-byte MBAP header followed by the PDU. The header's length
//! field counts the unit id plus the PDU, which makes the stream
//! length-delimited: read exactly 7 bytes, then exactly `length - 1` more.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::error::{ModbusError, ModbusResult};
use crate::MAX_PDU_SIZE;

/// Size of the MBAP header in bytes.
pub const MBAP_HEADER_SIZE: usize = 7;

/// MBAP (Modbus Application Protocol) header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// Always 0 for Modbus.
    pub protocol_id: u16,
    /// Byte count of everything after this field: unit id + PDU.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn new(transaction_id: u16, unit_id: u8, pdu_length: u16) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: pdu_length + 1,
            unit_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; MBAP_HEADER_SIZE] {
        let mut bytes = [0u8; MBAP_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6] = self.unit_id;
        bytes
    }

    pub fn from_bytes(data: &[u8]) -> ModbusResult<Self> {
        if data.len() < MBAP_HEADER_SIZE {
            return Err(ModbusError::frame(format!(
                "MBAP header needs {} bytes, got {}",
                MBAP_HEADER_SIZE,
                data.len()
            )));
        }
        let protocol_id = u16::from_be_bytes([data[2], data[3]]);
        if protocol_id != 0 {
            return Err(ModbusError::frame(format!(
                "invalid protocol id: {protocol_id}"
            )));
        }
        let length = u16::from_be_bytes([data[4], data[5]]);
        if length == 0 || length as usize > MAX_PDU_SIZE + 1 {
            return Err(ModbusError::frame(format!("invalid MBAP length: {length}")));
        }
        Ok(Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id,
            length,
            unit_id: data[6],
        })
    }

    /// PDU byte count implied by the header.
    pub fn pdu_length(&self) -> usize {
        self.length as usize - 1
    }
}

/// A complete Modbus TCP ADU: MBAP header plus PDU bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpFrame {
    pub header: MbapHeader,
    pub pdu: Vec<u8>,
}

impl TcpFrame {
    pub fn new(transaction_id: u16, unit_id: u8, pdu: Vec<u8>) -> Self {
        let header = MbapHeader::new(transaction_id, unit_id, pdu.len() as u16);
        Self { header, pdu }
    }

    /// Serialize the ADU into a contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MBAP_HEADER_SIZE + self.pdu.len());
        buf.put_slice(&self.header.to_bytes());
        buf.put_slice(&self.pdu);
        buf.freeze()
    }

    /// Parse a complete ADU. The declared length must match the bytes
    /// actually present; short or padded frames are rejected.
    pub fn decode(data: &[u8]) -> ModbusResult<Self> {
        let header = MbapHeader::from_bytes(data)?;
        let expected = MBAP_HEADER_SIZE + header.pdu_length();
        if data.len() != expected {
            warn!(
                declared = expected,
                actual = data.len(),
                "frame length mismatch"
            );
            return Err(ModbusError::frame(format!(
                "frame declares {} bytes but carries {}",
                expected,
                data.len()
            )));
        }
        Ok(Self {
            header,
            pdu: data[MBAP_HEADER_SIZE..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mbap_header_round_trip() {
        let header = MbapHeader::new(0x1234, 0x11, 5);
        assert_eq!(header.length, 6);

        let bytes = header.to_bytes();
        assert_eq!(bytes, [0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x11]);
        assert_eq!(MbapHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_nonzero_protocol_id_rejected() {
        let bytes = [0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x11];
        assert!(matches!(
            MbapHeader::from_bytes(&bytes),
            Err(ModbusError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_frame_round_trip() {
        let pdu = vec![0x03, 0x00, 0x0A, 0x00, 0x02];
        let frame = TcpFrame::new(0x0042, 17, pdu.clone());
        let encoded = frame.encode();
        assert_eq!(
            encoded.as_ref(),
            &[0x00, 0x42, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x0A, 0x00, 0x02]
        );

        let decoded = TcpFrame::decode(&encoded).unwrap();
        assert_eq!(decoded.header.transaction_id, 0x0042);
        assert_eq!(decoded.header.unit_id, 17);
        assert_eq!(decoded.pdu, pdu);
    }

    #[test]
    fn test_declared_length_must_match_payload() {
        // Header says 6 bytes follow the length field, but only the unit id
        // and 3 PDU bytes are present.
        let short = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x0A];
        assert!(matches!(
            TcpFrame::decode(&short),
            Err(ModbusError::MalformedFrame(_))
        ));

        // Trailing garbage after the declared frame end is equally malformed.
        let long = [
            0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x11, 0x05, 0xAA, 0xBB, 0xCC,
        ];
        assert!(TcpFrame::decode(&long).is_err());
    }

    #[test]
    fn test_zero_length_rejected() {
        let bytes = [0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x11];
        assert!(MbapHeader::from_bytes(&bytes).is_err());
    }
}

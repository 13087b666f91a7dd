//! H4 (UART transport) packet framing.

use byteorder::{ByteOrder, LE};
use std::io::{self, Read};

pub const H4_COMMAND: u8 = 0x01;
pub const H4_ACL: u8 = 0x02;
pub const H4_SCO: u8 = 0x03;
pub const H4_EVENT: u8 = 0x04;

pub const EVENT_COMMAND_COMPLETE: u8 = 0x0e;
pub const EVENT_COMMAND_STATUS: u8 = 0x0f;
pub const EVENT_VENDOR: u8 = 0xff;

/// Parameter payload of a vendor event that carries a tapped LMP PDU.
pub const LMP_EVENT_TAG: &[u8; 3] = b"LMP";

/// A complete H4 packet, including its leading type byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H4Packet(pub Vec<u8>);

impl H4Packet {
    pub fn packet_type(&self) -> u8 {
        self.0[0]
    }

    /// Event code and parameters, if this is an HCI event.
    pub fn event(&self) -> Option<(u8, &[u8])> {
        if self.0.len() >= 3 && self.packet_type() == H4_EVENT {
            Some((self.0[1], &self.0[3..]))
        } else {
            None
        }
    }
}

/// Build an H4 command packet.
pub fn command_packet(opcode: u16, params: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(H4_COMMAND);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Build an H4 event packet.
pub fn event_packet(code: u8, params: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(3 + params.len());
    packet.push(H4_EVENT);
    packet.push(code);
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Read one packet from the stream.
///
/// Returns `Ok(None)` on a clean end of stream before a type byte. An
/// unknown type byte means the stream is out of sync and is reported as
/// `InvalidData`.
pub fn read_packet<R: Read + ?Sized>(reader: &mut R) -> io::Result<Option<H4Packet>> {
    let mut packet_type = [0u8; 1];
    loop {
        match reader.read(&mut packet_type) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let header_len = match packet_type[0] {
        H4_COMMAND => 3,
        H4_ACL => 4,
        H4_SCO => 3,
        H4_EVENT => 2,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown H4 packet type {:#04x}", other),
            ))
        }
    };

    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header)?;

    let payload_len = match packet_type[0] {
        H4_ACL => LE::read_u16(&header[2..4]) as usize,
        H4_EVENT => header[1] as usize,
        _ => header[2] as usize,
    };

    let mut packet = Vec::with_capacity(1 + header_len + payload_len);
    packet.push(packet_type[0]);
    packet.extend_from_slice(&header);
    packet.resize(1 + header_len + payload_len, 0);
    reader.read_exact(&mut packet[1 + header_len..])?;

    Ok(Some(H4Packet(packet)))
}

/// Reply to an outstanding command, decoded from Command Complete or
/// Command Status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub opcode: u16,
    pub status: u8,
    /// Return parameters after the status byte (empty for Command Status).
    pub data: Vec<u8>,
    /// True for Command Status, which only acknowledges reception.
    pub is_status_only: bool,
}

/// Decode a Command Complete / Command Status event.
///
/// `Ok(None)` for other events; `Err` for a completion event too short to
/// carry its fixed fields.
pub fn parse_response(code: u8, params: &[u8]) -> Result<Option<CommandResponse>, String> {
    match code {
        EVENT_COMMAND_COMPLETE => {
            if params.len() < 4 {
                return Err(format!(
                    "Command Complete with {} parameter bytes",
                    params.len()
                ));
            }
            Ok(Some(CommandResponse {
                opcode: LE::read_u16(&params[1..3]),
                status: params[3],
                data: params[4..].to_vec(),
                is_status_only: false,
            }))
        }
        EVENT_COMMAND_STATUS => {
            if params.len() < 4 {
                return Err(format!(
                    "Command Status with {} parameter bytes",
                    params.len()
                ));
            }
            Ok(Some(CommandResponse {
                opcode: LE::read_u16(&params[2..4]),
                status: params[0],
                data: Vec::new(),
                is_status_only: true,
            }))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_command_packet_layout() {
        let packet = command_packet(0xfc4d, &[0x00, 0x50, 0x09, 0x00, 0x08]);
        assert_eq!(
            packet,
            vec![0x01, 0x4d, 0xfc, 0x05, 0x00, 0x50, 0x09, 0x00, 0x08]
        );
    }

    #[test]
    fn test_read_packets_in_sequence() {
        let mut stream = Vec::new();
        stream.extend(event_packet(EVENT_COMMAND_COMPLETE, &[1, 0x4c, 0xfc, 0]));
        stream.extend([H4_ACL, 0x01, 0x20, 0x02, 0x00, 0xaa, 0xbb]);
        stream.extend(command_packet(0x0c03, &[]));

        let mut cursor = Cursor::new(stream);
        let first = read_packet(&mut cursor).unwrap().unwrap();
        assert_eq!(first.event().unwrap().0, EVENT_COMMAND_COMPLETE);

        let acl = read_packet(&mut cursor).unwrap().unwrap();
        assert_eq!(acl.packet_type(), H4_ACL);
        assert_eq!(acl.0.len(), 7);

        let cmd = read_packet(&mut cursor).unwrap().unwrap();
        assert_eq!(cmd.0, vec![0x01, 0x03, 0x0c, 0x00]);

        assert!(read_packet(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_unknown_type_is_invalid_data() {
        let mut cursor = Cursor::new(vec![0x7f, 0, 0]);
        let err = read_packet(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_packet_is_error() {
        let mut cursor = Cursor::new(vec![H4_EVENT, 0x0e, 0x04, 0x01]);
        assert!(read_packet(&mut cursor).is_err());
    }

    #[test]
    fn test_parse_command_complete() {
        let resp = parse_response(EVENT_COMMAND_COMPLETE, &[1, 0x4d, 0xfc, 0, 0xde, 0xad])
            .unwrap()
            .unwrap();
        assert_eq!(resp.opcode, 0xfc4d);
        assert_eq!(resp.status, 0);
        assert_eq!(resp.data, vec![0xde, 0xad]);
        assert!(!resp.is_status_only);
    }

    #[test]
    fn test_parse_command_status() {
        let resp = parse_response(EVENT_COMMAND_STATUS, &[0x0c, 1, 0x4e, 0xfc])
            .unwrap()
            .unwrap();
        assert_eq!(resp.opcode, 0xfc4e);
        assert_eq!(resp.status, 0x0c);
        assert!(resp.is_status_only);
    }

    #[test]
    fn test_parse_malformed_and_unrelated() {
        assert!(parse_response(EVENT_COMMAND_COMPLETE, &[1, 0x4d]).is_err());
        assert!(parse_response(0x05, &[0, 1, 2]).unwrap().is_none());
    }
}

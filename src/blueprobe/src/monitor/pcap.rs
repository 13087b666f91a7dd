//! Capture-stream (classic pcap) framing.

use crate::bdaddr::BdAddr;
use crate::channel::{CaptureKind, CaptureRecord, Direction};
use byteorder::{WriteBytesExt, LE};
use std::time::{SystemTime, UNIX_EPOCH};

pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
pub const PCAP_VERSION: (u16, u16) = (2, 4);
pub const PCAP_SNAPLEN: u32 = 65535;

/// Bluetooth HCI H4 with a 4-byte direction pseudo-header.
pub const LINKTYPE_BLUETOOTH_HCI_H4_WITH_PHDR: u32 = 201;
/// LMP PDUs travel inside a synthetic Ethernet frame.
pub const LINKTYPE_ETHERNET: u32 = 1;

pub const GLOBAL_HEADER_LEN: usize = 24;
pub const RECORD_HEADER_LEN: usize = 16;

/// Ethertype of the synthetic LMP frame.
const LMP_ETHERTYPE: [u8; 2] = [0xff, 0xf0];

pub fn linktype(kind: CaptureKind) -> u32 {
    match kind {
        CaptureKind::Hci => LINKTYPE_BLUETOOTH_HCI_H4_WITH_PHDR,
        CaptureKind::Lmp => LINKTYPE_ETHERNET,
    }
}

pub fn global_header(kind: CaptureKind) -> Vec<u8> {
    let mut header = Vec::with_capacity(GLOBAL_HEADER_LEN);
    // Writes into a Vec cannot fail
    let _ = header.write_u32::<LE>(PCAP_MAGIC);
    let _ = header.write_u16::<LE>(PCAP_VERSION.0);
    let _ = header.write_u16::<LE>(PCAP_VERSION.1);
    let _ = header.write_i32::<LE>(0);
    let _ = header.write_u32::<LE>(0);
    let _ = header.write_u32::<LE>(PCAP_SNAPLEN);
    let _ = header.write_u32::<LE>(linktype(kind));
    header
}

/// Record header plus payload.
pub fn record(timestamp: SystemTime, payload: &[u8]) -> Vec<u8> {
    let since_epoch = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    let _ = out.write_u32::<LE>(since_epoch.as_secs() as u32);
    let _ = out.write_u32::<LE>(since_epoch.subsec_micros());
    let _ = out.write_u32::<LE>(payload.len() as u32);
    let _ = out.write_u32::<LE>(payload.len() as u32);
    out.extend_from_slice(payload);
    out
}

/// `00 00 00 dir` followed by the raw H4 packet.
pub fn hci_payload(capture: &CaptureRecord) -> Vec<u8> {
    let direction = match capture.direction {
        Direction::Sent => 0,
        Direction::Received => 1,
    };
    let mut payload = vec![0, 0, 0, direction];
    payload.extend_from_slice(&capture.payload);
    payload
}

/// Ethernet-style wrapper: destination, source, ethertype, a 6-byte meta
/// block carrying the direction, a 4-byte header encoding the PDU length,
/// the PDU and a zero CRC placeholder.
pub fn lmp_payload(capture: &CaptureRecord, local: BdAddr) -> Vec<u8> {
    let remote = capture.remote.unwrap_or_default();
    let (src, dest, meta) = match capture.direction {
        Direction::Sent => (local, remote, [0u8; 6]),
        Direction::Received => (remote, local, [1, 0, 0, 0, 0, 0]),
    };

    let pdu = &capture.payload;
    let mut payload = Vec::with_capacity(28 + pdu.len());
    payload.extend_from_slice(&dest.0);
    payload.extend_from_slice(&src.0);
    payload.extend_from_slice(&LMP_ETHERTYPE);
    payload.extend_from_slice(&meta);
    payload.extend_from_slice(&[0x19, 0x00, 0x00, ((pdu.len() << 3) | 7) as u8]);
    payload.extend_from_slice(pdu);
    payload.extend_from_slice(&[0, 0]);
    payload
}

/// One complete capture-stream record for `capture`.
pub fn frame(kind: CaptureKind, capture: &CaptureRecord, local: BdAddr) -> Vec<u8> {
    let payload = match kind {
        CaptureKind::Hci => hci_payload(capture),
        CaptureKind::Lmp => lmp_payload(capture, local),
    };
    record(capture.timestamp, &payload)
}

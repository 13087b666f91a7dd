//! Sending LMP PDUs on an established link.
//!
//! The controller has no host command for this, so a small routine from
//! the firmware map is assembled for the chosen connection, written to RAM
//! together with the PDU and launched.

use crate::bdaddr::BdAddr;
use crate::connection::{Connection, ConnectionRegistry};
use crate::error::{Error, Result};
use crate::hook::Assembler;
use crate::memory::MemoryEngine;
use tracing::{debug, info};

/// Opcode that introduces an extended opcode in the second byte.
pub const LMP_ESCAPE_OPCODE: u8 = 0x7f;

/// Largest PDU, opcode bytes included.
pub const MAX_LMP_PDU: usize = 17;

/// Which connection a PDU goes out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LmpTarget {
    /// The only active connection; fails if there are none or several.
    Active,
    /// Connection `number`. With `check`, its slot must be occupied.
    Number { number: usize, check: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LmpReport {
    pub connection: u32,
    /// Unknown when the connection was not checked.
    pub remote: Option<BdAddr>,
    pub pdu: Vec<u8>,
}

/// Encode a PDU. The low bit of the first byte is the transaction id:
/// 0 for a transaction started by the master.
pub fn encode_pdu(opcode: u8, payload: &[u8], extended: bool, is_master: bool) -> Result<Vec<u8>> {
    let tid = u8::from(!is_master);
    let mut pdu = if extended {
        vec![LMP_ESCAPE_OPCODE << 1 | tid, opcode]
    } else {
        if opcode >= LMP_ESCAPE_OPCODE {
            return Err(Error::InvalidArgument(format!(
                "LMP opcode {:#04x} needs the extended form",
                opcode
            )));
        }
        vec![opcode << 1 | tid]
    };
    pdu.extend_from_slice(payload);

    if pdu.len() > MAX_LMP_PDU {
        return Err(Error::InvalidArgument(format!(
            "LMP PDU is {} bytes, at most {} fit",
            pdu.len(),
            MAX_LMP_PDU
        )));
    }
    Ok(pdu)
}

pub struct LmpSender<'a, A: Assembler + ?Sized> {
    engine: &'a MemoryEngine,
    assembler: &'a A,
}

impl<'a, A: Assembler + ?Sized> LmpSender<'a, A> {
    pub fn new(engine: &'a MemoryEngine, assembler: &'a A) -> Self {
        LmpSender { engine, assembler }
    }

    pub fn send(
        &self,
        target: LmpTarget,
        opcode: u8,
        payload: &[u8],
        extended: bool,
    ) -> Result<LmpReport> {
        let map = self.engine.map();
        let routine = map.send_lmp.as_ref().ok_or_else(|| {
            Error::NotFound(format!("LMP send routine for {}", map.name))
        })?;

        let (number, connection) = self.resolve(target)?;
        let is_master = connection.as_ref().map_or(true, |c| c.is_master);
        let pdu = encode_pdu(opcode, payload, extended, is_master)?;

        let source = routine.source.replace("{connection}", &number.to_string());
        let mut code = self.assembler.assemble(&source, routine.code_address)?;
        debug!("LMP routine: {} bytes at {:#010x}", code.len(), routine.code_address);
        code.extend_from_slice(&pdu);

        let op = self.engine.begin();
        op.write_mem(routine.code_address, &code, None)?;
        op.launch_ram(routine.code_address)?;

        info!(
            "Sent LMP PDU {} on connection {}",
            hex::encode(&pdu),
            number
        );
        Ok(LmpReport {
            connection: number,
            remote: connection.map(|c| c.remote_address),
            pdu,
        })
    }

    fn resolve(&self, target: LmpTarget) -> Result<(u32, Option<Connection>)> {
        let registry = ConnectionRegistry::new(self.engine);
        match target {
            LmpTarget::Active => {
                let connection = registry.find_single_active()?;
                Ok((connection.number, Some(connection)))
            }
            LmpTarget::Number { number, check } => {
                let wire_number = u32::try_from(number).map_err(|_| Error::IndexOutOfRange {
                    index: number,
                    max: registry.capacity(),
                })?;
                if !check {
                    return Ok((wire_number, None));
                }
                let connection = registry
                    .read(number)?
                    .ok_or_else(|| Error::NotFound(format!("connection {} is empty", number)))?;
                Ok((wire_number, Some(connection)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::{MockController, OP_WRITE_RAM};
    use crate::firmware::FirmwareMap;
    use crate::memory::tests::{engine_for, scenario_map};
    use std::sync::Mutex;

    const ROUTINE: [u8; 8] = [0x10, 0xb5, 0x00, 0xbf, 0x00, 0xbf, 0x10, 0xbd];

    /// Fixed code; remembers every source it was handed.
    #[derive(Default)]
    struct RecordingAssembler {
        sources: Mutex<Vec<String>>,
    }

    impl Assembler for RecordingAssembler {
        fn assemble(&self, source: &str, _load_address: u32) -> Result<Vec<u8>> {
            self.sources.lock().unwrap().push(source.to_string());
            Ok(ROUTINE.to_vec())
        }
    }

    fn load_connection(mock: &MockController, index: usize, number: u32, master: bool) {
        let layout = FirmwareMap::bcm4339().connections;
        let mut record = vec![0u8; layout.record_length];
        record[layout.number..layout.number + 4].copy_from_slice(&number.to_le_bytes());
        let role: u32 = if master { 1 << 15 } else { 0 };
        record[layout.role_word..layout.role_word + 4].copy_from_slice(&role.to_le_bytes());
        record[layout.remote_address..layout.remote_address + 6]
            .copy_from_slice(&[0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        let address = layout.array_address + ((index - 1) * layout.record_length) as u32;
        mock.load(address, &record);
    }

    fn code_address() -> u32 {
        FirmwareMap::bcm4339().send_lmp.unwrap().code_address
    }

    #[test]
    fn test_encode_pdu() {
        assert_eq!(encode_pdu(0x25, &[0x01], false, true).unwrap(), vec![0x4a, 0x01]);
        assert_eq!(encode_pdu(0x25, &[], false, false).unwrap(), vec![0x4b]);
        assert_eq!(encode_pdu(0x0b, &[0x10], true, true).unwrap(), vec![0xfe, 0x0b, 0x10]);
        assert!(encode_pdu(0x7f, &[], false, true).is_err());
        assert!(encode_pdu(0x01, &[0; 17], false, true).is_err());
    }

    #[test]
    fn test_send_on_single_active_connection() {
        let mock = MockController::new();
        load_connection(&mock, 2, 3, true);
        let engine = engine_for(&mock, FirmwareMap::bcm4339());
        let assembler = RecordingAssembler::default();

        let report = LmpSender::new(&engine, &assembler)
            .send(LmpTarget::Active, 0x25, &[0x01], false)
            .unwrap();

        assert_eq!(report.connection, 3);
        assert_eq!(report.remote.unwrap().to_string(), "11:22:33:44:55:66");
        assert_eq!(report.pdu, vec![0x4a, 0x01]);
        assert!(assembler.sources.lock().unwrap()[0].contains("#3\n"));

        let mut expected = ROUTINE.to_vec();
        expected.extend_from_slice(&[0x4a, 0x01]);
        assert_eq!(mock.peek(code_address(), expected.len()), expected);
        assert_eq!(mock.launched(), vec![code_address()]);
    }

    #[test]
    fn test_slave_link_sets_transaction_bit() {
        let mock = MockController::new();
        load_connection(&mock, 1, 1, false);
        let engine = engine_for(&mock, FirmwareMap::bcm4339());

        let report = LmpSender::new(&engine, &RecordingAssembler::default())
            .send(LmpTarget::Number { number: 1, check: true }, 0x0b, &[0x10], true)
            .unwrap();
        assert_eq!(report.pdu, vec![0xff, 0x0b, 0x10]);
    }

    #[test]
    fn test_no_active_connection_sends_nothing() {
        let mock = MockController::new();
        let engine = engine_for(&mock, FirmwareMap::bcm4339());

        let err = LmpSender::new(&engine, &RecordingAssembler::default())
            .send(LmpTarget::Active, 0x25, &[], false)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(mock.command_count(OP_WRITE_RAM), 0);
        assert!(mock.launched().is_empty());
    }

    #[test]
    fn test_unchecked_number_skips_connection_reads() {
        let mock = MockController::new();
        let engine = engine_for(&mock, FirmwareMap::bcm4339());

        let report = LmpSender::new(&engine, &RecordingAssembler::default())
            .send(LmpTarget::Number { number: 5, check: false }, 0x25, &[], false)
            .unwrap();
        assert_eq!(report.connection, 5);
        assert_eq!(report.remote, None);
        assert!(mock
            .commands()
            .iter()
            .all(|(op, _)| *op != crate::channel::OP_READ_RAM));
    }

    #[test]
    fn test_empty_checked_slot() {
        let mock = MockController::new();
        let engine = engine_for(&mock, FirmwareMap::bcm4339());

        let err = LmpSender::new(&engine, &RecordingAssembler::default())
            .send(LmpTarget::Number { number: 4, check: true }, 0x25, &[], false)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_routine_must_land_in_ram() {
        let mock = MockController::new();
        // Scenario map has no RAM at the bcm4339 routine address
        let engine = engine_for(&mock, scenario_map());

        let err = LmpSender::new(&engine, &RecordingAssembler::default())
            .send(LmpTarget::Number { number: 1, check: false }, 0x25, &[], false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAddress { .. }));
        assert!(mock.launched().is_empty());
    }

    #[test]
    fn test_map_without_routine() {
        let mock = MockController::new();
        let map = FirmwareMap {
            send_lmp: None,
            ..FirmwareMap::bcm4339()
        };
        let engine = engine_for(&mock, map);

        let err = LmpSender::new(&engine, &RecordingAssembler::default())
            .send(LmpTarget::Active, 0x25, &[], false)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(mock.commands().is_empty());
    }
}

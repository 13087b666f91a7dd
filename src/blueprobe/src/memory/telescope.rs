//! Pointer-chain following ("telescope") over live memory.

use super::{MemoryEngine, Operation};
use crate::error::Result;
use crate::firmware::SectionKind;
use byteorder::{ByteOrder, LE};

pub const DEFAULT_DEPTH: usize = 4;

/// Bytes read at every dereferenced pointer.
const WINDOW: usize = 0x20;

/// One word of the telescoped range and where it leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerChain {
    /// Where the first value was read from.
    pub address: u32,
    /// First value followed by each dereferenced word.
    pub pointers: Vec<u32>,
    /// Printable ASCII at the end of the chain.
    pub text: Option<String>,
}

impl MemoryEngine {
    /// Follow every aligned word of `[address, address + length)` as a
    /// pointer chain at most `depth` levels deep.
    pub fn telescope(&self, address: u32, length: usize, depth: usize) -> Result<Vec<PointerChain>> {
        let operation = self.begin();
        let data = operation.read_mem(address, length + 4, None)?;

        let mut chains = Vec::new();
        let mut offset = 0;
        while offset < length && offset + 4 <= data.len() {
            let value = LE::read_u32(&data[offset..offset + 4]);
            chains.push(self.follow(&operation, address.wrapping_add(offset as u32), value, depth)?);
            offset += 4;
        }
        Ok(chains)
    }

    fn follow(&self, operation: &Operation<'_>, address: u32, value: u32, depth: usize) -> Result<PointerChain> {
        let mut chain = PointerChain {
            address,
            pointers: vec![value],
            text: None,
        };

        let mut current = value;
        let mut remaining = depth;
        while remaining > 0
            && current != 0
            && self.is_address_in_sections(current, WINDOW, SectionKind::Any)
        {
            let window = operation.read_mem(current, WINDOW, None)?;
            chain.text = printable_prefix(&window);
            current = LE::read_u32(&window[0..4]);
            chain.pointers.push(current);
            remaining -= 1;
        }

        Ok(chain)
    }
}

fn printable_prefix(data: &[u8]) -> Option<String> {
    let end = data
        .iter()
        .position(|b| !(0x20..0x7f).contains(b))
        .unwrap_or(data.len());
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&data[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::MockController;
    use crate::memory::tests::{engine_for, scenario_map};

    #[test]
    fn test_chain_ends_at_zero() {
        let mock = MockController::new();
        mock.load(0x90000, &0x90100u32.to_le_bytes());
        mock.load(0x90100, &0x90200u32.to_le_bytes());
        let engine = engine_for(&mock, scenario_map());

        let chains = engine.telescope(0x90000, 4, DEFAULT_DEPTH).unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].pointers, vec![0x90100, 0x90200, 0]);
        assert_eq!(chains[0].text, None);
    }

    #[test]
    fn test_chain_stops_outside_sections() {
        let mock = MockController::new();
        mock.load(0x90000, &0xdead_beefu32.to_le_bytes());
        let engine = engine_for(&mock, scenario_map());

        let chains = engine.telescope(0x90000, 4, DEFAULT_DEPTH).unwrap();
        assert_eq!(chains[0].pointers, vec![0xdead_beef]);
        // Only the initial range was read
        assert_eq!(mock.commands().len(), 1);
    }

    #[test]
    fn test_self_referencing_chain_is_bounded() {
        let mock = MockController::new();
        mock.load(0x90000, &0x90000u32.to_le_bytes());
        let engine = engine_for(&mock, scenario_map());

        let chains = engine.telescope(0x90000, 4, 3).unwrap();
        assert_eq!(chains[0].pointers.len(), 4);
    }

    #[test]
    fn test_terminal_text() {
        let mock = MockController::new();
        mock.load(0x90000, &0x90400u32.to_le_bytes());
        mock.load(0x90400, b"Nexus 5\0");
        let engine = engine_for(&mock, scenario_map());

        let chains = engine.telescope(0x90000, 8, DEFAULT_DEPTH).unwrap();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].text.as_deref(), Some("Nexus 5"));
        assert_eq!(chains[1].address, 0x90004);
    }
}

//! Patchram: the hardware table that overlays 4-byte ROM words.
//!
//! Three register blocks describe the table: a target table holding
//! `rom_address >> 2` per slot, a value table holding the replacement word
//! per slot, and an enable bitmap. State is always read back from the
//! controller; nothing is cached here.

use crate::error::{Error, Result};
use crate::firmware::{PatchramLayout, SectionKind};
use crate::memory::{MemoryEngine, Operation};
use byteorder::{ByteOrder, LE};
use tracing::{debug, info, warn};

/// Width of one patch slot.
pub const PATCH_WIDTH: usize = 4;

/// One row of the table as read from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSlot {
    pub index: usize,
    pub address: u32,
    pub value: [u8; PATCH_WIDTH],
    pub active: bool,
}

/// What to remove: the patch at a ROM address, or a slot by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchTarget {
    Address(u32),
    Slot(usize),
}

pub struct PatchTable<'a> {
    engine: &'a MemoryEngine,
}

impl<'a> PatchTable<'a> {
    pub fn new(engine: &'a MemoryEngine) -> Self {
        PatchTable { engine }
    }

    fn layout(&self) -> &PatchramLayout {
        &self.engine.map().patchram
    }

    pub fn capacity(&self) -> usize {
        self.layout().slots
    }

    /// Every slot, in index order, read live from the hardware table.
    pub fn state(&self) -> Result<Vec<PatchSlot>> {
        self.state_in(&self.engine.begin())
    }

    fn state_in(&self, op: &Operation<'_>) -> Result<Vec<PatchSlot>> {
        let layout = self.layout();
        let slots = layout.slots;

        let bitmap = op.read_mem(layout.enable_bitmap, slots / 8, None)?;
        let targets = op.read_mem(layout.target_table, slots * 4, None)?;
        let values = op.read_mem(layout.value_table, slots * PATCH_WIDTH, None)?;

        Ok((0..slots)
            .map(|index| {
                let word = LE::read_u32(&bitmap[(index / 32) * 4..(index / 32) * 4 + 4]);
                let mut value = [0u8; PATCH_WIDTH];
                value.copy_from_slice(&values[index * PATCH_WIDTH..(index + 1) * PATCH_WIDTH]);
                PatchSlot {
                    index,
                    address: LE::read_u32(&targets[index * 4..index * 4 + 4]) << 2,
                    value,
                    active: word & (1 << (index % 32)) != 0,
                }
            })
            .collect())
    }

    /// Overlay the 4-byte aligned ROM word at `address` with `value`.
    ///
    /// Without `slot` the first free slot is used. A value that is not
    /// exactly four bytes is truncated or zero-padded, with a warning. An
    /// address that is already patched has its slot's value replaced.
    pub fn install(&self, address: u32, value: &[u8], slot: Option<usize>) -> Result<usize> {
        self.check_install(address, slot)?;
        let op = self.engine.begin();
        self.install_in(&op, address, &fit_value(value), slot)
    }

    fn check_install(&self, address: u32, slot: Option<usize>) -> Result<()> {
        if address % 4 != 0 || !self.engine.is_address_in_sections(address, PATCH_WIDTH, SectionKind::Rom) {
            return Err(Error::InvalidAddress {
                address,
                length: PATCH_WIDTH,
                kind: SectionKind::Rom,
            });
        }
        let capacity = self.capacity();
        if let Some(index) = slot {
            if index >= capacity {
                return Err(Error::IndexOutOfRange {
                    index,
                    max: capacity - 1,
                });
            }
        }
        Ok(())
    }

    // Slot choice and the enable-bitmap update run under one operation, so
    // concurrent installs cannot pick the same free slot.
    fn install_in(
        &self,
        op: &Operation<'_>,
        address: u32,
        value: &[u8; PATCH_WIDTH],
        slot: Option<usize>,
    ) -> Result<usize> {
        let state = self.state_in(op)?;
        let index = match state.iter().find(|s| s.active && s.address == address) {
            Some(existing) => {
                warn!(
                    "{:#010x} is already patched in slot {}; replacing its value",
                    address, existing.index
                );
                if slot.is_some_and(|requested| requested != existing.index) {
                    warn!("Ignoring requested slot; the existing slot is reused");
                }
                existing.index
            }
            None => match slot {
                Some(index) => {
                    if state[index].active {
                        warn!(
                            "Slot {} is in use for {:#010x}; overwriting",
                            index, state[index].address
                        );
                    }
                    index
                }
                None => state
                    .iter()
                    .find(|s| !s.active)
                    .map(|s| s.index)
                    .ok_or(Error::NoFreeSlot)?,
            },
        };

        self.write_slot(op, index, address, value)?;
        info!(
            "Patched {:#010x} with {} in slot {}",
            address,
            hex::encode(value),
            index
        );
        Ok(index)
    }

    /// Overlay `value` at any ROM address, spreading it over as many
    /// aligned slots as it touches. Bytes around the new data keep their
    /// current content. Returns the slots used, lowest address first.
    pub fn install_spanning(&self, address: u32, value: &[u8]) -> Result<Vec<usize>> {
        self.install_spanning_in(&self.engine.begin(), address, value)
    }

    pub(crate) fn install_spanning_in(
        &self,
        op: &Operation<'_>,
        address: u32,
        value: &[u8],
    ) -> Result<Vec<usize>> {
        let base = address & !3;
        let lead = (address - base) as usize;
        let span = (lead + value.len() + 3) & !3;
        if value.is_empty() || !self.engine.is_address_in_sections(base, span, SectionKind::Rom) {
            return Err(Error::InvalidAddress {
                address,
                length: value.len(),
                kind: SectionKind::Rom,
            });
        }

        let mut words = op.read_mem(base, span, None)?;
        words[lead..lead + value.len()].copy_from_slice(value);

        let state = self.state_in(op)?;
        let needed = (0..span / 4)
            .map(|i| base + (i * 4) as u32)
            .filter(|a| !state.iter().any(|s| s.active && s.address == *a))
            .count();
        let free = state.iter().filter(|s| !s.active).count();
        if needed > free {
            return Err(Error::NoFreeSlot);
        }

        words
            .chunks(PATCH_WIDTH)
            .enumerate()
            .map(|(i, word)| self.install_in(op, base + (i * 4) as u32, &fit_value(word), None))
            .collect()
    }

    /// Deactivate and clear a patch.
    pub fn remove(&self, target: PatchTarget) -> Result<PatchSlot> {
        let op = self.engine.begin();
        let state = self.state_in(&op)?;
        let slot = match target {
            PatchTarget::Address(address) => state
                .iter()
                .find(|s| s.active && s.address == address)
                .copied()
                .ok_or_else(|| Error::NotFound(format!("no active patch at {:#010x}", address)))?,
            PatchTarget::Slot(index) => {
                let slot = state.get(index).copied().ok_or(Error::IndexOutOfRange {
                    index,
                    max: state.len() - 1,
                })?;
                if !slot.active {
                    return Err(Error::NotFound(format!("slot {} is not active", index)));
                }
                slot
            }
        };

        let layout = self.layout();
        self.set_enabled(&op, slot.index, false)?;
        op.write_unchecked(layout.target_table + slot.index as u32 * 4, &[0; 4])?;
        op.write_unchecked(layout.value_table + (slot.index * PATCH_WIDTH) as u32, &[0; PATCH_WIDTH])?;
        info!("Removed patch at {:#010x} from slot {}", slot.address, slot.index);
        Ok(slot)
    }

    // Value and target land before the enable bit, so the slot never goes
    // live half-written.
    fn write_slot(
        &self,
        op: &Operation<'_>,
        index: usize,
        address: u32,
        value: &[u8; PATCH_WIDTH],
    ) -> Result<()> {
        let layout = self.layout();
        op.write_unchecked(layout.value_table + (index * PATCH_WIDTH) as u32, value)?;
        op.write_unchecked(layout.target_table + index as u32 * 4, &(address >> 2).to_le_bytes())?;
        self.set_enabled(op, index, true)
    }

    fn set_enabled(&self, op: &Operation<'_>, index: usize, enabled: bool) -> Result<()> {
        let word_address = self.layout().enable_bitmap + (index / 32) as u32 * 4;
        let mut word = op.read_u32(word_address)?;
        let bit = 1u32 << (index % 32);
        if enabled {
            word |= bit;
        } else {
            word &= !bit;
        }
        debug!("Enable bitmap word {:#010x} = {:#010x}", word_address, word);
        op.write_unchecked(word_address, &word.to_le_bytes())
    }
}

fn fit_value(value: &[u8]) -> [u8; PATCH_WIDTH] {
    if value.len() > PATCH_WIDTH {
        warn!("Patch value is {} bytes; truncating to {}", value.len(), PATCH_WIDTH);
    } else if value.len() < PATCH_WIDTH {
        warn!("Patch value is {} bytes; zero-padding to {}", value.len(), PATCH_WIDTH);
    }
    let mut fitted = [0u8; PATCH_WIDTH];
    let n = value.len().min(PATCH_WIDTH);
    fitted[..n].copy_from_slice(&value[..n]);
    fitted
}

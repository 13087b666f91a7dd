//! Static description of a controller's address space.
//!
//! A [`FirmwareMap`] is pure data: section list, fixed addresses, table
//! geometry and per-command chunk limits. It is loaded once per target chip,
//! validated, and shared immutably by every component.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest payload a single vendor read/write command can move
/// (255-byte parameter limit minus the 4-byte address).
pub const MAX_CHUNK_SIZE: usize = 251;

// Allocates a buffer, copies the PDU to offset 0xc, looks up the
// connection struct and hands both to the firmware's LMP send function.
const BCM4339_SEND_LMP: &str = "\
    push {r4, lr}
    bl 0x3f17e
    mov r4, r0
    adds r0, #0xc
    adr r1, pdu
    movs r2, #20
    bl 0x2e03c
    movs r0, #{connection}
    bl 0x42c04
    mov r1, r4
    bl 0xf81a
    pop {r4, pc}
    .align 2
pdu:
";

/// A contiguous address range `[start_addr, end_addr)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub start_addr: u32,
    pub end_addr: u32,
    #[serde(default)]
    pub is_rom: bool,
    #[serde(default)]
    pub is_ram: bool,
}

impl Section {
    pub const fn rom(start_addr: u32, end_addr: u32) -> Self {
        Section {
            start_addr,
            end_addr,
            is_rom: true,
            is_ram: false,
        }
    }

    pub const fn ram(start_addr: u32, end_addr: u32) -> Self {
        Section {
            start_addr,
            end_addr,
            is_rom: false,
            is_ram: true,
        }
    }

    /// Memory-mapped range that is neither ROM nor RAM (peripheral windows).
    pub const fn other(start_addr: u32, end_addr: u32) -> Self {
        Section {
            start_addr,
            end_addr,
            is_rom: false,
            is_ram: false,
        }
    }

    pub fn size(&self) -> usize {
        (self.end_addr - self.start_addr) as usize
    }

    pub fn matches(&self, kind: SectionKind) -> bool {
        match kind {
            SectionKind::Rom => self.is_rom,
            SectionKind::Ram => self.is_ram,
            SectionKind::Any => true,
        }
    }

    /// True if `[address, address + length)` lies completely inside this section.
    pub fn contains_range(&self, address: u32, length: usize) -> bool {
        let start = u64::from(address);
        let end = start + length as u64;
        start >= u64::from(self.start_addr) && end <= u64::from(self.end_addr)
    }

    fn overlaps(&self, other: &Section) -> bool {
        self.start_addr < other.end_addr && other.start_addr < self.end_addr
    }
}

/// Which kind of section an address range must fall into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Rom,
    Ram,
    Any,
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionKind::Rom => write!(f, "ROM"),
            SectionKind::Ram => write!(f, "RAM"),
            SectionKind::Any => write!(f, "valid"),
        }
    }
}

/// Location and size of the hardware patchram tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchramLayout {
    /// One u32 per slot holding `rom_address >> 2`.
    pub target_table: u32,
    /// Four replacement bytes per slot.
    pub value_table: u32,
    /// One enable bit per slot, packed into little-endian u32 words.
    pub enable_bitmap: u32,
    pub slots: usize,
}

/// Field offsets inside one connection record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionLayout {
    pub array_address: u32,
    pub array_size: usize,
    pub record_length: usize,
    pub number: usize,
    pub id: usize,
    pub role_word: usize,
    pub remote_address: usize,
    pub extended_features: usize,
    pub host_features: usize,
    pub remote_name_pointer: usize,
    pub handle: usize,
    pub link_key: usize,
    pub public_rand: usize,
    pub tx_power: usize,
    pub effective_key_length: usize,
}

impl ConnectionLayout {
    /// Smallest record length that covers every configured field.
    pub fn min_record_length(&self) -> usize {
        [
            self.number + 4,
            self.id + 1,
            self.role_word + 4,
            self.remote_address + 6,
            self.extended_features + 8,
            self.host_features + 8,
            self.remote_name_pointer + 4,
            self.handle + 2,
            self.link_key + 16,
            self.public_rand + 16,
            self.tx_power + 1,
            self.effective_key_length + 1,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

/// Firmware routine that queues an LMP PDU on a connection.
///
/// `source` is assembly for the routine placed at `code_address`, with a
/// `{connection}` placeholder for the connection number. The PDU is stored
/// directly after the assembled code, so the source must end on the label
/// the routine copies it from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LmpRoutine {
    pub code_address: u32,
    pub source: String,
}

/// Immutable description of one target firmware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareMap {
    /// Target identity; also keys the on-disk ROM template.
    pub name: String,
    pub sections: Vec<Section>,
    /// Pointer to the 6-byte device address (stored reversed).
    pub bd_addr: u32,
    /// Pointer to the length-prefixed device name buffer.
    pub device_name: u32,
    pub read_chunk_size: usize,
    pub write_chunk_size: usize,
    pub patchram: PatchramLayout,
    pub connections: ConnectionLayout,
    /// Absent for targets without a known LMP send path.
    #[serde(default)]
    pub send_lmp: Option<LmpRoutine>,
}

impl FirmwareMap {
    /// Broadcom BCM4339 (Nexus 5 class) controller.
    pub fn bcm4339() -> Self {
        FirmwareMap {
            name: "bcm4339".to_string(),
            sections: vec![
                Section::rom(0x0, 0x90000),
                Section::ram(0xd0000, 0xd8000),
                Section::ram(0x200000, 0x228000),
                Section::rom(0x260000, 0x268000),
                Section::other(0x318000, 0x320000),
                Section::other(0x324000, 0x360000),
            ],
            bd_addr: 0x210c2c,
            device_name: 0x2178b6,
            read_chunk_size: MAX_CHUNK_SIZE,
            write_chunk_size: MAX_CHUNK_SIZE,
            patchram: PatchramLayout {
                target_table: 0x310000,
                value_table: 0xd0000,
                enable_bitmap: 0x310204,
                slots: 128,
            },
            connections: ConnectionLayout {
                array_address: 0x2038e8,
                array_size: 11,
                record_length: 0x14c,
                number: 0x00,
                id: 0x0c,
                role_word: 0x1c,
                remote_address: 0x28,
                extended_features: 0x30,
                host_features: 0x38,
                remote_name_pointer: 0x4c,
                handle: 0x64,
                link_key: 0x68,
                public_rand: 0x78,
                tx_power: 0x9c,
                effective_key_length: 0xa7,
            },
            send_lmp: Some(LmpRoutine {
                code_address: 0xd7500,
                source: BCM4339_SEND_LMP.to_string(),
            }),
        }
    }

    /// Look up a built-in preset by name.
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "bcm4339" | "nexus5" => Some(Self::bcm4339()),
            _ => None,
        }
    }

    /// Parse and validate a map from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let map: FirmwareMap = serde_json::from_str(json)
            .map_err(|e| Error::InvalidFirmwareMap(e.to_string()))?;
        map.validate()?;
        Ok(map)
    }

    /// Check structural invariants: ordered, non-overlapping sections and
    /// usable table geometry.
    pub fn validate(&self) -> Result<()> {
        for (i, section) in self.sections.iter().enumerate() {
            if section.start_addr > section.end_addr {
                return Err(Error::InvalidFirmwareMap(format!(
                    "section {:#x}..{:#x} ends before it starts",
                    section.start_addr, section.end_addr
                )));
            }
            if section.is_rom && section.is_ram {
                return Err(Error::InvalidFirmwareMap(format!(
                    "section {:#x}..{:#x} is flagged both ROM and RAM",
                    section.start_addr, section.end_addr
                )));
            }
            if let Some(other) = self.sections[i + 1..].iter().find(|o| section.overlaps(o)) {
                return Err(Error::InvalidFirmwareMap(format!(
                    "sections {:#x}..{:#x} and {:#x}..{:#x} overlap",
                    section.start_addr, section.end_addr, other.start_addr, other.end_addr
                )));
            }
        }

        for (label, size) in [
            ("read_chunk_size", self.read_chunk_size),
            ("write_chunk_size", self.write_chunk_size),
        ] {
            if size == 0 || size > MAX_CHUNK_SIZE {
                return Err(Error::InvalidFirmwareMap(format!(
                    "{} must be in 1..={}, got {}",
                    label, MAX_CHUNK_SIZE, size
                )));
            }
        }

        if self.patchram.slots == 0 || self.patchram.slots % 32 != 0 {
            return Err(Error::InvalidFirmwareMap(format!(
                "patchram slot count must be a non-zero multiple of 32, got {}",
                self.patchram.slots
            )));
        }

        let layout = &self.connections;
        if layout.record_length < layout.min_record_length() {
            return Err(Error::InvalidFirmwareMap(format!(
                "connection record length {:#x} is shorter than its fields ({:#x})",
                layout.record_length,
                layout.min_record_length()
            )));
        }

        Ok(())
    }

    /// True iff some section of `kind` fully contains `[address, address + length)`.
    pub fn is_address_in_sections(&self, address: u32, length: usize, kind: SectionKind) -> bool {
        self.sections
            .iter()
            .any(|s| s.matches(kind) && s.contains_range(address, length))
    }

    /// The section containing `address`, if any.
    pub fn find_section(&self, address: u32) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains_range(address, 1))
    }

    /// Size of a flat image spanning address 0 up to the highest section end.
    pub fn image_size(&self) -> usize {
        self.sections
            .iter()
            .map(|s| s.end_addr as usize)
            .max()
            .unwrap_or(0)
    }
}

//! Identity of the local controller.

use crate::bdaddr::BdAddr;
use crate::error::{Error, Result};
use crate::memory::MemoryEngine;

/// Size of the length-prefixed device name buffer.
const NAME_BUFFER_LEN: usize = 258;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: BdAddr,
    pub name: String,
}

impl DeviceInfo {
    pub fn read(engine: &MemoryEngine) -> Result<Self> {
        Ok(DeviceInfo {
            address: read_address(engine)?,
            name: read_name(engine)?,
        })
    }
}

pub fn read_address(engine: &MemoryEngine) -> Result<BdAddr> {
    let raw = engine.read_mem(engine.map().bd_addr, 6, None)?;
    BdAddr::from_le_bytes(&raw)
        .ok_or_else(|| Error::Protocol("short read of device address".to_string()))
}

/// The name buffer stores `len + 1` in its first byte and the name from
/// offset 2.
pub fn read_name(engine: &MemoryEngine) -> Result<String> {
    let buffer = engine.read_mem(engine.map().device_name, NAME_BUFFER_LEN, None)?;
    let len = usize::from(buffer[0].saturating_sub(1)).min(NAME_BUFFER_LEN - 2);
    Ok(String::from_utf8_lossy(&buffer[2..2 + len]).into_owned())
}

//! Connection records decoded from the controller's live connection array.

use crate::bdaddr::BdAddr;
use crate::error::{Error, Result};
use crate::firmware::ConnectionLayout;
use crate::memory::MemoryEngine;
use byteorder::{ByteOrder, LE};
use tracing::debug;

/// Role word bit that is set while we are master of the link.
const ROLE_MASTER_BIT: u32 = 1 << 15;

/// Raw tx power byte is offset by this from dBm.
const TX_POWER_OFFSET: i16 = 127;

/// Snapshot of one connection slot. Only the controller mutates the
/// underlying record, so this goes stale immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Position in the connection array, starting at 1.
    pub index: usize,
    pub number: u32,
    pub id: u8,
    pub remote_address: BdAddr,
    pub is_master: bool,
    pub handle: u16,
    pub remote_name_pointer: u32,
    pub extended_features: [u8; 8],
    pub host_features: [u8; 8],
    pub link_key: [u8; 16],
    pub public_rand: [u8; 16],
    pub tx_power_dbm: i16,
    pub effective_key_length: u8,
}

impl Connection {
    /// Decode one raw record. An all-zero remote address marks an empty
    /// slot and yields `None`.
    pub fn decode(index: usize, layout: &ConnectionLayout, record: &[u8]) -> Option<Self> {
        let remote_address =
            BdAddr::from_le_bytes(&record[layout.remote_address..layout.remote_address + 6])?;
        if remote_address.is_zero() {
            return None;
        }

        Some(Connection {
            index,
            number: LE::read_u32(&record[layout.number..]),
            id: record[layout.id],
            remote_address,
            is_master: LE::read_u32(&record[layout.role_word..]) & ROLE_MASTER_BIT != 0,
            handle: LE::read_u16(&record[layout.handle..]),
            remote_name_pointer: LE::read_u32(&record[layout.remote_name_pointer..]),
            extended_features: array_at(record, layout.extended_features),
            host_features: array_at(record, layout.host_features),
            link_key: array_at(record, layout.link_key),
            public_rand: array_at(record, layout.public_rand),
            tx_power_dbm: i16::from(record[layout.tx_power]) - TX_POWER_OFFSET,
            effective_key_length: record[layout.effective_key_length],
        })
    }
}

fn array_at<const N: usize>(record: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&record[offset..offset + N]);
    out
}

pub struct ConnectionRegistry<'a> {
    engine: &'a MemoryEngine,
}

impl<'a> ConnectionRegistry<'a> {
    pub fn new(engine: &'a MemoryEngine) -> Self {
        ConnectionRegistry { engine }
    }

    fn layout(&self) -> &ConnectionLayout {
        &self.engine.map().connections
    }

    pub fn capacity(&self) -> usize {
        self.layout().array_size
    }

    /// Read the record at 1-based `index`. `Ok(None)` means the slot is empty.
    pub fn read(&self, index: usize) -> Result<Option<Connection>> {
        let layout = self.layout();
        if index == 0 || index > layout.array_size {
            return Err(Error::IndexOutOfRange {
                index,
                max: layout.array_size,
            });
        }

        let address = layout.array_address + ((index - 1) * layout.record_length) as u32;
        debug!("Reading connection {} at {:#010x}", index, address);
        let record = self.engine.read_mem(address, layout.record_length, None)?;
        Ok(Connection::decode(index, layout, &record))
    }

    /// Every occupied slot, in index order.
    pub fn active_connections(&self) -> Result<Vec<Connection>> {
        let mut active = Vec::new();
        for index in 1..=self.capacity() {
            if let Some(connection) = self.read(index)? {
                active.push(connection);
            }
        }
        Ok(active)
    }

    /// The only active connection. Fails when there is none, or when
    /// several exist and the caller has to pick one explicitly.
    pub fn find_single_active(&self) -> Result<Connection> {
        let mut active = self.active_connections()?;
        match active.len() {
            1 => Ok(active.remove(0)),
            0 => Err(Error::NotFound("no active connection".to_string())),
            n => Err(Error::NotFound(format!(
                "{} active connections; select one by number",
                n
            ))),
        }
    }
}

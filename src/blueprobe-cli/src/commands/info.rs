//! `info` handlers: state decoded from live controller RAM.

use anyhow::Result;
use blueprobe::{Assembler, Connection, PatchSlot, Session};
use std::fmt::Write as _;

use crate::assembler::CommandAssembler;

pub fn device(session: &Session) -> Result<()> {
    let info = session.device_info()?;
    println!("### | Device");
    println!("    - Name:     {}", info.name);
    println!("    - Address:  {}", info.address);
    println!("    - Firmware: {}", session.map().name);
    Ok(())
}

pub fn connections(session: &Session) -> Result<()> {
    let registry = session.connections();
    let active = registry.active_connections()?;

    if active.is_empty() {
        println!("No active connections ({} slots)", registry.capacity());
        return Ok(());
    }

    for connection in &active {
        print!("{}", format_connection(connection));
    }
    Ok(())
}

fn format_connection(connection: &Connection) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "### | Connection #{}", connection.index);
    let _ = writeln!(out, "    - Number:            {}", connection.number);
    let _ = writeln!(out, "    - Remote BT address: {}", connection.remote_address);
    let _ = writeln!(
        out,
        "    - Remote BT name:    {:#010x}",
        connection.remote_name_pointer
    );
    let _ = writeln!(
        out,
        "    - Master of Conn.:   {}",
        connection.is_master
    );
    let _ = writeln!(out, "    - Conn. Handle:      {:#06x}", connection.handle);
    let _ = writeln!(
        out,
        "    - Public RAND:       {}",
        hex::encode(connection.public_rand)
    );
    let _ = writeln!(
        out,
        "    - Link Key:          {}",
        hex::encode(connection.link_key)
    );
    let _ = writeln!(
        out,
        "    - Effective Key Len: {} byte ({} bit)",
        connection.effective_key_length,
        u32::from(connection.effective_key_length) * 8
    );
    let _ = writeln!(out, "    - Tx Power:          {} dBm", connection.tx_power_dbm);
    let _ = writeln!(
        out,
        "    - Ext. Features:     {}",
        hex::encode(connection.extended_features)
    );
    let _ = writeln!(
        out,
        "    - Host Features:     {}",
        hex::encode(connection.host_features)
    );
    out
}

pub fn patchram(session: &Session, assembler: &CommandAssembler) -> Result<()> {
    let table = session.patches();
    let slots = table.state()?;
    let active: Vec<&PatchSlot> = slots.iter().filter(|slot| slot.active).collect();

    println!(
        "### | Patchram ({} of {} slots used)",
        active.len(),
        table.capacity()
    );
    for slot in active {
        let mut line = format_slot(slot);
        if assembler.can_disassemble() {
            match assembler.disassemble(&slot.value, slot.address) {
                Ok(text) => {
                    let _ = write!(line, "  {}", text.trim());
                }
                Err(e) => tracing::debug!("Could not disassemble slot {}: {}", slot.index, e),
            }
        }
        println!("{}", line);
    }
    Ok(())
}

fn format_slot(slot: &PatchSlot) -> String {
    format!(
        "[{:03}] {:#010x}: {}",
        slot.index,
        slot.address,
        hex::encode(slot.value)
    )
}

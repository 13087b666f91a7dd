//! Patchram command handlers

use anyhow::Result;
use blueprobe::patchram::PATCH_WIDTH;
use blueprobe::{PatchTarget, Session};

use super::parse_data;
use crate::cli::DataArgs;

/// Overlay ROM at `address`. An aligned word (or an explicit slot) takes one
/// slot; unaligned or longer values are spliced into the covering words.
pub fn patch(session: &Session, address: u32, data: &DataArgs, slot: Option<usize>) -> Result<()> {
    let value = parse_data(data)?;
    let table = session.patches();

    if slot.is_some() || (address as usize % PATCH_WIDTH == 0 && value.len() <= PATCH_WIDTH) {
        let index = table.install(address, &value, slot)?;
        println!("Patched {:#010x} using slot {}", address, index);
        return Ok(());
    }

    let slots = table.install_spanning(address, &value)?;
    println!(
        "Patched {:#010x}+{} using slots {:?}",
        address,
        value.len(),
        slots
    );
    Ok(())
}

pub fn unpatch(session: &Session, target: PatchTarget) -> Result<()> {
    let removed = session.patches().remove(target)?;
    println!(
        "Removed patch at {:#010x} from slot {}",
        removed.address, removed.index
    );
    Ok(())
}

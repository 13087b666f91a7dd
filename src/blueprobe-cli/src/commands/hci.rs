//! Raw HCI command handler

use anyhow::{bail, Context, Result};
use blueprobe::Session;

use crate::cli::parse_int;

/// Parameter bytes from command-line words: `0x`-prefixed words are
/// little-endian u32 values, anything else is a hex string.
fn command_params(words: &[String]) -> Result<Vec<u8>> {
    let mut params = Vec::new();
    for word in words {
        if word.starts_with("0x") || word.starts_with("0X") {
            let value = parse_int(word).map_err(anyhow::Error::msg)?;
            params.extend_from_slice(&value.to_le_bytes());
        } else {
            params.extend(hex::decode(word).with_context(|| format!("Invalid hex: {}", word))?);
        }
    }
    Ok(params)
}

pub fn send(session: &Session, opcode: u32, words: &[String]) -> Result<()> {
    let Ok(opcode) = u16::try_from(opcode) else {
        bail!("Opcode {:#x} does not fit in 16 bits", opcode);
    };
    let params = command_params(words)?;

    let response = session.send_hci_command(opcode, &params)?;
    if response.is_status_only {
        println!("Command Status: {:#04x}", response.status);
    } else {
        println!("Command Complete, status {:#04x}", response.status);
        if !response.data.is_empty() {
            println!("Data: {}", hex::encode(&response.data));
        }
    }
    Ok(())
}

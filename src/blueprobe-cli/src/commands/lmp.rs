//! LMP send handler

use anyhow::{bail, Context, Result};
use blueprobe::{LmpTarget, Session};

use crate::assembler::CommandAssembler;
use crate::cli::LmpArgs;

fn target(args: &LmpArgs) -> LmpTarget {
    match args.conn_number {
        None => LmpTarget::Active,
        Some(number) => LmpTarget::Number {
            number: number as usize,
            check: !args.nocheck,
        },
    }
}

fn payload(data: &str) -> Result<Vec<u8>> {
    hex::decode(data).with_context(|| format!("Payload is not a hex string: {}", data))
}

pub fn send(session: &Session, assembler: &CommandAssembler, args: &LmpArgs) -> Result<()> {
    if !assembler.can_assemble() {
        bail!("No assembler configured. Use 'blueprobe configure --assembler CMD'");
    }
    let Ok(opcode) = u8::try_from(args.opcode) else {
        bail!("LMP opcode {:#x} does not fit in 8 bits", args.opcode);
    };
    let payload = payload(&args.data)?;

    let report = session
        .lmp(assembler)
        .send(target(args), opcode, &payload, args.extended)?;
    let remote = report
        .remote
        .map_or_else(|| "?".to_string(), |address| address.to_string());
    println!(
        "Sent {} to connection {} ({})",
        hex::encode(&report.pdu),
        report.connection,
        remote
    );
    Ok(())
}

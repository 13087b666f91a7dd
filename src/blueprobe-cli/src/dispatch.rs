//! Command dispatch
//!
//! Routes a parsed subcommand to its handler on an open session.

use anyhow::Result;
use blueprobe::{CaptureKind, PatchTarget, Session};

use crate::assembler::CommandAssembler;
use crate::cli::*;
use crate::commands;
use crate::config::Config;

pub fn dispatch(session: &mut Session, config: &Config, command: Commands) -> Result<()> {
    let assembler = CommandAssembler::new(config.assembler.clone(), config.disassembler.clone());

    match command {
        Commands::Configure(args) => commands::configure::handle(args),

        Commands::Info { target } => match target {
            InfoTarget::Device => commands::info::device(session),
            InfoTarget::Connections => commands::info::connections(session),
            InfoTarget::Patchram => commands::info::patchram(session, &assembler),
        },

        Commands::Hexdump {
            address,
            length,
            aligned,
        } => commands::memory::hexdump(session, address, length as usize, aligned),

        Commands::Telescope {
            address,
            length,
            depth,
        } => commands::memory::telescope(session, address, length as usize, depth),

        Commands::Disasm { address, length } => {
            commands::memory::disasm(session, &assembler, address, length as usize)
        }

        Commands::Dumpmem(args) => commands::memory::dumpmem(session, &args),

        Commands::Searchmem(args) => commands::memory::searchmem(session, &args),

        Commands::Writemem(args) => commands::memory::writemem(session, &args),

        Commands::Patch {
            address,
            data,
            slot,
        } => commands::patch::patch(session, address, &data, slot),

        Commands::Unpatch { address, slot } => {
            let target = match (address, slot) {
                (_, Some(slot)) => PatchTarget::Slot(slot),
                (Some(address), None) => PatchTarget::Address(address),
                (None, None) => anyhow::bail!("Give a ROM address or --slot"),
            };
            commands::patch::unpatch(session, target)
        }

        Commands::Writeasm(args) => commands::memory::writeasm(session, &assembler, &args),

        Commands::Exec(args) => commands::memory::exec(session, &assembler, &args),

        Commands::Launch { address } => commands::memory::launch(session, address),

        Commands::Hook { plan } => commands::hook::install(session, &assembler, &plan),

        Commands::Sendhcicmd { opcode, data } => commands::hci::send(session, opcode, &data),

        Commands::Sendlmp(args) => commands::lmp::send(session, &assembler, &args),

        Commands::Monitor { kind } => {
            let kind = match kind {
                MonitorKind::Hci => CaptureKind::Hci,
                MonitorKind::Lmp => CaptureKind::Lmp,
            };
            commands::monitor::run(session, kind)
        }
    }
}

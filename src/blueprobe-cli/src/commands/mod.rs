//! Command handlers for the blueprobe CLI
//!
//! Each subcommand group has its own module; this module holds the
//! connection setup and the formatting helpers they share.

pub mod configure;
pub mod hci;
pub mod hook;
pub mod info;
pub mod lmp;
pub mod memory;
pub mod monitor;
pub mod patch;

use anyhow::{bail, Context, Result};
use blueprobe::{CommandLauncher, ImageTemplate, Session};
use std::fmt::Write as _;
use std::net::TcpStream;
use std::sync::Arc;

use crate::cli::{parse_int, DataArgs, TargetArgs};
use crate::config::Config;

/// Open a session to the configured or given endpoint.
pub fn connect(config: &Config, target: &TargetArgs) -> Result<Session> {
    let endpoint = target
        .endpoint
        .as_deref()
        .or(config.endpoint.as_deref())
        .context("No endpoint given. Use --endpoint or 'blueprobe configure --endpoint HOST:PORT'")?;

    let map = config.firmware_map(target.chip.as_deref(), target.firmware_map.as_deref())?;

    let stream = TcpStream::connect(endpoint)
        .with_context(|| format!("Failed to connect to {}", endpoint))?;
    stream
        .set_nodelay(true)
        .context("Failed to configure the socket")?;

    let launcher = CommandLauncher::from_command_line(&config.viewer)
        .context("Configured viewer command line is empty")?;

    let mut session = Session::connect(
        Box::new(stream),
        config.channel_config(),
        map,
        Arc::new(launcher),
    )
    .with_context(|| format!("Failed to open a session on {}", endpoint))?;

    if let Some(dir) = config.template_dir() {
        session = session.with_template(ImageTemplate::new(dir));
    }

    Ok(session)
}

/// Classic 16-bytes-per-line hexdump with an ASCII column.
pub fn format_hexdump(data: &[u8], base: u32) -> String {
    let mut out = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", base as usize + i * 16);
        for (j, byte) in chunk.iter().enumerate() {
            if j == 8 {
                out.push(' ');
            }
            let _ = write!(out, "{:02x} ", byte);
        }
        // Padding for incomplete lines
        for j in chunk.len()..16 {
            if j == 8 {
                out.push(' ');
            }
            out.push_str("   ");
        }
        out.push_str(" |");
        for byte in chunk {
            if byte.is_ascii_graphic() || *byte == b' ' {
                out.push(*byte as char);
            } else {
                out.push('.');
            }
        }
        out.push_str("|\n");
    }
    out
}

/// Turn command-line data words into bytes.
///
/// `--hex` concatenates the words as one hex string, `--int` packs each
/// word as a little-endian u32, otherwise the words are text joined by
/// spaces.
pub fn parse_data(args: &DataArgs) -> Result<Vec<u8>> {
    if args.data.is_empty() {
        bail!("No data given");
    }

    if args.hex {
        let text: String = args.data.concat();
        return hex::decode(&text).with_context(|| format!("Invalid hex string: {}", text));
    }

    if args.int {
        let mut bytes = Vec::with_capacity(args.data.len() * 4);
        for word in &args.data {
            let value = parse_int(word).map_err(anyhow::Error::msg)?;
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        return Ok(bytes);
    }

    Ok(args.data.join(" ").into_bytes())
}

/// Progress callback printing a percentage on stderr.
pub fn progress_printer(label: &str) -> impl FnMut(usize, usize) + '_ {
    let mut last = usize::MAX;
    move |done, total| {
        let percent = if total == 0 { 100 } else { done * 100 / total };
        if percent != last {
            last = percent;
            eprint!("\r{}: {:3}%", label, percent);
            if done >= total {
                eprintln!();
            }
        }
    }
}

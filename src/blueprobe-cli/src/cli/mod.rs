//! CLI argument definitions for blueprobe
//!
//! This module contains all clap-derived structs and enums for CLI parsing.

mod core;
mod memory;

pub use self::core::{Cli, Commands, ConfigureArgs, InfoTarget, LmpArgs, MonitorKind, TargetArgs};
pub use self::memory::{AsmArgs, DataArgs, DumpArgs, ExecArgs, SearchArgs, WriteArgs};

/// Parse an integer as hex (`0x` prefix) or decimal.
pub fn parse_int(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", value, e))
}

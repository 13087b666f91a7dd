//! Memory command CLI definitions

use clap::Args;
use std::path::PathBuf;

use super::parse_int;

/// Data given on the command line, as text, hex or an integer.
#[derive(Args, Debug, Default)]
pub struct DataArgs {
    /// Interpret data as hex string (e.g. ff000a20)
    #[arg(long, conflicts_with = "int")]
    pub hex: bool,

    /// Interpret data as 32-bit integer (e.g. 0x123)
    #[arg(long)]
    pub int: bool,

    pub data: Vec<String>,
}

#[derive(Args, Debug)]
pub struct WriteArgs {
    #[arg(value_parser = parse_int)]
    pub address: u32,

    #[command(flatten)]
    pub data: DataArgs,

    /// Read data from this file instead
    #[arg(short, long, conflicts_with_all = ["hex", "int"])]
    pub file: Option<PathBuf>,

    /// Number of times to repeat the data
    #[arg(short, long, default_value = "1")]
    pub repeat: usize,
}

#[derive(Args, Debug)]
pub struct DumpArgs {
    /// Do not refresh the memory image before dumping
    #[arg(short, long)]
    pub norefresh: bool,

    /// Only dump RAM sections, one file per section
    #[arg(short, long)]
    pub ram: bool,

    #[arg(short, long, default_value = "memdump.bin")]
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Refresh the memory image before searching
    #[arg(short, long)]
    pub refresh: bool,

    /// Interpret pattern as hex (`??` matches any byte)
    #[arg(long, conflicts_with = "address")]
    pub hex: bool,

    /// Interpret pattern as a 32-bit address
    #[arg(short, long)]
    pub address: bool,

    /// Bytes of context shown around each match
    #[arg(short, long, default_value = "0", value_parser = parse_int)]
    pub context: u32,

    #[arg(required = true)]
    pub pattern: Vec<String>,
}

#[derive(Args, Debug)]
pub struct AsmArgs {
    #[arg(value_parser = parse_int)]
    pub address: u32,

    /// Read assembly from this file instead
    #[arg(short, long, conflicts_with = "code")]
    pub file: Option<PathBuf>,

    /// Only assemble and show the machine code; nothing is written
    #[arg(short, long)]
    pub dry: bool,

    /// Instructions, joined by spaces (separate statements with ';')
    pub code: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Raw machine code, or assembly source (`.s`/`.asm` or --asm)
    pub file: PathBuf,

    #[arg(value_parser = parse_int)]
    pub address: u32,

    /// Treat FILE as assembly source whatever its extension
    #[arg(long)]
    pub asm: bool,

    /// Only show the machine code; nothing is written or launched
    #[arg(short, long)]
    pub dry: bool,
}

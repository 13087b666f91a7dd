//! Core CLI definitions

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use super::memory::{AsmArgs, DataArgs, DumpArgs, ExecArgs, SearchArgs, WriteArgs};
use super::parse_int;

#[derive(Parser)]
#[command(name = "blueprobe")]
#[command(about = "Bluetooth controller firmware diagnostics", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub target: TargetArgs,

    /// More log output (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Which controller to talk to, overriding the configured defaults.
#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    /// host:port of the controller's H4 byte stream
    #[arg(long, global = true, env = "BLUEPROBE_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Built-in firmware preset (e.g. bcm4339)
    #[arg(long, global = true)]
    pub chip: Option<String>,

    /// Firmware map file (TOML or .json), takes precedence over --chip
    #[arg(long, global = true)]
    pub firmware_map: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Configure default settings
    #[command(visible_alias = "c")]
    Configure(ConfigureArgs),

    /// Display information parsed from live RAM
    #[command(visible_alias = "i")]
    Info {
        #[arg(value_enum)]
        target: InfoTarget,
    },

    /// Hexdump a memory region
    #[command(visible_alias = "hd")]
    Hexdump {
        #[arg(value_parser = parse_int)]
        address: u32,

        #[arg(short, long, default_value = "256", value_parser = parse_int)]
        length: u32,

        /// Access memory strictly 4-byte aligned
        #[arg(short, long)]
        aligned: bool,
    },

    /// Dump a region and follow pointers into valid sections
    #[command(visible_alias = "tel")]
    Telescope {
        #[arg(value_parser = parse_int)]
        address: u32,

        #[arg(short, long, default_value = "64", value_parser = parse_int)]
        length: u32,

        /// Maximum pointer chain depth
        #[arg(short, long, default_value = "4")]
        depth: usize,
    },

    /// Disassemble a memory region with the configured disassembler
    Disasm {
        #[arg(value_parser = parse_int)]
        address: u32,

        #[arg(short, long, default_value = "128", value_parser = parse_int)]
        length: u32,
    },

    /// Dump the memory image to a file
    #[command(visible_alias = "memdump")]
    Dumpmem(DumpArgs),

    /// Search the memory image for a pattern
    #[command(visible_alias = "memsearch")]
    Searchmem(SearchArgs),

    /// Write data to RAM
    Writemem(WriteArgs),

    /// Overlay 4 bytes of ROM through a patchram slot
    Patch {
        #[arg(value_parser = parse_int)]
        address: u32,

        #[command(flatten)]
        data: DataArgs,

        /// Patchram slot to use (first free slot by default)
        #[arg(short, long)]
        slot: Option<usize>,
    },

    /// Remove a patch by ROM address or slot
    Unpatch {
        #[arg(value_parser = parse_int, required_unless_present = "slot")]
        address: Option<u32>,

        #[arg(short, long, conflicts_with = "address")]
        slot: Option<usize>,
    },

    /// Assemble instructions and write them to RAM
    #[command(visible_alias = "asm")]
    Writeasm(AsmArgs),

    /// Write code to RAM and jump to it
    #[command(visible_alias = "execute")]
    Exec(ExecArgs),

    /// Jump to a RAM address
    Launch {
        #[arg(value_parser = parse_int)]
        address: u32,
    },

    /// Install hooks described by a TOML plan
    Hook {
        plan: PathBuf,
    },

    /// Send an arbitrary HCI command
    Sendhcicmd {
        /// Opcode, e.g. 0xfc4d for ReadRAM
        #[arg(value_parser = parse_int)]
        opcode: u32,

        /// Hex strings, or 0x-prefixed values sent as little-endian u32
        data: Vec<String>,
    },

    /// Send an LMP PDU to a connected device
    Sendlmp(LmpArgs),

    /// Stream live traffic to the capture viewer until it is closed
    Monitor {
        #[arg(value_enum)]
        kind: MonitorKind,
    },
}

#[derive(Args, Debug, Default)]
pub struct ConfigureArgs {
    #[arg(long)]
    pub endpoint: Option<String>,

    #[arg(long)]
    pub chip: Option<String>,

    #[arg(long)]
    pub firmware_map: Option<PathBuf>,

    /// Capture viewer command line; reads pcap on stdin
    #[arg(long)]
    pub viewer: Option<String>,

    /// Assembler command line; `{addr}` is replaced by the load address
    #[arg(long)]
    pub assembler: Option<String>,

    /// Disassembler command line; `{addr}` is replaced by the load address
    #[arg(long)]
    pub disassembler: Option<String>,

    #[arg(long)]
    pub timeout_ms: Option<u64>,

    #[arg(long)]
    pub retries: Option<u32>,

    #[arg(long)]
    pub template_dir: Option<PathBuf>,

    /// Show current configuration
    #[arg(long)]
    pub show: bool,
}

#[derive(Args, Debug)]
pub struct LmpArgs {
    /// Connection number (default: the only active connection)
    #[arg(short = 'n', long, value_parser = parse_int)]
    pub conn_number: Option<u32>,

    /// Do not check that the connection is active (fast but unsafe)
    #[arg(long, requires = "conn_number")]
    pub nocheck: bool,

    /// Extended opcode, sent after the 0x7f escape
    #[arg(short, long)]
    pub extended: bool,

    #[arg(value_parser = parse_int)]
    pub opcode: u32,

    /// Payload as a hex string
    #[arg(default_value = "")]
    pub data: String,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum InfoTarget {
    Device,
    Connections,
    Patchram,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorKind {
    Hci,
    Lmp,
}

//! Diagnostic access to Bluetooth controller firmware.
//!
//! Reads and writes controller memory through vendor HCI commands,
//! manages the ROM patch table, injects hook code, decodes connection
//! state and bridges live HCI/LMP traffic to a capture viewer.
//!
//! # Example
//!
//! ```no_run
//! use blueprobe::{ChannelConfig, CommandLauncher, FirmwareMap, Session};
//! use std::net::TcpStream;
//! use std::sync::Arc;
//!
//! let stream = TcpStream::connect("127.0.0.1:8872")?;
//! let session = Session::connect(
//!     Box::new(stream),
//!     ChannelConfig::default(),
//!     FirmwareMap::bcm4339(),
//!     Arc::new(CommandLauncher::default()),
//! )?;
//! let name = session.device_info()?.name;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bdaddr;
pub mod channel;
pub mod connection;
pub mod device;
pub mod error;
pub mod firmware;
pub mod hook;
pub mod lmp;
pub mod memory;
pub mod monitor;
pub mod patchram;
pub mod session;

pub use bdaddr::BdAddr;
pub use channel::{CaptureKind, ChannelConfig, Closer, CommandChannel, Transport};
pub use connection::{Connection, ConnectionRegistry};
pub use device::DeviceInfo;
pub use error::{Error, Result};
pub use firmware::{FirmwareMap, LmpRoutine, Section, SectionKind};
pub use hook::{Assembler, BranchKind, CallSite, HookBlob, HookInstaller, HookPlan, HookStep};
pub use lmp::{LmpReport, LmpSender, LmpTarget};
pub use memory::{ImageTemplate, MemoryEngine, MemoryImage, Operation, PointerChain, SearchPattern};
pub use monitor::{CommandLauncher, MonitorRegistry, ViewerLauncher};
pub use patchram::{PatchSlot, PatchTable, PatchTarget};
pub use session::Session;

//! Error taxonomy shared by every component.

use crate::channel::CaptureKind;
use crate::firmware::SectionKind;
use crate::hook::HookStep;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection to the controller was lost")]
    ConnectionLost,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No response to opcode {opcode:#06x} after {attempts} attempts")]
    Timeout { opcode: u16, attempts: u32 },

    #[error("Range {address:#010x}+{length:#x} is not inside a {kind} section")]
    InvalidAddress {
        address: u32,
        length: usize,
        kind: SectionKind,
    },

    #[error("All patchram slots are in use")]
    NoFreeSlot,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Index {index} out of range, maximum is {max}")]
    IndexOutOfRange { index: usize, max: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Assembler rejected input: {0}")]
    Assembly(String),

    #[error("Transfer aborted after {bytes_done} bytes: {source}")]
    PartialIo {
        bytes_done: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("Controller rejected opcode {opcode:#06x} with status {status:#04x}")]
    CommandRejected { opcode: u16, status: u8 },

    #[error("Cancelled after {bytes_done} bytes")]
    Cancelled { bytes_done: usize },

    #[error("Read-back of code at {address:#010x} does not match what was written")]
    VerifyFailed { address: u32 },

    #[error("Hook installation failed while {step}: {source}")]
    HookStep {
        step: HookStep,
        #[source]
        source: Box<Error>,
    },

    #[error("{0} monitor already running")]
    AlreadyRunning(CaptureKind),

    #[error("{0} monitor is not running")]
    NotRunning(CaptureKind),

    #[error("Invalid firmware map: {0}")]
    InvalidFirmwareMap(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Memory image template error: {0}")]
    Template(#[source] std::io::Error),

    #[error("Capture viewer error: {0}")]
    Viewer(#[source] std::io::Error),
}

impl Error {
    /// Transport and framing failures that a fresh attempt may get past.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. } | Error::Protocol(_) | Error::CommandRejected { .. }
        )
    }

    /// Bytes successfully transferred before the failure, if known.
    pub fn bytes_done(&self) -> Option<usize> {
        match self {
            Error::PartialIo { bytes_done, .. } | Error::Cancelled { bytes_done } => {
                Some(*bytes_done)
            }
            _ => None,
        }
    }
}

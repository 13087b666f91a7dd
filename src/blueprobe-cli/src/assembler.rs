//! Assembler and disassembler backed by external command lines.

use blueprobe::{Assembler, Error, Result};
use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;
use tracing::debug;

/// Placeholder replaced by the load address in a configured command line.
const ADDRESS_PLACEHOLDER: &str = "{addr}";

/// Runs configured tools with the input on stdin and the result on stdout.
///
/// `thumb-as --base {addr}` receives the assembly source and must print raw
/// machine code; the disassembler receives machine code and prints text.
#[derive(Debug, Clone, Default)]
pub struct CommandAssembler {
    assembler: Option<String>,
    disassembler: Option<String>,
}

impl CommandAssembler {
    pub fn new(assembler: Option<String>, disassembler: Option<String>) -> Self {
        CommandAssembler {
            assembler,
            disassembler,
        }
    }

    pub fn can_assemble(&self) -> bool {
        self.assembler.is_some()
    }

    pub fn can_disassemble(&self) -> bool {
        self.disassembler.is_some()
    }
}

fn run_tool(command_line: &str, input: Vec<u8>, load_address: u32) -> Result<Vec<u8>> {
    let address = format!("{:#x}", load_address);
    let mut parts = command_line
        .split_whitespace()
        .map(|part| part.replace(ADDRESS_PLACEHOLDER, &address));
    let program = parts
        .next()
        .ok_or_else(|| Error::Assembly("empty tool command line".to_string()))?;
    let args: Vec<String> = parts.collect();
    debug!("Running {} {:?}", program, args);

    let mut child = Command::new(&program)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Assembly(format!("failed to run {}: {}", program, e)))?;

    // Fed from a thread so a chatty tool cannot block on a full stdout pipe
    let stdin = child.stdin.take();
    let feeder = thread::spawn(move || {
        if let Some(mut stdin) = stdin {
            let _ = stdin.write_all(&input);
        }
    });

    let output = child
        .wait_with_output()
        .map_err(|e| Error::Assembly(format!("{} did not finish: {}", program, e)))?;
    let _ = feeder.join();

    if !output.status.success() {
        return Err(Error::Assembly(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(output.stdout)
}

impl Assembler for CommandAssembler {
    fn assemble(&self, source: &str, load_address: u32) -> Result<Vec<u8>> {
        let command_line = self
            .assembler
            .as_deref()
            .ok_or_else(|| Error::Assembly("no assembler configured".to_string()))?;
        run_tool(command_line, source.as_bytes().to_vec(), load_address)
    }

    fn disassemble(&self, code: &[u8], load_address: u32) -> Result<String> {
        let command_line = self
            .disassembler
            .as_deref()
            .ok_or_else(|| Error::Assembly("no disassembler configured".to_string()))?;
        let text = run_tool(command_line, code.to_vec(), load_address)?;
        Ok(String::from_utf8_lossy(&text).into_owned())
    }
}

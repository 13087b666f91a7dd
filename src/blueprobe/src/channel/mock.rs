//! Mock Controller
//!
//! A simulated controller speaking H4 over an in-memory pipe, for testing
//! everything above the command channel without hardware.

use super::h4::{self, H4_COMMAND};
use super::{Closer, Transport};
use byteorder::{ByteOrder, LE};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

pub use super::{OP_LAUNCH_RAM, OP_READ_RAM, OP_WRITE_RAM};

pub const STATUS_UNKNOWN_COMMAND: u8 = 0x01;
pub const STATUS_HARDWARE_FAILURE: u8 = 0x03;

#[derive(Default)]
struct MockState {
    memory: HashMap<u32, u8>,
    to_host: Option<Sender<Vec<u8>>>,
    host_reader: Option<Receiver<Vec<u8>>>,
    pending: Vec<u8>,
    commands: Vec<(u16, Vec<u8>)>,
    launched: Vec<u32>,
    drop_responses: usize,
    fail_commands: usize,
    /// Fail every read that touches this address.
    poisoned_address: Option<u32>,
    malformed_responses: bool,
    /// Writes to these ranges are silently ignored (flash-like behaviour).
    write_protected: Vec<(u32, u32)>,
}

/// Cloneable handle to one simulated controller; all clones share state.
#[derive(Clone)]
pub struct MockController {
    state: Arc<Mutex<MockState>>,
}

impl MockController {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        MockController {
            state: Arc::new(Mutex::new(MockState {
                to_host: Some(tx),
                host_reader: Some(rx),
                ..MockState::default()
            })),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    /// Preload controller memory.
    pub fn load(&self, address: u32, data: &[u8]) {
        self.with_state(|s| {
            for (i, byte) in data.iter().enumerate() {
                s.memory.insert(address + i as u32, *byte);
            }
        });
    }

    /// Inspect controller memory directly, bypassing the protocol.
    pub fn peek(&self, address: u32, length: usize) -> Vec<u8> {
        self.with_state(|s| {
            (0..length as u32)
                .map(|i| s.memory.get(&(address + i)).copied().unwrap_or(0))
                .collect()
        })
    }

    /// Swallow the next `count` completions (the commands still execute).
    pub fn drop_responses(&self, count: usize) {
        self.with_state(|s| s.drop_responses = count);
    }

    /// Answer the next `count` commands with a hardware-failure status.
    pub fn fail_commands(&self, count: usize) {
        self.with_state(|s| s.fail_commands = count);
    }

    pub fn poison_address(&self, address: u32) {
        self.with_state(|s| s.poisoned_address = Some(address));
    }

    pub fn set_malformed_responses(&self, enabled: bool) {
        self.with_state(|s| s.malformed_responses = enabled);
    }

    pub fn write_protect(&self, start: u32, end: u32) {
        self.with_state(|s| s.write_protected.push((start, end)));
    }

    /// Push an unsolicited event to the host.
    pub fn inject_event(&self, code: u8, params: &[u8]) {
        self.with_state(|s| {
            if let Some(tx) = &s.to_host {
                let _ = tx.send(h4::event_packet(code, params));
            }
        });
    }

    /// Simulate the controller going away.
    pub fn hang_up(&self) {
        self.with_state(|s| s.to_host = None);
    }

    pub fn command_count(&self, opcode: u16) -> usize {
        self.with_state(|s| s.commands.iter().filter(|(op, _)| *op == opcode).count())
    }

    pub fn commands(&self) -> Vec<(u16, Vec<u8>)> {
        self.with_state(|s| s.commands.clone())
    }

    pub fn launched(&self) -> Vec<u32> {
        self.with_state(|s| s.launched.clone())
    }
}

impl MockState {
    fn execute(&mut self, opcode: u16, params: &[u8]) {
        self.commands.push((opcode, params.to_vec()));

        let (status, data) = if self.fail_commands > 0 {
            self.fail_commands -= 1;
            (STATUS_HARDWARE_FAILURE, Vec::new())
        } else {
            self.handle(opcode, params)
        };

        if self.drop_responses > 0 {
            self.drop_responses -= 1;
            return;
        }

        let mut event = vec![1];
        event.extend_from_slice(&opcode.to_le_bytes());
        if self.malformed_responses {
            event.truncate(2);
        } else {
            event.push(status);
            event.extend_from_slice(&data);
        }
        if let Some(tx) = &self.to_host {
            let _ = tx.send(h4::event_packet(h4::EVENT_COMMAND_COMPLETE, &event));
        }
    }

    fn handle(&mut self, opcode: u16, params: &[u8]) -> (u8, Vec<u8>) {
        match opcode {
            OP_READ_RAM if params.len() == 5 => {
                let address = LE::read_u32(&params[0..4]);
                let length = params[4] as u32;
                if let Some(poisoned) = self.poisoned_address {
                    if poisoned >= address && poisoned < address + length {
                        return (STATUS_HARDWARE_FAILURE, Vec::new());
                    }
                }
                let data = (0..length)
                    .map(|i| self.memory.get(&(address + i)).copied().unwrap_or(0))
                    .collect();
                (0, data)
            }
            OP_WRITE_RAM if params.len() >= 4 => {
                let address = LE::read_u32(&params[0..4]);
                for (i, byte) in params[4..].iter().enumerate() {
                    let target = address + i as u32;
                    let protected = self
                        .write_protected
                        .iter()
                        .any(|(start, end)| target >= *start && target < *end);
                    if !protected {
                        self.memory.insert(target, *byte);
                    }
                }
                (0, Vec::new())
            }
            OP_LAUNCH_RAM if params.len() == 4 => {
                self.launched.push(LE::read_u32(params));
                (0, Vec::new())
            }
            _ => (STATUS_UNKNOWN_COMMAND, Vec::new()),
        }
    }

    fn take_commands(&mut self) -> Vec<(u16, Vec<u8>)> {
        let mut parsed = Vec::new();
        while self.pending.len() >= 4 && self.pending[0] == H4_COMMAND {
            let total = 4 + self.pending[3] as usize;
            if self.pending.len() < total {
                break;
            }
            let packet: Vec<u8> = self.pending.drain(..total).collect();
            parsed.push((LE::read_u16(&packet[1..3]), packet[4..].to_vec()));
        }
        parsed
    }
}

impl Write for MockController {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.to_host.is_none() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "controller gone"));
        }
        state.pending.extend_from_slice(buf);
        for (opcode, params) in state.take_commands() {
            state.execute(opcode, &params);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockController {
    fn reader(&mut self) -> io::Result<Box<dyn Read + Send>> {
        let rx = self
            .with_state(|s| s.host_reader.take())
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "reader already taken"))?;
        Ok(Box::new(MockReader {
            rx,
            buffer: Vec::new(),
            position: 0,
        }))
    }

    fn closer(&mut self) -> io::Result<Box<dyn Closer>> {
        Ok(Box::new(self.clone()))
    }
}

impl Closer for MockController {
    fn close(&self) -> io::Result<()> {
        self.hang_up();
        Ok(())
    }
}

struct MockReader {
    rx: Receiver<Vec<u8>>,
    buffer: Vec<u8>,
    position: usize,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.buffer.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.buffer = chunk;
                    self.position = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.buffer.len() - self.position);
        buf[..n].copy_from_slice(&self.buffer[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

//! Memory access engine
//!
//! Chunked reads and writes of controller memory over the vendor
//! diagnostic commands, plus the cached full-address-space image.
//!
//! - `image` - flat snapshot and on-disk ROM template
//! - `pattern` - wildcard byte search
//! - `telescope` - bounded pointer-chain following

pub mod image;
pub mod pattern;
pub mod telescope;

pub use image::{ImageTemplate, MemoryImage};
pub use pattern::SearchPattern;
pub use telescope::PointerChain;

use crate::channel::{CommandChannel, OP_LAUNCH_RAM, OP_READ_RAM, OP_WRITE_RAM};
use crate::error::{Error, Result};
use crate::firmware::{FirmwareMap, SectionKind};
use byteorder::{ByteOrder, LE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Receives `(bytes_done, bytes_total)` after every chunk.
pub type Progress<'a> = &'a mut dyn FnMut(usize, usize);

/// Per-chunk retries on top of the channel's own timeout retries.
pub const DEFAULT_CHUNK_RETRIES: u32 = 2;

/// Requests that the running foreground operation stop before its next
/// chunk. A request made while nothing runs is dropped when the next
/// operation starts.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct MemoryEngine {
    channel: Arc<CommandChannel>,
    map: Arc<FirmwareMap>,
    chunk_retries: u32,
    /// Held for the whole of one foreground operation.
    operation: Mutex<()>,
    cancel: Arc<AtomicBool>,
    template: Option<ImageTemplate>,
    image: Option<MemoryImage>,
}

/// Exclusive foreground access to controller memory, released on drop.
///
/// Multi-step operations such as patch installation hold one of these
/// across every read and write they make, so no other operation can
/// interleave with them.
pub struct Operation<'a> {
    engine: &'a MemoryEngine,
    _guard: MutexGuard<'a, ()>,
}

impl Operation<'_> {
    pub fn map(&self) -> &FirmwareMap {
        &self.engine.map
    }

    pub fn read_mem(&self, address: u32, length: usize, progress: Option<Progress<'_>>) -> Result<Vec<u8>> {
        self.engine
            .read_chunked(address, length, self.engine.map.read_chunk_size, progress)
    }

    pub fn read_u32(&self, address: u32) -> Result<u32> {
        let bytes = self.read_mem(address, 4, None)?;
        Ok(LE::read_u32(&bytes))
    }

    pub fn write_mem(&self, address: u32, data: &[u8], progress: Option<Progress<'_>>) -> Result<()> {
        self.engine.check_ram(address, data.len())?;
        self.engine.write_chunked(address, data, progress)
    }

    /// Write outside the section gate, for hardware tables such as patchram
    /// registers that are not part of any firmware section.
    pub(crate) fn write_unchecked(&self, address: u32, data: &[u8]) -> Result<()> {
        self.engine.write_chunked(address, data, None)
    }

    pub fn launch_ram(&self, address: u32) -> Result<()> {
        info!("Launching code at {:#010x}", address);
        self.engine
            .channel
            .send_checked(OP_LAUNCH_RAM, &address.to_le_bytes())?;
        Ok(())
    }
}

impl MemoryEngine {
    /// The map must already be validated; zero chunk sizes would never
    /// make progress.
    pub(crate) fn new(channel: Arc<CommandChannel>, map: Arc<FirmwareMap>) -> Self {
        MemoryEngine {
            channel,
            map,
            chunk_retries: DEFAULT_CHUNK_RETRIES,
            operation: Mutex::new(()),
            cancel: Arc::new(AtomicBool::new(false)),
            template: None,
            image: None,
        }
    }

    /// Wait for any running foreground operation, then start a new one.
    pub fn begin(&self) -> Operation<'_> {
        let guard = self.operation.lock().unwrap_or_else(PoisonError::into_inner);
        self.cancel.store(false, Ordering::SeqCst);
        Operation {
            engine: self,
            _guard: guard,
        }
    }

    /// Persist and reuse ROM content in this template store.
    pub fn with_template(mut self, template: ImageTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn with_chunk_retries(mut self, retries: u32) -> Self {
        self.chunk_retries = retries;
        self
    }

    pub fn map(&self) -> &FirmwareMap {
        &self.map
    }

    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel))
    }

    /// True iff a section of `kind` fully contains `[address, address + length)`.
    pub fn is_address_in_sections(&self, address: u32, length: usize, kind: SectionKind) -> bool {
        self.map.is_address_in_sections(address, length, kind)
    }

    /// Read `length` bytes starting at `address`.
    pub fn read_mem(
        &self,
        address: u32,
        length: usize,
        progress: Option<Progress<'_>>,
    ) -> Result<Vec<u8>> {
        self.begin().read_mem(address, length, progress)
    }

    /// Read using only 4-byte aligned requests whose length is a multiple
    /// of four, for targets that misbehave on byte-granular access.
    pub fn read_mem_aligned(&self, address: u32, length: usize) -> Result<Vec<u8>> {
        let start = address & !3;
        let end = (u64::from(address) + length as u64 + 3) & !3;
        let total = (end - u64::from(start)) as usize;
        let chunk = (self.map.read_chunk_size & !3).max(4);

        let _operation = self.begin();
        let data = self.read_chunked(start, total, chunk, None)?;
        let skip = (address - start) as usize;
        Ok(data[skip..skip + length].to_vec())
    }

    pub fn read_u32(&self, address: u32) -> Result<u32> {
        self.begin().read_u32(address)
    }

    /// Write `data` to RAM. The whole range must lie inside one RAM
    /// section; otherwise nothing is sent.
    pub fn write_mem(&self, address: u32, data: &[u8], progress: Option<Progress<'_>>) -> Result<()> {
        self.begin().write_mem(address, data, progress)
    }

    /// Transfer execution to `address`. Fails unless the controller
    /// acknowledges with status zero.
    pub fn launch_ram(&self, address: u32) -> Result<()> {
        self.begin().launch_ram(address)
    }

    fn check_ram(&self, address: u32, length: usize) -> Result<()> {
        if !self.is_address_in_sections(address, length, SectionKind::Ram) {
            return Err(Error::InvalidAddress {
                address,
                length,
                kind: SectionKind::Ram,
            });
        }
        Ok(())
    }

    fn read_chunked(
        &self,
        address: u32,
        length: usize,
        chunk_size: usize,
        progress: Option<Progress<'_>>,
    ) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(length);
        self.transfer(length, chunk_size, progress, |offset, len| {
            let chunk_address = address.wrapping_add(offset as u32);
            let mut params = [0u8; 5];
            LE::write_u32(&mut params[0..4], chunk_address);
            params[4] = len as u8;

            let chunk = self.channel.send_checked(OP_READ_RAM, &params)?;
            if chunk.len() != len {
                return Err(Error::Protocol(format!(
                    "read at {:#010x} returned {} bytes, expected {}",
                    chunk_address,
                    chunk.len(),
                    len
                )));
            }
            data.extend_from_slice(&chunk);
            Ok(())
        })?;
        Ok(data)
    }

    fn write_chunked(&self, address: u32, data: &[u8], progress: Option<Progress<'_>>) -> Result<()> {
        self.transfer(
            data.len(),
            self.map.write_chunk_size,
            progress,
            |offset, len| {
                let chunk_address = address.wrapping_add(offset as u32);
                let mut params = Vec::with_capacity(4 + len);
                params.extend_from_slice(&chunk_address.to_le_bytes());
                params.extend_from_slice(&data[offset..offset + len]);
                self.channel.send_checked(OP_WRITE_RAM, &params)?;
                Ok(())
            },
        )
    }

    /// Drive `op(offset, len)` over the range chunk by chunk. A chunk is
    /// retried on retryable errors; any final failure or a cancellation
    /// aborts the whole transfer, reporting the bytes already completed.
    fn transfer(
        &self,
        total: usize,
        chunk_size: usize,
        mut progress: Option<Progress<'_>>,
        mut op: impl FnMut(usize, usize) -> Result<()>,
    ) -> Result<()> {
        let mut done = 0;

        while done < total {
            if self.cancel.swap(false, Ordering::SeqCst) {
                info!("Transfer cancelled after {} of {} bytes", done, total);
                return Err(Error::Cancelled { bytes_done: done });
            }

            let len = chunk_size.min(total - done);
            let mut attempt = 0;
            loop {
                match op(done, len) {
                    Ok(()) => break,
                    Err(e) if e.is_retryable() && attempt < self.chunk_retries => {
                        attempt += 1;
                        warn!("Chunk at offset {:#x} failed ({}), retry {}", done, e, attempt);
                    }
                    Err(e) => {
                        return Err(Error::PartialIo {
                            bytes_done: done,
                            source: Box::new(e),
                        })
                    }
                }
            }

            done += len;
            debug!("Transferred {}/{} bytes", done, total);
            if let Some(report) = progress.as_deref_mut() {
                report(done, total);
            }
        }
        Ok(())
    }

    /// The cached image of the whole address space.
    ///
    /// Built on first use (from the ROM template when one matches, reading
    /// every section otherwise). With `refresh`, non-ROM sections of an
    /// existing image are re-read and spliced in.
    pub fn memory_image(&mut self, refresh: bool) -> Result<&MemoryImage> {
        // `&mut self` already excludes every other operation
        self.cancel.store(false, Ordering::SeqCst);
        let image = match self.image.take() {
            Some(mut image) => {
                if refresh {
                    if let Err(e) = self.refresh_image(&mut image) {
                        self.image = Some(image);
                        return Err(e);
                    }
                }
                image
            }
            None => self.build_image()?,
        };
        Ok(self.image.insert(image))
    }

    /// Drop the cached image so the next access rebuilds it.
    pub fn invalidate_image(&mut self) {
        self.image = None;
    }

    fn build_image(&self) -> Result<MemoryImage> {
        if let Some(template) = &self.template {
            if let Some(mut image) = template.load(&self.map) {
                info!("Template found; reading only non-ROM sections");
                self.refresh_image(&mut image)?;
                return Ok(image);
            }
        }

        info!("No usable template; reading every section including ROM");
        let mut image = MemoryImage::zeroed(self.map.image_size());
        let total: usize = self.map.sections.iter().map(|s| s.size()).sum();
        let mut done = 0;
        for section in &self.map.sections {
            let content =
                self.read_chunked(section.start_addr, section.size(), self.map.read_chunk_size, None)?;
            image.splice(section, &content);
            done += section.size();
            info!(
                "Read section {:#010x}..{:#010x} ({}/{} bytes)",
                section.start_addr, section.end_addr, done, total
            );
        }

        if let Some(template) = &self.template {
            if let Err(e) = template.store(&self.map, &image) {
                warn!("Could not persist ROM template: {}", e);
            }
        }
        Ok(image)
    }

    fn refresh_image(&self, image: &mut MemoryImage) -> Result<()> {
        for section in self.map.sections.iter().filter(|s| !s.is_rom) {
            let content =
                self.read_chunked(section.start_addr, section.size(), self.map.read_chunk_size, None)?;
            image.splice(section, &content);
            debug!(
                "Refreshed section {:#010x}..{:#010x}",
                section.start_addr, section.end_addr
            );
        }
        Ok(())
    }
}

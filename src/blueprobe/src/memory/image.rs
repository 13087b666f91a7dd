//! Memory Image
//!
//! Flat snapshot of the whole firmware address space and the on-disk ROM
//! template that lets later runs skip re-reading immutable ROM.

use super::pattern::SearchPattern;
use crate::error::{Error, Result};
use crate::firmware::{FirmwareMap, Section};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Byte content from address 0 to the highest section end. Gaps between
/// sections are zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryImage {
    data: Vec<u8>,
}

impl MemoryImage {
    pub fn zeroed(size: usize) -> Self {
        MemoryImage {
            data: vec![0; size],
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        MemoryImage { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes at `[address, address + length)`, if inside the image.
    pub fn get(&self, address: u32, length: usize) -> Option<&[u8]> {
        let start = address as usize;
        self.data.get(start..start.checked_add(length)?)
    }

    /// Replace a section's range with freshly read content.
    pub fn splice(&mut self, section: &Section, content: &[u8]) {
        let start = section.start_addr as usize;
        self.data[start..start + content.len()].copy_from_slice(content);
    }

    /// Absolute addresses of every match.
    pub fn search(&self, pattern: &SearchPattern) -> Vec<u32> {
        pattern
            .find_all(&self.data)
            .into_iter()
            .map(|offset| offset as u32)
            .collect()
    }

    /// Copy with every non-ROM section cleared.
    pub fn rom_only(&self, map: &FirmwareMap) -> MemoryImage {
        let mut rom = self.clone();
        for section in map.sections.iter().filter(|s| !s.is_rom) {
            let start = section.start_addr as usize;
            let end = (section.end_addr as usize).min(rom.data.len());
            rom.data[start..end].fill(0);
        }
        rom
    }
}

/// Sidecar metadata guarding a template against a mismatched target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMetadata {
    pub firmware: String,
    pub length: usize,
    pub sha256: String,
}

/// On-disk ROM template store, keyed by firmware name.
#[derive(Debug, Clone)]
pub struct ImageTemplate {
    dir: PathBuf,
}

impl ImageTemplate {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        ImageTemplate {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Paths of the template blob and its metadata.
    pub fn paths(&self, map: &FirmwareMap) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{}.rom.bin", map.name)),
            self.dir.join(format!("{}.rom.json", map.name)),
        )
    }

    /// Load a template that matches `map`. A missing, unreadable, stale or
    /// corrupt template yields `None` so the caller falls back to reading ROM.
    pub fn load(&self, map: &FirmwareMap) -> Option<MemoryImage> {
        let (blob_path, meta_path) = self.paths(map);
        if !blob_path.exists() || !meta_path.exists() {
            debug!("No ROM template at {}", blob_path.display());
            return None;
        }

        let meta_json = match fs::read_to_string(&meta_path) {
            Ok(json) => json,
            Err(e) => {
                warn!("Cannot read template metadata {}: {}", meta_path.display(), e);
                return None;
            }
        };
        let metadata: TemplateMetadata = match serde_json::from_str(&meta_json) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Ignoring unreadable template metadata {}: {}", meta_path.display(), e);
                return None;
            }
        };

        let data = match fs::read(&blob_path) {
            Ok(data) => data,
            Err(e) => {
                warn!("Cannot read ROM template {}: {}", blob_path.display(), e);
                return None;
            }
        };
        let expected = TemplateMetadata {
            firmware: map.name.clone(),
            length: map.image_size(),
            sha256: hash_bytes(&data),
        };
        if metadata != expected || data.len() != expected.length {
            warn!(
                "Discarding ROM template {}: metadata does not match target {}",
                blob_path.display(),
                map.name
            );
            return None;
        }

        info!("Loaded ROM template {}", blob_path.display());
        Some(MemoryImage::from_bytes(data))
    }

    /// Persist the ROM part of `image`.
    pub fn store(&self, map: &FirmwareMap, image: &MemoryImage) -> Result<()> {
        let (blob_path, meta_path) = self.paths(map);
        fs::create_dir_all(&self.dir).map_err(Error::Template)?;

        let rom = image.rom_only(map);
        let metadata = TemplateMetadata {
            firmware: map.name.clone(),
            length: rom.len(),
            sha256: hash_bytes(rom.as_bytes()),
        };
        let meta_json = serde_json::to_string_pretty(&metadata)
            .map_err(|e| Error::Template(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        fs::write(&blob_path, rom.as_bytes()).map_err(Error::Template)?;
        fs::write(&meta_path, meta_json).map_err(Error::Template)?;
        info!("Stored ROM template {}", blob_path.display());
        Ok(())
    }
}

fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

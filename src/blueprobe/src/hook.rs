//! Code injection: write hook blobs to RAM, then redirect ROM call sites
//! into them through patchram.
//!
//! Every blob is assembled, written and read back before the first patch
//! is installed. A failure at any point stops the run and names the step;
//! completed steps are left in place.

use crate::error::{Error, Result};
use crate::firmware::SectionKind;
use crate::memory::{MemoryEngine, Operation};
use crate::patchram::PatchTable;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// External machine-code toolchain.
pub trait Assembler {
    /// Assemble `source` as if placed at `load_address`.
    fn assemble(&self, source: &str, load_address: u32) -> Result<Vec<u8>>;

    fn disassemble(&self, _code: &[u8], _load_address: u32) -> Result<String> {
        Err(Error::Assembly("no disassembler available".to_string()))
    }
}

/// Code to place in RAM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookBlob {
    pub name: String,
    pub load_address: u32,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchKind {
    /// Plain branch; the hook returns on the caller's behalf.
    #[default]
    Branch,
    /// Branch with link; the hook returns to the instruction after the site.
    Link,
}

impl BranchKind {
    fn mnemonic(self) -> &'static str {
        match self {
            BranchKind::Branch => "b",
            BranchKind::Link => "bl",
        }
    }
}

/// A ROM instruction to overwrite with a branch into a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub address: u32,
    pub blob: String,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub kind: BranchKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookPlan {
    #[serde(default)]
    pub blobs: Vec<HookBlob>,
    #[serde(default)]
    pub call_sites: Vec<CallSite>,
}

/// The step a hook installation failed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookStep {
    AssembleBlob(String),
    AssembleBranch(u32),
    WriteBlob(String),
    VerifyBlob(String),
    InstallPatch(u32),
}

impl fmt::Display for HookStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookStep::AssembleBlob(name) => write!(f, "assembling blob '{}'", name),
            HookStep::AssembleBranch(address) => {
                write!(f, "assembling the branch at {:#010x}", address)
            }
            HookStep::WriteBlob(name) => write!(f, "writing blob '{}'", name),
            HookStep::VerifyBlob(name) => write!(f, "verifying blob '{}'", name),
            HookStep::InstallPatch(address) => write!(f, "patching {:#010x}", address),
        }
    }
}

/// What an installation put where.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookReport {
    /// `(name, load address, code length)` per blob.
    pub blobs: Vec<(String, u32, usize)>,
    /// `(call site, patch slots)` per call site.
    pub patches: Vec<(u32, Vec<usize>)>,
}

struct Assembled<'p> {
    blob: &'p HookBlob,
    code: Vec<u8>,
}

pub struct HookInstaller<'a, A: Assembler + ?Sized> {
    engine: &'a MemoryEngine,
    assembler: &'a A,
}

fn at_step<T>(step: HookStep, result: Result<T>) -> Result<T> {
    result.map_err(|source| Error::HookStep {
        step,
        source: Box::new(source),
    })
}

impl<'a, A: Assembler + ?Sized> HookInstaller<'a, A> {
    pub fn new(engine: &'a MemoryEngine, assembler: &'a A) -> Self {
        HookInstaller { engine, assembler }
    }

    pub fn install(&self, plan: &HookPlan) -> Result<HookReport> {
        let blobs = self.assemble_blobs(plan)?;
        let branches = self.assemble_branches(plan)?;

        let op = self.engine.begin();
        let mut report = HookReport::default();
        for assembled in &blobs {
            self.write_verified(&op, assembled)?;
            report.blobs.push((
                assembled.blob.name.clone(),
                assembled.blob.load_address,
                assembled.code.len(),
            ));
        }

        let patches = PatchTable::new(self.engine);
        for (site, branch) in &branches {
            let slots = at_step(
                HookStep::InstallPatch(site.address),
                patches.install_spanning_in(&op, site.address, branch),
            )?;
            info!(
                "Redirected {:#010x} to '{}'+{:#x} via slots {:?}",
                site.address, site.blob, site.offset, slots
            );
            report.patches.push((site.address, slots));
        }
        Ok(report)
    }

    fn assemble_blobs<'p>(&self, plan: &'p HookPlan) -> Result<Vec<Assembled<'p>>> {
        plan.blobs
            .iter()
            .map(|blob| {
                let step = HookStep::AssembleBlob(blob.name.clone());
                let code = at_step(
                    step.clone(),
                    self.assembler.assemble(&blob.source, blob.load_address),
                )?;
                if code.is_empty() {
                    return at_step(
                        step,
                        Err(Error::Assembly("assembler produced no code".to_string())),
                    );
                }
                if !self.engine.is_address_in_sections(blob.load_address, code.len(), SectionKind::Ram) {
                    return at_step(
                        HookStep::WriteBlob(blob.name.clone()),
                        Err(Error::InvalidAddress {
                            address: blob.load_address,
                            length: code.len(),
                            kind: SectionKind::Ram,
                        }),
                    );
                }
                debug!("Assembled '{}': {} bytes", blob.name, code.len());
                Ok(Assembled { blob, code })
            })
            .collect()
    }

    fn assemble_branches<'p>(&self, plan: &'p HookPlan) -> Result<Vec<(&'p CallSite, Vec<u8>)>> {
        plan.call_sites
            .iter()
            .map(|site| {
                let step = HookStep::AssembleBranch(site.address);
                let blob = plan.blobs.iter().find(|b| b.name == site.blob);
                let blob = at_step(
                    step.clone(),
                    blob.ok_or_else(|| Error::NotFound(format!("hook blob '{}'", site.blob))),
                )?;
                let target = blob.load_address.wrapping_add(site.offset);
                let source = format!("{} {:#x}", site.kind.mnemonic(), target);
                let code = at_step(step, self.assembler.assemble(&source, site.address))?;
                Ok((site, code))
            })
            .collect()
    }

    fn write_verified(&self, op: &Operation<'_>, assembled: &Assembled<'_>) -> Result<()> {
        let blob = assembled.blob;
        at_step(
            HookStep::WriteBlob(blob.name.clone()),
            op.write_mem(blob.load_address, &assembled.code, None),
        )?;

        let step = HookStep::VerifyBlob(blob.name.clone());
        let readback = at_step(
            step.clone(),
            op.read_mem(blob.load_address, assembled.code.len(), None),
        )?;
        if readback != assembled.code {
            return at_step(
                step,
                Err(Error::VerifyFailed {
                    address: blob.load_address,
                }),
            );
        }
        info!(
            "Wrote '{}' ({} bytes) to {:#010x}",
            blob.name,
            assembled.code.len(),
            blob.load_address
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::{MockController, OP_WRITE_RAM};
    use crate::firmware::FirmwareMap;
    use crate::memory::tests::{engine_for, scenario_map};
    use byteorder::{ByteOrder, LE};

    /// Emits the source bytes verbatim; branches become `[kind, target]`.
    struct FakeAssembler;

    impl Assembler for FakeAssembler {
        fn assemble(&self, source: &str, _load_address: u32) -> Result<Vec<u8>> {
            if source.contains("bad") {
                return Err(Error::Assembly(format!("cannot parse '{}'", source)));
            }
            if let Some((mnemonic, target)) = source.split_once(" 0x") {
                let target = u32::from_str_radix(target, 16)
                    .map_err(|e| Error::Assembly(e.to_string()))?;
                let tag = if mnemonic == "bl" { 0xf1 } else { 0xf0 };
                let mut code = vec![tag];
                code.extend_from_slice(&target.to_le_bytes()[..3]);
                return Ok(code);
            }
            Ok(source.as_bytes().to_vec())
        }
    }

    fn plan(source: &str, load_address: u32) -> HookPlan {
        HookPlan {
            blobs: vec![HookBlob {
                name: "log_lmp".to_string(),
                load_address,
                source: source.to_string(),
            }],
            call_sites: vec![CallSite {
                address: 0x2fed8,
                blob: "log_lmp".to_string(),
                offset: 4,
                kind: BranchKind::Link,
            }],
        }
    }

    fn patch_table_writes(mock: &MockController) -> usize {
        let patchram = FirmwareMap::bcm4339().patchram;
        mock.commands()
            .iter()
            .filter(|(op, params)| {
                *op == OP_WRITE_RAM
                    && [patchram.target_table, patchram.enable_bitmap]
                        .contains(&LE::read_u32(&params[0..4]))
            })
            .count()
    }

    #[test]
    fn test_install_hook() {
        let mock = MockController::new();
        let engine = engine_for(&mock, scenario_map());

        let report = HookInstaller::new(&engine, &FakeAssembler)
            .install(&plan("push {r4, lr}", 0x91000))
            .unwrap();

        assert_eq!(report.blobs, vec![("log_lmp".to_string(), 0x91000, 13)]);
        assert_eq!(report.patches, vec![(0x2fed8, vec![0])]);
        assert_eq!(mock.peek(0x91000, 13), b"push {r4, lr}");

        let slot = PatchTable::new(&engine).state().unwrap()[0];
        assert!(slot.active);
        assert_eq!(slot.address, 0x2fed8);
        assert_eq!(slot.value, [0xf1, 0x04, 0x10, 0x09]);
    }

    #[test]
    fn test_blob_written_before_any_patch() {
        let mock = MockController::new();
        let engine = engine_for(&mock, scenario_map());
        HookInstaller::new(&engine, &FakeAssembler)
            .install(&plan("code", 0x91000))
            .unwrap();

        let commands = mock.commands();
        let blob_write = commands
            .iter()
            .position(|(op, p)| *op == OP_WRITE_RAM && LE::read_u32(&p[0..4]) == 0x91000)
            .unwrap();
        let first_patch = commands
            .iter()
            .position(|(op, p)| *op == OP_WRITE_RAM && LE::read_u32(&p[0..4]) != 0x91000)
            .unwrap();
        assert!(blob_write < first_patch);
    }

    #[test]
    fn test_failed_verify_installs_no_patch() {
        let mock = MockController::new();
        mock.write_protect(0x91000, 0x92000);
        let engine = engine_for(&mock, scenario_map());

        let err = HookInstaller::new(&engine, &FakeAssembler)
            .install(&plan("code", 0x91000))
            .unwrap_err();
        match err {
            Error::HookStep { step, source } => {
                assert_eq!(step, HookStep::VerifyBlob("log_lmp".to_string()));
                assert!(matches!(*source, Error::VerifyFailed { address: 0x91000 }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(patch_table_writes(&mock), 0);
    }

    #[test]
    fn test_assembly_failure_touches_nothing() {
        let mock = MockController::new();
        let engine = engine_for(&mock, scenario_map());

        let err = HookInstaller::new(&engine, &FakeAssembler)
            .install(&plan("bad opcode", 0x91000))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::HookStep {
                step: HookStep::AssembleBlob(_),
                ..
            }
        ));
        assert!(mock.commands().is_empty());
    }

    #[test]
    fn test_blob_outside_ram_rejected_up_front() {
        let mock = MockController::new();
        let engine = engine_for(&mock, scenario_map());

        let err = HookInstaller::new(&engine, &FakeAssembler)
            .install(&plan("code", 0x1000))
            .unwrap_err();
        match err {
            Error::HookStep { step, source } => {
                assert_eq!(step, HookStep::WriteBlob("log_lmp".to_string()));
                assert!(matches!(*source, Error::InvalidAddress { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(mock.commands().is_empty());
    }

    #[test]
    fn test_unknown_blob_in_call_site() {
        let mock = MockController::new();
        let engine = engine_for(&mock, scenario_map());
        let mut plan = plan("code", 0x91000);
        plan.call_sites[0].blob = "missing".to_string();

        let err = HookInstaller::new(&engine, &FakeAssembler)
            .install(&plan)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::HookStep {
                step: HookStep::AssembleBranch(0x2fed8),
                ..
            }
        ));
        assert!(mock.commands().is_empty());
    }

    #[test]
    fn test_step_display() {
        assert_eq!(
            HookStep::InstallPatch(0x2fed8).to_string(),
            "patching 0x0002fed8"
        );
    }
}

//! Hook installation from a TOML plan file.
//!
//! ```toml
//! [[blob]]
//! name = "lmp_hook"
//! load_address = 0x2002a0
//! source = "lmp_hook.s"    # relative to the plan file
//!
//! [[call_site]]
//! address = 0x3f3f4
//! blob = "lmp_hook"
//! kind = "link"            # or "branch" (default)
//! ```

use anyhow::{bail, Context, Result};
use blueprobe::{CallSite, HookBlob, HookPlan, Session};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::assembler::CommandAssembler;

#[derive(Debug, Deserialize)]
struct PlanFile {
    #[serde(default, rename = "blob")]
    blobs: Vec<BlobEntry>,
    #[serde(default, rename = "call_site")]
    call_sites: Vec<CallSite>,
}

#[derive(Debug, Deserialize)]
struct BlobEntry {
    name: String,
    load_address: u32,
    source: PathBuf,
}

fn load_plan(path: &Path) -> Result<HookPlan> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read hook plan {}", path.display()))?;
    let file: PlanFile = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse hook plan {}", path.display()))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let mut blobs = Vec::with_capacity(file.blobs.len());
    for entry in file.blobs {
        let source_path = base.join(&entry.source);
        let source = fs::read_to_string(&source_path).with_context(|| {
            format!(
                "Failed to read source of blob '{}' from {}",
                entry.name,
                source_path.display()
            )
        })?;
        blobs.push(HookBlob {
            name: entry.name,
            load_address: entry.load_address,
            source,
        });
    }

    Ok(HookPlan {
        blobs,
        call_sites: file.call_sites,
    })
}

pub fn install(session: &Session, assembler: &CommandAssembler, plan_path: &Path) -> Result<()> {
    if !assembler.can_assemble() {
        bail!("No assembler configured. Use 'blueprobe configure --assembler CMD'");
    }
    let plan = load_plan(plan_path)?;

    let report = session.hooks(assembler).install(&plan)?;
    for (name, address, length) in &report.blobs {
        println!("Blob '{}': {} bytes at {:#010x}", name, length, address);
    }
    for (address, slots) in &report.patches {
        println!("Call site {:#010x} redirected using slots {:?}", address, slots);
    }
    Ok(())
}

//! Memory command handlers
//!
//! Reading, dumping, searching and writing controller memory, and
//! launching code placed in RAM.

use anyhow::{bail, Context, Result};
use blueprobe::{Assembler, PointerChain, SearchPattern, SectionKind, Session};
use std::fs;
use std::path::{Path, PathBuf};

use super::{format_hexdump, parse_data, progress_printer};
use crate::assembler::CommandAssembler;
use crate::cli::{parse_int, AsmArgs, DumpArgs, ExecArgs, SearchArgs, WriteArgs};

/// Reads below this size finish too quickly to be worth a progress line.
const PROGRESS_THRESHOLD: usize = 0x1000;

fn read_with_progress(session: &Session, address: u32, length: usize) -> Result<Vec<u8>> {
    if length < PROGRESS_THRESHOLD {
        return Ok(session.memory().read_mem(address, length, None)?);
    }
    let mut progress = progress_printer("Reading");
    Ok(session
        .memory()
        .read_mem(address, length, Some(&mut progress))?)
}

pub fn hexdump(session: &Session, address: u32, length: usize, aligned: bool) -> Result<()> {
    if !session
        .memory()
        .is_address_in_sections(address, length, SectionKind::Any)
    {
        tracing::warn!(
            "{:#010x}+{:#x} is not inside a known section; the controller may crash",
            address,
            length
        );
    }

    let data = if aligned {
        session.memory().read_mem_aligned(address, length)?
    } else {
        read_with_progress(session, address, length)?
    };
    print!("{}", format_hexdump(&data, address));
    Ok(())
}

pub fn telescope(session: &Session, address: u32, length: usize, depth: usize) -> Result<()> {
    for chain in session.memory().telescope(address, length, depth)? {
        println!("{}", format_chain(&chain));
    }
    Ok(())
}

fn format_chain(chain: &PointerChain) -> String {
    let mut line = format!("{:#010x}: ", chain.address);
    let hops: Vec<String> = chain
        .pointers
        .iter()
        .map(|pointer| format!("{:#010x}", pointer))
        .collect();
    line.push_str(&hops.join(" -> "));
    if let Some(text) = &chain.text {
        line.push_str(&format!(" {:?}", text));
    }
    line
}

pub fn disasm(
    session: &Session,
    assembler: &CommandAssembler,
    address: u32,
    length: usize,
) -> Result<()> {
    if !assembler.can_disassemble() {
        bail!("No disassembler configured. Use 'blueprobe configure --disassembler CMD'");
    }
    let code = session.memory().read_mem(address, length, None)?;
    print!("{}", assembler.disassemble(&code, address)?);
    Ok(())
}

/// File name for one RAM section of a `--ram` dump.
fn ram_dump_path(file: &Path, start: u32) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(format!("_{:#x}", start));
    PathBuf::from(name)
}

pub fn dumpmem(session: &mut Session, args: &DumpArgs) -> Result<()> {
    if args.ram {
        let sections: Vec<_> = session
            .map()
            .sections
            .iter()
            .filter(|section| section.is_ram)
            .copied()
            .collect();
        for section in sections {
            let data = read_with_progress(session, section.start_addr, section.size())?;
            let path = ram_dump_path(&args.file, section.start_addr);
            fs::write(&path, &data)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "Dumped RAM section {:#010x}..{:#010x} to {}",
                section.start_addr,
                section.end_addr,
                path.display()
            );
        }
        return Ok(());
    }

    let image = session.memory_mut().memory_image(!args.norefresh)?;
    fs::write(&args.file, image.as_bytes())
        .with_context(|| format!("Failed to write {}", args.file.display()))?;
    println!(
        "Dumped {} bytes of memory to {}",
        image.len(),
        args.file.display()
    );
    Ok(())
}

fn search_pattern(args: &SearchArgs) -> Result<SearchPattern> {
    let text = args.pattern.join(" ");
    if args.hex {
        return Ok(SearchPattern::parse_hex(&text)?);
    }
    if args.address {
        let value = parse_int(&text).map_err(anyhow::Error::msg)?;
        return Ok(SearchPattern::address(value));
    }
    Ok(SearchPattern::literal(text.as_bytes()))
}

pub fn searchmem(session: &mut Session, args: &SearchArgs) -> Result<()> {
    let pattern = search_pattern(args)?;
    let context = args.context as usize;

    let image = session.memory_mut().memory_image(args.refresh)?;
    let matches = image.search(&pattern);

    if matches.is_empty() {
        println!("No matches found.");
        return Ok(());
    }

    println!("Found {} matches:", matches.len());
    for address in matches {
        println!("  {:#010x}", address);
        if context > 0 {
            let start = (address as usize).saturating_sub(context) as u32;
            let length = (address - start) as usize + pattern.len() + context;
            let length = length.min(image.len() - start as usize);
            if let Some(window) = image.get(start, length) {
                print!("{}", format_hexdump(window, start));
            }
        }
    }
    Ok(())
}

/// The bytes a `writemem` sends, repeated as requested.
fn write_payload(args: &WriteArgs) -> Result<Vec<u8>> {
    let data = match &args.file {
        Some(path) => {
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?
        }
        None => parse_data(&args.data)?,
    };
    if data.is_empty() || args.repeat == 0 {
        bail!("Nothing to write");
    }
    Ok(data.repeat(args.repeat))
}

pub fn writemem(session: &Session, args: &WriteArgs) -> Result<()> {
    let payload = write_payload(args)?;
    let mut progress = progress_printer("Writing");
    session
        .memory()
        .write_mem(args.address, &payload, Some(&mut progress))?;
    println!("Wrote {} bytes to {:#010x}", payload.len(), args.address);
    Ok(())
}

/// Machine code for `source` placed at `address`.
fn assemble_at(assembler: &CommandAssembler, source: &str, address: u32) -> Result<Vec<u8>> {
    if !assembler.can_assemble() {
        bail!("No assembler configured. Use 'blueprobe configure --assembler CMD'");
    }
    let code = assembler.assemble(source, address)?;
    if code.is_empty() {
        bail!("Assembler didn't produce any machine code");
    }
    Ok(code)
}

fn asm_source(args: &AsmArgs) -> Result<String> {
    match &args.file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        None if args.code.is_empty() => bail!("Give instructions or --file"),
        None => Ok(args.code.join(" ")),
    }
}

pub fn writeasm(session: &Session, assembler: &CommandAssembler, args: &AsmArgs) -> Result<()> {
    let source = asm_source(args)?;
    let code = assemble_at(assembler, &source, args.address)?;
    println!("Machine code ({} bytes):", code.len());
    print!("{}", format_hexdump(&code, args.address));

    if args.dry {
        println!("Dry run; nothing written.");
        return Ok(());
    }
    session.memory().write_mem(args.address, &code, None)?;
    println!("Wrote {} bytes to {:#010x}", code.len(), args.address);
    Ok(())
}

fn is_assembly(args: &ExecArgs) -> bool {
    args.asm
        || args
            .file
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext.to_ascii_lowercase().as_str(), "s" | "asm"))
}

pub fn exec(session: &Session, assembler: &CommandAssembler, args: &ExecArgs) -> Result<()> {
    let file = &args.file;
    let code = if is_assembly(args) {
        let source = fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        assemble_at(assembler, &source, args.address)?
    } else {
        fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?
    };
    if code.is_empty() {
        bail!("{} is empty", file.display());
    }

    if args.dry {
        print!("{}", format_hexdump(&code, args.address));
        println!("Dry run; nothing written or launched.");
        return Ok(());
    }
    session.memory().write_mem(args.address, &code, None)?;
    println!("Wrote {} bytes to {:#010x}", code.len(), args.address);
    launch(session, args.address)
}

pub fn launch(session: &Session, address: u32) -> Result<()> {
    session.memory().launch_ram(address)?;
    println!("Launched code at {:#010x}", address);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::DataArgs;

    fn search_args(pattern: &[&str], hex: bool, address: bool) -> SearchArgs {
        SearchArgs {
            refresh: false,
            hex,
            address,
            context: 0,
            pattern: pattern.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn test_search_pattern_kinds() {
        let literal = search_pattern(&search_args(&["Nexus", "5"], false, false)).unwrap();
        assert_eq!(literal, SearchPattern::literal(b"Nexus 5"));

        let address = search_pattern(&search_args(&["0x200400"], false, true)).unwrap();
        assert_eq!(address, SearchPattern::address(0x200400));

        let hex = search_pattern(&search_args(&["ff", "??", "20"], true, false)).unwrap();
        assert_eq!(hex.len(), 3);

        assert!(search_pattern(&search_args(&["zz"], true, false)).is_err());
    }

    #[test]
    fn test_format_chain() {
        let chain = PointerChain {
            address: 0x200000,
            pointers: vec![0x200010, 0],
            text: Some("ok".to_string()),
        };
        assert_eq!(
            format_chain(&chain),
            "0x00200000: 0x00200010 -> 0x00000000 \"ok\""
        );
    }

    #[test]
    fn test_ram_dump_path() {
        assert_eq!(
            ram_dump_path(Path::new("memdump.bin"), 0x200000),
            PathBuf::from("memdump.bin_0x200000")
        );
    }

    #[test]
    fn test_write_payload_repeat() {
        let args = WriteArgs {
            address: 0x200000,
            data: DataArgs {
                hex: true,
                int: false,
                data: vec!["00bf".to_string()],
            },
            file: None,
            repeat: 3,
        };
        assert_eq!(write_payload(&args).unwrap(), vec![0x00, 0xbf, 0x00, 0xbf, 0x00, 0xbf]);
    }

    #[test]
    fn test_write_payload_from_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("code.bin");
        fs::write(&path, [1, 2, 3]).unwrap();

        let args = WriteArgs {
            address: 0x200000,
            data: DataArgs::default(),
            file: Some(path),
            repeat: 1,
        };
        assert_eq!(write_payload(&args).unwrap(), vec![1, 2, 3]);
    }

    fn exec_args(file: &str, asm: bool) -> ExecArgs {
        ExecArgs {
            file: PathBuf::from(file),
            address: 0x211800,
            asm,
            dry: false,
        }
    }

    #[test]
    fn test_exec_detects_assembly() {
        assert!(is_assembly(&exec_args("exec_hello.s", false)));
        assert!(is_assembly(&exec_args("hook.ASM", false)));
        assert!(is_assembly(&exec_args("code.txt", true)));
        assert!(!is_assembly(&exec_args("code.bin", false)));
        assert!(!is_assembly(&exec_args("noextension", false)));
    }

    #[test]
    fn test_asm_source() {
        let inline = AsmArgs {
            address: 0x211800,
            file: None,
            dry: true,
            code: vec!["movs r0, #1;".to_string(), "bx lr".to_string()],
        };
        assert_eq!(asm_source(&inline).unwrap(), "movs r0, #1; bx lr");

        let empty = AsmArgs {
            code: Vec::new(),
            ..inline
        };
        assert!(asm_source(&empty).is_err());
    }

    #[test]
    fn test_assemble_needs_assembler() {
        let assembler = CommandAssembler::new(None, None);
        assert!(assemble_at(&assembler, "nop", 0x211800).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_assemble_at_rejects_empty_output() {
        let assembler = CommandAssembler::new(Some("true".to_string()), None);
        assert!(assemble_at(&assembler, "nop", 0x211800).is_err());

        let assembler = CommandAssembler::new(Some("cat".to_string()), None);
        assert_eq!(assemble_at(&assembler, "AB", 0x211800).unwrap(), b"AB".to_vec());
    }

    #[test]
    fn test_write_payload_zero_repeat() {
        let args = WriteArgs {
            address: 0x200000,
            data: DataArgs {
                hex: false,
                int: false,
                data: vec!["x".to_string()],
            },
            file: None,
            repeat: 0,
        };
        assert!(write_payload(&args).is_err());
    }
}

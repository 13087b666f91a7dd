//! Configuration command handlers
//!
//! Handles the `configure` subcommand for setting up blueprobe defaults.

use crate::cli::ConfigureArgs;
use crate::config::Config;
use anyhow::Result;

/// Handle the configure command
pub fn handle(args: ConfigureArgs) -> Result<()> {
    let mut config = Config::load()?;

    if args.show {
        show_config(&config);
        return Ok(());
    }

    if apply(&mut config, args) {
        config.save()?;
        println!("Configuration updated");
        if let Ok(path) = Config::config_path() {
            println!("Config saved to: {}", path.display());
        }
    } else {
        show_usage();
    }

    Ok(())
}

/// Copy every given option into `config`. Returns false if none was given.
fn apply(config: &mut Config, args: ConfigureArgs) -> bool {
    let mut changed = false;

    if let Some(endpoint) = args.endpoint {
        config.endpoint = Some(endpoint);
        changed = true;
    }
    if let Some(chip) = args.chip {
        config.chip = chip;
        changed = true;
    }
    if let Some(path) = args.firmware_map {
        config.firmware_map = Some(path);
        changed = true;
    }
    if let Some(viewer) = args.viewer {
        config.viewer = viewer;
        changed = true;
    }
    if let Some(assembler) = args.assembler {
        config.assembler = Some(assembler);
        changed = true;
    }
    if let Some(disassembler) = args.disassembler {
        config.disassembler = Some(disassembler);
        changed = true;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = timeout_ms;
        changed = true;
    }
    if let Some(retries) = args.retries {
        config.retries = retries;
        changed = true;
    }
    if let Some(dir) = args.template_dir {
        config.template_dir = Some(dir);
        changed = true;
    }

    changed
}

/// Display current configuration
fn show_config(config: &Config) {
    match &config.endpoint {
        Some(endpoint) => println!("Endpoint:      {}", endpoint),
        None => println!("Endpoint:      (not set)"),
    }
    match &config.firmware_map {
        Some(path) => println!("Firmware map:  {}", path.display()),
        None => println!("Chip preset:   {}", config.chip),
    }
    println!("Viewer:        {}", config.viewer);
    println!(
        "Assembler:     {}",
        config.assembler.as_deref().unwrap_or("(not set)")
    );
    println!(
        "Disassembler:  {}",
        config.disassembler.as_deref().unwrap_or("(not set)")
    );
    println!("Timeout:       {} ms", config.timeout_ms);
    println!("Retries:       {}", config.retries);
    if let Some(dir) = config.template_dir() {
        println!("Templates:     {}", dir.display());
    }

    if let Ok(path) = Config::config_path() {
        println!("Config file:   {}", path.display());
    }
}

fn show_usage() {
    println!("Usage: blueprobe configure --endpoint HOST:PORT [--chip NAME] [--viewer CMD]");
    println!("   or: blueprobe configure --show");
    println!();
    println!("Note: the endpoint is a TCP socket carrying the controller's H4 stream,");
    println!("      e.g. an adb-forwarded HCI snoop/injection port.");
}

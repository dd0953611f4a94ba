// CLI application
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use nuclide_export::backend::InMemoryBackend;
use nuclide_export::config::ExportConfig;
use nuclide_export::exporter::Exporter;
use nuclide_export::parser::GoblinParser;
use nuclide_export::{Address, Bitness, DisassemblyResult};

#[derive(Parser)]
#[command(name = "nuclide-export")]
#[command(about = "Normalize a disassembler's view of a binary")]
#[command(version)]
struct Cli {
    /// Backend dump (JSON) to export
    #[arg(short, long)]
    dump: PathBuf,

    /// The analyzed binary; fills in architecture, base address, imports and names
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Debug symbol file to merge names from
    #[arg(short, long)]
    symbols: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the base address (hex, with or without 0x)
    #[arg(long, value_parser = parse_address)]
    base_addr: Option<Address>,

    /// Override the instruction-set width (16, 32 or 64)
    #[arg(long, value_parser = parse_bitness)]
    bitness: Option<Bitness>,
}

fn parse_address(text: &str) -> Result<Address, String> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    Address::from_str_radix(digits, 16).map_err(|e| format!("invalid address {text}: {e}"))
}

fn parse_bitness(text: &str) -> Result<Bitness, String> {
    let bits: u32 = text.parse().map_err(|e| format!("invalid bitness {text}: {e}"))?;
    Bitness::try_from(bits).map_err(|e| e.to_string())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ExportConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ExportConfig::default(),
    };
    if cli.symbols.is_some() {
        config.symbol_file = cli.symbols.clone();
    }
    if cli.base_addr.is_some() {
        config.base_addr = cli.base_addr;
    }
    if cli.bitness.is_some() {
        config.bitness = cli.bitness;
    }

    let text = fs::read_to_string(&cli.dump)
        .with_context(|| format!("reading dump {}", cli.dump.display()))?;
    let mut backend = InMemoryBackend::from_json(&text)
        .with_context(|| format!("parsing dump {}", cli.dump.display()))?;

    if let Some(path) = &cli.image {
        let data = fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
        let info = GoblinParser::new()
            .parse(&data)
            .with_context(|| format!("parsing image {}", path.display()))?;
        log::info!(
            "image {}: {} {} bit, base 0x{:x}, {} imports",
            path.display(),
            info.architecture,
            info.bitness,
            info.base_addr,
            info.api_map.len()
        );
        backend = backend.with_image_info(&info).with_binary(data);
    }

    let result = Exporter::new(backend).with_config(config).run()?;
    print_summary(&result);

    Ok(())
}

fn print_summary(result: &DisassemblyResult) {
    println!(
        "Architecture:        {} ({} bit)",
        result.architecture,
        result.bitness.map_or(0, Bitness::bits)
    );
    println!("Base address:        0x{:x}", result.base_addr);
    println!("Functions:           {}", result.functions.len());
    println!("Blocks:              {}", result.block_count());
    println!("Instructions:        {}", result.instruction_count());
    println!("Code references:     {}", result.code_refs.edge_count());
    println!("Recursive functions: {}", result.recursive_functions.len());
    println!("Leaf functions:      {}", result.leaf_functions.len());
    println!("Named functions:     {}", result.function_symbols.len());
    println!("API call sites:      {}", result.addr_to_api.len());
    println!("Decode errors:       {}", result.errors.len());

    if !result.skipped_functions.is_empty() {
        println!("Skipped functions:   {}", result.skipped_functions.len());
        for (entry, reason) in &result.skipped_functions {
            println!("  0x{entry:x}: {reason}");
        }
    }
    for warning in &result.warnings {
        println!("Warning: {warning}");
    }
    if let Some(duration) = result.analysis_duration() {
        println!("Took {} ms", duration.num_milliseconds());
    }
}

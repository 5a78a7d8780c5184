//! bulksym - standalone debug entry point for the bulk analyzer.
//!
//! Analyzes object files and archives, prints symbol-name attribution, and
//! optionally resolves string literals or symbol aliases against a final
//! linked binary. Also hosts the hidden `--delegate` mode used by the IPC
//! coordinator.

use anyhow::Result;
use bulksym::{AddressRange, AnalyzerOptions, BulkAnalyzer};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bulksym")]
#[command(
    author,
    version,
    about = "Bulk object-file symbol and string-literal analysis"
)]
#[command(long_about = "
bulksym runs the symbol-listing and section-header tools over batches of
object files and archives in parallel, and reports which paths define each
symbol and where each object file's string literals ended up inside the
final linked binary.

EXAMPLES:
    bulksym --names obj/foo.o obj/libbar.a
    bulksym --elf out/chrome --strings obj/foo.o
    bulksym --elf out/chrome --aliases
    bulksym --tool-prefix aarch64-linux-gnu- --names obj/*.o
")]
struct Cli {
    /// Object file or archive paths to analyze
    paths: Vec<String>,

    /// Prefix for nm / readelf / c++filt (toolchain triple or directory)
    #[arg(long, default_value = "")]
    tool_prefix: String,

    /// Directory the object paths are relative to
    #[arg(long)]
    output_directory: Option<PathBuf>,

    /// Object files per symbol-listing invocation
    #[arg(long, default_value_t = bulksym::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Parallel worker count (0 = all cores)
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// Final linked binary for string / alias analysis
    #[arg(long)]
    elf: Option<PathBuf>,

    /// Print the finalized symbol-name -> object-path map
    #[arg(long)]
    names: bool,

    /// Resolve and print string literal positions (requires --elf)
    #[arg(long)]
    strings: bool,

    /// Print the address-alias map of --elf (identical code folding)
    #[arg(long)]
    aliases: bool,

    /// Final-binary range as ADDR:SIZE (hex with 0x, or decimal); repeatable.
    /// Defaults to the whole file when resolving strings.
    #[arg(long = "range")]
    ranges: Vec<String>,

    /// Run as the IPC delegate over stdin/stdout
    #[arg(long, hide = true)]
    delegate: bool,
}

fn parse_u64(value: &str) -> Result<u64> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => value.parse()?,
    };
    Ok(parsed)
}

fn parse_range(spec: &str) -> Result<AddressRange> {
    let Some((address, size)) = spec.split_once(':') else {
        anyhow::bail!("bad range {spec:?}, expected ADDR:SIZE");
    };
    Ok(AddressRange::new(parse_u64(address)?, parse_u64(size)?))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut options = AnalyzerOptions::new()
        .with_tool_prefix(&cli.tool_prefix)
        .with_batch_size(cli.batch_size)
        .with_workers(cli.workers);
    if let Some(dir) = &cli.output_directory {
        options = options.with_output_directory(dir);
    }

    if cli.delegate {
        bulksym::ipc::run_delegate(options)?;
        return Ok(());
    }

    if cli.strings && cli.elf.is_none() {
        anyhow::bail!("--strings requires --elf");
    }
    if cli.aliases && cli.elf.is_none() {
        anyhow::bail!("--aliases requires --elf");
    }
    if cli.paths.is_empty() && !cli.aliases {
        anyhow::bail!("no object or archive paths given");
    }

    let mut analyzer = BulkAnalyzer::new(options)?;

    if let (Some(elf), true) = (&cli.elf, cli.aliases) {
        let aliases = analyzer.collect_aliases(elf)?;
        println!("{} aliased addresses in {}", aliases.len(), elf.display());
        for (address, names) in &aliases {
            println!("{address:>16x} {}", names.join("  "));
        }
    }

    if cli.paths.is_empty() {
        return Ok(());
    }

    analyzer.analyze_paths(&cli.paths)?;
    analyzer.sort_paths()?;

    let symbol_names = analyzer.symbol_names();
    if cli.names {
        for (name, paths) in symbol_names {
            println!("{name}");
            for path in paths {
                println!("    {path}");
            }
        }
    }
    println!(
        "{} symbol names from {} input paths",
        symbol_names.len(),
        cli.paths.len()
    );

    if let (Some(elf), true) = (&cli.elf, cli.strings) {
        let ranges = if cli.ranges.is_empty() {
            vec![AddressRange::new(0, std::fs::metadata(elf)?.len())]
        } else {
            cli.ranges
                .iter()
                .map(|spec| parse_range(spec))
                .collect::<Result<Vec<_>>>()?
        };

        analyzer.analyze_string_literals(elf, &ranges)?;
        let positions = analyzer.string_positions();
        let mut sorted_ranges: Vec<&AddressRange> = positions.keys().collect();
        sorted_ranges.sort_unstable();
        for range in sorted_ranges {
            println!("range {:#x}+{:#x}:", range.address, range.size);
            for (path, resolved) in &positions[range] {
                for position in resolved {
                    println!(
                        "    {:>16x} {:>6} {}",
                        position.address, position.size, path
                    );
                }
            }
        }
    }

    analyzer.close();
    Ok(())
}

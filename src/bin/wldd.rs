extern crate dependency_chain;

use clap::Parser;
use dependency_chain::logging::init_tracing;
use dependency_chain::render::render_ldd;
use dependency_chain::{lookup, LookupQuery, ResolveOptions};
use fs_err as fs;
use std::path::PathBuf;

/// ldd for Windows
#[derive(Debug, Parser)]
#[command(name = "wldd", version, about, long_about = None)]
struct Cli {
    /// Sets the input file to use
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Windows partition to use for system DLLs lookup (default: the partition where INPUT lies)
    #[arg(short = 'w', long, value_name = "WINDOWS_ROOT")]
    windows_root: Option<PathBuf>,

    /// Hide system DLLs in the output
    #[arg(long)]
    hide_system_dlls: bool,

    /// Sets the level of verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if !cli.input.exists() {
        eprintln!("Specified file not found at {}", cli.input.display());
        std::process::exit(1);
    }

    let mut query = LookupQuery::deduce_from_executable_location(fs::canonicalize(&cli.input)?)?;
    if let Some(root) = &cli.windows_root {
        query = query.with_windows_root(root)?;
    }
    query.parameters = ResolveOptions {
        unique: true,
        ..ResolveOptions::default()
    };

    let win_dir = query.system.as_ref().map(|s| s.win_dir.clone());
    let graph = lookup(query)?;

    let is_system = |path: &Option<PathBuf>| match (path, &win_dir) {
        (Some(path), Some(win_dir)) => path.starts_with(win_dir),
        _ => false,
    };
    println!(
        "{}",
        render_ldd(&graph, |node| cli.hide_system_dlls && is_system(&node.path))
    );

    Ok(())
}

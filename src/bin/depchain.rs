extern crate dependency_chain;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use dependency_chain::common::{decanonicalize, path_to_string, readable_canonical_path};
use dependency_chain::logging::init_tracing;
use dependency_chain::progress::TracingProgress;
use dependency_chain::render::{render_chain, render_failed, render_headers};
use dependency_chain::{
    BinaryImage, DependencyGraph, FileSystemLoader, LookupPath, LookupQuery, ResolveOptions,
    Resolver,
};
use fs_err as fs;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Dependency chain of Windows executables and .NET assemblies
#[derive(Debug, Parser)]
#[command(name = "depchain", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    lookup: LookupArgs,

    #[command(subcommand)]
    command: Command,
}

/// Options shaping the DLL lookup, shared by all subcommands
#[derive(Debug, Args)]
struct LookupArgs {
    /// Windows partition to use for system DLLs lookup (if not specified, the partition where INPUT lies will be tested and used if valid)
    #[arg(short = 'w', long, global = true, value_name = "WINDOWS_ROOT")]
    windows_root: Option<PathBuf>,

    /// Working directory to be considered in the DLL lookup path (default: directory of INPUT)
    #[arg(short = 'k', long, global = true, value_name = "WORKDIR")]
    workdir: Option<PathBuf>,

    /// User path entries, separated by ';', to be searched after the system locations
    #[arg(short = 'a', long, global = true, value_name = "PATH")]
    userpath: Option<String>,

    /// Let the Windows loader locate and map the modules (Windows only)
    #[arg(long, global = true)]
    os_loader: bool,

    /// Verbosity level (repeat for more detail); RUST_LOG overrides it
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Options of a resolution run
#[derive(Debug, Args)]
struct ResolveArgs {
    /// Target file (.exe or .dll)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Maximum recursion depth (default: unlimited)
    #[arg(short = 'd', long)]
    max_depth: Option<usize>,

    /// Number of modules loaded in parallel
    #[arg(short = 'j', long, default_value_t = 1)]
    jobs: usize,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the dependency tree of INPUT
    Chain {
        #[command(flatten)]
        resolve: ResolveArgs,

        /// Share one node between all occurrences of a module
        #[arg(long)]
        unique: bool,

        /// Emit the graph as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the dependencies of INPUT that could not be loaded
    Failed {
        #[command(flatten)]
        resolve: ResolveArgs,

        /// Only report managed assembly references
        #[arg(long)]
        managed_only: bool,

        /// Emit the failed modules as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the decoded headers of INPUT
    Headers {
        /// Target file (.exe, .dll or object file)
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Emit the headers as JSON
        #[arg(long)]
        json: bool,
    },
}

fn check_input(input: &Path) -> anyhow::Result<PathBuf> {
    if !input.exists() {
        bail!(
            "Specified file not found at {}\nCurrent working directory: {}",
            input.display(),
            std::env::current_dir()?.display(),
        );
    }
    if input.is_dir() {
        bail!(
            "The specified path is a directory, not a PE executable file: {}",
            input.display()
        );
    }
    Ok(fs::canonicalize(input)?)
}

fn build_query(
    binary_path: &Path,
    options: ResolveOptions,
    args: &LookupArgs,
) -> anyhow::Result<LookupQuery> {
    let mut query = LookupQuery::deduce_from_executable_location(binary_path)?;
    query.parameters = options;

    // overrides (must be last)

    if let Some(root) = &args.windows_root {
        query = query.with_windows_root(root)?;
    } else if let Some(system) = &query.system {
        tracing::info!(
            "Windows partition root not specified, assumed {}",
            path_to_string(&system.win_dir)
        );
    } else {
        tracing::warn!("Windows partition root not specified, and executable doesn't lie in one; system DLL imports will not be resolved");
    }

    if let Some(workdir) = &args.workdir {
        query.target.working_dir = fs::canonicalize(workdir)?;
    } else {
        tracing::info!(
            "Working directory not specified, assuming directory of executable: {}",
            decanonicalize(&path_to_string(&query.target.working_dir))
        );
    }

    if let Some(user_path) = &args.userpath {
        let canonicalized_path = user_path
            .split(';')
            .filter(|s| !s.is_empty())
            .filter_map(|s| {
                if Path::new(s).exists() {
                    Some(fs::canonicalize(s))
                } else {
                    tracing::warn!("Skipping non-existing path entry {}", s);
                    None
                }
            })
            .collect::<Result<Vec<_>, std::io::Error>>()?;
        query.target.user_path.extend(canonicalized_path);
    }
    Ok(query)
}

fn resolve_input(args: &ResolveArgs, unique: bool, lookup: &LookupArgs) -> anyhow::Result<DependencyGraph> {
    let binary_path = check_input(&args.input)?;
    let options = ResolveOptions {
        unique,
        max_depth: args.max_depth,
        max_concurrency: args.jobs,
    };
    let root = path_to_string(&binary_path);
    tracing::info!(
        "Looking for dependencies of binary {}",
        readable_canonical_path(&binary_path)?
    );

    if lookup.os_loader {
        #[cfg(windows)]
        {
            let loader = dependency_chain::WindowsLoader;
            return Resolver::new(&loader, options)
                .with_progress(&TracingProgress)
                .resolve(&root)
                .with_context(|| format!("Could not resolve {}", root));
        }
        #[cfg(not(windows))]
        {
            bail!("--os-loader is only available on Windows");
        }
    }

    let query = build_query(&binary_path, options.clone(), lookup)?;
    let lookup_path = LookupPath::new(query);
    let search_path: Vec<String> = lookup_path
        .search_path()
        .iter()
        .map(|p| decanonicalize(&path_to_string(p)))
        .collect();
    tracing::info!("Search path: {}", search_path.join(", "));

    let loader = FileSystemLoader::new(lookup_path);
    Resolver::new(&loader, options)
        .with_progress(&TracingProgress)
        .resolve(&root)
        .with_context(|| format!("Could not resolve {}", root))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let js = serde_json::to_string_pretty(value).context("Error serializing")?;
    println!("{}", js);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.lookup.verbose);

    match &cli.command {
        Command::Chain {
            resolve,
            unique,
            json,
        } => {
            let graph = resolve_input(resolve, *unique, &cli.lookup)?;
            if *json {
                print_json(&graph)?;
            } else {
                println!("{}", render_chain(&graph));
            }
        }
        Command::Failed {
            resolve,
            managed_only,
            json,
        } => {
            let graph = resolve_input(resolve, false, &cli.lookup)?;
            if *json {
                print_json(&graph.failed(*managed_only))?;
            } else if graph.failed(*managed_only).is_empty() {
                println!("No missing dependencies detected");
            } else {
                println!("{}", render_failed(&graph, *managed_only));
            }
        }
        Command::Headers { input, json } => {
            let binary_path = check_input(input)?;
            let data = fs::read(&binary_path)?;
            let image = BinaryImage::parse_bytes(&data)
                .with_context(|| format!("Could not decode {}", binary_path.display()))?;
            if *json {
                print_json(&image)?;
            } else {
                println!("{}", render_headers(&image));
            }
        }
    }

    Ok(())
}

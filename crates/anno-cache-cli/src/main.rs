use anno_cache::codec::{self, TextCodec};
use anno_cache::path::encode;
use anno_cache::{CacheLayout, CacheOptions, CacheStore, ContainerName, TableKind};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "annocache", version, about = "Inspect and maintain the annotation scan cache")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode a cache file (binary or text) and print it as text
    Dump(DumpArgs),
    /// Print the directory name each argument is stored under
    Encode(EncodeArgs),
    /// Print the cache file paths of a module or container
    Layout(LayoutArgs),
    /// Print the effective cache options
    Options(OptionsArgs),
    /// Remove temp files left behind by interrupted writes
    Sweep(SweepArgs),
}

#[derive(Args)]
struct DumpArgs {
    /// Cache file to decode
    file: PathBuf,
    /// Only print the header fields
    #[arg(long)]
    header: bool,
}

#[derive(Args)]
struct EncodeArgs {
    #[arg(required = true)]
    names: Vec<String>,
}

#[derive(Args)]
struct SourceArgs {
    /// TOML options file; defaults to `ANNO_CACHE_*` environment variables
    #[arg(long)]
    config: Option<PathBuf>,
    /// Cache root, overriding the configured one
    #[arg(long)]
    dir: Option<PathBuf>,
}

#[derive(Args)]
struct LayoutArgs {
    #[arg(long)]
    app: String,
    #[arg(long)]
    module: String,
    /// Container name; omit for the module-level files
    #[arg(long)]
    container: Option<String>,
    #[command(flatten)]
    source: SourceArgs,
}

#[derive(Args)]
struct OptionsArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Emit JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct SweepArgs {
    #[command(flatten)]
    source: SourceArgs,
}

const CONTAINER_TABLES: [TableKind; 4] = [
    TableKind::Stamp,
    TableKind::Classes,
    TableKind::Targets,
    TableKind::Details,
];

const MODULE_TABLES: [TableKind; 4] = [
    TableKind::Stamp,
    TableKind::Containers,
    TableKind::Resolved,
    TableKind::Unresolved,
];

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Dump(args) => dump(&args.file, args.header),
        Command::Encode(args) => {
            let mut out = std::io::stdout().lock();
            for name in &args.names {
                writeln!(out, "{}", encode(name))?;
            }
            Ok(0)
        }
        Command::Layout(args) => {
            let options = load_options(&args.source)?;
            let layout = CacheLayout::new(options.dir.clone(), options.format());
            let (name, kinds) = match args.container {
                Some(container) => (ContainerName::Named(container), &CONTAINER_TABLES),
                None => (ContainerName::Module, &MODULE_TABLES),
            };
            let mut out = std::io::stdout().lock();
            for &kind in kinds.iter() {
                if let Some(path) = layout.container_path(&args.app, &args.module, &name, kind) {
                    writeln!(out, "{:<22} {}", kind.table_name(), path.display())?;
                }
            }
            Ok(0)
        }
        Command::Options(args) => {
            let options = load_options(&args.source)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&options)?);
            } else {
                println!("{options}");
            }
            Ok(0)
        }
        Command::Sweep(args) => {
            let options = load_options(&args.source)?;
            let store = CacheStore::new(options)?;
            let removed = store.sweep_abandoned_writes()?;
            println!(
                "removed {removed} abandoned write(s) under {}",
                store.layout().root().display()
            );
            Ok(0)
        }
    }
}

fn load_options(source: &SourceArgs) -> Result<CacheOptions> {
    let mut options = match &source.config {
        Some(path) => CacheOptions::load_from_path(path)?,
        None => CacheOptions::from_env().context("reading ANNO_CACHE_* environment variables")?,
    };
    if let Some(dir) = &source.dir {
        options.dir = dir.clone();
    }
    tracing::debug!(
        target = "anno.cache",
        config = ?source.config,
        dir = %options.dir.display(),
        "loaded cache options"
    );
    Ok(options)
}

/// Exit code 1 means the file exists but does not decode.
fn dump(path: &Path, header_only: bool) -> Result<i32> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let codec = codec::detect(&bytes);

    if header_only {
        return match codec.read_header(&bytes) {
            Ok(header) => {
                println!("Codec:    {}", codec.name());
                println!("Encoding: {}", header.encoding);
                println!("Table:    {}", header.table);
                println!("Version:  {}", header.version);
                println!("Written:  {}", header.written);
                Ok(0)
            }
            Err(err) => {
                eprintln!("{}: {err}", path.display());
                Ok(1)
            }
        };
    }

    match codec.read(&bytes) {
        Ok(table) => {
            let text = codec::encode_to_vec(&TextCodec, &table)?;
            std::io::stdout().lock().write_all(&text)?;
            Ok(0)
        }
        Err(err) => {
            eprintln!("{}: {err}", path.display());
            Ok(1)
        }
    }
}

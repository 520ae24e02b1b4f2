use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use lowmem_checkpoint::split::{is_empty_json, read_empty_spec};
use lowmem_checkpoint::{load_manifest, load_split_tensor, save_split, EmptySpec, SplitEntry};
use lowmem_core::DType;
use lowmem_nn::serialization;

#[derive(Parser)]
#[command(
    name = "lowmem",
    about = "Split checkpoint tools",
    long_about = "Convert, inspect and generate one-file-per-parameter checkpoints that\ncan be loaded without holding a full state dict in memory.",
    version
)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Convert a single safetensors file into a split checkpoint directory
    Split {
        /// Input .safetensors file
        #[arg(long)]
        input: PathBuf,
        /// Output directory
        #[arg(long)]
        output: PathBuf,
    },
    /// List the entries of a split checkpoint directory
    Inspect {
        /// Split checkpoint directory
        #[arg(long)]
        dir: PathBuf,
    },
    /// Write a placeholder checkpoint made only of empty specs
    Empty {
        /// Output directory
        #[arg(long)]
        output: PathBuf,
        /// Parameter as NAME:D0xD1x... (repeatable)
        #[arg(long = "name", required = true)]
        names: Vec<ParamShape>,
        /// Element type of every parameter
        #[arg(long, default_value = "float32")]
        dtype: DType,
        /// Standard deviation used when the parameters are materialized
        #[arg(long, default_value = "0.02")]
        init_std: f64,
    },
}

/// `NAME:D0xD1x...` as given on the command line. An empty dimension list
/// (`NAME:`) is a scalar.
#[derive(Clone, Debug, PartialEq)]
struct ParamShape {
    name: String,
    dims: Vec<usize>,
}

impl FromStr for ParamShape {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (name, dims) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected NAME:D0xD1..., got '{s}'"))?;
        if name.is_empty() {
            return Err(format!("missing parameter name in '{s}'"));
        }
        let dims = if dims.is_empty() {
            Vec::new()
        } else {
            dims.split('x')
                .map(|d| {
                    d.trim()
                        .parse::<usize>()
                        .map_err(|e| format!("bad dimension '{d}' in '{s}': {e}"))
                })
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        Ok(Self {
            name: name.to_string(),
            dims,
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Split { input, output } => cmd_split(&input, &output),
        Commands::Inspect { dir } => cmd_inspect(&dir),
        Commands::Empty {
            output,
            names,
            dtype,
            init_std,
        } => cmd_empty(&output, &names, dtype, init_std),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn cmd_split(input: &Path, output: &Path) -> Result<()> {
    let state_dict = serialization::load_state_dict(input)
        .with_context(|| format!("reading {}", input.display()))?;
    if state_dict.is_empty() {
        bail!("{} holds no tensors", input.display());
    }
    tracing::debug!(tensors = state_dict.len(), "read {}", input.display());

    let mut entries: Vec<(String, SplitEntry)> = state_dict
        .into_iter()
        .map(|(name, tensor)| (name, SplitEntry::Tensor(tensor)))
        .collect();
    // safetensors files carry no order; sort so file indices are reproducible
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let manifest = save_split(&entries, output)?;
    println!("Wrote {} parameters to {}", manifest.len(), output.display());
    Ok(())
}

fn cmd_inspect(dir: &Path) -> Result<()> {
    let manifest = load_manifest(dir)?;
    println!("{} ({} entries)", dir.display(), manifest.len());

    let mut total = 0usize;
    let mut problems = 0usize;
    for (name, file) in manifest.iter() {
        let path = dir.join(file);
        let line = if is_empty_json(file) {
            read_empty_spec(&path).map(|spec| {
                total += spec.nbytes();
                format!(
                    "{:<10} {:<16} empty(std={})",
                    spec.torch_dtype.to_string(),
                    format!("{:?}", spec.shape.dims()),
                    spec.init_std
                )
            })
        } else {
            load_split_tensor(&path).map(|t| {
                total += t.nbytes();
                format!(
                    "{:<10} {:<16} {} bytes",
                    t.dtype().to_string(),
                    format!("{:?}", t.shape().dims()),
                    t.nbytes()
                )
            })
        };
        match line {
            Ok(line) => println!("  {:<40} {}", name, line),
            Err(e) => {
                problems += 1;
                println!("  {:<40} ERROR: {}", name, e);
            }
        }
    }

    println!("Total: {:.2} MB", total as f64 / 1e6);
    if problems > 0 {
        bail!("{} entries could not be read", problems);
    }
    Ok(())
}

fn cmd_empty(output: &Path, names: &[ParamShape], dtype: DType, init_std: f64) -> Result<()> {
    let entries: Vec<(String, SplitEntry)> = names
        .iter()
        .map(|p| {
            let spec = EmptySpec::new(p.dims.as_slice(), dtype, init_std);
            (p.name.clone(), SplitEntry::Empty(spec))
        })
        .collect();
    let manifest = save_split(&entries, output)?;
    println!(
        "Wrote {} empty parameters ({}, std={}) to {}",
        manifest.len(),
        dtype,
        init_std,
        output.display()
    );
    Ok(())
}

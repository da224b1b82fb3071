//! Inspect the linked variant families and dry-run operator resolution
//!
//! Usage:
//!   # List families with their key layouts:
//!   vxplan families
//!   # Run every registration-time check (exits non-zero on failure):
//!   vxplan check
//!   # Resolve an invocation and print the nodes it would attach:
//!   vxplan explain --invocation clip.json --config device.json
//!
//! An invocation file looks like:
//!
//! ```json
//! {
//!   "op": "clip",
//!   "inputs": [{"shape": [18, 9], "dtype": "f32"}],
//!   "outputs": [{"shape": [18, 9], "dtype": "f32"}],
//!   "attrs": {"min_value": -1.0, "max_value": 1.0}
//! }
//! ```

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Deserialize;

use vxplan::{AttributeBag, DryRunGraph, Resolver, ResolverConfig, Result, TensorMeta};

/// Kernel variant resolution, without a device
#[derive(Parser)]
#[command(name = "vxplan")]
struct Cli {
    /// Resolver configuration (JSON); defaults apply when omitted
    #[arg(short, long, global = true, env = "VXPLAN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List variant families, their sizes and key layouts
    Families {
        /// Also list every variant's kernel name and key
        #[arg(short, long)]
        verbose: bool,
    },
    /// Re-run the registry self-check
    Check,
    /// Resolve one invocation on a dry-run graph and print the plan
    Explain {
        /// Invocation description (JSON)
        #[arg(short, long)]
        invocation: PathBuf,
    },
}

/// Operator invocation as read from disk
#[derive(Deserialize)]
struct InvocationFile {
    op: String,
    inputs: Vec<TensorMeta>,
    outputs: Vec<TensorMeta>,
    #[serde(default)]
    attrs: AttributeBag,
}

impl InvocationFile {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn load_config(path: Option<&Path>) -> Result<ResolverConfig> {
    match path {
        Some(path) => ResolverConfig::from_file(path),
        None => Ok(ResolverConfig::default()),
    }
}

fn list_families(resolver: &Resolver, verbose: bool) {
    println!("Operators: {}", resolver.operators().join(", "));
    for family in resolver.registry().families() {
        let fields: Vec<String> = family
            .layout()
            .fields()
            .iter()
            .map(|f| format!("{}@{}:{}", f.name, f.offset, f.width))
            .collect();
        println!(
            "{:<28} {:>4} variants  {}  [{}]",
            family.name(),
            family.variants().len(),
            if family.is_hashed() { "hashed" } else { "linear" },
            fields.join(" ")
        );
        if verbose {
            for v in family.variants() {
                println!("    {:<48} {}", v.kernel_name, v.key);
            }
        }
    }
    println!("Total: {} variants", resolver.registry().variant_count());
}

fn explain(resolver: &Resolver, path: &Path) -> Result<()> {
    let file = InvocationFile::load(path)?;
    let mut graph = DryRunGraph::new();
    let inputs: Vec<_> = file.inputs.into_iter().map(|m| graph.tensor(m)).collect();
    let outputs: Vec<_> = file.outputs.into_iter().map(|m| graph.tensor(m)).collect();

    let plan = resolver.resolve(&mut graph, &file.op, &inputs, &outputs, &file.attrs)?;
    log::info!("{}: strategy `{}`", plan.op, plan.strategy);

    let report = serde_json::json!({
        "op": plan.op,
        "strategy": plan.strategy,
        "nodes": graph.nodes(),
        "transients": plan.transients,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    let resolver = vxplan_ops::resolver(config)?;

    match cli.command {
        Command::Families { verbose } => list_families(&resolver, verbose),
        Command::Check => {
            resolver.registry().self_check()?;
            println!(
                "ok: {} families, {} variants",
                resolver.registry().families().len(),
                resolver.registry().variant_count()
            );
        }
        Command::Explain { invocation } => explain(&resolver, &invocation)?,
    }
    Ok(())
}

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use telc_ir::{IrModule, Target};
use telc_utils::logger;
use tracing::{debug, info};

use crate::compiler::Compiler;
use crate::config::LowerConfig;
use crate::partition::per_target_modules;
use crate::workspace::{FunctionInfo, update_function_metadata};

#[derive(Parser, Debug)]
#[command(name = "telc", version, about = "Tensor-expression lowering driver")]
pub struct TelcCli {
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    verbose: u8,

    #[arg(long, global = true)]
    /// Display phase timing information.
    time: bool,

    #[command(subcommand)]
    command: Command,
}

impl TelcCli {
    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Lowers a JSON module and prints what was produced.
    Lower {
        path: PathBuf,
        #[arg(long)]
        /// Prefix for lowered entry names.
        module_name: Option<String>,
        #[arg(long)]
        /// Target shape functions are lowered for, e.g. `llvm -mcpu=skylake`.
        host: Option<String>,
        #[arg(long)]
        /// Workspace alignment in bytes.
        alignment: Option<u64>,
        #[arg(long)]
        /// Print the lowered module.
        dump: bool,
        #[arg(short, long)]
        /// Write the lowered module as JSON.
        output: Option<PathBuf>,
        #[cfg(feature = "toml-config")]
        #[arg(long)]
        /// Read settings from a TOML file before applying the flags.
        config: Option<PathBuf>,
    },
    /// Lists the registered external codegen backends.
    Backends,
}

pub fn run() -> Result<()> {
    let cli = TelcCli::parse();
    logger::init_logging(logger::level_for_verbosity(cli.verbose));
    match &cli.command {
        Command::Lower { .. } => handle_lower(&cli),
        Command::Backends => {
            handle_backends();
            Ok(())
        }
    }
}

fn handle_lower(cli: &TelcCli) -> Result<()> {
    let Command::Lower {
        path, dump, output, ..
    } = &cli.command
    else {
        return Ok(());
    };
    let config = lower_config(&cli.command)?;
    let mut timings = Vec::new();

    let module = timed(&mut timings, "Load", || read_module(path))?;
    let compiler = Compiler::with_config(config);
    let alignment = compiler.config().workspace_byte_alignment;

    let mut metadata = BTreeMap::new();
    let lowered = timed(&mut timings, "Lower", || {
        compiler.lower_module(
            &module,
            &compiler.config().module_name,
            |annotated| {
                if annotated.annotation.is_some() {
                    update_function_metadata(&annotated, &mut metadata, alignment)?;
                }
                Ok(())
            },
            &compiler.config().host_target,
        )
    })
    .with_context(|| format!("failed to lower {}", path.display()))?;

    let partitions = timed(&mut timings, "Partition", || per_target_modules(&lowered))?;
    info!(targets = partitions.len(), "lowering finished");

    print_partitions(&partitions);
    print_weights(&lowered);
    print_metadata(&metadata);

    if !lowered.attrs.external_mods.is_empty() {
        println!("{}", "== External modules ==".bold());
        for module in &lowered.attrs.external_mods {
            println!("  {} ({}, {} symbols)", module.name, module.format, module.symbols.len());
        }
    }

    if *dump {
        println!("{}", "== Lowered module ==".bold());
        println!("{lowered}");
    }

    if let Some(output) = output {
        write_module(output, &lowered)?;
        println!("{} {}", "wrote".green().bold(), output.display());
    }

    if cli.time {
        print_timings(&timings);
    }
    Ok(())
}

fn handle_backends() {
    let keys = Compiler::with_config(LowerConfig::default()).registry().keys();
    if keys.is_empty() {
        println!("{}", "no external codegen backends registered".yellow());
        return;
    }
    for key in keys {
        println!("  {key}");
    }
}

/// Defaults, then the environment, then a config file when enabled, then
/// the command-line flags.
fn lower_config(command: &Command) -> Result<LowerConfig> {
    let Command::Lower {
        module_name,
        host,
        alignment,
        #[cfg(feature = "toml-config")]
        config,
        ..
    } = command
    else {
        return Ok(LowerConfig::default());
    };

    #[allow(unused_mut)]
    let mut lower_config = LowerConfig::from_env().context("invalid TELC_* environment")?;
    #[cfg(feature = "toml-config")]
    if let Some(path) = config {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        lower_config = lower_config
            .apply_toml_str(&text)
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
    }

    if let Some(name) = module_name {
        lower_config.module_name.clone_from(name);
    }
    if let Some(host) = host {
        lower_config.host_target = host
            .parse::<Target>()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("invalid host target `{host}`"))?;
    }
    if let Some(alignment) = alignment {
        lower_config.workspace_byte_alignment = *alignment;
    }
    lower_config.validate()?;
    debug!(?lower_config, "resolved configuration");
    Ok(lower_config)
}

pub fn read_module(path: &Path) -> Result<IrModule> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn write_module(path: &Path, module: &IrModule) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(module).context("failed to serialize module")?;
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

fn timed<T>(
    timings: &mut Vec<(&'static str, Duration)>,
    phase: &'static str,
    f: impl FnOnce() -> T,
) -> T {
    let start = Instant::now();
    let result = f();
    timings.push((phase, start.elapsed()));
    result
}

fn print_partitions(partitions: &BTreeMap<Target, IrModule>) {
    println!("{}", "== Targets ==".bold());
    for (target, module) in partitions {
        let names: Vec<&str> = module.global_vars().map(|var| var.name()).collect();
        println!("  {} {}", target.to_string().cyan(), names.join(", "));
    }
}

fn print_weights(module: &IrModule) {
    if module.attrs.op_weights.is_empty() {
        return;
    }
    println!("{}", "== Operator weights ==".bold());
    for (name, weight) in &module.attrs.op_weights {
        println!("  {name:<40} {weight}");
    }
}

fn print_metadata(metadata: &BTreeMap<String, FunctionInfo>) {
    if metadata.is_empty() {
        return;
    }
    println!("{}", "== Function memory ==".bold());
    for (name, info) in metadata {
        println!("  {name}: {info}");
    }
}

fn print_timings(timings: &[(&'static str, Duration)]) {
    println!("{}", "[Timing]".bold());
    let mut total = Duration::ZERO;
    for (name, duration) in timings {
        println!("{:>16}: {:>6.2} ms", name, duration.as_secs_f64() * 1000.0);
        total += *duration;
    }
    println!("{:>16}: {:>6.2} ms", "Total", total.as_secs_f64() * 1000.0);
}

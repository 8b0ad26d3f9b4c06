use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(long, short, global = true)]
    /// Log every decision the engine makes, not just the outcome
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the layout of a class file
    Inspect {
        /// The class file to read
        class: PathBuf,
    },

    /// Write an instrumented copy of a class file
    Instrument(InstrumentArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    EntryExit,
    Root,
    Marker,
    Alloc,
    Liveness,
    Region,
    ProfilePoints,
}

#[derive(Args)]
pub struct InstrumentArgs {
    /// The class file to instrument
    pub class: PathBuf,

    #[arg(long, value_enum)]
    /// What to inject
    pub kind: Kind,

    #[arg(long("method"))]
    /// Methods to instrument, as `name` or `name(descriptor)`. Every method with code when absent
    pub methods: Vec<String>,

    #[arg(long, value_parser = parse_pair::<usize>)]
    /// Bytecode range `start:end` for region instrumentation
    pub region: Option<(usize, usize)>,

    #[arg(long, value_parser = parse_pair::<u16>)]
    /// Source line range `first:last` for region instrumentation
    pub lines: Option<(u16, u16)>,

    #[arg(long, value_delimiter = ',')]
    /// Bytecode offsets of profile points, numbered in the order given
    pub points: Vec<usize>,

    #[arg(long)]
    /// Call the sampled CPU runtime
    pub sampled: bool,

    #[arg(long)]
    /// Where to copy classes that contain unexpected bytecode
    pub dump_dir: Option<PathBuf>,

    #[arg(long)]
    /// Also hook servlet request methods
    pub servlets: bool,

    #[arg(long)]
    /// Trace allocations from inside java.lang.Object.<init>
    pub track_object_ctor: bool,

    #[arg(long)]
    /// Only trace allocations of classes with these name prefixes
    pub include: Vec<String>,

    #[arg(long)]
    /// Never trace allocations of classes with these name prefixes
    pub exclude: Vec<String>,

    #[arg(long, short)]
    /// Where to write the instrumented class
    pub output: PathBuf,
}

fn parse_pair<T: std::str::FromStr>(value: &str) -> Result<(T, T)> {
    let (first, second) = value
        .split_once(':')
        .ok_or_else(|| anyhow!("expected `a:b`, got `{}`", value))?;

    let parse = |part: &str| {
        part.trim()
            .parse::<T>()
            .map_err(|_| anyhow!("`{}` is not a valid bound", part))
    };

    Ok((parse(first)?, parse(second)?))
}

/// Splits `name(descriptor)` into its parts.
pub fn parse_method(value: &str) -> (&str, Option<&str>) {
    match value.find('(') {
        Some(index) => (&value[..index], Some(&value[index..])),
        None => (value, None),
    }
}

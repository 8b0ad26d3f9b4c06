use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use args::{Cli, Command, InstrumentArgs, Kind};
use clap::Parser;
use instrument::{
    Injection, InstrumentConfig, InstrumentationFilter, Instrumentor, MemoryMode, MethodRole,
    MethodTarget, ProfilePoint,
};
use parse::classfile::ClassInfo;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt;

use crate::args::parse_method;

mod args;

/// Loader id for classes read from disk.
const LOADER: u32 = 0;

fn inspect(path: &Path) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("could not read {}", path.display()))?;
    let class = ClassInfo::parse(&bytes)?;

    println!(
        "class {} (version {}.{}, {} pool entries)",
        class.name()?,
        class.major_version,
        class.minor_version,
        class.pool_count()
    );

    if let Some(super_name) = class.super_name()? {
        println!("  extends {}", super_name);
    }

    for (index, method) in class.methods.iter().enumerate() {
        let Some(code) = &method.code else {
            println!("  {}{}: no code", method.name, method.descriptor);
            continue;
        };

        println!(
            "  {}{}: {} bytes, max_stack {}, max_locals {}, {} exception entries",
            method.name,
            method.descriptor,
            code.code_length,
            code.max_stack,
            code.max_locals,
            code.exception_table_length
        );

        for entry in class.exception_table(index)? {
            println!(
                "    {}..{} -> {} (catch {})",
                entry.start_pc, entry.end_pc, entry.handler_pc, entry.catch_type
            );
        }
    }

    Ok(())
}

fn config(args: &InstrumentArgs) -> InstrumentConfig {
    let mut filter = InstrumentationFilter::new();
    for prefix in &args.include {
        filter = filter.include(prefix.clone());
    }
    for prefix in &args.exclude {
        filter = filter.exclude(prefix.clone());
    }

    InstrumentConfig {
        dump_dir: args.dump_dir.clone(),
        filter,
        servlet_tracking: args.servlets,
        track_object_ctor: args.track_object_ctor,
        cpu_sampled: args.sampled,
    }
}

/// The methods named on the command line, or every method with code.
fn selected_methods(class: &ClassInfo, names: &[String]) -> Result<Vec<usize>> {
    if names.is_empty() {
        return Ok(class
            .methods
            .iter()
            .enumerate()
            .filter(|(_, m)| m.code.is_some())
            .map(|(i, _)| i)
            .collect());
    }

    let mut selected = Vec::new();
    for name in names {
        let (method, descriptor) = parse_method(name);
        let before = selected.len();

        selected.extend(
            class
                .methods
                .iter()
                .enumerate()
                .filter(|(_, m)| m.name == method && descriptor.map_or(true, |d| m.descriptor == d))
                .map(|(i, _)| i),
        );

        if selected.len() == before {
            return Err(anyhow!("{} has no method {}", class.name()?, name));
        }
    }

    selected.dedup();
    Ok(selected)
}

fn target(class: &ClassInfo, method: usize, args: &InstrumentArgs) -> Result<MethodTarget> {
    let injection = match args.kind {
        Kind::EntryExit => Injection::EntryExit(MethodRole::Normal),
        Kind::Root => Injection::EntryExit(MethodRole::Root),
        Kind::Marker => Injection::EntryExit(MethodRole::Marker),
        Kind::Alloc => Injection::ObjectAllocation(MemoryMode::Allocations),
        Kind::Liveness => Injection::ObjectAllocation(MemoryMode::Liveness),
        Kind::ProfilePoints => Injection::ProfilePoints,
        Kind::Region => {
            let range = match (args.region, args.lines) {
                (Some((start, end)), _) => start..end,
                (None, Some((first, last))) => class.bci_range_for_lines(method, first, last)?,
                (None, None) => return Err(anyhow!("region instrumentation needs --region or --lines")),
            };
            Injection::CodeRegion(range)
        }
    };

    let points = args
        .points
        .iter()
        .enumerate()
        .map(|(id, &bci)| ProfilePoint { id: id as u16, bci })
        .collect();

    Ok(MethodTarget::new(method, injection).with_profile_points(points))
}

fn instrument(args: InstrumentArgs) -> Result<()> {
    let bytes = fs::read(&args.class)
        .with_context(|| format!("could not read {}", args.class.display()))?;

    let mut session = Instrumentor::new(config(&args));
    let class = session.load_class(&bytes, LOADER)?;
    let name = class.name()?.to_string();
    let info = class.info().clone();

    let targets = selected_methods(&info, &args.methods)?
        .into_iter()
        .map(|method| target(&info, method, &args))
        .collect::<Result<Vec<_>>>()?;

    if let Some(hooked) = session.instrument_runtime_hooks(&name, LOADER)? {
        info!("{}: hooked {} runtime methods", name, hooked.instrumented.len());
    }

    let result = session.instrument_class(&name, LOADER, &targets)?;

    for (method, error) in &result.skipped {
        warn!("{}: method {} left as is: {}", name, method, error);
    }

    fs::write(&args.output, &result.bytes)
        .with_context(|| format!("could not write {}", args.output.display()))?;

    info!(
        "{}: instrumented {} of {} methods, written to {}",
        name,
        result.instrumented.len(),
        targets.len(),
        args.output.display()
    );

    for (method, id) in &result.method_ids {
        println!("{} {}{} id {}", name, info.methods[*method].name, info.methods[*method].descriptor, id);
    }

    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let format = fmt::format()
        .with_ansi(true)
        .without_time()
        .with_level(true)
        .with_target(false)
        .with_thread_names(false)
        .with_source_location(true)
        .compact();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Inspect { class } => inspect(&class),
        Command::Instrument(instrument_args) => instrument(instrument_args),
    }
}

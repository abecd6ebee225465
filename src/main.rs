mod boxdir;
mod config;
mod intercept;
mod quota;
mod reactor;
mod supervisor;
mod utils;
mod verdict;

use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use log::error;

use crate::boxdir::BoxDir;
use crate::config::GlobalConfig;
use crate::quota::{MemoryBoundary, Quotas};
use crate::supervisor::Supervisor;
use crate::utils::{Memory, Time};

/// Process isolator: runs untrusted programs under resource quotas.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct CliArgs {
    /// Path to the global config file.
    #[clap(short, long, value_parser)]
    config: Option<String>,
    /// Box to operate on.
    #[clap(long, value_parser, default_value_t = 0)]
    box_id: u32,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the box directory and print its path.
    Init,
    /// Run a program inside the box under quotas.
    Run(RunArgs),
    /// Remove the box directory.
    Cleanup,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Cpu time limit, in seconds.
    #[clap(long, value_parser)]
    time: Option<f64>,
    /// Wall clock limit, in seconds.
    #[clap(long, value_parser)]
    wall_time: Option<f64>,
    /// Memory limit for the whole tree, in KiB.
    #[clap(long, value_parser)]
    mem: Option<u64>,
    /// Size limit for any written file, in KiB.
    #[clap(long, value_parser)]
    fsize: Option<u64>,
    /// Max simultaneously live processes, root included.
    #[clap(long, value_parser)]
    processes: Option<u64>,
    /// Treat memory usage landing exactly on the limit as a violation.
    #[clap(long)]
    strict_memory_boundary: bool,
    /// Write a "key: value" report of the run to this file.
    #[clap(long, value_parser)]
    meta: Option<PathBuf>,
    /// Print the verdict as JSON on stdout after the run.
    #[clap(long)]
    json: bool,
    /// KEY=VALUE environment for the program; KEY alone inherits our value.
    #[clap(long = "env", value_parser)]
    env: Vec<String>,
    /// Redirect stdin from this file (relative to the box).
    #[clap(long, value_parser)]
    stdin: Option<PathBuf>,
    /// Redirect stdout to this file (relative to the box).
    #[clap(long, value_parser)]
    stdout: Option<PathBuf>,
    /// Redirect stderr to this file (relative to the box).
    #[clap(long, value_parser)]
    stderr: Option<PathBuf>,
    /// Program and arguments.
    #[clap(last = true, required = true, value_parser)]
    command: Vec<String>,
}

#[cfg(target_os = "linux")]
fn main() {
    let args = CliArgs::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let code = match dispatch(args) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            2
        }
    };
    exit(code);
}

fn dispatch(args: CliArgs) -> anyhow::Result<i32> {
    let config = match &args.config {
        Some(path) => GlobalConfig::read_from(path)?
            .with_context(|| format!("config file {path} not found"))?,
        None => GlobalConfig::read()?,
    };

    match args.command {
        Command::Init => {
            let boxdir = BoxDir::create(&config.box_root, args.box_id)
                .with_context(|| format!("failed to create box {}", args.box_id))?;
            println!("{}", boxdir.root().display());
            Ok(0)
        }
        Command::Cleanup => {
            BoxDir::open(&config.box_root, args.box_id)?
                .remove()
                .with_context(|| format!("failed to remove box {}", args.box_id))?;
            Ok(0)
        }
        Command::Run(run) => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?
            .block_on(run_box(config, args.box_id, run)),
    }
}

async fn run_box(config: GlobalConfig, box_id: u32, args: RunArgs) -> anyhow::Result<i32> {
    let boxdir = BoxDir::open(&config.box_root, box_id)?;
    let work_dir = boxdir.work_dir();

    let quotas = Quotas {
        fsize: args.fsize.map(Memory::from_kilobytes),
        memory: args.mem.map(Memory::from_kilobytes),
        processes: args.processes,
        cpu_time: args.time.map(Time::from_seconds_f64),
        wall_time: args.wall_time.map(Time::from_seconds_f64),
        memory_boundary: if args.strict_memory_boundary {
            MemoryBoundary::Exclusive
        } else {
            MemoryBoundary::Inclusive
        },
    };

    let (program, params) = args
        .command
        .split_first()
        .context("no program to run")?;
    let env = args
        .env
        .iter()
        .map(|kv| match kv.split_once('=') {
            Some((key, value)) => (key.to_owned(), value.to_owned()),
            None => (kv.clone(), std::env::var(kv).unwrap_or_default()),
        })
        .collect();

    let mut supervisor = Supervisor::new(program.clone(), quotas)
        .args(params.to_vec())
        .env(env)
        .work_dir(&work_dir)
        .cgroup_root(config.cgroup_root.clone())
        .sample_interval(Duration::from_millis(config.sample_interval_ms));
    if let Some(path) = &args.stdin {
        supervisor = supervisor.stdin(work_dir.join(path));
    }
    if let Some(path) = &args.stdout {
        supervisor = supervisor.stdout(work_dir.join(path));
    }
    if let Some(path) = &args.stderr {
        supervisor = supervisor.stderr(work_dir.join(path));
    }

    let verdict = supervisor.run().await;

    if let Some(path) = &args.meta {
        verdict
            .write_meta(path)
            .with_context(|| format!("failed to write meta file {path:?}"))?;
    }
    if args.json {
        println!("{}", serde_json::to_string(&verdict)?);
    }
    Ok(if verdict.is_ok() { 0 } else { 1 })
}

#[cfg(not(target_os = "linux"))]
compile_error!("Only Linux is supported. To run on other platforms, please port the program.");

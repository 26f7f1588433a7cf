use anyhow::Result;
use clap::{CommandFactory, Parser};
use std::{path::PathBuf, process::ExitCode, sync::Arc};
use tracing_subscriber::{EnvFilter, fmt};

mod catalog;
mod commands;
mod config;
mod host;
mod inventory;
mod provisioning;
mod tooling;
mod ui;
mod utils;

use commands::{Cmd, rc};
use config::Config;
use utils::process::{ProcessRunner, Runner};

pub struct AppCtx {
    pub debug: bool,
    pub cfg: Arc<Config>,
    pub runner: Arc<dyn Runner + Send + Sync>,
}

#[derive(Parser, Debug)]
#[command(
    name = "provisioner",
    about = "Flashes and configures Kiwix Hotspot disks from a Raspberry Pi",
    arg_required_else_help = false,
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    #[arg(long, global = true)]
    debug: bool,

    #[arg(long, global = true)]
    check_config: bool,

    #[arg(long, global = true)]
    print_config: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

fn init_tracing(debug: bool) {
    let default = if debug { "trace" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(debug)
        .with_line_number(debug)
        .without_time()
        .try_init();
}

fn run(cli: Cli) -> Result<i32> {
    if cli.command.is_none() && !cli.check_config && !cli.print_config {
        let mut cmd = Cli::command();
        cmd.print_help()?;
        println!();
        return Ok(rc::OK);
    }
    let mut cfg = Config::load(&cli.config)?;
    cfg.debug |= cli.debug;

    if cli.check_config {
        tracing::info!("config OK");
        return Ok(rc::OK);
    }
    if cli.print_config {
        println!("{}", cfg.to_toml()?);
        return Ok(rc::OK);
    }

    let Some(cmd) = cli.command else {
        let mut cmd = Cli::command();
        cmd.print_help()?;
        println!();
        return Ok(rc::OK);
    };

    let ctx = AppCtx {
        debug: cfg.debug,
        runner: Arc::new(ProcessRunner::new(cfg.debug)),
        cfg: Arc::new(cfg),
    };
    cmd.run(&ctx)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(cli) {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX)),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(rc::FAILURE as u8)
        }
    }
}

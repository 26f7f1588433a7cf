use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use clap::Subcommand;

use crate::{AppCtx, host::Host, tooling::Toolbox};

pub mod images;
pub mod provision;
pub mod status;
pub mod supervise;

/// Process exit codes, shared with the supervisor loop.
pub mod rc {
    pub const OK: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const DECLINED: i32 = 2;
    pub const NOT_FOUND: i32 = 3;
    pub const DOES_NOT_FIT: i32 = 5;
    pub const NOT_READY: i32 = 6;
    pub const ADVANCED: i32 = 10;
    pub const REBOOT: i32 = 11;
    pub const CANCELED: i32 = 12;
    pub const HALT: i32 = 13;
    pub const UI: i32 = 14;
    pub const SIGNALED: i32 = 130;
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Show host, network, clock, disks and readiness.
    Status(status::StatusArgs),
    /// List the images found on removable media.
    Images(images::ImagesArgs),
    /// Flash and configure a target disk.
    Provision(provision::ProvisionArgs),
    /// Run a UI command in a loop, acting on its exit codes.
    Supervise(supervise::SuperviseArgs),
}

impl Cmd {
    pub fn run(&self, ctx: &AppCtx) -> Result<i32> {
        match self {
            Cmd::Status(args) => args.run(ctx),
            Cmd::Images(args) => args.run(ctx),
            Cmd::Provision(args) => args.run(ctx),
            Cmd::Supervise(args) => args.run(ctx),
        }
    }
}

/// Snapshot of the host through the real tools.
pub fn gather(ctx: &AppCtx) -> Result<(Toolbox, Host)> {
    let tools = Toolbox::new(&ctx.cfg, ctx.runner.clone());
    let host = Host::query(&tools, &ctx.cfg).context("gather host information")?;
    Ok((tools, host))
}

/// `question [y/N]`, anything but y/yes declines.
pub fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    io::stdout().flush().context("flush stdout")?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("read answer")?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

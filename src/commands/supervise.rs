use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Args;
use tracing as log;

use super::rc;
use crate::{
    AppCtx,
    utils::{
        bins::which,
        process::{CmdSpec, Runner},
    },
};

#[derive(Args, Debug)]
pub struct SuperviseArgs {
    /// Simple UI program (default: `provisioner-ui` next to this binary).
    #[arg(long)]
    pub ui: Option<PathBuf>,

    /// Advanced UI program (default: `provisioner-advanced` next to this binary).
    #[arg(long)]
    pub advanced: Option<PathBuf>,
}

/// What each exit code leads to.
#[derive(Debug, Clone)]
pub struct Programs {
    pub ui: String,
    pub advanced: String,
    pub systemctl: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Run(Vec<String>),
    Exit(i32),
}

impl Programs {
    fn ui(&self) -> Next {
        Next::Run(vec![self.ui.clone()])
    }

    fn power(&self, action: &str) -> Next {
        Next::Run(vec![self.systemctl.clone(), action.to_string()])
    }

    /// Follow-up to a child exiting with `code`.
    pub fn dispatch(&self, code: i32) -> Next {
        match code {
            rc::OK => Next::Exit(rc::OK),
            rc::ADVANCED => Next::Run(vec![self.advanced.clone()]),
            rc::REBOOT => self.power("reboot"),
            rc::HALT => self.power("halt"),
            rc::UI | rc::CANCELED => self.ui(),
            code if code >= 128 => Next::Exit(code),
            code => {
                log::warn!("[supervise] unexpected exit code {code}, back to UI");
                self.ui()
            }
        }
    }
}

impl SuperviseArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<i32> {
        let bin_dir = std::env::current_exe()
            .context("locate own binary")?
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let ui = self.ui.clone().unwrap_or_else(|| bin_dir.join("provisioner-ui"));
        if !ui.exists() {
            bail!("cannot find {}", ui.display());
        }
        let advanced = self
            .advanced
            .clone()
            .unwrap_or_else(|| bin_dir.join("provisioner-advanced"));
        let systemctl = which("systemctl")
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "systemctl".into());

        let programs = Programs {
            ui: ui.display().to_string(),
            advanced: advanced.display().to_string(),
            systemctl,
        };
        supervise(ctx.runner.as_ref(), &programs)
    }
}

/// Runs the UI, then whatever its exit code asks for, until told to stop.
pub fn supervise(runner: &dyn Runner, programs: &Programs) -> Result<i32> {
    let mut argv = vec![programs.ui.clone()];
    loop {
        let Some((program, args)) = argv.split_first() else {
            bail!("empty command");
        };
        let spec = CmdSpec::new(program.clone()).args(args.iter().cloned()).interactive();
        let code = match runner.run_output(&spec) {
            Ok(out) => out.code,
            Err(e) => {
                if argv[0] == programs.ui {
                    return Err(e).context("run UI");
                }
                log::error!("[supervise] {e:#}");
                argv = vec![programs.ui.clone()];
                continue;
            }
        };
        match programs.dispatch(code) {
            Next::Run(next) => argv = next,
            Next::Exit(code) => {
                if code >= 128 {
                    log::warn!("[supervise] exit via signal ({code})");
                }
                return Ok(code);
            }
        }
    }
}

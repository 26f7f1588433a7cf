use std::{path::Path, sync::Arc};

use anyhow::Result;

use crate::utils::process::{CmdOutput, CmdSpec, Runner, StdioSpec, sh_quote};

pub const REQ_BINS: &[&str] = &["chroot"];

type DynRunner = dyn Runner + Send + Sync;

pub trait ChrootPort: Send + Sync {
    /// Runs `program args…` with `root` as filesystem root.
    fn exec(&self, root: &Path, program: &str, args: &[&str]) -> Result<CmdOutput>;

    /// Runs a script inside `root` through bash, discarding its output.
    fn exec_quiet(&self, root: &Path, script: &str) -> Result<CmdOutput> {
        let line = format!("{} >/dev/null 2>/dev/null", sh_quote(script));
        self.exec(root, "/bin/bash", &["-c", &line])
    }
}

pub struct ChrootCli {
    runner: Arc<DynRunner>,
    verbose: bool,
}

impl ChrootCli {
    pub fn new(runner: Arc<DynRunner>, verbose: bool) -> Self {
        Self { runner, verbose }
    }
}

impl ChrootPort for ChrootCli {
    fn exec(&self, root: &Path, program: &str, args: &[&str]) -> Result<CmdOutput> {
        let out = if self.verbose {
            StdioSpec::Inherit
        } else {
            StdioSpec::Pipe
        };
        let cmd = CmdSpec::new("chroot")
            .arg(root.display().to_string())
            .arg(program)
            .args(args.iter().copied())
            .stdout(out)
            .stderr(out);
        self.runner.run_output(&cmd)
    }
}

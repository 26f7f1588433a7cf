use std::sync::Arc;

use anyhow::{Context, Result};

use crate::utils::process::{CmdSpec, Runner, StdioSpec};

pub const REQ_BINS: &[&str] = &["lsblk"];

/// Columns the inventory model is built from.
pub const COLUMNS: &str =
    "NAME,MAJ:MIN,RM,SIZE,RO,TYPE,MOUNTPOINTS,FSTYPE,LABEL,PARTUUID,PARTLABEL,PATH,PHY-SEC,TRAN,VENDOR,MODEL,STATE";

type DynRunner = dyn Runner + Send + Sync;

pub trait LsblkPort: Send + Sync {
    /// Raw JSON listing (`{"blockdevices": [...]}`), sizes in bytes.
    fn list_json(&self) -> Result<String>;
}

pub struct LsblkCli {
    runner: Arc<DynRunner>,
}

impl LsblkCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self { runner }
    }
}

impl LsblkPort for LsblkCli {
    fn list_json(&self) -> Result<String> {
        let cmd = CmdSpec::new("lsblk")
            .args(["--json", "--bytes", "--output", COLUMNS])
            .stderr(StdioSpec::Pipe);
        self.runner.run_capture(&cmd).context("lsblk listing")
    }
}

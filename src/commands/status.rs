use anyhow::Result;
use clap::Args;

use super::{gather, rc};
use crate::{AppCtx, tooling::{ToolScope, Toolbox}, ui};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Exit with a non-zero code when not ready for auto-provisioning.
    #[arg(long)]
    pub check: bool,
}

impl StatusArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<i32> {
        Toolbox::ensure_bins(ToolScope::Provision)?;
        let (_, host) = gather(ctx)?;

        ui::host_table(&host).printstd();
        ui::disks_table(&host).printstd();
        let readiness = host.provision_ready();
        println!("{}", ui::readiness_line(&readiness));

        if self.check && !readiness.is_ready() {
            return Ok(rc::NOT_READY);
        }
        Ok(rc::OK)
    }
}

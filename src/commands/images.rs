use anyhow::Result;
use clap::Args;
use tracing as log;

use super::rc;
use crate::{
    AppCtx,
    host::scan_images,
    inventory::Inventory,
    tooling::{ToolScope, Toolbox},
    ui,
};

#[derive(Args, Debug)]
pub struct ImagesArgs {
    /// Only scan this device (e.g. `sda1`).
    #[arg(long)]
    pub device: Option<String>,
}

impl ImagesArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<i32> {
        Toolbox::ensure_bins(ToolScope::Inspect)?;
        let tools = Toolbox::new(&ctx.cfg, ctx.runner.clone());
        let mut inventory = Inventory::query(tools.lsblk().as_ref())?;
        if let Some(name) = &self.device {
            keep_device(&mut inventory, name);
            if inventory.device_by_name(name).is_none() {
                log::error!("device {name} not found");
                return Ok(rc::NOT_FOUND);
            }
        }

        let images = scan_images(&tools, &ctx.cfg, &inventory);

        if images.is_empty() {
            log::info!("<no images>");
        } else {
            ui::images_table(&images).printstd();
        }
        Ok(rc::OK)
    }
}

/// Drops every disk that neither is nor holds `name`.
fn keep_device(inventory: &mut Inventory, name: &str) {
    inventory
        .disks
        .retain(|d| d.name == name || d.partitions.iter().any(|p| p.name == name));
    for disk in &mut inventory.disks {
        if disk.name != name {
            disk.partitions.retain(|p| p.name == name);
        }
    }
}

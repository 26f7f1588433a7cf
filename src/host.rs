//! Live facts about the machine being used to provision, and the rules
//! choosing what to flash where.

use std::{cmp::Reverse, fs, path::Path};

use anyhow::{Context, Result};
use tracing as log;

use crate::{
    catalog::{ImageFileInfo, Prober, Scanner, probe},
    config::Config,
    inventory::{Disk, Inventory},
    tooling::{Toolbox, clock::ClockInfo, eeprom::BootOrder, network::NetworkFacts},
};

/// Transports in order of preference for the target disk.
const TRANSPORT_PRIORITY: &[&[&str]] = &[&["NVME"], &["USB"], &["SD", "MMC"]];

pub struct Host {
    pub model: String,
    pub serial_number: String,
    /// `None` when the EEPROM config could not be read.
    pub boot_order: Option<BootOrder>,
    pub inventory: Inventory,
    pub images: Vec<ImageFileInfo>,
    pub media_fstype: String,
    pub network: NetworkFacts,
    pub clock: ClockInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Ready => "",
            Self::NotReady(r) => r,
        }
    }
}

impl Host {
    pub fn query(tools: &Toolbox, cfg: &Config) -> Result<Self> {
        let dt = cfg.devicetree_dir();
        let model = read_devicetree(&dt, "model");
        let serial_number = read_devicetree(&dt, "serial-number");
        let boot_order = match tools
            .eeprom()
            .read_config()
            .and_then(|text| BootOrder::from_config(&text))
        {
            Ok(bo) => Some(bo),
            Err(e) => {
                log::debug!("[host] failed to read boot order: {e:#}");
                None
            }
        };

        let inventory = Inventory::query(tools.lsblk().as_ref()).context("query block devices")?;
        let images = scan_images(tools, cfg, &inventory);

        let clock = tools.clock().query().unwrap_or_else(|e| {
            log::warn!("[host] cannot query clock: {e:#}");
            ClockInfo {
                retcode: -1,
                ..Default::default()
            }
        });
        let network = NetworkFacts::query(tools.network().as_ref(), &cfg.network);

        Ok(Self {
            model,
            serial_number,
            boot_order,
            inventory,
            images,
            media_fstype: cfg.images.media_fstype.clone(),
            network,
            clock,
        })
    }

    /// Disk holding the running system's `/`.
    pub fn provisionos_disk(&self) -> Option<&Disk> {
        self.inventory.disks.iter().find(|d| d.hosts_root())
    }

    pub fn source_disks(&self) -> Vec<&Disk> {
        let root = self.provisionos_disk().map(|d| d.name.as_str());
        self.inventory
            .disks
            .iter()
            .filter(|d| Some(d.name.as_str()) != root)
            .collect()
    }

    /// Source disks carrying image media.
    pub fn media_disks(&self) -> Vec<&Disk> {
        self.source_disks()
            .into_iter()
            .filter(|d| {
                d.has_fstype(&self.media_fstype)
                    || d.partitions.iter().any(|p| p.has_fstype(&self.media_fstype))
            })
            .collect()
    }

    /// Unmounted disks other than the system's, preferred first.
    pub fn target_disks(&self) -> Vec<&Disk> {
        let mut targets: Vec<&Disk> = self
            .source_disks()
            .into_iter()
            .filter(|d| !d.is_mounted())
            .collect();
        targets.sort_by_key(|d| (transport_rank(&d.transport()), Reverse(d.size)));
        targets
    }

    pub fn nvme_target_disks(&self) -> Vec<&Disk> {
        self.target_disks()
            .into_iter()
            .filter(|d| d.transport() == "NVME")
            .collect()
    }

    pub fn target_disk(&self) -> Option<&Disk> {
        self.target_disks().into_iter().next()
    }

    /// First failing condition for an unattended run, in check order.
    pub fn provision_ready(&self) -> Readiness {
        let nvme = self.nvme_target_disks();
        if nvme.is_empty() {
            return Readiness::NotReady("No target disk present".into());
        }
        if nvme.len() > 1 {
            let names: Vec<String> = nvme.iter().map(|d| d.to_string()).collect();
            return Readiness::NotReady(format!(
                "Multiple target disks present:\n{}",
                names.join(",")
            ));
        }
        if self.images.is_empty() {
            if self.media_disks().is_empty() {
                return Readiness::NotReady("No source image disk present".into());
            }
            return Readiness::NotReady("No image found".into());
        }
        if !self.network.internet.https {
            return Readiness::NotReady("No Internet connection".into());
        }
        if self.network.is_not_connected() {
            return Readiness::NotReady("Not connected to network".into());
        }
        if self.network.is_multi_connected() {
            return Readiness::NotReady("Is connected to multiple networks".into());
        }
        if !self.clock.ntp_synced {
            return Readiness::NotReady("Clock not synced (requires Internet)".into());
        }
        Readiness::Ready
    }
}

fn transport_rank(transport: &str) -> usize {
    TRANSPORT_PRIORITY
        .iter()
        .position(|names| names.contains(&transport))
        .unwrap_or(TRANSPORT_PRIORITY.len())
}

/// Images on every media device, most useful first.
pub fn scan_images(tools: &Toolbox, cfg: &Config, inventory: &Inventory) -> Vec<ImageFileInfo> {
    let kernel = match fs::read_to_string(cfg.filesystems_file()) {
        Ok(text) => probe::kernel_filesystems(&text),
        Err(e) => {
            log::warn!("[host] cannot read supported filesystems: {e}");
            Vec::new()
        }
    };
    let prober = Prober::new(
        tools.mount(),
        tools.loops(),
        tools.disk(),
        probe::supported_root_fs(&kernel),
    );
    Scanner::new(tools.mount(), prober, cfg.images.clone()).scan(inventory)
}

/// Devicetree strings end with a NUL.
fn read_devicetree(dir: &Path, name: &str) -> String {
    match fs::read_to_string(dir.join(name)) {
        Ok(text) => text.trim().trim_end_matches('\0').to_string(),
        Err(e) => {
            log::debug!("[host] cannot read devicetree {name}: {e}");
            "Unknown".to_string()
        }
    }
}

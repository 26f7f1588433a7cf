use std::{collections::BTreeSet, sync::Arc};

use anyhow::Result;

use crate::{
    config::Config,
    utils::{bins::ensure_bins, process::Runner},
};

pub mod chroot;
pub mod clock;
pub mod disk;
pub mod eeprom;
pub mod imager;
pub mod loopdev;
pub mod lsblk;
pub mod mount;
pub mod network;

pub use chroot::{ChrootCli, ChrootPort};
pub use clock::{ClockCli, ClockPort};
pub use disk::{DiskCli, DiskPort};
pub use eeprom::{EepromCli, EepromPort};
pub use imager::{ImagerPort, RpiImagerCli};
pub use loopdev::{LoopCli, LoopPort};
pub use lsblk::{LsblkCli, LsblkPort};
pub use mount::{MountCli, MountPort};
pub use network::{NetworkCli, NetworkPort};

/// Which external tools a command needs before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolScope {
    /// Inventory and image scan only.
    Inspect,
    /// Everything the provisioning steps shell out to, except the flasher
    /// itself (its absence is reported by the imager step).
    Provision,
}

#[derive(Clone)]
pub struct Toolbox {
    lsblk: Arc<dyn LsblkPort>,
    mount: Arc<dyn MountPort>,
    loops: Arc<dyn LoopPort>,
    disk: Arc<dyn DiskPort>,
    eeprom: Arc<dyn EepromPort>,
    clock: Arc<dyn ClockPort>,
    network: Arc<dyn NetworkPort>,
    chroot: Arc<dyn ChrootPort>,
    imager: Arc<dyn ImagerPort>,
}

impl Toolbox {
    pub fn new(cfg: &Config, runner: Arc<dyn Runner + Send + Sync>) -> Self {
        Self {
            lsblk: Arc::new(LsblkCli::new(runner.clone())),
            mount: Arc::new(MountCli::new(runner.clone(), cfg.timing.clone())),
            loops: Arc::new(LoopCli::new(runner.clone())),
            disk: Arc::new(DiskCli::new(runner.clone())),
            eeprom: Arc::new(EepromCli::new(runner.clone())),
            clock: Arc::new(ClockCli::new(runner.clone())),
            network: Arc::new(NetworkCli::new(runner.clone(), &cfg.network)),
            chroot: Arc::new(ChrootCli::new(runner, cfg.debug)),
            imager: Arc::new(RpiImagerCli::new(&cfg.imager)),
        }
    }

    pub fn ensure_bins(scope: ToolScope) -> Result<()> {
        let mut all: BTreeSet<&'static str> = BTreeSet::new();
        all.extend(lsblk::REQ_BINS);
        all.extend(mount::REQ_BINS);
        all.extend(loopdev::REQ_BINS);
        all.extend(disk::REQ_BINS);

        if scope == ToolScope::Provision {
            all.extend(eeprom::REQ_BINS);
            all.extend(clock::REQ_BINS);
            all.extend(network::REQ_BINS);
            all.extend(chroot::REQ_BINS);
        }

        ensure_bins(all)
    }

    #[inline]
    pub fn lsblk(&self) -> Arc<dyn LsblkPort> {
        self.lsblk.clone()
    }
    #[inline]
    pub fn mount(&self) -> Arc<dyn MountPort> {
        self.mount.clone()
    }
    #[inline]
    pub fn loops(&self) -> Arc<dyn LoopPort> {
        self.loops.clone()
    }
    #[inline]
    pub fn disk(&self) -> Arc<dyn DiskPort> {
        self.disk.clone()
    }
    #[inline]
    pub fn eeprom(&self) -> Arc<dyn EepromPort> {
        self.eeprom.clone()
    }
    #[inline]
    pub fn clock(&self) -> Arc<dyn ClockPort> {
        self.clock.clone()
    }
    #[inline]
    pub fn network(&self) -> Arc<dyn NetworkPort> {
        self.network.clone()
    }
    #[inline]
    pub fn chroot(&self) -> Arc<dyn ChrootPort> {
        self.chroot.clone()
    }
    #[inline]
    pub fn imager(&self) -> Arc<dyn ImagerPort> {
        self.imager.clone()
    }
}

#[cfg(test)]
pub mod mock;

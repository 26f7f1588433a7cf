use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing as log;

use crate::utils::process::{CmdSpec, Runner, StdioSpec};

pub const REQ_BINS: &[&str] = &["losetup", "mknod"];

type DynRunner = dyn Runner + Send + Sync;

pub trait LoopPort: Send + Sync {
    /// Attaches `image` with partition scanning and returns the loop disk
    /// (`/dev/loopN`); partitions are reachable as `/dev/loopNpK`.
    fn attach(&self, image: &Path) -> Result<PathBuf>;
    fn detach(&self, loop_dev: &Path) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct LosetupList {
    #[serde(default)]
    loopdevices: Vec<LosetupEntry>,
}

#[derive(Debug, Deserialize)]
struct LosetupEntry {
    name: String,
}

pub struct LoopCli {
    runner: Arc<DynRunner>,
    sys_block: PathBuf,
}

impl LoopCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self {
            runner,
            sys_block: PathBuf::from("/sys/block"),
        }
    }

    fn free_device(&self) -> Result<PathBuf> {
        let out = self
            .runner
            .run_capture(&CmdSpec::new("losetup").arg("-f"))
            .context("find free loop device")?;
        let dev = out.trim();
        if dev.is_empty() {
            bail!("no free loop device");
        }
        Ok(PathBuf::from(dev))
    }

    fn is_attached(&self, dev: &Path) -> Result<bool> {
        let out = self
            .runner
            .run_capture(&CmdSpec::new("losetup").arg("--json"))
            .context("list loop devices")?;
        // losetup prints nothing at all when no device is attached
        if out.trim().is_empty() {
            return Ok(false);
        }
        let list: LosetupList = serde_json::from_str(&out).context("parse losetup --json")?;
        let name = dev.display().to_string();
        Ok(list.loopdevices.iter().any(|d| d.name == name))
    }

    /// Inside containers udev does not create partition nodes; recreate them
    /// from the kernel's view in sysfs.
    fn ensure_partition_nodes(&self, dev: &Path) -> Result<()> {
        let first = partition_node(dev, 1);
        if first.exists() {
            log::debug!("[loop] found {}", first.display());
            return Ok(());
        }
        let name = dev
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("bad loop device path {}", dev.display()))?;
        let block_dir = self.sys_block.join(&name);
        if !block_dir.is_dir() {
            bail!("{} does not exist", block_dir.display());
        }
        for entry in fs::read_dir(&block_dir)
            .with_context(|| format!("read {}", block_dir.display()))?
        {
            let entry = entry?;
            let part_name = entry.file_name().to_string_lossy().into_owned();
            if !part_name.starts_with(&format!("{name}p")) {
                continue;
            }
            let numbers = fs::read_to_string(entry.path().join("dev"))
                .with_context(|| format!("read {}/dev", entry.path().display()))?;
            let (major, minor) = numbers
                .trim()
                .split_once(':')
                .ok_or_else(|| anyhow!("bad dev numbers {numbers:?}"))?;
            let node = dev.with_file_name(&part_name);
            log::debug!("[loop] mknod {} b {major} {minor}", node.display());
            self.runner
                .run(
                    &CmdSpec::new("mknod")
                        .arg(node.display().to_string())
                        .args(["b", major, minor]),
                )
                .with_context(|| format!("mknod {}", node.display()))?;
        }
        Ok(())
    }
}

pub fn partition_node(loop_dev: &Path, num: u32) -> PathBuf {
    let name = loop_dev
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    loop_dev.with_file_name(format!("{name}p{num}"))
}

impl LoopPort for LoopCli {
    fn attach(&self, image: &Path) -> Result<PathBuf> {
        let dev = self.free_device()?;
        if self.is_attached(&dev)? {
            bail!("loop device {} is not free", dev.display());
        }
        log::debug!("[loop] attaching {} to {}", image.display(), dev.display());
        self.runner
            .run(
                &CmdSpec::new("losetup")
                    .arg("--partscan")
                    .arg(dev.display().to_string())
                    .arg(image.display().to_string())
                    .stdout(StdioSpec::Null),
            )
            .with_context(|| format!("attach {}", image.display()))?;

        if let Err(e) = self.ensure_partition_nodes(&dev) {
            let _ = self.detach(&dev);
            return Err(e);
        }
        Ok(dev)
    }

    fn detach(&self, loop_dev: &Path) -> Result<()> {
        let res = self
            .runner
            .run(
                &CmdSpec::new("losetup")
                    .arg("--detach")
                    .arg(loop_dev.display().to_string()),
            )
            .with_context(|| format!("detach {}", loop_dev.display()));

        // nodes created by mknod outlive the device
        if partition_node(loop_dev, 1).exists() {
            let name = loop_dev
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let entries = loop_dev
                .parent()
                .and_then(|dir| fs::read_dir(dir).ok())
                .into_iter()
                .flatten()
                .flatten();
            for entry in entries {
                if entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(&format!("{name}p"))
                {
                    log::debug!("[loop] unlinking {}", entry.path().display());
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
        res
    }
}

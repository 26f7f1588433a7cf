//! What an image file holds: partition layout and embedded OS identity.

use std::{
    collections::HashMap,
    fs,
    os::unix::fs::MetadataExt,
    path::Path,
    sync::Arc,
};

use anyhow::Result;
use regex::Regex;
use serde::Deserialize;
use time::{OffsetDateTime, macros::format_description};
use tracing as log;

use crate::tooling::{DiskPort, LoopPort, MountPort, loopdev::partition_node};

/// Root filesystems an image may carry, in preference order.
pub const ROOT_FILESYSTEMS: &[&str] = &["ext2", "ext3", "ext4", "jfs", "btrfs", "xfs", "reiserfs"];

/// Identity of the system found on an image's root partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemDetails {
    pub is_linux: bool,
    pub release: Option<String>,
    pub version: Option<String>,
    pub variant: Option<String>,
    pub human: Option<String>,
    pub is_hotspot: bool,
    pub is_raspi: bool,
}

impl SystemDetails {
    pub fn non_linux(is_raspi: bool) -> Self {
        Self {
            is_linux: false,
            release: Some("Unknown".into()),
            version: None,
            variant: None,
            human: None,
            is_hotspot: false,
            is_raspi,
        }
    }

    fn linux(release: String, is_raspi: bool) -> Self {
        Self {
            is_linux: true,
            release: Some(release),
            version: None,
            variant: None,
            human: None,
            is_hotspot: false,
            is_raspi,
        }
    }
}

/// Result of looking inside an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// No root partition to look into.
    NotAttempted,
    /// An identity marker matched.
    Identified(SystemDetails),
    /// Root partition readable but nothing recognisable on it.
    Unknown(SystemDetails),
    /// Attaching, mounting or reading failed.
    Failed(String),
}

impl ProbeOutcome {
    pub fn details(&self) -> Option<&SystemDetails> {
        match self {
            Self::Identified(d) | Self::Unknown(d) => Some(d),
            Self::NotAttempted | Self::Failed(_) => None,
        }
    }
}

/// Partition-table facts plus identity for one image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub has_mbr: bool,
    pub has_gpt: bool,
    pub has_root: bool,
    pub outcome: ProbeOutcome,
}

/// Filesystem names the running kernel knows, from `/proc/filesystems`.
pub fn kernel_filesystems(text: &str) -> Vec<String> {
    let mut out: Vec<String> = text
        .lines()
        .filter_map(|l| l.split_whitespace().last())
        .map(str::to_string)
        .collect();
    out.sort();
    out.dedup();
    out
}

/// [`ROOT_FILESYSTEMS`] the kernel can mount.
pub fn supported_root_fs(kernel: &[String]) -> Vec<String> {
    ROOT_FILESYSTEMS
        .iter()
        .filter(|fs| kernel.iter().any(|k| k == *fs))
        .map(|fs| fs.to_string())
        .collect()
}

pub struct Prober {
    mount: Arc<dyn MountPort>,
    loops: Arc<dyn LoopPort>,
    disk: Arc<dyn DiskPort>,
    root_fs: Vec<String>,
}

impl Prober {
    pub fn new(
        mount: Arc<dyn MountPort>,
        loops: Arc<dyn LoopPort>,
        disk: Arc<dyn DiskPort>,
        root_fs: Vec<String>,
    ) -> Self {
        Self {
            mount,
            loops,
            disk,
            root_fs,
        }
    }

    pub fn probe(&self, image: &Path) -> Probe {
        let table = match self.disk.partition_table(image) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("[probe] cannot read partition table of {}: {e:#}", image.display());
                return Probe {
                    has_mbr: false,
                    has_gpt: false,
                    has_root: false,
                    outcome: ProbeOutcome::Failed(format!("{e:#}")),
                };
            }
        };

        let root = table
            .partitions
            .iter()
            .find(|p| self.root_fs.iter().any(|fs| *fs == p.fstype));
        let outcome = match root {
            None => ProbeOutcome::NotAttempted,
            Some(part) => match self.inspect(image, part.number) {
                Ok(details) if details.is_linux => ProbeOutcome::Identified(details),
                Ok(details) => ProbeOutcome::Unknown(details),
                Err(e) => {
                    log::warn!("[probe] cannot inspect {}: {e:#}", image.display());
                    ProbeOutcome::Failed(format!("{e:#}"))
                }
            },
        };

        Probe {
            has_mbr: table.has_mbr(),
            has_gpt: table.has_gpt(),
            has_root: root.is_some(),
            outcome,
        }
    }

    /// Attaches the image, mounts partition `partnum` read-only, reads the
    /// identity markers and releases both, whatever happened in between.
    fn inspect(&self, image: &Path, partnum: u32) -> Result<SystemDetails> {
        log::debug!("[probe] attaching {} p{partnum}", image.display());
        let loop_dev = self.loops.attach(image)?;

        let mountpoint = match self
            .mount
            .mount_to_temp(&partition_node(&loop_dev, partnum), false)
        {
            Ok(m) => m,
            Err(e) => {
                if let Err(de) = self.loops.detach(&loop_dev) {
                    log::warn!("[probe] detach {}: {de:#}", loop_dev.display());
                }
                return Err(e.context(format!("mount root partition of {}", image.display())));
            }
        };

        let details = read_identity(&mountpoint);
        log::debug!("[probe] {}: {details:?}", image.display());

        let unmounted = self.mount.unmount(&mountpoint);
        let detached = self.loops.detach(&loop_dev);
        unmounted?;
        detached?;
        Ok(details)
    }
}

#[derive(Deserialize)]
struct OffspotManifest {
    name: Option<String>,
    version: Option<String>,
    variant: Option<String>,
    human: Option<String>,
}

/// Reads identity markers under `<root>/etc`, first match wins.
pub fn read_identity(root: &Path) -> SystemDetails {
    let etc = root.join("etc");

    if let Some(details) = offspot_manifest(&etc.join("offspot.json")) {
        return details;
    }
    if let Some(details) = offspot_base(&etc.join("hostname")) {
        return details;
    }

    let mut is_raspi = false;
    if let Some(first) = first_line(&etc.join("rpi-issue")) {
        if first.contains("Raspberry Pi") {
            is_raspi = true;
        }
        if let Some(version) = rpi_reference(&first) {
            let mut d = SystemDetails::linux("Raspberry Pi OS".into(), true);
            d.version = Some(version);
            return d;
        }
    }

    if let Some(env) = read_envfile(&etc.join("lsb-release")) {
        if let Some(id) = env.get("DISTRIB_ID") {
            let mut d = SystemDetails::linux(id.clone(), is_raspi);
            d.version = env.get("DISTRIB_RELEASE").cloned();
            d.variant = env.get("DISTRIB_CODENAME").cloned();
            d.human = env.get("DISTRIB_DESCRIPTION").cloned();
            return d;
        }
    }

    if let Some(env) = read_envfile(&etc.join("os-release")) {
        if let Some(name) = env.get("NAME") {
            let mut d = SystemDetails::linux(name.clone(), is_raspi);
            d.version = env.get("VERSION_ID").cloned();
            d.variant = env.get("VERSION_CODENAME").cloned();
            d.human = env.get("PRETTY_NAME").cloned();
            return d;
        }
    }

    for name in ["issue.net", "issue"] {
        if let Some(first) = first_line(&etc.join(name)) {
            let mut d = SystemDetails::linux(first.clone(), is_raspi);
            d.human = Some(first);
            return d;
        }
    }

    SystemDetails::non_linux(is_raspi)
}

fn offspot_manifest(path: &Path) -> Option<SystemDetails> {
    let text = fs::read_to_string(path).ok()?;
    let manifest: OffspotManifest = match serde_json::from_str(&text) {
        Ok(m) => m,
        Err(e) => {
            log::debug!("[probe] unreadable {}: {e}", path.display());
            return None;
        }
    };
    let name = manifest.name.filter(|n| !n.is_empty())?;
    Some(SystemDetails {
        is_linux: true,
        release: Some(name),
        version: manifest.version,
        variant: manifest.variant,
        human: manifest.human,
        is_hotspot: true,
        is_raspi: true,
    })
}

/// Base hotspot images predating the manifest only carry their hostname;
/// the file's ctime stands in for a version.
fn offspot_base(path: &Path) -> Option<SystemDetails> {
    if fs::read_to_string(path).ok()? != "offspot-base" {
        return None;
    }
    let ctime = fs::metadata(path).ok()?.ctime();
    let version = OffsetDateTime::from_unix_timestamp(ctime)
        .ok()?
        .format(format_description!("[year]-[month]"))
        .ok()?;
    Some(SystemDetails {
        is_linux: true,
        release: Some("Kiwix Hotspot".into()),
        version: Some(version),
        variant: Some("Unknown".into()),
        human: None,
        is_hotspot: true,
        is_raspi: true,
    })
}

fn rpi_reference(line: &str) -> Option<String> {
    let re = Regex::new(r"^Raspberry Pi reference (\d{4}-\d{2}-\d{2})").ok()?;
    re.captures(line).map(|c| c[1].to_string())
}

fn first_line(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let line = text.lines().next()?.trim();
    (!line.is_empty()).then(|| line.to_string())
}

/// `KEY=value` files, values optionally quoted.
fn read_envfile(path: &Path) -> Option<HashMap<String, String>> {
    let text = fs::read_to_string(path).ok()?;
    Some(parse_envfile(&text))
}

pub fn parse_envfile(text: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        if !key.trim().is_empty() && !value.is_empty() {
            out.insert(key.trim().to_string(), value.to_string());
        }
    }
    out
}

//! Block-device inventory built from `lsblk --json --bytes`.

use std::{
    fmt,
    ops::Deref,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing as log;

use crate::{tooling::LsblkPort, utils::human::format_size};

/// Minor numbers reserved per disk for its partitions. This holds for the
/// `sd` and `mmcblk` majors; NVMe numbers partitions sequentially from the
/// disk's own minor, which also yields the right value below 16.
pub const PARTITION_STRIDE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Disk,
    Part,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub major: u32,
    pub minor: u32,
    pub removable: bool,
    /// Bytes.
    pub size: u64,
    pub read_only: bool,
    pub kind: DeviceKind,
    /// First entry is the primary mountpoint.
    pub mountpoints: Vec<PathBuf>,
    pub fstype: Option<String>,
    pub label: Option<String>,
    pub partuuid: Option<String>,
    pub partlabel: Option<String>,
    pub path: PathBuf,
    pub sector_size: u32,
    pub tran: String,
    pub vendor: String,
    pub model: String,
    pub state: Option<String>,
    /// Name of the owning disk, for partitions.
    pub parent: Option<String>,
}

impl Device {
    pub fn partnum(&self) -> u32 {
        self.minor % PARTITION_STRIDE
    }

    pub fn brand(&self) -> String {
        let parts: Vec<&str> = [self.vendor.trim(), self.model.trim()]
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            "Unknown".to_string()
        } else {
            parts.join(" ")
        }
    }

    pub fn size_human(&self) -> String {
        format_size(self.size)
    }

    pub fn transport(&self) -> String {
        self.tran.to_uppercase()
    }

    pub fn mountpoint(&self) -> Option<&Path> {
        self.mountpoints.first().map(PathBuf::as_path)
    }

    pub fn is_root(&self) -> bool {
        self.mountpoint().is_some_and(|m| m == Path::new("/"))
    }

    pub fn has_fstype(&self, fstype: &str) -> bool {
        self.fstype.as_deref() == Some(fstype)
    }
}

/// A disk and the partitions it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
    pub device: Device,
    pub partitions: Vec<Device>,
}

impl Deref for Disk {
    type Target = Device;

    fn deref(&self) -> &Device {
        &self.device
    }
}

impl Disk {
    /// The disk itself or any of its partitions is mounted.
    pub fn is_mounted(&self) -> bool {
        !self.device.mountpoints.is_empty()
            || self.partitions.iter().any(|p| !p.mountpoints.is_empty())
    }

    /// Holds the running system's `/`.
    pub fn hosts_root(&self) -> bool {
        self.device.is_root() || self.partitions.iter().any(Device::is_root)
    }

    pub fn partition(&self, num: u32) -> Option<&Device> {
        self.partitions.iter().find(|p| p.partnum() == num)
    }
}

impl fmt::Display for Disk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Disk {} {}",
            self.transport(),
            self.brand(),
            self.size_human()
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    /// In lsblk order.
    pub disks: Vec<Disk>,
}

impl Inventory {
    pub fn query(port: &dyn LsblkPort) -> Result<Self> {
        let text = port.list_json()?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let listing: Listing = serde_json::from_str(text).context("parse lsblk JSON")?;
        let mut disks: Vec<Disk> = Vec::new();

        for entry in listing.blockdevices {
            let Some(disk) = entry.to_device(None)? else {
                for child in &entry.children {
                    log::warn!(
                        "[inventory] device {}: parent ({}) not in list",
                        child.name,
                        entry.name
                    );
                }
                continue;
            };
            if disk.kind != DeviceKind::Disk {
                log::debug!("[inventory] {} is not a disk, skipped", disk.name);
                continue;
            }
            let mut partitions = Vec::new();
            for child in &entry.children {
                let Some(part) = child.to_device(Some(&disk.name))? else {
                    continue;
                };
                if part.kind != DeviceKind::Part {
                    log::debug!("[inventory] {} is not a partition, skipped", part.name);
                    continue;
                }
                partitions.push(part);
            }
            disks.push(Disk {
                device: disk,
                partitions,
            });
        }

        Ok(Self { disks })
    }

    pub fn disk_by_name(&self, name: &str) -> Option<&Disk> {
        self.disks.iter().find(|d| d.name == name)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.disks
            .iter()
            .flat_map(|d| std::iter::once(&d.device).chain(d.partitions.iter()))
    }

    pub fn device_by_name(&self, name: &str) -> Option<&Device> {
        self.devices().find(|d| d.name == name)
    }

    pub fn device_by_path(&self, path: &Path) -> Option<&Device> {
        self.devices().find(|d| d.path == path)
    }

    /// Disk owning `device` (itself when it is a disk).
    pub fn disk_of(&self, device: &Device) -> Option<&Disk> {
        match &device.parent {
            Some(parent) => self.disk_by_name(parent),
            None => self.disk_by_name(&device.name),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Listing {
    #[serde(default)]
    blockdevices: Vec<Entry>,
}

/// lsblk prints flags as `true`/`"1"` and numbers as `123`/`"123"`
/// depending on its version.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Flexible {
    Bool(bool),
    Num(u64),
    Text(String),
}

impl Flexible {
    fn as_bool(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Num(n) => *n != 0,
            Self::Text(s) => s.trim() == "1" || s.trim().eq_ignore_ascii_case("true"),
        }
    }

    fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Bool(_) => None,
            Self::Num(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Entry {
    name: String,
    #[serde(rename = "maj:min")]
    maj_min: String,
    rm: Option<Flexible>,
    size: Option<Flexible>,
    ro: Option<Flexible>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    mountpoints: Vec<Option<String>>,
    fstype: Option<String>,
    label: Option<String>,
    partuuid: Option<String>,
    partlabel: Option<String>,
    path: Option<String>,
    #[serde(rename = "phy-sec")]
    phy_sec: Option<Flexible>,
    tran: Option<String>,
    vendor: Option<String>,
    model: Option<String>,
    state: Option<String>,
    #[serde(default)]
    children: Vec<Entry>,
}

impl Entry {
    /// `None` for zero-size devices (empty card readers and the like).
    fn to_device(&self, parent: Option<&str>) -> Result<Option<Device>> {
        let (major, minor) = self
            .maj_min
            .split_once(':')
            .ok_or_else(|| anyhow!("bad maj:min {:?} for {}", self.maj_min, self.name))?;
        let major = major
            .trim()
            .parse()
            .with_context(|| format!("major of {}", self.name))?;
        let minor = minor
            .trim()
            .parse()
            .with_context(|| format!("minor of {}", self.name))?;

        let size = self.size.as_ref().and_then(Flexible::as_u64).unwrap_or(0);
        if size == 0 {
            log::debug!("[inventory] excluding {} as it is zero size", self.name);
            return Ok(None);
        }

        let kind = match self.kind.as_str() {
            "disk" => DeviceKind::Disk,
            "part" => DeviceKind::Part,
            other => {
                log::debug!("[inventory] ignoring {} of type {other}", self.name);
                return Ok(None);
            }
        };

        let text = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Ok(Some(Device {
            name: self.name.clone(),
            major,
            minor,
            removable: self.rm.as_ref().is_some_and(Flexible::as_bool),
            size,
            read_only: self.ro.as_ref().is_some_and(Flexible::as_bool),
            kind,
            mountpoints: self
                .mountpoints
                .iter()
                .flatten()
                .filter(|m| !m.is_empty())
                .map(PathBuf::from)
                .collect(),
            fstype: text(&self.fstype),
            label: text(&self.label),
            partuuid: text(&self.partuuid),
            partlabel: text(&self.partlabel),
            path: self
                .path
                .as_deref()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/dev").join(&self.name)),
            sector_size: self
                .phy_sec
                .as_ref()
                .and_then(Flexible::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(512),
            tran: text(&self.tran).unwrap_or_default(),
            vendor: text(&self.vendor).unwrap_or_default(),
            model: text(&self.model).unwrap_or_default(),
            state: text(&self.state),
            parent: parent.map(str::to_string),
        }))
    }
}


#[cfg(test)]
mod tests {
    use super::{fixtures::PI_LSBLK, *};

    #[test]
    fn parses_disks_and_partitions() {
        let inv = Inventory::parse(PI_LSBLK).unwrap();
        let names: Vec<&str> = inv.disks.iter().map(|d| d.name.as_str()).collect();
        // zero-size reader and loop device are dropped
        assert_eq!(names, ["sda", "mmcblk0", "nvme0n1"]);

        let sda = inv.disk_by_name("sda").unwrap();
        assert!(sda.removable);
        assert_eq!(sda.brand(), "SanDisk Ultra");
        assert_eq!(sda.transport(), "USB");
        assert_eq!(sda.partitions.len(), 1);
        let sda1 = &sda.partitions[0];
        assert!(sda1.has_fstype("exfat"));
        assert_eq!(sda1.partnum(), 1);
        assert_eq!(sda1.parent.as_deref(), Some("sda"));
        assert_eq!(sda1.label.as_deref(), Some("IMAGES"));
        assert!(!sda.is_mounted());

        let nvme = inv.disk_by_name("nvme0n1").unwrap();
        assert_eq!(nvme.brand(), "Samsung SSD 980 256GB");
        assert_eq!(nvme.to_string(), "NVME Disk Samsung SSD 980 256GB 256.06 GB");
        assert!(nvme.partitions.is_empty());
    }

    #[test]
    fn root_and_mount_detection() {
        let inv = Inventory::parse(PI_LSBLK).unwrap();
        let sd = inv.disk_by_name("mmcblk0").unwrap();
        assert!(sd.is_mounted());
        assert!(sd.hosts_root());
        assert!(!sd.is_root());
        assert!(sd.partition(2).unwrap().is_root());
        assert_eq!(
            sd.partition(1).unwrap().mountpoint(),
            Some(Path::new("/boot/firmware"))
        );
    }

    #[test]
    fn lookups() {
        let inv = Inventory::parse(PI_LSBLK).unwrap();
        let p = inv.device_by_path(Path::new("/dev/mmcblk0p2")).unwrap();
        assert_eq!(p.name, "mmcblk0p2");
        assert_eq!(inv.disk_of(p).unwrap().name, "mmcblk0");
        assert_eq!(inv.device_by_name("nvme0n1").unwrap().kind, DeviceKind::Disk);
        assert!(inv.device_by_name("sdb").is_none());
        assert!(inv.device_by_path(Path::new("/dev/nope")).is_none());
    }

    #[test]
    fn string_flags_and_missing_fields() {
        let json = r#"{"blockdevices": [{"name": "sdc", "maj:min": "8:32", "rm": "1",
            "size": "1000000000", "ro": "0", "type": "disk", "mountpoints": []}]}"#;
        let inv = Inventory::parse(json).unwrap();
        let sdc = inv.disk_by_name("sdc").unwrap();
        assert!(sdc.removable);
        assert!(!sdc.read_only);
        assert_eq!(sdc.size, 1_000_000_000);
        assert_eq!(sdc.path, PathBuf::from("/dev/sdc"));
        assert_eq!(sdc.sector_size, 512);
        assert_eq!(sdc.brand(), "Unknown");
    }

    #[test]
    fn rejects_garbage() {
        assert!(Inventory::parse("not json").is_err());
        let bad = r#"{"blockdevices": [{"name": "x", "maj:min": "8", "size": 5, "type": "disk"}]}"#;
        assert!(Inventory::parse(bad).is_err());
    }
}

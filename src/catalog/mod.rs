//! Bootable images found on removable media, best candidate first.

use std::{
    cmp::Ordering,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing as log;
use walkdir::WalkDir;

use crate::{
    config::Images,
    inventory::{Device, Inventory},
    tooling::MountPort,
};

pub mod probe;

pub use probe::{Probe, ProbeOutcome, Prober, SystemDetails};

/// Usefulness tiers, most useful first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImageKind {
    Hotspot,
    Raspi,
    Linux,
    Other,
}

impl ImageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hotspot => "hotspot",
            Self::Raspi => "raspi",
            Self::Linux => "linux",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFileInfo {
    /// Absolute path at scan time; the mount it lives under may be gone.
    pub path: PathBuf,
    pub size: u64,
    /// Name of the device holding the file (`sda1`).
    pub device: String,
    /// Path relative to that device's filesystem root.
    pub relpath: PathBuf,
    pub has_mbr: bool,
    pub has_gpt: bool,
    pub has_root: bool,
    pub outcome: ProbeOutcome,
}

impl ImageFileInfo {
    pub fn from_probe(path: PathBuf, size: u64, device: String, relpath: PathBuf, p: Probe) -> Self {
        Self {
            path,
            size,
            device,
            relpath,
            has_mbr: p.has_mbr,
            has_gpt: p.has_gpt,
            has_root: p.has_root,
            outcome: p.outcome,
        }
    }

    fn details(&self) -> Option<&SystemDetails> {
        self.outcome.details()
    }

    pub fn has_boot(&self) -> bool {
        self.has_mbr || self.has_gpt
    }

    pub fn is_compatible(&self) -> bool {
        self.has_root
    }

    pub fn is_linux(&self) -> bool {
        self.details().is_some_and(|d| d.is_linux)
    }

    pub fn is_raspi(&self) -> bool {
        self.details().is_some_and(|d| d.is_raspi)
    }

    pub fn is_hotspot(&self) -> bool {
        self.details().is_some_and(|d| d.is_hotspot)
    }

    pub fn kind(&self) -> ImageKind {
        if self.is_hotspot() {
            ImageKind::Hotspot
        } else if self.is_raspi() {
            ImageKind::Raspi
        } else if self.is_linux() {
            ImageKind::Linux
        } else {
            ImageKind::Other
        }
    }

    pub fn version(&self) -> &str {
        self.details()
            .and_then(|d| d.version.as_deref())
            .unwrap_or("0.0")
    }

    pub fn name(&self) -> String {
        let details = match self.details() {
            Some(d) if d.is_linux => d,
            _ => {
                let mut name = "Unknown".to_string();
                if self.has_boot() {
                    name.push_str(if self.has_gpt { " with GPT" } else { " with MBR" });
                }
                if self.has_root {
                    name.push_str(" with partition(s)");
                }
                return name;
            }
        };
        let variant = details.variant.as_deref().unwrap_or("");
        if details.is_hotspot {
            return format!("Kiwix Hotspot “{variant}” version {}", self.version());
        }
        if details.is_raspi {
            return format!("Raspberry Pi OS version {}", self.version());
        }
        let mut name = details.release.clone().unwrap_or_else(|| "Unknown".into());
        for extra in [details.variant.as_deref(), details.version.as_deref()]
            .into_iter()
            .flatten()
        {
            name.push(' ');
            name.push_str(extra);
        }
        name
    }

    pub fn human(&self) -> String {
        self.details()
            .and_then(|d| d.human.clone())
            .unwrap_or_else(|| self.name())
    }

    /// Folder holding the file, relative to the device root, with a
    /// trailing separator (`/` for the root itself).
    pub fn path_root(&self) -> String {
        let parent = self
            .relpath
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let parent = if parent == "." { String::new() } else { parent };
        format!("{parent}/")
    }
}

/// Kind first, then newer version, then larger file.
pub fn usefulness(a: &ImageFileInfo, b: &ImageFileInfo) -> Ordering {
    a.kind()
        .cmp(&b.kind())
        .then_with(|| b.version().cmp(a.version()))
        .then_with(|| b.size.cmp(&a.size))
}

pub struct Scanner {
    mount: Arc<dyn MountPort>,
    prober: Prober,
    settings: Images,
}

impl Scanner {
    pub fn new(mount: Arc<dyn MountPort>, prober: Prober, settings: Images) -> Self {
        Self {
            mount,
            prober,
            settings,
        }
    }

    /// Disks and partitions formatted as image media.
    pub fn media<'a>(&self, inventory: &'a Inventory) -> Vec<&'a Device> {
        inventory
            .devices()
            .filter(|d| d.has_fstype(&self.settings.media_fstype))
            .collect()
    }

    pub fn scan(&self, inventory: &Inventory) -> Vec<ImageFileInfo> {
        let mut images = Vec::new();
        for device in self.media(inventory) {
            images.extend(self.scan_device(device));
        }
        images.sort_by(usefulness);
        images
    }

    /// Uses an existing mount as is; otherwise mounts read-only for the
    /// duration of the search.
    fn scan_device(&self, device: &Device) -> Vec<ImageFileInfo> {
        if let Some(mountpoint) = device.mountpoint() {
            return self.scan_tree(device, mountpoint);
        }

        let mountpoint = match self.mount.mount_to_temp(&device.path, false) {
            Ok(m) => m,
            Err(e) => {
                log::error!("[scan] unable to mount {}: {e:#}", device.name);
                return Vec::new();
            }
        };
        let found = self.scan_tree(device, &mountpoint);
        if let Err(e) = self.mount.timed_unmount(&mountpoint) {
            log::error!("[scan] failed to unmount {}: {e:#}", device.path.display());
        }
        found
    }

    fn scan_tree(&self, device: &Device, root: &Path) -> Vec<ImageFileInfo> {
        let mut found = Vec::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("[scan] walking {}: {e}", root.display());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let matches_suffix = path
                .file_name()
                .map(|n| n.to_string_lossy().ends_with(&self.settings.suffix))
                .unwrap_or(false);
            if !matches_suffix {
                continue;
            }
            let size = match fs::metadata(path) {
                Ok(m) => m.len(),
                Err(e) => {
                    log::warn!("[scan] stat {}: {e}", path.display());
                    continue;
                }
            };
            if size < self.settings.min_size {
                log::debug!("[scan] {} too small ({size} bytes)", path.display());
                continue;
            }

            let relpath = path.strip_prefix(root).unwrap_or(path).to_path_buf();
            let probe = self.prober.probe(path);
            let info = ImageFileInfo::from_probe(
                path.to_path_buf(),
                size,
                device.name.clone(),
                relpath,
                probe,
            );
            if info.is_compatible() {
                log::info!("[scan] found {} on {}: {}", info.relpath.display(), device.name, info.name());
                found.push(info);
            } else {
                log::debug!("[scan] {} has no root partition", path.display());
            }
        }
        found
    }
}


#[cfg(test)]
mod tests {
    use std::{fs::File, path::PathBuf};

    use super::{fixtures::image, *};
    use crate::{
        config::Config,
        inventory::fixtures::PI_LSBLK,
        tooling::mock::{MockDisk, MockLoop, MockMount},
    };

    #[test]
    fn kind_beats_version_and_size() {
        let mut list = vec![
            image(ImageKind::Other, Some("9.9"), 9_000),
            image(ImageKind::Linux, Some("2030"), 8_000),
            image(ImageKind::Raspi, Some("2024-11-19"), 7_000),
            image(ImageKind::Hotspot, Some("2025-01"), 1_000),
        ];
        list.sort_by(usefulness);
        let kinds: Vec<ImageKind> = list.iter().map(ImageFileInfo::kind).collect();
        assert_eq!(
            kinds,
            [ImageKind::Hotspot, ImageKind::Raspi, ImageKind::Linux, ImageKind::Other]
        );
    }

    #[test]
    fn newer_then_larger() {
        let mut list = vec![
            image(ImageKind::Hotspot, Some("2024-06"), 5_000),
            image(ImageKind::Hotspot, Some("2025-01"), 1_000),
            image(ImageKind::Hotspot, Some("2025-01"), 3_000),
            image(ImageKind::Hotspot, None, 9_000),
        ];
        list.sort_by(usefulness);
        let order: Vec<(&str, u64)> = list.iter().map(|i| (i.version(), i.size)).collect();
        assert_eq!(
            order,
            [("2025-01", 3_000), ("2025-01", 1_000), ("2024-06", 5_000), ("0.0", 9_000)]
        );
    }

    #[test]
    fn display_names() {
        let hs = image(ImageKind::Hotspot, Some("2025-01"), 1);
        assert_eq!(hs.name(), "Kiwix Hotspot “Wikipedia” version 2025-01");
        assert_eq!(hs.human(), hs.name());
        let rpi = image(ImageKind::Raspi, Some("2024-11-19"), 1);
        assert_eq!(rpi.name(), "Raspberry Pi OS version 2024-11-19");
        let linux = image(ImageKind::Linux, Some("12"), 1);
        assert_eq!(linux.name(), "Test Wikipedia 12");

        let mut unknown = image(ImageKind::Other, None, 1);
        assert_eq!(unknown.name(), "Unknown with MBR with partition(s)");
        unknown.outcome = ProbeOutcome::Failed("boom".into());
        unknown.has_mbr = false;
        unknown.has_gpt = true;
        assert_eq!(unknown.name(), "Unknown with GPT with partition(s)");
        assert_eq!(unknown.kind(), ImageKind::Other);
        assert_eq!(unknown.version(), "0.0");
    }

    #[test]
    fn path_root_of_relpath() {
        let mut img = image(ImageKind::Linux, None, 1);
        img.relpath = PathBuf::from("a.img");
        assert_eq!(img.path_root(), "/");
        img.relpath = PathBuf::from("images/2025/a.img");
        assert_eq!(img.path_root(), "images/2025/");
    }

    fn sparse(path: &Path, size: u64) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        File::create(path).unwrap().set_len(size).unwrap();
    }

    #[test]
    fn scan_mounts_probes_and_unmounts() {
        let mount = Arc::new(MockMount::default());
        let loops = Arc::new(MockLoop::default());
        let disk = Arc::new(MockDisk::default());

        // sda1 (exfat, unmounted) lands on this directory
        let media = mount.fixture("/dev/sda1");
        let big = media.join("hotspots/kiwix.img");
        let small = media.join("tiny.img");
        let other = media.join("notes.iso");
        sparse(&big, 2_000);
        sparse(&small, 10);
        sparse(&other, 5_000);
        disk.tables.lock().unwrap().insert(
            big.clone(),
            "BYT;\nx:100s:file:512:512:msdos::;\n1:1s:10s:10s:fat32::;\n2:11s:99s:89s:ext4::;\n".into(),
        );
        let root = mount.fixture("/dev/loop0p2");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(
            root.join("etc/offspot.json"),
            r#"{"name": "Kiwix Hotspot", "version": "2025-01", "variant": "Wikipedia"}"#,
        )
        .unwrap();

        let mut settings = Config::default().images;
        settings.min_size = 1_000;
        let prober = Prober::new(mount.clone(), loops.clone(), disk.clone(), vec!["ext4".into()]);
        let scanner = Scanner::new(mount.clone(), prober, settings);

        let inv = Inventory::parse(PI_LSBLK).unwrap();
        assert_eq!(scanner.media(&inv).len(), 1);
        let images = scanner.scan(&inv);

        assert_eq!(images.len(), 1);
        let img = &images[0];
        assert_eq!(img.device, "sda1");
        assert_eq!(img.relpath, PathBuf::from("hotspots/kiwix.img"));
        assert_eq!(img.kind(), ImageKind::Hotspot);
        assert_eq!(img.path_root(), "hotspots/");
        // media mount + image root mount, each released once
        assert_eq!(mount.temp_mounts(), 2);
        assert!(mount.balanced());
        assert_eq!(loops.detached.lock().unwrap().len(), 1);
    }

    #[test]
    fn unmountable_media_is_skipped() {
        let mount = Arc::new(MockMount::default());
        mount.fail_on("/dev/sda1");
        let prober = Prober::new(
            mount.clone(),
            Arc::new(MockLoop::default()),
            Arc::new(MockDisk::default()),
            vec!["ext4".into()],
        );
        let scanner = Scanner::new(mount.clone(), prober, Config::default().images);
        let inv = Inventory::parse(PI_LSBLK).unwrap();
        assert!(scanner.scan(&inv).is_empty());
        assert_eq!(mount.temp_mounts(), 0);
    }
}

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use tracing as log;

use crate::{
    provisioning::{Environment, Step, StepKind, StepResult, check, check_fsck, partition_path},
    tooling::{DiskPort, MountPort},
    utils::ids::{new_disk_id, parse_disk_identifier, replace_partuuid_refs},
};

const BOOT_PART: u32 = 1;
const ROOT_PART: u32 = 2;
const DATA_PART: u32 = 3;

/// Grows the hotspot's data partition and filesystem to the end of the
/// target disk, then gives the disk a fresh identifier so it cannot be
/// confused with the media it was flashed from.
pub struct ResizePartitionStep {
    disk: Arc<dyn DiskPort>,
    mount: Arc<dyn MountPort>,
    mountpoint: Option<PathBuf>,
    notes: Vec<String>,
}

impl ResizePartitionStep {
    pub fn new(disk: Arc<dyn DiskPort>, mount: Arc<dyn MountPort>) -> Self {
        Self {
            disk,
            mount,
            mountpoint: None,
            notes: Vec::new(),
        }
    }

    fn note(&mut self, line: String) {
        log::debug!("[resize] {line}");
        self.notes.push(line);
    }

    fn resize(&mut self, env: &Environment, verbose: bool) -> Result<String> {
        let disk = &env.target_disk;
        let dev = disk.path.as_path();
        let data_part = partition_path(dev, DATA_PART);
        let data_name = data_part
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let data_num = self
            .disk
            .partition_number(&disk.name, &data_name)
            .context("Failed to resize partition")?;
        self.note(format!(
            "disk: {}, data partition: {} (#{data_num})",
            dev.display(),
            data_part.display()
        ));

        let table = self
            .disk
            .partition_table(dev)
            .context("Failed to resize partition")?;
        let data_end = table
            .last_end()
            .ok_or_else(|| anyhow!("no partition on {}", dev.display()))
            .context("Failed to resize partition")?;
        let target_end = self
            .disk
            .size_sectors(&disk.name)
            .context("Failed to resize partition")?
            .saturating_sub(1);
        self.note(format!("data_part_end: {data_end}s, target_end: {target_end}s"));

        let listing = self
            .disk
            .fdisk_list(dev)
            .context("Failed to retrieve old Disk ID")?;
        let old_id = parse_disk_identifier(&listing)
            .ok_or_else(|| anyhow!("no disk identifier in fdisk output"))
            .context("Failed to retrieve old Disk ID")?;
        self.note(format!("old disk id: {old_id}"));

        if data_end == target_end {
            return Ok("Partition already extended".into());
        }

        let out = self
            .disk
            .resize_partition(dev, data_num, target_end)
            .and_then(|o| check(o, "Failed to resize partition"))?;
        self.log_output(verbose, &out.combined());
        let out = self
            .disk
            .fsck(&data_part)
            .and_then(|o| check_fsck(o, "Failed to check partition after part resize"))?;
        self.log_output(verbose, &out.combined());
        let out = self
            .disk
            .resize_fs(&data_part)
            .and_then(|o| check(o, "Failed to resize filesystem"))?;
        self.log_output(verbose, &out.combined());
        let out = self
            .disk
            .fsck(&data_part)
            .and_then(|o| check_fsck(o, "Failed to check partition after filesystem resize"))?;
        self.log_output(verbose, &out.combined());

        let new_id = new_disk_id();
        self.note(format!("new disk id: {new_id}"));
        self.disk
            .set_disk_id(dev, &new_id)
            .and_then(|o| check(o, "Failed to change disk ID"))?;

        self.rewrite_refs(&partition_path(dev, ROOT_PART), "etc/fstab", &old_id, &new_id)
            .context("Failed to update fstab")?;
        self.rewrite_refs(&partition_path(dev, BOOT_PART), "cmdline.txt", &old_id, &new_id)
            .context("Failed to update kernel command line")?;

        Ok(format!("Data partition extended to sector {target_end}"))
    }

    fn log_output(&self, verbose: bool, output: &str) {
        if verbose && !output.trim().is_empty() {
            log::info!("[resize] {}", output.trim());
        }
    }

    /// Mounts `part`, swaps the disk id in `PARTUUID=` references of `rel`,
    /// and unmounts whatever happened.
    fn rewrite_refs(&mut self, part: &Path, rel: &str, old_id: &str, new_id: &str) -> Result<()> {
        let mp = self.mount.mount_to_temp(part, true)?;
        self.mountpoint = Some(mp.clone());

        let file = mp.join(rel);
        let edited = fs::read_to_string(&file)
            .with_context(|| format!("read {}", file.display()))
            .and_then(|text| {
                let (updated, count) = replace_partuuid_refs(&text, old_id, new_id);
                if count == 0 {
                    log::warn!("[resize] no PARTUUID={old_id} reference in {rel}");
                }
                fs::write(&file, updated).with_context(|| format!("write {}", file.display()))?;
                Ok(count)
            });
        self.mount.sync();

        let released = self.release_mount();
        let count = edited?;
        released?;
        self.note(format!("{rel}: {count} reference(s) updated"));
        Ok(())
    }

    fn release_mount(&mut self) -> Result<()> {
        if let Some(mp) = &self.mountpoint {
            self.mount.unmount(mp)?;
            self.mountpoint = None;
        }
        Ok(())
    }
}

impl Step for ResizePartitionStep {
    fn kind(&self) -> StepKind {
        StepKind::ResizePartition
    }

    fn run(&mut self, env: &Environment, verbose: bool) -> Result<StepResult> {
        self.notes.clear();
        Ok(match self.resize(env, verbose) {
            Ok(text) => StepResult::success(text).with_debug(self.notes.join("\n")),
            Err(e) => StepResult::from_error(&e, &self.notes),
        })
    }

    fn cleanup(&mut self) -> Result<()> {
        self.release_mount()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        provisioning::fixtures::environment,
        tooling::mock::{MockDisk, MockMount},
    };

    const SECTORS: u64 = 500_118_192;

    fn table(data_end: u64) -> String {
        format!(
            "BYT;\n/dev/nvme0n1:{SECTORS}s:nvme:512:512:msdos:Samsung SSD 980 256GB:;\n\
             1:8192s:532479s:524288s:fat32::lba;\n\
             2:532480s:12115967s:11583488s:ext4::;\n\
             3:12115968s:{data_end}s:{}s:ext4::;",
            data_end - 12_115_968 + 1
        )
    }

    struct Rig {
        disk: Arc<MockDisk>,
        mount: Arc<MockMount>,
        step: ResizePartitionStep,
    }

    fn rig(data_end: u64) -> Rig {
        let disk = MockDisk {
            part_numbers: [("nvme0n1p3".to_string(), 3)].into_iter().collect(),
            ..Default::default()
        };
        disk.tables
            .lock()
            .unwrap()
            .insert(PathBuf::from("/dev/nvme0n1"), table(data_end));
        disk.sectors.lock().unwrap().insert("nvme0n1".into(), SECTORS);
        let disk = Arc::new(disk);

        let mount = Arc::new(MockMount::default());
        let root = mount.fixture("/dev/nvme0n1p2");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(
            root.join("etc/fstab"),
            "proc /proc proc defaults 0 0\n\
             PARTUUID=8a438930-01 /boot/firmware vfat defaults 0 2\n\
             PARTUUID=8a438930-02 / ext4 defaults,noatime 0 1\n",
        )
        .unwrap();
        let boot = mount.fixture("/dev/nvme0n1p1");
        fs::write(
            boot.join("cmdline.txt"),
            "console=serial0,115200 root=PARTUUID=8a438930-02 rootfstype=ext4 fsck.repair=yes\n",
        )
        .unwrap();

        let step = ResizePartitionStep::new(disk.clone(), mount.clone());
        Rig { disk, mount, step }
    }

    #[test]
    fn extends_and_renames_disk() {
        let mut r = rig(20_000_000);
        let res = r.step.run(&environment(), false).unwrap();
        assert!(res.succeeded, "{res:?}");
        assert_eq!(res.success_text, format!("Data partition extended to sector {}", SECTORS - 1));

        let calls = r.disk.calls();
        assert!(calls.contains(&format!("resizepart /dev/nvme0n1 3 {}", SECTORS - 1)));
        assert_eq!(calls.iter().filter(|c| c.starts_with("fsck")).count(), 2);
        assert!(calls.contains(&"resize2fs /dev/nvme0n1p3".to_string()));

        let new_id = r.disk.disk_id.lock().unwrap().clone();
        assert_ne!(new_id, "8a438930");
        let fstab = fs::read_to_string(r.mount.fixture("/dev/nvme0n1p2").join("etc/fstab")).unwrap();
        assert!(fstab.contains(&format!("PARTUUID={new_id}-01 /boot/firmware")));
        assert!(fstab.contains(&format!("PARTUUID={new_id}-02 / ")));
        let cmdline = fs::read_to_string(r.mount.fixture("/dev/nvme0n1p1").join("cmdline.txt")).unwrap();
        assert!(cmdline.contains(&format!("root=PARTUUID={new_id}-02 ")));

        assert_eq!(r.mount.temp_mounts(), 2);
        assert!(r.mount.balanced());
        assert!(res.debug_text.contains("old disk id: 8a438930"));
    }

    #[test]
    fn second_run_is_a_no_op() {
        let mut r = rig(SECTORS - 1);
        for _ in 0..2 {
            let res = r.step.run(&environment(), false).unwrap();
            assert!(res.succeeded);
            assert_eq!(res.success_text, "Partition already extended");
        }
        let calls = r.disk.calls();
        assert!(!calls.iter().any(|c| c.starts_with("resizepart") || c.starts_with("set_disk_id")));
        assert_eq!(*r.disk.disk_id.lock().unwrap(), "8a438930");
        assert_eq!(r.mount.temp_mounts(), 0);
    }

    #[test]
    fn resize_then_rerun_short_circuits() {
        let mut r = rig(20_000_000);
        assert!(r.step.run(&environment(), false).unwrap().succeeded);
        let id = r.disk.disk_id.lock().unwrap().clone();
        let again = r.step.run(&environment(), false).unwrap();
        assert_eq!(again.success_text, "Partition already extended");
        assert_eq!(*r.disk.disk_id.lock().unwrap(), id);
    }

    #[test]
    fn fsck_failure_stops_before_resize2fs() {
        let mut r = rig(20_000_000);
        r.disk.set_code("fsck", 8);
        let res = r.step.run(&environment(), false).unwrap();
        assert!(!res.succeeded);
        assert_eq!(res.error_text, "Failed to check partition after part resize");
        assert!(res.debug_text.contains("target_end: 500118191s"));
        assert!(!r.disk.calls().iter().any(|c| c.starts_with("resize2fs")));
    }

    #[test]
    fn corrected_fsck_errors_are_fine() {
        let mut r = rig(20_000_000);
        r.disk.set_code("fsck", 1);
        assert!(r.step.run(&environment(), false).unwrap().succeeded);
    }

    #[test]
    fn disk_id_failure() {
        let mut r = rig(20_000_000);
        r.disk.set_code("fdisk", 1);
        let res = r.step.run(&environment(), false).unwrap();
        assert_eq!(res.error_text, "Failed to change disk ID");
        assert_eq!(r.mount.temp_mounts(), 0);
    }

    #[test]
    fn missing_fstab_still_unmounts() {
        let mut r = rig(20_000_000);
        fs::remove_file(r.mount.fixture("/dev/nvme0n1p2").join("etc/fstab")).unwrap();
        let res = r.step.run(&environment(), false).unwrap();
        assert_eq!(res.error_text, "Failed to update fstab");
        assert_eq!(r.mount.temp_mounts(), 1);
        assert!(r.mount.balanced());
    }

    #[test]
    fn failed_unmount_is_retried_by_cleanup() {
        let mut r = rig(20_000_000);
        r.mount.fail_next_unmounts(1);
        let res = r.step.run(&environment(), false).unwrap();
        assert_eq!(res.error_text, "Failed to update fstab");
        assert!(!r.mount.balanced());
        r.step.cleanup().unwrap();
        assert!(r.mount.balanced());
    }

    #[test]
    fn failed_mount_is_reported() {
        let mut r = rig(20_000_000);
        r.mount.fail_on("/dev/nvme0n1p1");
        let res = r.step.run(&environment(), false).unwrap();
        assert_eq!(res.error_text, "Failed to update kernel command line");
        assert!(r.mount.balanced());
        r.step.cleanup().unwrap();
    }
}

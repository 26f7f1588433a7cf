//! In-memory ports shared by unit tests.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{Result, anyhow, bail};
use tempfile::TempDir;

use super::{
    ChrootPort, ClockPort, DiskPort, EepromPort, ImagerPort, LoopPort, LsblkPort, MountPort,
    NetworkPort, Toolbox,
    clock::ClockInfo,
    disk::PartedTable,
    imager::ImagerRun,
    network::{Interface, InternetCheck},
};
use crate::utils::process::CmdOutput;

pub fn ok_output(stdout: &str) -> CmdOutput {
    CmdOutput {
        code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

pub fn code_output(code: i32) -> CmdOutput {
    CmdOutput {
        code,
        stdout: String::new(),
        stderr: format!("exit {code}"),
    }
}

/// Mount layer that maps devices onto prepared directories and records
/// every call.
pub struct MockMount {
    scratch: TempDir,
    fixtures: Mutex<HashMap<PathBuf, PathBuf>>,
    pub fail_devices: Mutex<Vec<PathBuf>>,
    /// Number of upcoming `unmount` calls that fail.
    pub failing_unmounts: Mutex<usize>,
    pub mounted: Mutex<Vec<PathBuf>>,
    pub unmounted: Mutex<Vec<PathBuf>>,
    pub calls: Mutex<Vec<String>>,
}

impl Default for MockMount {
    fn default() -> Self {
        Self {
            scratch: TempDir::new().expect("scratch dir"),
            fixtures: Mutex::new(HashMap::new()),
            fail_devices: Mutex::new(Vec::new()),
            failing_unmounts: Mutex::new(0),
            mounted: Mutex::new(Vec::new()),
            unmounted: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl MockMount {
    /// Directory that `dev` appears as once mounted; created on demand.
    pub fn fixture(&self, dev: &str) -> PathBuf {
        let dev = PathBuf::from(dev);
        let mut map = self.fixtures.lock().unwrap();
        map.entry(dev.clone())
            .or_insert_with(|| {
                let name = dev.file_name().unwrap().to_string_lossy().into_owned();
                let dir = self.scratch.path().join(format!("{name}.mnt"));
                fs::create_dir_all(&dir).unwrap();
                dir
            })
            .clone()
    }

    pub fn fail_on(&self, dev: &str) {
        self.fail_devices.lock().unwrap().push(PathBuf::from(dev));
    }

    pub fn fail_next_unmounts(&self, count: usize) {
        *self.failing_unmounts.lock().unwrap() = count;
    }

    pub fn temp_mounts(&self) -> usize {
        self.mounted.lock().unwrap().len()
    }

    pub fn temp_unmounts(&self) -> usize {
        self.unmounted.lock().unwrap().len()
    }

    /// Every temp mount released exactly once.
    pub fn balanced(&self) -> bool {
        let mut m = self.mounted.lock().unwrap().clone();
        let mut u = self.unmounted.lock().unwrap().clone();
        m.sort();
        u.sort();
        m == u
    }

    fn record(&self, line: String) {
        self.calls.lock().unwrap().push(line);
    }
}

impl MountPort for MockMount {
    fn mount(&self, dev: &Path, target: &Path, rw: bool) -> Result<()> {
        self.record(format!("mount {} {} rw={rw}", dev.display(), target.display()));
        if self.fail_devices.lock().unwrap().iter().any(|d| d == dev) {
            bail!("mock mount failure for {}", dev.display());
        }
        Ok(())
    }

    fn mount_to_temp(&self, dev: &Path, rw: bool) -> Result<PathBuf> {
        self.record(format!("mount_to_temp {} rw={rw}", dev.display()));
        if self.fail_devices.lock().unwrap().iter().any(|d| d == dev) {
            bail!("mock mount failure for {}", dev.display());
        }
        let dir = self.fixture(&dev.display().to_string());
        self.mounted.lock().unwrap().push(dir.clone());
        Ok(dir)
    }

    fn mount_fs(&self, fstype: &str, what: &str, target: &Path) -> Result<()> {
        self.record(format!("mount -t {fstype} {what} {}", target.display()));
        Ok(())
    }

    fn rbind(&self, src: &Path, target: &Path) -> Result<()> {
        self.record(format!("rbind {} {}", src.display(), target.display()));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.record(format!("unmount {}", target.display()));
        {
            let mut failing = self.failing_unmounts.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                bail!("mock unmount failure for {}", target.display());
            }
        }
        if self.mounted.lock().unwrap().iter().any(|m| m == target) {
            self.unmounted.lock().unwrap().push(target.to_path_buf());
        }
        Ok(())
    }

    fn timed_unmount(&self, target: &Path) -> Result<()> {
        self.unmount(target)
    }

    fn unmount_recursive(&self, target: &Path, lazy: bool) -> Result<()> {
        self.record(format!("umount_recursive {} lazy={lazy}", target.display()));
        if !lazy && self.mounted.lock().unwrap().iter().any(|m| m == target) {
            self.unmounted.lock().unwrap().push(target.to_path_buf());
        }
        Ok(())
    }

    fn sync(&self) {}
}

#[derive(Default)]
pub struct MockLoop {
    pub attached: Mutex<Vec<PathBuf>>,
    pub detached: Mutex<Vec<PathBuf>>,
    pub fail_attach: bool,
}

impl LoopPort for MockLoop {
    fn attach(&self, image: &Path) -> Result<PathBuf> {
        if self.fail_attach {
            bail!("mock attach failure for {}", image.display());
        }
        let mut attached = self.attached.lock().unwrap();
        let dev = PathBuf::from(format!("/dev/loop{}", attached.len()));
        attached.push(dev.clone());
        Ok(dev)
    }

    fn detach(&self, loop_dev: &Path) -> Result<()> {
        self.detached.lock().unwrap().push(loop_dev.to_path_buf());
        Ok(())
    }
}

/// Disk layer driven by a small mutable geometry model: resizing moves the
/// last partition's end sector, `set_disk_id` changes the reported id.
pub struct MockDisk {
    pub tables: Mutex<HashMap<PathBuf, String>>,
    pub sectors: Mutex<HashMap<String, u64>>,
    pub part_numbers: HashMap<String, u32>,
    pub disk_id: Mutex<String>,
    pub codes: Mutex<HashMap<&'static str, i32>>,
    pub calls: Mutex<Vec<String>>,
}

impl Default for MockDisk {
    fn default() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            sectors: Mutex::new(HashMap::new()),
            part_numbers: HashMap::new(),
            disk_id: Mutex::new("8a438930".into()),
            codes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl MockDisk {
    pub fn set_code(&self, op: &'static str, code: i32) {
        self.codes.lock().unwrap().insert(op, code);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn code(&self, op: &'static str) -> i32 {
        self.codes.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    fn record(&self, line: String) {
        self.calls.lock().unwrap().push(line);
    }
}

impl DiskPort for MockDisk {
    fn partition_table(&self, dev: &Path) -> Result<PartedTable> {
        self.record(format!("print {}", dev.display()));
        let tables = self.tables.lock().unwrap();
        let text = tables
            .get(dev)
            .ok_or_else(|| anyhow!("no partition table for {}", dev.display()))?;
        PartedTable::parse(text)
    }

    fn resize_partition(&self, dev: &Path, partnum: u32, end_sector: u64) -> Result<CmdOutput> {
        self.record(format!("resizepart {} {partnum} {end_sector}", dev.display()));
        let code = self.code("resizepart");
        if code == 0 {
            let mut tables = self.tables.lock().unwrap();
            if let Some(text) = tables.get_mut(dev) {
                let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
                if let Some(last) = lines.last_mut() {
                    let mut fields: Vec<String> = last.split(':').map(str::to_string).collect();
                    fields[2] = format!("{end_sector}s");
                    *last = fields.join(":");
                }
                *text = lines.join("\n");
            }
        }
        Ok(if code == 0 { ok_output("") } else { code_output(code) })
    }

    fn fsck(&self, part: &Path) -> Result<CmdOutput> {
        self.record(format!("fsck {}", part.display()));
        let code = self.code("fsck");
        Ok(if code == 0 { ok_output("clean") } else { code_output(code) })
    }

    fn resize_fs(&self, part: &Path) -> Result<CmdOutput> {
        self.record(format!("resize2fs {}", part.display()));
        Ok(match self.code("resize2fs") {
            0 => ok_output(""),
            c => code_output(c),
        })
    }

    fn fdisk_list(&self, dev: &Path) -> Result<String> {
        self.record(format!("fdisk -l {}", dev.display()));
        Ok(format!(
            "Disk {}: 238.47 GiB\nDisklabel type: dos\nDisk identifier: 0x{}\n",
            dev.display(),
            self.disk_id.lock().unwrap()
        ))
    }

    fn set_disk_id(&self, dev: &Path, new_id: &str) -> Result<CmdOutput> {
        self.record(format!("set_disk_id {} {new_id}", dev.display()));
        let code = self.code("fdisk");
        if code == 0 {
            *self.disk_id.lock().unwrap() = new_id.to_string();
            Ok(ok_output(""))
        } else {
            Ok(code_output(code))
        }
    }

    fn size_sectors(&self, disk: &str) -> Result<u64> {
        self.sectors
            .lock()
            .unwrap()
            .get(disk)
            .copied()
            .ok_or_else(|| anyhow!("no size for {disk}"))
    }

    fn partition_number(&self, _disk: &str, part: &str) -> Result<u32> {
        self.part_numbers
            .get(part)
            .copied()
            .ok_or_else(|| anyhow!("no partition {part}"))
    }
}

pub struct MockEeprom {
    pub config: String,
    pub applied: Mutex<Vec<String>>,
    pub apply_code: i32,
}

impl EepromPort for MockEeprom {
    fn read_config(&self) -> Result<String> {
        Ok(self.config.clone())
    }

    fn apply(&self, file: &Path) -> Result<CmdOutput> {
        self.applied
            .lock()
            .unwrap()
            .push(fs::read_to_string(file)?);
        Ok(if self.apply_code == 0 {
            ok_output("EEPROM updated")
        } else {
            code_output(self.apply_code)
        })
    }
}

pub struct MockClock {
    pub text: String,
    pub write_code: i32,
    pub writes: Mutex<usize>,
}

impl ClockPort for MockClock {
    fn query(&self) -> Result<ClockInfo> {
        Ok(ClockInfo::parse(0, &self.text))
    }

    fn write_hwclock(&self) -> Result<CmdOutput> {
        *self.writes.lock().unwrap() += 1;
        Ok(if self.write_code == 0 {
            ok_output("")
        } else {
            code_output(self.write_code)
        })
    }
}

#[derive(Default)]
pub struct MockNetwork {
    pub interfaces: BTreeMap<String, Interface>,
    pub internet: InternetCheck,
}

impl NetworkPort for MockNetwork {
    fn interfaces(&self) -> Result<BTreeMap<String, Interface>> {
        Ok(self.interfaces.clone())
    }

    fn regdomain(&self) -> Option<String> {
        None
    }

    fn internet(&self) -> InternetCheck {
        self.internet
    }
}

#[derive(Default)]
pub struct MockChroot {
    pub calls: Mutex<Vec<String>>,
    pub fail_script: bool,
}

impl ChrootPort for MockChroot {
    fn exec(&self, root: &Path, program: &str, args: &[&str]) -> Result<CmdOutput> {
        let line = format!("{} {program} {}", root.display(), args.join(" "));
        self.calls.lock().unwrap().push(line.trim_end().to_string());
        if self.fail_script && program == "/bin/bash" {
            return Ok(code_output(1));
        }
        Ok(ok_output(""))
    }
}

/// Flasher replaying a fixed transcript one chunk per poll.
pub struct MockImager {
    pub installed: bool,
    pub chunks: Vec<String>,
    pub code: i32,
    pub spawned: Mutex<Vec<(PathBuf, PathBuf)>>,
}

struct MockImagerRun {
    chunks: Vec<String>,
    shown: usize,
    code: i32,
}

impl ImagerRun for MockImagerRun {
    fn output(&self) -> String {
        self.chunks[..self.shown].concat()
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        if self.shown < self.chunks.len() {
            self.shown += 1;
            return Ok(None);
        }
        Ok(Some(self.code))
    }

    fn kill(&mut self) {}
}

impl ImagerPort for MockImager {
    fn binary(&self) -> Option<PathBuf> {
        self.installed.then(|| PathBuf::from("/usr/bin/rpi-imager"))
    }

    fn spawn(&self, image: &Path, target: &Path) -> Result<Box<dyn ImagerRun>> {
        if !self.installed {
            bail!("rpi-imager not found in PATH");
        }
        self.spawned
            .lock()
            .unwrap()
            .push((image.to_path_buf(), target.to_path_buf()));
        Ok(Box::new(MockImagerRun {
            chunks: self.chunks.clone(),
            shown: 0,
            code: self.code,
        }))
    }
}

pub struct MockLsblk(pub String);

impl LsblkPort for MockLsblk {
    fn list_json(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Toolbox assembled from individual ports.
pub struct ToolboxBuilder {
    pub lsblk: Arc<dyn LsblkPort>,
    pub mount: Arc<dyn MountPort>,
    pub loops: Arc<dyn LoopPort>,
    pub disk: Arc<dyn DiskPort>,
    pub eeprom: Arc<dyn EepromPort>,
    pub clock: Arc<dyn ClockPort>,
    pub network: Arc<dyn NetworkPort>,
    pub chroot: Arc<dyn ChrootPort>,
    pub imager: Arc<dyn ImagerPort>,
}

impl Default for ToolboxBuilder {
    fn default() -> Self {
        Self {
            lsblk: Arc::new(MockLsblk(r#"{"blockdevices": []}"#.into())),
            mount: Arc::new(MockMount::default()),
            loops: Arc::new(MockLoop::default()),
            disk: Arc::new(MockDisk::default()),
            eeprom: Arc::new(MockEeprom {
                config: "[all]\nBOOT_ORDER=0xf41\n".into(),
                applied: Mutex::new(Vec::new()),
                apply_code: 0,
            }),
            clock: Arc::new(MockClock {
                text: "NTP=yes\nNTPSynchronized=yes\n".into(),
                write_code: 0,
                writes: Mutex::new(0),
            }),
            network: Arc::new(MockNetwork::default()),
            chroot: Arc::new(MockChroot::default()),
            imager: Arc::new(MockImager {
                installed: true,
                chunks: Vec::new(),
                code: 0,
                spawned: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl ToolboxBuilder {
    pub fn build(self) -> Toolbox {
        Toolbox {
            lsblk: self.lsblk,
            mount: self.mount,
            loops: self.loops,
            disk: self.disk,
            eeprom: self.eeprom,
            clock: self.clock,
            network: self.network,
            chroot: self.chroot,
            imager: self.imager,
        }
    }
}

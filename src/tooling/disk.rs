use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail};

use crate::utils::process::{CmdOutput, CmdSpec, Runner};

pub const REQ_BINS: &[&str] = &["parted", "fdisk", "fsck.ext4", "resize2fs"];

type DynRunner = dyn Runner + Send + Sync;

/// Partition table operations on a whole disk (or image file) and sysfs
/// geometry lookups. Calls that a step must judge by exit code return the
/// raw `CmdOutput`.
pub trait DiskPort: Send + Sync {
    /// `parted -m -s <dev> unit s print`, parsed.
    fn partition_table(&self, dev: &Path) -> Result<PartedTable>;
    fn resize_partition(&self, dev: &Path, partnum: u32, end_sector: u64) -> Result<CmdOutput>;
    fn fsck(&self, part: &Path) -> Result<CmdOutput>;
    fn resize_fs(&self, part: &Path) -> Result<CmdOutput>;
    /// `fdisk -l <dev>` output.
    fn fdisk_list(&self, dev: &Path) -> Result<String>;
    fn set_disk_id(&self, dev: &Path, new_id: &str) -> Result<CmdOutput>;
    /// Disk size in 512-byte sectors, from sysfs.
    fn size_sectors(&self, disk: &str) -> Result<u64>;
    /// Kernel partition number of `part` on `disk`, from sysfs.
    fn partition_number(&self, disk: &str, part: &str) -> Result<u32>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartedTable {
    /// `msdos`, `gpt`, `loop`…
    pub label: String,
    pub partitions: Vec<PartedPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartedPartition {
    pub number: u32,
    pub start: u64,
    pub end: u64,
    pub fstype: String,
}

impl PartedTable {
    pub fn has_mbr(&self) -> bool {
        self.label == "msdos"
    }

    pub fn has_gpt(&self) -> bool {
        self.label == "gpt"
    }

    /// End sector of the partition listed last.
    pub fn last_end(&self) -> Option<u64> {
        self.partitions.last().map(|p| p.end)
    }

    /// Parses machine-readable parted output:
    ///
    /// ```text
    /// BYT;
    /// /dev/nvme0n1:500118192s:nvme:512:512:msdos:Samsung SSD:;
    /// 1:8192s:532479s:524288s:fat32::lba;
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && *l != "BYT;" && *l != "CHS;" && *l != "CYL;");
        let header = lines
            .next()
            .ok_or_else(|| anyhow!("empty parted output"))?;
        let label = header
            .trim_end_matches(';')
            .split(':')
            .nth(5)
            .ok_or_else(|| anyhow!("bad parted disk line {header:?}"))?
            .to_string();

        let mut partitions = Vec::new();
        for line in lines {
            let fields: Vec<&str> = line.trim_end_matches(';').split(':').collect();
            if fields.len() < 5 {
                bail!("bad parted partition line {line:?}");
            }
            partitions.push(PartedPartition {
                number: fields[0]
                    .parse()
                    .with_context(|| format!("partition number in {line:?}"))?,
                start: sectors(fields[1])?,
                end: sectors(fields[2])?,
                fstype: fields[4].to_string(),
            });
        }
        Ok(Self { label, partitions })
    }
}

fn sectors(field: &str) -> Result<u64> {
    field
        .trim_end_matches('s')
        .parse()
        .with_context(|| format!("bad sector value {field:?}"))
}

pub struct DiskCli {
    runner: Arc<DynRunner>,
    sys_block: PathBuf,
}

impl DiskCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self {
            runner,
            sys_block: PathBuf::from("/sys/block"),
        }
    }

    fn read_sys(&self, rel: &Path) -> Result<String> {
        let path = self.sys_block.join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }
}

impl DiskPort for DiskCli {
    fn partition_table(&self, dev: &Path) -> Result<PartedTable> {
        let cmd = CmdSpec::new("parted")
            .args(["-m", "-s"])
            .arg(dev.display().to_string())
            .args(["unit", "s", "print"]);
        let out = self
            .runner
            .run_capture(&cmd)
            .with_context(|| format!("read partition table of {}", dev.display()))?;
        PartedTable::parse(&out)
    }

    fn resize_partition(&self, dev: &Path, partnum: u32, end_sector: u64) -> Result<CmdOutput> {
        let cmd = CmdSpec::new("parted")
            .arg("-m")
            .arg(dev.display().to_string())
            .args(["u", "s", "resizepart"])
            .arg(partnum.to_string())
            .arg(end_sector.to_string());
        self.runner.run_output(&cmd)
    }

    fn fsck(&self, part: &Path) -> Result<CmdOutput> {
        let cmd = CmdSpec::new("fsck.ext4")
            .args(["-y", "-f", "-v"])
            .arg(part.display().to_string());
        self.runner.run_output(&cmd)
    }

    fn resize_fs(&self, part: &Path) -> Result<CmdOutput> {
        let cmd = CmdSpec::new("resize2fs")
            .args(["-f", "-p"])
            .arg(part.display().to_string());
        self.runner.run_output(&cmd)
    }

    fn fdisk_list(&self, dev: &Path) -> Result<String> {
        let cmd = CmdSpec::new("fdisk").arg("-l").arg(dev.display().to_string());
        self.runner
            .run_capture(&cmd)
            .with_context(|| format!("fdisk -l {}", dev.display()))
    }

    fn set_disk_id(&self, dev: &Path, new_id: &str) -> Result<CmdOutput> {
        // expert mode, change identifier, back, write
        let cmd = CmdSpec::new("fdisk")
            .arg(dev.display().to_string())
            .input(format!("x\ni\n0x{new_id}\nr\nw\n"));
        self.runner.run_output(&cmd)
    }

    fn size_sectors(&self, disk: &str) -> Result<u64> {
        let raw = self.read_sys(&Path::new(disk).join("size"))?;
        raw.trim()
            .parse()
            .with_context(|| format!("bad sysfs size {raw:?} for {disk}"))
    }

    fn partition_number(&self, disk: &str, part: &str) -> Result<u32> {
        let raw = self.read_sys(&Path::new(disk).join(part).join("partition"))?;
        raw.trim()
            .parse()
            .with_context(|| format!("bad partition number {raw:?} for {part}"))
    }
}

//! Turning a freshly flashed disk into a shippable device: the selection a
//! run works on, the step contract and the types steps report with.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use time::OffsetDateTime;

use crate::{
    catalog::ImageFileInfo,
    host::Host,
    inventory::{Device, Disk},
    utils::{human::format_size, process::CmdOutput, time::seconds_between},
};

pub mod imager_parser;
pub mod manager;
pub mod steps;

pub use imager_parser::ImagerProgress;
pub use manager::{Event, Outcome, PipelineReport, ProvisionManager, run_pipeline};

/// What one provisioning run works on. Immutable once built.
pub struct Environment {
    pub host: Arc<Host>,
    pub image: ImageFileInfo,
    /// Partition holding the image file.
    pub image_device: Device,
    pub target_disk: Disk,
}

impl Environment {
    pub fn new(host: Arc<Host>, image: ImageFileInfo, image_device: Device, target_disk: Disk) -> Self {
        Self {
            host,
            image,
            image_device,
            target_disk,
        }
    }

    /// Best image onto the preferred target, as used by unattended runs.
    pub fn auto(host: Arc<Host>) -> Result<Self> {
        let image = host
            .images
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("no image found"))?;
        let image_device = host
            .inventory
            .device_by_name(&image.device)
            .cloned()
            .with_context(|| format!("device {} holding the image is gone", image.device))?;
        let target_disk = host
            .target_disk()
            .cloned()
            .ok_or_else(|| anyhow!("no target disk present"))?;
        Ok(Self::new(host, image, image_device, target_disk))
    }

    pub fn image_fits_target(&self) -> bool {
        self.image.size <= self.target_disk.size
    }

    pub fn ensure_fits(&self) -> Result<(), FitError> {
        if self.image_fits_target() {
            Ok(())
        } else {
            Err(FitError {
                image_size: self.image.size,
                target_size: self.target_disk.size,
            })
        }
    }

    /// Device node of partition `num` on the target disk.
    pub fn target_partition(&self, num: u32) -> PathBuf {
        partition_path(&self.target_disk.path, num)
    }
}

/// Image larger than the chosen target disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitError {
    pub image_size: u64,
    pub target_size: u64,
}

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "image ({}) is larger than target disk ({})",
            format_size(self.image_size),
            format_size(self.target_size)
        )
    }
}

impl std::error::Error for FitError {}

/// `/dev/sda` + 2 → `/dev/sda2`; `/dev/nvme0n1` + 2 → `/dev/nvme0n1p2`.
pub fn partition_path(disk: &Path, num: u32) -> PathBuf {
    let base = disk.display().to_string();
    if base.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{base}p{num}"))
    } else {
        PathBuf::from(format!("{base}{num}"))
    }
}

/// The fixed pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StepKind {
    HardwareClock,
    Imager,
    BootOrder,
    ResizePartition,
    OffspotYaml,
    Docker,
}

impl StepKind {
    pub const ALL: [StepKind; 6] = [
        StepKind::HardwareClock,
        StepKind::Imager,
        StepKind::BootOrder,
        StepKind::ResizePartition,
        StepKind::OffspotYaml,
        StepKind::Docker,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn ident(self) -> &'static str {
        match self {
            StepKind::HardwareClock => "hwclock",
            StepKind::Imager => "imager",
            StepKind::BootOrder => "bootorder",
            StepKind::ResizePartition => "resize",
            StepKind::OffspotYaml => "offspot",
            StepKind::Docker => "docker",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StepKind::HardwareClock => "Set hardware clock",
            StepKind::Imager => "Flash image to disk",
            StepKind::BootOrder => "Set boot order",
            StepKind::ResizePartition => "Extend data partition",
            StepKind::OffspotYaml => "Configure hotspot",
            StepKind::Docker => "Load OCI images",
        }
    }

    pub fn reports_progress(self) -> bool {
        matches!(self, StepKind::Imager)
    }

    /// How often an observer should sample progress while the step runs.
    pub fn progress_interval(self) -> Option<Duration> {
        self.reports_progress().then(|| Duration::from_millis(100))
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Timings and parsed output of a flasher run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImagerStats {
    pub started_on: Option<OffsetDateTime>,
    pub ended_on: Option<OffsetDateTime>,
    pub progress: ImagerProgress,
    pub exit_code: Option<i32>,
}

impl ImagerStats {
    /// Seconds between start and end, `-1.0` until both are known.
    pub fn duration(&self) -> f64 {
        match (self.started_on, self.ended_on) {
            (Some(start), Some(end)) => seconds_between(start, end),
            _ => -1.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResult {
    pub succeeded: bool,
    pub success_text: String,
    pub error_text: String,
    pub debug_text: String,
    pub advice: Option<String>,
    pub imager_stats: Option<ImagerStats>,
}

impl StepResult {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            success_text: text.into(),
            ..Default::default()
        }
    }

    pub fn failed(text: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            error_text: text.into(),
            ..Default::default()
        }
    }

    /// Failure whose summary is the outermost context of `err`; the full
    /// chain goes to `debug_text` after any collected `notes`.
    pub fn from_error(err: &anyhow::Error, notes: &[String]) -> Self {
        let mut debug: Vec<String> = notes.to_vec();
        debug.push(format!("{err:#}"));
        Self::failed(err.to_string()).with_debug(debug.join("\n"))
    }

    pub fn with_debug(mut self, text: impl Into<String>) -> Self {
        self.debug_text = text.into();
        self
    }

    pub fn with_advice(mut self, text: impl Into<String>) -> Self {
        self.advice = Some(text.into());
        self
    }

    pub fn with_stats(mut self, stats: ImagerStats) -> Self {
        self.imager_stats = Some(stats);
        self
    }

    pub fn text(&self) -> &str {
        if self.succeeded {
            &self.success_text
        } else {
            &self.error_text
        }
    }
}

/// Latest progress a running step published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub percent: u32,
    pub text: String,
}

/// Shared handle between the step producing progress and whoever displays
/// it. Readers always see a complete snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProgressProbe(Arc<Mutex<Progress>>);

impl ProgressProbe {
    pub fn publish(&self, percent: u32, text: &str) {
        let mut current = self.0.lock().unwrap_or_else(|e| e.into_inner());
        current.percent = percent.min(100);
        if current.text != text {
            current.text = text.to_string();
        }
    }

    pub fn snapshot(&self) -> Progress {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// One unit of the pipeline.
///
/// `run` returns `Ok` for every outcome the step can describe, including
/// failures. `Err` means the step itself broke and the run is aborted.
/// A step releases whatever it mounted before returning from `run`;
/// `cleanup` is the backstop for what an aborted run left behind.
pub trait Step: Send {
    fn kind(&self) -> StepKind;

    fn run(&mut self, env: &Environment, verbose: bool) -> Result<StepResult>;

    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Present only for kinds that report progress.
    fn probe(&self) -> Option<ProgressProbe> {
        None
    }
}

/// Builds step instances on demand.
pub trait StepFactory: Send {
    fn build(&self, kind: StepKind) -> Box<dyn Step>;
}

/// Turns a non-zero exit into an error whose outermost message is `what`.
pub(crate) fn check(out: CmdOutput, what: &str) -> Result<CmdOutput> {
    if out.success() {
        return Ok(out);
    }
    let detail = anyhow!("exit code {}: {}", out.code, out.combined().trim());
    Err(detail.context(what.to_string()))
}

/// Like [`check`] for e2fsck, where 1 and 2 mean errors were corrected.
pub(crate) fn check_fsck(out: CmdOutput, what: &str) -> Result<CmdOutput> {
    if (0..4).contains(&out.code) {
        return Ok(out);
    }
    let detail = anyhow!("fsck exit code {}: {}", out.code, out.combined().trim());
    Err(detail.context(what.to_string()))
}

/// Path of `rel` below `root`, refusing anything that would escape it.
pub(crate) fn inside(root: &Path, rel: &Path) -> Result<PathBuf> {
    if rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        bail!("{} is not a relative path", rel.display());
    }
    Ok(root.join(rel))
}

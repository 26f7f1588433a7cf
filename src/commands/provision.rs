use std::{
    path::Path,
    sync::{
        Arc,
        atomic::AtomicBool,
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::Args;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use tracing as log;

use super::{confirm, gather, rc};
use crate::{
    AppCtx,
    host::Host,
    inventory::{Device, Inventory},
    provisioning::{
        Environment, Event, Outcome, PipelineReport, ProgressProbe, ProvisionManager,
        run_pipeline, steps::DefaultSteps,
    },
    tooling::{ToolScope, Toolbox},
    ui,
    utils::lock::ProvisionLock,
};

#[derive(Args, Debug)]
pub struct ProvisionArgs {
    /// Device holding the image (e.g. `/dev/sda1` or `sda1`). Manual mode.
    #[arg(long, requires_all = ["image", "target"])]
    pub source_device: Option<String>,

    /// Image path relative to the source device's root.
    #[arg(long, requires = "source_device")]
    pub image: Option<String>,

    /// Disk to flash (e.g. `/dev/nvme0n1`).
    #[arg(long, requires = "source_device")]
    pub target: Option<String>,

    /// Do not ask for confirmation.
    #[arg(short = 'y', long)]
    pub yes: bool,
}

/// Devices named for a manual run.
#[derive(Debug, Clone)]
pub struct ManualRequest {
    pub source_device: String,
    pub image: String,
    pub target: String,
}

/// Either something to provision or the code to exit with.
pub enum Selection {
    Go(Environment),
    Exit(i32),
}

impl ProvisionArgs {
    fn manual(&self) -> Option<ManualRequest> {
        match (&self.source_device, &self.image, &self.target) {
            (Some(source_device), Some(image), Some(target)) => Some(ManualRequest {
                source_device: source_device.clone(),
                image: image.clone(),
                target: target.clone(),
            }),
            _ => None,
        }
    }

    pub fn run(&self, ctx: &AppCtx) -> Result<i32> {
        Toolbox::ensure_bins(ToolScope::Provision)?;
        let _lock = ProvisionLock::acquire("provision")?;

        let stop = Arc::new(AtomicBool::new(false));
        for sig in [SIGINT, SIGTERM, SIGQUIT] {
            signal_hook::flag::register(sig, Arc::clone(&stop))
                .with_context(|| format!("register handler for signal {sig}"))?;
        }

        let (tools, host) = gather(ctx)?;
        let host = Arc::new(host);
        let mut ask = |q: &str| confirm(q);
        let selection = match self.manual() {
            Some(req) => select_manual(host, &req, self.yes, &mut ask)?,
            None => select_auto(host, self.yes, &mut ask)?,
        };
        let env = match selection {
            Selection::Go(env) => env,
            Selection::Exit(code) => return Ok(code),
        };

        let factory = DefaultSteps::new(tools, ctx.cfg.clone());
        let mut manager = ProvisionManager::new(env, Box::new(factory));
        let report = drive(&mut manager, ctx.debug, &stop)?;

        ui::report_table(&report).printstd();
        for line in ui::report_summary(&report) {
            println!("{line}");
        }
        Ok(exit_code(&report))
    }
}

/// Unattended choice: best image onto the only NVMe target.
pub fn select_auto(
    host: Arc<Host>,
    yes: bool,
    ask: &mut dyn FnMut(&str) -> Result<bool>,
) -> Result<Selection> {
    let readiness = host.provision_ready();
    if !readiness.is_ready() {
        log::error!("[provision] {}", ui::readiness_line(&readiness));
        return Ok(Selection::Exit(rc::NOT_READY));
    }
    let env = Environment::auto(host)?;
    if let Err(e) = env.ensure_fits() {
        log::error!("[provision] {e}");
        return Ok(Selection::Exit(rc::DOES_NOT_FIT));
    }
    ui::plan_table(&env).printstd();
    if !yes && !ask("Flash this image? All data on the target disk will be lost.")? {
        return Ok(Selection::Exit(rc::DECLINED));
    }
    Ok(Selection::Go(env))
}

pub fn select_manual(
    host: Arc<Host>,
    req: &ManualRequest,
    yes: bool,
    ask: &mut dyn FnMut(&str) -> Result<bool>,
) -> Result<Selection> {
    let Some(source) = resolve(&host.inventory, &req.source_device).cloned() else {
        log::error!("[provision] source device {} not found", req.source_device);
        return Ok(Selection::Exit(rc::NOT_FOUND));
    };
    let Some(source_disk) = host.inventory.disk_of(&source).map(|d| d.name.clone()) else {
        log::error!("[provision] no disk holds {}", source.name);
        return Ok(Selection::Exit(rc::NOT_FOUND));
    };
    let is_media = host.media_disks().iter().any(|d| d.name == source_disk);
    if !is_media
        && !yes
        && !ask(&format!("{} is not a detected source disk. Use it anyway?", source.name))?
    {
        return Ok(Selection::Exit(rc::DECLINED));
    }

    let relpath = Path::new(req.image.trim_start_matches('/'));
    let Some(image) = host
        .images
        .iter()
        .find(|i| i.device == source.name && i.relpath == relpath)
        .cloned()
    else {
        log::error!("[provision] image {} not found on {}", relpath.display(), source.name);
        return Ok(Selection::Exit(rc::NOT_FOUND));
    };

    let Some(target) = resolve(&host.inventory, &req.target)
        .and_then(|d| host.inventory.disk_by_name(&d.name))
        .cloned()
    else {
        log::error!("[provision] target disk {} not found", req.target);
        return Ok(Selection::Exit(rc::NOT_FOUND));
    };
    if target.name == source_disk {
        bail!("target disk {} holds the source image", target.name);
    }
    let is_target = host.target_disks().iter().any(|d| d.name == target.name);
    if !is_target
        && !yes
        && !ask(&format!("{} is not a detected target disk. Use it anyway?", target.name))?
    {
        return Ok(Selection::Exit(rc::DECLINED));
    }

    let env = Environment::new(host, image, source, target);
    if let Err(e) = env.ensure_fits() {
        log::error!("[provision] {e}");
        return Ok(Selection::Exit(rc::DOES_NOT_FIT));
    }
    ui::plan_table(&env).printstd();
    Ok(Selection::Go(env))
}

/// `/dev/sda1` or `sda1`.
fn resolve<'a>(inventory: &'a Inventory, arg: &str) -> Option<&'a Device> {
    if arg.starts_with('/') {
        inventory.device_by_path(Path::new(arg))
    } else {
        inventory.device_by_name(arg)
    }
}

const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Runs the pipeline on a worker thread and reports progress from this one.
fn drive(manager: &mut ProvisionManager, verbose: bool, stop: &AtomicBool) -> Result<PipelineReport> {
    let (tx, rx) = mpsc::channel();
    thread::scope(|s| {
        let worker = s.spawn(move || run_pipeline(manager, verbose, stop, &tx));

        let mut probe: Option<ProgressProbe> = None;
        let mut last = None;
        let mut wait = IDLE_WAIT;
        loop {
            match rx.recv_timeout(wait) {
                Ok(Event::StepStarted {
                    kind, probe: p, ..
                }) => {
                    log::info!("{} {}", ui::step_prefix(kind), kind.name());
                    wait = kind.progress_interval().unwrap_or(IDLE_WAIT);
                    probe = p;
                    last = None;
                }
                Ok(Event::StepFinished { kind, result }) => {
                    probe = None;
                    if result.succeeded {
                        log::info!("{} {}", ui::step_prefix(kind), result.text());
                    } else {
                        log::error!("{} {}", ui::step_prefix(kind), result.text());
                    }
                }
                Ok(Event::StepAborted { kind, error }) => {
                    probe = None;
                    log::error!("{} {error}", ui::step_prefix(kind));
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(p) = &probe {
                        let now = p.snapshot();
                        if last.as_ref() != Some(&now) {
                            log::info!("[imager] {:>3}% {}", now.percent, now.text);
                            last = Some(now);
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        match worker.join() {
            Ok(report) => Ok(report),
            Err(_) => bail!("provisioning thread panicked"),
        }
    })
}

pub fn exit_code(report: &PipelineReport) -> i32 {
    match report.outcome {
        Outcome::Completed => rc::OK,
        Outcome::Stopped(_) => rc::SIGNALED,
        Outcome::Rejected(_) => rc::DOES_NOT_FIT,
        Outcome::Failed(_) | Outcome::Aborted { .. } => rc::FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{host::fixtures::ready_host, provisioning::StepKind};

    fn never(_: &str) -> Result<bool> {
        panic!("unexpected question")
    }

    fn request(source: &str, image: &str, target: &str) -> ManualRequest {
        ManualRequest {
            source_device: source.into(),
            image: image.into(),
            target: target.into(),
        }
    }

    fn relpath(host: &Host) -> String {
        host.images[0].relpath.display().to_string()
    }

    fn code(sel: Selection) -> Option<i32> {
        match sel {
            Selection::Go(_) => None,
            Selection::Exit(code) => Some(code),
        }
    }

    #[test]
    fn manual_resolves_paths_and_names() {
        let host = ready_host();
        let image = format!("/{}", relpath(&host));
        let req = request("/dev/sda1", &image, "nvme0n1");
        match select_manual(Arc::new(host), &req, false, &mut never).unwrap() {
            Selection::Go(env) => {
                assert_eq!(env.image_device.name, "sda1");
                assert_eq!(env.target_disk.name, "nvme0n1");
            }
            Selection::Exit(code) => panic!("exited with {code}"),
        }
    }

    #[test]
    fn manual_missing_things_are_not_found() {
        let host = Arc::new(ready_host());
        let image = relpath(&host);
        for req in [
            request("sdz1", &image, "nvme0n1"),
            request("sda1", "nope.img", "nvme0n1"),
            request("sda1", &image, "/dev/nvme9n1"),
        ] {
            let sel = select_manual(host.clone(), &req, false, &mut never).unwrap();
            assert_eq!(code(sel), Some(rc::NOT_FOUND), "{req:?}");
        }
    }

    #[test]
    fn manual_unusual_target_asks_first() {
        let host = Arc::new(ready_host());
        let req = request("sda1", &relpath(&host), "mmcblk0");
        let mut asked = Vec::new();
        let mut decline = |q: &str| {
            asked.push(q.to_string());
            Ok(false)
        };
        let sel = select_manual(host.clone(), &req, false, &mut decline).unwrap();
        assert_eq!(code(sel), Some(rc::DECLINED));
        assert_eq!(asked, ["mmcblk0 is not a detected target disk. Use it anyway?"]);

        let sel = select_manual(host, &req, true, &mut never).unwrap();
        assert_eq!(code(sel), None);
    }

    #[test]
    fn manual_refuses_source_as_target() {
        let host = Arc::new(ready_host());
        let req = request("sda1", &relpath(&host), "sda");
        assert!(select_manual(host, &req, true, &mut never).is_err());
    }

    #[test]
    fn manual_too_large_image() {
        let mut host = ready_host();
        host.images[0].size = 300_000_000_000;
        let host = Arc::new(host);
        let req = request("sda1", &relpath(&host), "nvme0n1");
        let sel = select_manual(host, &req, false, &mut never).unwrap();
        assert_eq!(code(sel), Some(rc::DOES_NOT_FIT));
    }

    #[test]
    fn auto_requires_readiness_and_consent() {
        let mut host = ready_host();
        host.clock.ntp_synced = false;
        let sel = select_auto(Arc::new(host), true, &mut never).unwrap();
        assert_eq!(code(sel), Some(rc::NOT_READY));

        let mut decline = |_: &str| Ok(false);
        let sel = select_auto(Arc::new(ready_host()), false, &mut decline).unwrap();
        assert_eq!(code(sel), Some(rc::DECLINED));

        let sel = select_auto(Arc::new(ready_host()), true, &mut never).unwrap();
        assert_eq!(code(sel), None);
    }

    #[test]
    fn exit_codes() {
        let report = |outcome| PipelineReport {
            outcome,
            results: Vec::new(),
            duration: 0.0,
            cleanup_failures: 0,
        };
        assert_eq!(exit_code(&report(Outcome::Completed)), rc::OK);
        assert_eq!(exit_code(&report(Outcome::Stopped(StepKind::Docker))), rc::SIGNALED);
        assert_eq!(exit_code(&report(Outcome::Rejected("big".into()))), rc::DOES_NOT_FIT);
        assert_eq!(exit_code(&report(Outcome::Failed(StepKind::Imager))), rc::FAILURE);
    }
}

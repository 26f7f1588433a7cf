use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use tracing as log;

use crate::{
    provisioning::{
        Environment, ImagerProgress, ImagerStats, ProgressProbe, Step, StepKind, StepResult,
        inside,
    },
    tooling::{ImagerPort, MountPort},
    utils::{human::format_duration, time::now},
};

/// Flashes the chosen image onto the target disk with the external flasher.
pub struct ImagerStep {
    imager: Arc<dyn ImagerPort>,
    mount: Arc<dyn MountPort>,
    poll: Duration,
    probe: ProgressProbe,
    stats: ImagerStats,
    /// Where the image device is mounted while the flasher runs.
    mountpoint: Option<PathBuf>,
}

impl ImagerStep {
    pub fn new(imager: Arc<dyn ImagerPort>, mount: Arc<dyn MountPort>, poll: Duration) -> Self {
        Self {
            imager,
            mount,
            poll,
            probe: ProgressProbe::default(),
            stats: ImagerStats::default(),
            mountpoint: None,
        }
    }

    pub fn stats(&self) -> &ImagerStats {
        &self.stats
    }

    fn publish(&self) {
        let p = &self.stats.progress;
        self.probe.publish(p.progress(), p.phase());
    }

    /// Keeps the mountpoint on failure so `cleanup` can try again.
    fn release_mount(&mut self) -> Result<()> {
        if let Some(mp) = &self.mountpoint {
            self.mount
                .unmount(mp)
                .with_context(|| format!("unmount image device at {}", mp.display()))?;
            self.mountpoint = None;
        }
        Ok(())
    }

    /// Runs the flasher to completion, returning its exit code and transcript.
    fn flash(&mut self, image: &Path, target: &Path) -> Result<(i32, String)> {
        self.stats = ImagerStats {
            started_on: Some(now()),
            ..Default::default()
        };
        self.publish();

        let mut run = self
            .imager
            .spawn(image, target)
            .context("Failed to start imager")?;
        let code = loop {
            let status = run.try_wait().context("Failed to follow imager")?;
            self.stats.progress.parse(&run.output());
            self.publish();
            if let Some(code) = status {
                break code;
            }
            thread::sleep(self.poll);
        };
        let transcript = run.output();
        self.stats.progress.parse(&transcript);
        self.stats.exit_code = Some(code);
        if self.stats.ended_on.is_none() {
            self.stats.ended_on = Some(now());
        }
        self.publish();
        Ok((code, transcript))
    }
}

impl Step for ImagerStep {
    fn kind(&self) -> StepKind {
        StepKind::Imager
    }

    fn probe(&self) -> Option<ProgressProbe> {
        Some(self.probe.clone())
    }

    fn run(&mut self, env: &Environment, verbose: bool) -> Result<StepResult> {
        if self.imager.binary().is_none() {
            return Ok(StepResult::failed("Imager is not installed")
                .with_advice("Install rpi-imager on the provisioning system"));
        }

        let device = &env.image_device.path;
        let mountpoint = match self.mount.mount_to_temp(device, false) {
            Ok(mp) => mp,
            Err(e) => {
                let e = e.context("Failed to mount image device");
                return Ok(StepResult::from_error(&e, &[format!("device: {}", device.display())]));
            }
        };
        self.mountpoint = Some(mountpoint.clone());

        let target = env.target_disk.path.clone();
        let flashed = inside(&mountpoint, &env.image.relpath)
            .and_then(|image| self.flash(&image, &target).map(|out| (image, out)));

        if let Err(e) = self.release_mount() {
            log::warn!("[imager] {e:#}");
        }

        let (image, (code, transcript)) = match flashed {
            Ok(v) => v,
            Err(e) => {
                return Ok(StepResult::from_error(&e, &[format!("target: {}", target.display())])
                    .with_stats(self.stats.clone()));
            }
        };
        if verbose {
            log::info!("[imager] output:\n{transcript}");
        }

        if code != 0 {
            log::error!("[imager] exited with {code}");
            let debug = format!(
                "fpath: {}\ntarget: {}\nexit code: {code}\n{transcript}",
                image.display(),
                target.display()
            );
            return Ok(StepResult::failed("Failed to flash image to disk")
                .with_debug(debug)
                .with_stats(self.stats.clone()));
        }

        let p = &self.stats.progress;
        let text = format!(
            "Image flashed in {} (write {}, verify {})",
            format_duration(self.stats.duration()),
            format_duration(p.write_duration),
            format_duration(p.verify_duration)
        );
        Ok(StepResult::success(text).with_stats(self.stats.clone()))
    }

    fn cleanup(&mut self) -> Result<()> {
        self.release_mount()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        provisioning::fixtures::environment,
        tooling::mock::{MockImager, MockMount},
    };

    fn chunks() -> Vec<String> {
        [
            "Hash of uncompressed image: \"c0ffee\"\n",
            "Done zeroing out start and end of drive\n  Writing: [==>   ] 40 %\n",
            "  Writing: [=====] 100 %\nWrite done in 30 seconds\n",
            "  Verifying: [==>  ] 50 %\n",
            "Verify done in 10 seconds\nVerify hash: \"c0ffee\"\nWrite successful.\n",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    fn step(installed: bool, code: i32) -> (ImagerStep, Arc<MockImager>, Arc<MockMount>) {
        let imager = Arc::new(MockImager {
            installed,
            chunks: chunks(),
            code,
            spawned: Mutex::new(Vec::new()),
        });
        let mount = Arc::new(MockMount::default());
        let step = ImagerStep::new(imager.clone(), mount.clone(), Duration::from_millis(1));
        (step, imager, mount)
    }

    #[test]
    fn flashes_and_reports_stats() {
        let env = environment();
        let (mut s, imager, mount) = step(true, 0);
        let r = s.run(&env, false).unwrap();
        assert!(r.succeeded, "{r:?}");

        let spawned = imager.spawned.lock().unwrap();
        let fixture = mount.fixture("/dev/sda1");
        assert_eq!(spawned[0].0, fixture.join(&env.image.relpath));
        assert_eq!(spawned[0].1, PathBuf::from("/dev/nvme0n1"));

        let stats = r.imager_stats.unwrap();
        assert_eq!(stats.exit_code, Some(0));
        assert!(stats.progress.finalizing_done);
        assert_eq!(stats.progress.img_hash, "c0ffee");
        assert_eq!(stats.progress.write_duration, 30.0);
        assert!(stats.duration() >= 0.0);
        assert_eq!(s.probe().unwrap().snapshot().percent, 100);
        assert_eq!(s.probe().unwrap().snapshot().text, "Completed");
        assert_eq!(mount.temp_mounts(), 1);
        assert!(mount.balanced());
    }

    #[test]
    fn non_zero_exit_fails_but_unmounts() {
        let env = environment();
        let (mut s, _, mount) = step(true, 1);
        let r = s.run(&env, false).unwrap();
        assert!(!r.succeeded);
        assert_eq!(r.error_text, "Failed to flash image to disk");
        assert!(r.debug_text.contains("target: /dev/nvme0n1"));
        assert!(r.debug_text.contains("Write successful."));
        assert!(mount.balanced());
        // nothing left for cleanup
        s.cleanup().unwrap();
        assert_eq!(mount.temp_unmounts(), 1);
    }

    #[test]
    fn missing_binary_is_a_failed_step() {
        let env = environment();
        let (mut s, _, mount) = step(false, 0);
        let r = s.run(&env, false).unwrap();
        assert_eq!(r.error_text, "Imager is not installed");
        assert_eq!(mount.temp_mounts(), 0);
    }

    #[test]
    fn mount_failure_is_reported() {
        let env = environment();
        let (mut s, imager, mount) = step(true, 0);
        mount.fail_on("/dev/sda1");
        let r = s.run(&env, false).unwrap();
        assert_eq!(r.error_text, "Failed to mount image device");
        assert!(imager.spawned.lock().unwrap().is_empty());
        assert!(mount.balanced());
    }

    #[test]
    fn failed_unmount_is_retried_by_cleanup() {
        let env = environment();
        let (mut s, _, mount) = step(true, 0);
        mount.fail_next_unmounts(1);
        let r = s.run(&env, false).unwrap();
        assert!(r.succeeded, "{r:?}");
        assert!(!mount.balanced());
        s.cleanup().unwrap();
        assert!(mount.balanced());
        assert_eq!(mount.temp_unmounts(), 1);
    }

    #[test]
    fn progress_is_published_while_running() {
        let env = environment();
        let (mut s, _, _) = step(true, 0);
        let probe = s.probe().unwrap();
        assert_eq!(probe.snapshot().percent, 0);
        s.run(&env, false).unwrap();
        assert_eq!(probe.snapshot().percent, 100);
    }
}

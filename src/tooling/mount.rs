use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use anyhow::{Context, Result};
use tracing as log;

use crate::{
    config::Timing,
    utils::process::{CmdSpec, Runner, StdioSpec},
};

pub const REQ_BINS: &[&str] = &["mount", "umount", "sync"];

type DynRunner = dyn Runner + Send + Sync;

/// Mount discipline for every component touching filesystems.
///
/// Each successful `mount_to_temp` must be paired with one `unmount` of
/// the returned path; `unmount` also removes the temporary directory.
pub trait MountPort: Send + Sync {
    fn mount(&self, dev: &Path, target: &Path, rw: bool) -> Result<()>;
    fn mount_to_temp(&self, dev: &Path, rw: bool) -> Result<PathBuf>;
    /// Pseudo filesystems (`proc`, `sysfs`, `devpts`).
    fn mount_fs(&self, fstype: &str, what: &str, target: &Path) -> Result<()>;
    fn rbind(&self, src: &Path, target: &Path) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;
    /// Same as `unmount` after the configured settle delay.
    fn timed_unmount(&self, target: &Path) -> Result<()>;
    fn unmount_recursive(&self, target: &Path, lazy: bool) -> Result<()>;
    fn sync(&self);
}

pub struct MountCli {
    runner: Arc<DynRunner>,
    timing: Timing,
}

impl MountCli {
    pub fn new(runner: Arc<DynRunner>, timing: Timing) -> Self {
        Self { runner, timing }
    }

    #[inline]
    fn mount_cmd(&self, dev: &Path, target: &Path, rw: bool) -> CmdSpec {
        CmdSpec::new("mount")
            .arg(if rw { "-orw" } else { "-oro" })
            .arg(dev.display().to_string())
            .arg(target.display().to_string())
            .stdout(StdioSpec::Null)
    }

    #[inline]
    fn umount_cmd(&self, target: &Path) -> CmdSpec {
        CmdSpec::new("umount")
            .arg("-f")
            .arg(target.display().to_string())
            .stdout(StdioSpec::Null)
    }

    fn settle(&self) {
        if !self.timing.mount_settle.is_zero() {
            thread::sleep(self.timing.mount_settle);
        }
    }
}

impl MountPort for MountCli {
    fn mount(&self, dev: &Path, target: &Path, rw: bool) -> Result<()> {
        log::debug!("[mount] {} -> {}", dev.display(), target.display());
        self.runner
            .run(&self.mount_cmd(dev, target, rw))
            .with_context(|| format!("mount {} on {}", dev.display(), target.display()))?;
        self.settle();
        Ok(())
    }

    fn mount_to_temp(&self, dev: &Path, rw: bool) -> Result<PathBuf> {
        let name = dev
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dev".into());
        let mountpoint = tempfile::Builder::new()
            .prefix(&format!("{name}_"))
            .suffix(".mnt")
            .tempdir()
            .context("create temporary mountpoint")?
            .keep();

        if let Err(e) = self.mount(dev, &mountpoint, rw) {
            let _ = fs::remove_dir(&mountpoint);
            return Err(e);
        }
        Ok(mountpoint)
    }

    fn mount_fs(&self, fstype: &str, what: &str, target: &Path) -> Result<()> {
        let cmd = CmdSpec::new("mount")
            .args(["-t", fstype, what])
            .arg(target.display().to_string())
            .stdout(StdioSpec::Null);
        self.runner
            .run(&cmd)
            .with_context(|| format!("mount -t {fstype} {what} {}", target.display()))
    }

    fn rbind(&self, src: &Path, target: &Path) -> Result<()> {
        let cmd = CmdSpec::new("mount")
            .arg("--rbind")
            .arg(src.display().to_string())
            .arg(target.display().to_string())
            .stdout(StdioSpec::Null);
        self.runner
            .run(&cmd)
            .with_context(|| format!("rbind {} on {}", src.display(), target.display()))
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        log::debug!("[mount] unmounting {}", target.display());
        self.sync();
        self.runner
            .run(&self.umount_cmd(target))
            .with_context(|| format!("umount {}", target.display()))?;
        if is_temp_mountpoint(target) {
            let _ = fs::remove_dir(target);
        }
        Ok(())
    }

    fn timed_unmount(&self, target: &Path) -> Result<()> {
        let delay = self.timing.unmount_delay;
        if !delay.is_zero() {
            log::debug!(
                "[mount] sleeping {}ms before unmounting {}",
                delay.as_millis(),
                target.display()
            );
            thread::sleep(delay);
        }
        self.unmount(target)
    }

    fn unmount_recursive(&self, target: &Path, lazy: bool) -> Result<()> {
        let mut cmd = CmdSpec::new("umount");
        if lazy {
            cmd = cmd.arg("-l");
        }
        let cmd = cmd
            .arg("--recursive")
            .arg(target.display().to_string())
            .stdout(StdioSpec::Null)
            .stderr(StdioSpec::Null);
        self.runner
            .run(&cmd)
            .with_context(|| format!("umount --recursive {}", target.display()))
    }

    fn sync(&self) {
        let _ = self.runner.run(&CmdSpec::new("sync"));
    }
}

/// Directories created by `mount_to_temp` live in the temp dir with a `.mnt`
/// suffix; anything else is left in place after unmounting.
fn is_temp_mountpoint(path: &Path) -> bool {
    path.starts_with(std::env::temp_dir())
        && path.extension().is_some_and(|ext| ext == "mnt")
}

#[cfg(test)]
pub fn no_delays() -> Timing {
    Timing {
        mount_settle: std::time::Duration::ZERO,
        unmount_delay: std::time::Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::utils::process::CmdOutput;

    #[derive(Default)]
    struct Recorder {
        cmds: Mutex<Vec<String>>,
        fail_program: Option<&'static str>,
    }

    impl Runner for Recorder {
        fn run_output(&self, cmd: &CmdSpec) -> Result<CmdOutput> {
            self.cmds.lock().unwrap().push(cmd.render());
            let code = if Some(cmd.program()) == self.fail_program { 32 } else { 0 };
            Ok(CmdOutput {
                code,
                stdout: String::new(),
                stderr: "boom".into(),
            })
        }
    }

    #[test]
    fn temp_mount_is_removed_on_unmount() {
        let rec = Arc::new(Recorder::default());
        let cli = MountCli::new(rec.clone(), no_delays());
        let mp = cli.mount_to_temp(Path::new("/dev/sda1"), false).unwrap();
        let name = mp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("sda1_") && name.ends_with(".mnt"), "{name}");
        assert!(mp.is_dir());

        cli.unmount(&mp).unwrap();
        assert!(!mp.exists());

        let cmds = rec.cmds.lock().unwrap();
        assert!(cmds[0].starts_with("mount -oro /dev/sda1 "));
        assert_eq!(cmds[1], "sync");
        assert!(cmds[2].starts_with("umount -f "));
    }

    #[test]
    fn failed_mount_leaves_no_directory() {
        let rec = Arc::new(Recorder {
            fail_program: Some("mount"),
            ..Default::default()
        });
        let cli = MountCli::new(rec, no_delays());
        let before: Vec<_> = fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("zzfail_"))
            .collect();
        assert!(cli.mount_to_temp(Path::new("/dev/zzfail"), true).is_err());
        let after: Vec<_> = fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("zzfail_"))
            .collect();
        assert_eq!(before.len(), after.len());
    }

    #[test]
    fn lazy_recursive_unmount() {
        let rec = Arc::new(Recorder::default());
        let cli = MountCli::new(rec.clone(), no_delays());
        cli.unmount_recursive(Path::new("/tmp/root.mnt/proc"), true)
            .unwrap();
        assert_eq!(
            rec.cmds.lock().unwrap()[0],
            "umount -l --recursive /tmp/root.mnt/proc"
        );
    }
}

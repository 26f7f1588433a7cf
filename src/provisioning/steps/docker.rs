use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use tracing as log;

use crate::{
    config::Chroot,
    provisioning::{Environment, Step, StepKind, StepResult},
    tooling::{ChrootPort, MountPort},
};

const LOADER_SCRIPT_PATH: &str = "usr/local/bin/load-images-from-chroot.sh";
const CGROUPFS_HELPERS: [&str; 2] = ["cgroupfs-mount", "cgroupfs-umount"];
/// Nested mounts below the chroot root, torn down before the root itself.
const NESTED_MOUNTS: [&str; 4] = ["data", "dev", "proc", "sys"];

const LOADER_SCRIPT: &str = r#"#!/bin/bash

set -e

echo "mounting cgroupfs"
cgroupfs-mount

echo "starting balena engine"
/usr/local/bin/balena-engine-daemon &
sleep 10

echo "starting images loader"
/usr/sbin/docker-images-loader.py

echo "listing loaded images"
docker images

echo "unmounting cgroupfs"
cgroupfs-umount

echo "done."
"#;

/// Loads the OCI images shipped on the data partition into the target's
/// container engine, from a chroot into the target's root filesystem.
pub struct DockerStep {
    mount: Arc<dyn MountPort>,
    chroot: Arc<dyn ChrootPort>,
    settings: Chroot,
    /// Root of the chroot while anything is mounted below it.
    mountpoint: Option<PathBuf>,
}

impl DockerStep {
    pub fn new(mount: Arc<dyn MountPort>, chroot: Arc<dyn ChrootPort>, settings: Chroot) -> Self {
        Self {
            mount,
            chroot,
            settings,
            mountpoint: None,
        }
    }

    fn prepare_root(&mut self, env: &Environment, notes: &mut Vec<String>) -> Result<PathBuf> {
        let root = self
            .mount
            .mount_to_temp(&env.target_partition(2), true)
            .context("Failed to mount root partition")?;
        self.mountpoint = Some(root.clone());
        notes.push(format!("mountpoint: {}", root.display()));

        self.mount
            .mount(&env.target_partition(3), &root.join("data"), true)
            .context("Failed to mount data partition")?;

        for name in CGROUPFS_HELPERS {
            let dest = root.join("usr/bin").join(name);
            if dest.exists() {
                continue;
            }
            let src = self.settings.helper_dir.join(name);
            fs::copy(&src, &dest)
                .with_context(|| format!("copy {} to {}", src.display(), dest.display()))
                .context("Failed to copy cgroupfs-mount scripts")?;
        }

        self.mount
            .mount_fs("proc", "/proc", &root.join("proc"))
            .context("Failed to mount proc into chroot")?;
        self.mount
            .mount_fs("sysfs", "/sys", &root.join("sys"))
            .context("Failed to mount sysfs into chroot")?;
        self.mount
            .rbind(Path::new("/dev"), &root.join("dev"))
            .context("Failed to rbind-mount /dev into chroot")?;

        let resolv = root.join("etc/resolv.conf");
        // often a dangling symlink to systemd-resolved's file
        if resolv.is_symlink() {
            let _ = fs::remove_file(&resolv);
        }
        fs::copy(&self.settings.resolv_conf, &resolv)
            .with_context(|| format!("copy {}", self.settings.resolv_conf.display()))
            .context("Failed to copy resolv.conf")?;

        let script = root.join(LOADER_SCRIPT_PATH);
        fs::write(&script, LOADER_SCRIPT)
            .and_then(|_| fs::set_permissions(&script, fs::Permissions::from_mode(0o755)))
            .with_context(|| format!("write {}", script.display()))
            .context("Failed to copy images loader script")?;
        Ok(root)
    }

    fn load_images(&mut self, env: &Environment, verbose: bool, notes: &mut Vec<String>) -> Result<()> {
        let root = self.prepare_root(env, notes)?;
        if verbose {
            log::info!("[docker] {LOADER_SCRIPT_PATH}:\n{LOADER_SCRIPT}");
        }

        let script = format!("/{LOADER_SCRIPT_PATH}");
        let out = if verbose {
            self.chroot.exec(&root, &script, &[])
        } else {
            self.chroot.exec_quiet(&root, &script)
        }
        .context("Failed to run chroot loader script")?;
        if !out.success() {
            // the script unmounts cgroupfs last; it most likely did not get there
            if let Err(e) = self.chroot.exec(&root, "cgroupfs-umount", &[]) {
                log::warn!("[docker] cgroupfs-umount failed: {e:#}");
            }
            return Err(anyhow!("exit code {}: {}", out.code, out.combined().trim()))
                .context("Failed to run chroot loader script");
        }
        Ok(())
    }

    /// Best-effort teardown of the chroot, nested mounts first, each
    /// retried lazily. Errors are logged, never returned: several of these
    /// are expected to fail when a stage was never reached.
    fn unmount_everything(&mut self) {
        let Some(root) = self.mountpoint.take() else {
            return;
        };
        for name in NESTED_MOUNTS {
            let target = root.join(name);
            for lazy in [false, true] {
                if let Err(e) = self.mount.unmount_recursive(&target, lazy) {
                    log::debug!("[docker] {e:#}");
                }
            }
        }
        for lazy in [false, true] {
            if let Err(e) = self.mount.unmount_recursive(&root, lazy) {
                log::debug!("[docker] {e:#}");
            }
        }
        let _ = fs::remove_dir(&root);

        // rbind teardown takes the host's devpts along
        if let Err(e) = self.mount.mount_fs("devpts", "none", Path::new("/dev/pts")) {
            log::warn!("[docker] remounting /dev/pts failed: {e:#}");
        }
    }
}

impl Step for DockerStep {
    fn kind(&self) -> StepKind {
        StepKind::Docker
    }

    fn run(&mut self, env: &Environment, verbose: bool) -> Result<StepResult> {
        let mut notes = vec![
            format!("root: {}", env.target_partition(2).display()),
            format!("data: {}", env.target_partition(3).display()),
        ];
        let loaded = self.load_images(env, verbose, &mut notes);
        self.unmount_everything();
        Ok(match loaded {
            Ok(()) => StepResult::success("OCI images loaded"),
            Err(e) => StepResult::from_error(&e, &notes),
        })
    }

    fn cleanup(&mut self) -> Result<()> {
        self.unmount_everything();
        Ok(())
    }
}

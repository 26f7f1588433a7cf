use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use fs2::FileExt;

const DEFAULT_LOCK_DIR: &str = "/run/lock";

/// Exclusive advisory lock held for the whole provisioning run.
///
/// The lock file records the holder's pid and purpose so a second
/// invocation can say who is in the way.
pub struct ProvisionLock {
    file: File,
    path: PathBuf,
}

impl std::fmt::Debug for ProvisionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionLock")
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for ProvisionLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl ProvisionLock {
    pub fn acquire(purpose: &str) -> Result<Self> {
        let dir = Path::new(DEFAULT_LOCK_DIR);
        let dir = if writable_dir(dir) {
            dir.to_path_buf()
        } else {
            std::env::temp_dir()
        };
        Self::acquire_in(&dir, purpose)
    }

    pub fn acquire_in(dir: &Path, purpose: &str) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create lock dir {}", dir.display()))?;
        let path = dir.join("provisioner.lock");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open lockfile {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let holder = read_holder(&mut file).unwrap_or_default();
                let holder = if holder.is_empty() {
                    "unknown holder".to_string()
                } else {
                    holder
                };
                bail!(
                    "another provisioning run holds {} ({holder})",
                    path.display()
                )
            }
            Err(e) => return Err(e).with_context(|| format!("flock {}", path.display())),
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "pid={} purpose={purpose}", std::process::id())
            .with_context(|| format!("write lockfile {}", path.display()))?;
        file.sync_all()?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_holder(file: &mut File) -> Result<String> {
    let mut s = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut s)?;
    Ok(s.trim().to_string())
}

fn writable_dir(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    let probe = dir.join(".provisioner_lock_probe");
    match File::create(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(probe);
            true
        }
        Err(_) => false,
    }
}

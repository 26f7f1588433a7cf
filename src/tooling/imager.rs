use std::{
    fs::File,
    io::{ErrorKind, Read},
    os::fd::AsFd,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
    pty::{OpenptyResult, Winsize, openpty},
    sys::termios::Termios,
};
use tracing as log;

use crate::{
    config::Imager,
    utils::{bins::which, process::exit_code},
};

const READ_CHUNK: usize = 1024;

/// Launches the external flasher.
pub trait ImagerPort: Send + Sync {
    /// Resolved path of the flasher binary, if installed.
    fn binary(&self) -> Option<PathBuf>;
    fn spawn(&self, image: &Path, target: &Path) -> Result<Box<dyn ImagerRun>>;
}

/// A running flasher whose terminal output is being collected.
pub trait ImagerRun: Send {
    /// Everything printed so far, CR and CRLF normalised to LF.
    fn output(&self) -> String;
    /// Exit code once the process has ended.
    fn try_wait(&mut self) -> Result<Option<i32>>;
    fn kill(&mut self);
}

pub struct RpiImagerCli {
    binary: String,
    poll_timeout: Duration,
}

impl RpiImagerCli {
    pub fn new(cfg: &Imager) -> Self {
        Self {
            binary: cfg.binary.clone(),
            poll_timeout: cfg.poll_timeout,
        }
    }

    pub fn args(image: &Path, target: &Path) -> Vec<String> {
        vec![
            "--cli".into(),
            "--disable-eject".into(),
            "--debug".into(),
            image.display().to_string(),
            target.display().to_string(),
        ]
    }
}

impl ImagerPort for RpiImagerCli {
    fn binary(&self) -> Option<PathBuf> {
        which(&self.binary)
    }

    fn spawn(&self, image: &Path, target: &Path) -> Result<Box<dyn ImagerRun>> {
        let bin = self
            .binary()
            .ok_or_else(|| anyhow!("{} not found in PATH", self.binary))?;

        // the flasher redraws progress with bare CRs, which it only emits
        // when attached to a terminal
        let winsize = Winsize {
            ws_row: 24,
            ws_col: 200,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let OpenptyResult { master, slave } =
            openpty(Some(&winsize), None::<&Termios>).context("openpty")?;
        let out = slave.try_clone().context("dup pty slave")?;
        let err = slave.try_clone().context("dup pty slave")?;

        let args = Self::args(image, target);
        log::debug!("[imager] exec: {} {}", bin.display(), args.join(" "));
        let child = Command::new(&bin)
            .args(&args)
            .env("LANG", "C.UTF-8")
            .env("LC_ALL", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err))
            .spawn()
            .with_context(|| format!("spawn {}", bin.display()))?;
        drop(slave);

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let buffer = buffer.clone();
            let stop = stop.clone();
            let timeout = self.poll_timeout;
            thread::Builder::new()
                .name("imager-pty".into())
                .spawn(move || drain_pty(File::from(master), buffer, stop, timeout))
                .context("spawn pty reader")?
        };

        Ok(Box::new(RpiImagerRun {
            child,
            buffer,
            stop,
            reader: Some(reader),
            code: None,
        }))
    }
}

struct RpiImagerRun {
    child: Child,
    buffer: Arc<Mutex<Vec<u8>>>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    code: Option<i32>,
}

impl RpiImagerRun {
    fn finish_reader(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                log::warn!("[imager] pty reader panicked");
            }
        }
    }
}

impl ImagerRun for RpiImagerRun {
    fn output(&self) -> String {
        let raw = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        normalize_newlines(&String::from_utf8_lossy(&raw))
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        if let Some(code) = self.code {
            return Ok(Some(code));
        }
        match self.child.try_wait().context("poll imager process")? {
            Some(status) => {
                // reader drains what is left before noticing the stop flag
                self.finish_reader();
                let code = exit_code(status);
                self.code = Some(code);
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    fn kill(&mut self) {
        if self.code.is_none() {
            let _ = self.child.kill();
            if let Ok(status) = self.child.wait() {
                self.code = Some(exit_code(status));
            }
        }
        self.finish_reader();
    }
}

impl Drop for RpiImagerRun {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Reads the pty master until EOF, or until `stop` is set and no more data
/// arrives within `timeout`.
fn drain_pty(
    mut master: File,
    buffer: Arc<Mutex<Vec<u8>>>,
    stop: Arc<AtomicBool>,
    timeout: Duration,
) {
    let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let ready = {
            let mut fds = [PollFd::new(master.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(ms)) {
                Ok(n) => n > 0,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    log::debug!("[imager] poll failed: {e}");
                    break;
                }
            }
        };
        if !ready {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            continue;
        }
        match master.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buffer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted || e.kind() == ErrorKind::WouldBlock => {}
            // EIO is how a pty reports that the other side is gone
            Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => break,
            Err(e) => {
                log::debug!("[imager] pty read failed: {e}");
                break;
            }
        }
    }
}

pub fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn normalizes_carriage_returns() {
        assert_eq!(
            normalize_newlines("  Writing: [==] 10 %\r  Writing: [===] 20 %\r\nWrite done"),
            "  Writing: [==] 10 %\n  Writing: [===] 20 %\nWrite done"
        );
    }

    #[test]
    fn missing_binary_is_an_error() {
        let cli = RpiImagerCli::new(&Imager {
            binary: "zz-no-such-imager".into(),
            poll_timeout: Duration::from_millis(50),
        });
        assert!(cli.binary().is_none());
        assert!(cli.spawn(Path::new("/a.img"), Path::new("/dev/null")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn collects_pty_output_of_a_real_process() {
        // `echo` ignores the imager arguments and prints them back
        let cli = RpiImagerCli::new(&Imager {
            binary: "echo".into(),
            poll_timeout: Duration::from_millis(50),
        });
        let mut run = cli
            .spawn(Path::new("/a.img"), Path::new("/dev/null"))
            .unwrap();
        let started = Instant::now();
        let code = loop {
            if let Some(code) = run.try_wait().unwrap() {
                break code;
            }
            assert!(started.elapsed() < Duration::from_secs(10));
            thread::sleep(Duration::from_millis(20));
        };
        assert_eq!(code, 0);
        let out = run.output();
        assert!(out.contains("--cli --disable-eject --debug /a.img /dev/null"), "{out:?}");
        assert!(!out.contains('\r'));
    }
}

use std::{
    io::Write,
    path::PathBuf,
    process::{Command, ExitStatus, Stdio},
};

use anyhow::{Context, Result, bail};

/// Locale pinned for every child so tool output stays parseable.
const LOCALE_ENV: &[(&str, &str)] = &[
    ("LANG", "C.UTF-8"),
    ("LANGUAGE", "C.UTF-8"),
    ("LC_ALL", "C.UTF-8"),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StdioSpec {
    Inherit,
    Null,
    Pipe,
}

impl StdioSpec {
    #[inline]
    fn to_stdio(&self) -> Stdio {
        match self {
            StdioSpec::Inherit => Stdio::inherit(),
            StdioSpec::Null => Stdio::null(),
            StdioSpec::Pipe => Stdio::piped(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CmdSpec {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    input: Option<String>,
    stdout: StdioSpec,
    stderr: StdioSpec,
    cwd: Option<PathBuf>,
    interactive: bool,
}

impl CmdSpec {
    #[must_use]
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            input: None,
            stdout: StdioSpec::Pipe,
            stderr: StdioSpec::Pipe,
            cwd: None,
            interactive: false,
        }
    }

    #[must_use]
    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, it: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(it.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.envs.push((k.into(), v.into()));
        self
    }

    /// Text fed to the child's stdin (e.g. fdisk's interactive script).
    #[must_use]
    pub fn input(mut self, text: impl Into<String>) -> Self {
        self.input = Some(text.into());
        self
    }

    #[must_use]
    pub fn stdout(mut self, s: StdioSpec) -> Self {
        self.stdout = s;
        self
    }

    #[must_use]
    pub fn stderr(mut self, s: StdioSpec) -> Self {
        self.stderr = s;
        self
    }

    /// Hands the terminal to the child: all three streams inherited.
    #[must_use]
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self.stdout = StdioSpec::Inherit;
        self.stderr = StdioSpec::Inherit;
        self
    }

    #[must_use]
    pub fn cwd<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn render(&self) -> String {
        let prog = sh_quote(&self.program);
        let args: Vec<String> = self.args.iter().map(|a| sh_quote(a)).collect();
        let mut env_prefix = String::new();
        for (k, v) in &self.envs {
            env_prefix.push_str(&format!("{k}={} ", sh_quote(v)));
        }
        format!("{}{} {}", env_prefix, prog, args.join(" "))
            .trim_end()
            .to_string()
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in LOCALE_ENV {
            cmd.env(k, v);
        }
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        if let Some(ref d) = self.cwd {
            cmd.current_dir(d);
        }
        cmd
    }
}

/// Exit status and combined textual output of a finished command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    #[inline]
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            (out, "") => out.to_string(),
            ("", err) => err.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

pub trait Runner: Send + Sync {
    /// Runs to completion; any non-zero exit is an error.
    fn run(&self, cmd: &CmdSpec) -> Result<()> {
        let out = self.run_output(cmd)?;
        if !out.success() {
            bail!(
                "command failed: {} (exit {}): {}",
                cmd.render(),
                out.code,
                out.combined()
            );
        }
        Ok(())
    }

    /// Runs to completion and returns stdout; any non-zero exit is an error.
    fn run_capture(&self, cmd: &CmdSpec) -> Result<String> {
        let out = self.run_output(cmd)?;
        if !out.success() {
            bail!(
                "command failed: {} (exit {}): {}",
                cmd.render(),
                out.code,
                out.combined()
            );
        }
        Ok(out.stdout)
    }

    /// Runs to completion and reports the exit code without judging it.
    fn run_output(&self, cmd: &CmdSpec) -> Result<CmdOutput>;
}

#[derive(Default, Clone)]
pub struct ProcessRunner {
    verbose: bool,
}

impl ProcessRunner {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl Runner for ProcessRunner {
    fn run_output(&self, spec: &CmdSpec) -> Result<CmdOutput> {
        if self.verbose {
            tracing::info!("Running: {}", spec.render());
        } else {
            tracing::debug!("exec: {}", spec.render());
        }

        let mut cmd = spec.to_command();
        cmd.stdout(spec.stdout.to_stdio());
        cmd.stderr(spec.stderr.to_stdio());
        cmd.stdin(if spec.input.is_some() {
            Stdio::piped()
        } else if spec.interactive {
            Stdio::inherit()
        } else {
            Stdio::null()
        });

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", spec.render()))?;

        if let Some(ref text) = spec.input {
            let mut stdin = child
                .stdin
                .take()
                .with_context(|| format!("stdin not available for {}", spec.program))?;
            stdin
                .write_all(text.as_bytes())
                .with_context(|| format!("write stdin of {}", spec.program))?;
        }

        let out = child
            .wait_with_output()
            .with_context(|| format!("wait for {}", spec.render()))?;

        let output = CmdOutput {
            code: exit_code(out.status),
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
        };
        if self.verbose && !output.combined().is_empty() {
            tracing::info!(
                "Captured output ($?={}):\n{}",
                output.code,
                output.combined()
            );
        }
        Ok(output)
    }
}

/// Shell-style exit code; signals map to 128+N.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

pub fn sh_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".into();
    }
    if !s
        .bytes()
        .any(|b| b == b' ' || b == b'\'' || b == b'"' || b == b'\\' || b == b'\n')
    {
        return s.to_string();
    }
    let mut out = String::from("'");
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sh_quote_empty() {
        assert_eq!(sh_quote(""), "''");
    }

    #[test]
    fn sh_quote_simple() {
        assert_eq!(sh_quote("hello"), "hello");
    }

    #[test]
    fn sh_quote_with_space() {
        assert_eq!(sh_quote("hello world"), "'hello world'");
    }

    #[test]
    fn sh_quote_with_single_quote() {
        assert_eq!(sh_quote("don't"), "'don'\\''t'");
    }

    #[test]
    fn cmd_spec_render() {
        let cmd = CmdSpec::new("mount").arg("-oro").arg("/dev/sda1").arg("/tmp/a b");
        assert_eq!(cmd.render(), "mount -oro /dev/sda1 '/tmp/a b'");
    }

    #[test]
    fn cmd_spec_with_env() {
        let cmd = CmdSpec::new("cmd").env("VAR", "value");
        assert_eq!(cmd.render(), "VAR=value cmd");
    }

    #[test]
    fn combined_output_joins_streams() {
        let out = CmdOutput {
            code: 1,
            stdout: "a\n".into(),
            stderr: "b\n".into(),
        };
        assert_eq!(out.combined(), "a\nb");
        assert!(!out.success());
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_reports_exit_code() {
        let runner = ProcessRunner::new(false);
        let out = runner
            .run_output(&CmdSpec::new("sh").args(["-c", "echo hi; exit 3"]))
            .unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stdout.trim(), "hi");
        assert!(runner.run(&CmdSpec::new("sh").args(["-c", "exit 1"])).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_feeds_input() {
        let runner = ProcessRunner::new(false);
        let out = runner
            .run_capture(&CmdSpec::new("cat").input("x\ni\n"))
            .unwrap();
        assert_eq!(out, "x\ni\n");
    }
}

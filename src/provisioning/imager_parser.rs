//! Progress extracted from the flasher's console transcript.
//!
//! The whole transcript is re-read on every poll. Fields only ever move
//! forward, so parsing the same or a longer transcript again never undoes
//! anything already seen.

use std::sync::LazyLock;

use regex::Regex;

static PATTERNS: LazyLock<Option<LinePatterns>> = LazyLock::new(LinePatterns::new);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImagerProgress {
    pub img_hash: String,
    pub verify_hash: String,
    pub preparing_done: bool,
    /// 0-100.
    pub write_progress: u32,
    pub write_done: bool,
    /// Seconds, as reported by the flasher.
    pub write_duration: f64,
    pub verify_progress: u32,
    pub verify_done: bool,
    pub verify_duration: f64,
    pub finalizing_done: bool,
}

impl ImagerProgress {
    pub fn parse(&mut self, transcript: &str) {
        if self.finalizing_done {
            return;
        }
        let Some(re) = PATTERNS.as_ref() else {
            return;
        };

        for line in transcript.lines() {
            if !self.preparing_done && (line.contains("Writing:") || line.contains("Done zeroing out"))
            {
                self.preparing_done = true;
            }

            if self.img_hash.is_empty() {
                if let Some(hash) = re.hash(line, "Hash of uncompressed image") {
                    self.img_hash = hash;
                }
            }

            if !self.write_done {
                if let Some(pct) = re.bar_percent(line, "Writing") {
                    self.write_progress = self.write_progress.max(pct);
                }
                if line.starts_with("Write done ") || line.starts_with("  Verifying:") {
                    self.write_done = true;
                    self.write_progress = 100;
                }
            }
            if self.write_duration == 0.0 {
                if let Some(secs) = re.done_seconds(line, "Write") {
                    self.write_duration = secs;
                }
            }

            if !self.verify_done {
                if let Some(pct) = re.bar_percent(line, "Verifying") {
                    self.verify_progress = self.verify_progress.max(pct);
                }
                if line.starts_with("Verify done")
                    || line.starts_with("Verify hash:")
                    || line.starts_with("Writing first block")
                {
                    self.verify_done = true;
                    self.verify_progress = 100;
                    // verifying implies the write finished
                    self.write_done = true;
                    self.write_progress = 100;
                    self.preparing_done = true;
                }
            }
            if self.verify_duration == 0.0 {
                if let Some(secs) = re.done_seconds(line, "Verify") {
                    self.verify_duration = secs;
                }
            }
            if self.verify_hash.is_empty() {
                if let Some(hash) = re.hash(line, "Verify hash") {
                    self.verify_hash = hash;
                }
            }

            if line.starts_with("Write successful") {
                self.finalizing_done = true;
            }
        }
    }

    /// Mean of both phases, each capped at 100.
    pub fn progress(&self) -> u32 {
        (self.write_progress.min(100) + self.verify_progress.min(100)) / 2
    }

    pub fn phase(&self) -> &'static str {
        if !self.preparing_done {
            "Preparing (device and hashes)"
        } else if !self.write_done {
            "Writing to disk"
        } else if !self.verify_done {
            "Verifying disk"
        } else if !self.finalizing_done {
            "Finalizing"
        } else {
            "Completed"
        }
    }
}

struct LinePatterns {
    bar: Regex,
    done: Regex,
    hash: Regex,
}

impl LinePatterns {
    fn new() -> Option<Self> {
        Some(Self {
            bar: Regex::new(r"^\s+(Writing|Verifying): \[[^\]]*\] (\d+) %$").ok()?,
            done: Regex::new(r"^(Write|Verify) done in (\d+(?:\.\d+)?) seconds").ok()?,
            hash: Regex::new(r#"^(Hash of uncompressed image|Verify hash): "([a-f0-9]+)"$"#).ok()?,
        })
    }

    /// `  Writing: [=====>     ] 45 %` → 45.
    fn bar_percent(&self, line: &str, label: &str) -> Option<u32> {
        let caps = self.bar.captures(line)?;
        (&caps[1] == label).then(|| caps[2].parse().ok()).flatten()
    }

    /// `Write done in 48 seconds` → 48.0.
    fn done_seconds(&self, line: &str, label: &str) -> Option<f64> {
        let caps = self.done.captures(line)?;
        (&caps[1] == label).then(|| caps[2].parse().ok()).flatten()
    }

    /// `Verify hash: "ab12"` → `ab12`.
    fn hash(&self, line: &str, label: &str) -> Option<String> {
        let caps = self.hash.captures(line)?;
        (&caps[1] == label).then(|| caps[2].to_string())
    }
}

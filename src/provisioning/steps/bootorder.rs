use std::{io::Write, sync::Arc};

use anyhow::{Context, Result};
use tracing as log;

use crate::{
    config::Eeprom,
    provisioning::{Environment, Step, StepKind, StepResult, check},
    tooling::EepromPort,
};

const BOOT_ORDER_KEY: &str = "BOOT_ORDER";
const POWER_OFF_KEY: &str = "POWER_OFF_ON_HALT";

/// Makes the firmware try the freshly flashed disk first.
pub struct BootOrderStep {
    eeprom: Arc<dyn EepromPort>,
    settings: Eeprom,
}

impl BootOrderStep {
    pub fn new(eeprom: Arc<dyn EepromPort>, settings: Eeprom) -> Self {
        Self { eeprom, settings }
    }

    fn apply(&self, verbose: bool) -> Result<String> {
        let current = self
            .eeprom
            .read_config()
            .context("Failed to read EEPROM config")?;
        let updated = rewrite_config(
            &current,
            &[
                (BOOT_ORDER_KEY, self.settings.boot_order.clone()),
                (
                    POWER_OFF_KEY,
                    if self.settings.power_off_on_halt { "1" } else { "0" }.to_string(),
                ),
            ],
        );
        if verbose {
            log::info!("[bootorder] new EEPROM config:\n{updated}");
        }

        let mut file = tempfile::Builder::new()
            .prefix("eeprom_")
            .suffix(".conf")
            .tempfile()
            .context("Failed to update EEPROM")?;
        file.write_all(updated.as_bytes())
            .and_then(|_| file.flush())
            .context("Failed to update EEPROM")?;

        let out = self
            .eeprom
            .apply(file.path())
            .and_then(|out| check(out, "Failed to update EEPROM"))?;
        if verbose {
            log::info!("[bootorder] {}", out.combined().trim());
        }
        Ok(format!("Boot order set to {}", self.settings.boot_order))
    }
}

impl Step for BootOrderStep {
    fn kind(&self) -> StepKind {
        StepKind::BootOrder
    }

    fn run(&mut self, _env: &Environment, verbose: bool) -> Result<StepResult> {
        Ok(match self.apply(verbose) {
            Ok(text) => StepResult::success(text),
            Err(e) => StepResult::from_error(&e, &[]),
        })
    }
}

/// Sets `KEY=value` for each pair: the first existing line for a key is
/// rewritten in place, missing keys are appended. Every other line is kept
/// as is.
fn rewrite_config(text: &str, pairs: &[(&str, String)]) -> String {
    let mut seen = vec![false; pairs.len()];
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let key = line.split_once('=').map(|(k, _)| k.trim());
        let hit = pairs
            .iter()
            .position(|(k, _)| Some(*k) == key)
            .filter(|&i| !seen[i]);
        match hit {
            Some(i) => {
                seen[i] = true;
                lines.push(format!("{}={}", pairs[i].0, pairs[i].1));
            }
            None => lines.push(line.to_string()),
        }
    }
    for (i, (key, value)) in pairs.iter().enumerate() {
        if !seen[i] {
            lines.push(format!("{key}={value}"));
        }
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

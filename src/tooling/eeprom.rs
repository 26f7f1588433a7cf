use std::{fmt, path::Path, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;

use crate::utils::process::{CmdOutput, CmdSpec, Runner};

pub const REQ_BINS: &[&str] = &["rpi-eeprom-config"];

type DynRunner = dyn Runner + Send + Sync;

pub trait EepromPort: Send + Sync {
    /// Current bootloader configuration text (`KEY=VALUE` lines).
    fn read_config(&self) -> Result<String>;
    /// Stages `file` as the new bootloader configuration.
    fn apply(&self, file: &Path) -> Result<CmdOutput>;
}

pub struct EepromCli {
    runner: Arc<DynRunner>,
}

impl EepromCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self { runner }
    }
}

impl EepromPort for EepromCli {
    fn read_config(&self) -> Result<String> {
        self.runner
            .run_capture(&CmdSpec::new("rpi-eeprom-config"))
            .context("rpi-eeprom-config failed")
    }

    fn apply(&self, file: &Path) -> Result<CmdOutput> {
        let cmd = CmdSpec::new("rpi-eeprom-config")
            .arg("--apply")
            .arg(file.display().to_string());
        self.runner.run_output(&cmd)
    }
}

/// One nibble of `BOOT_ORDER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootValue {
    SdCardDetect,
    SdCard,
    Network,
    RpiBoot,
    UsbMsd,
    BcmUsbMsd,
    Nvme,
    Http,
    Stop,
    Restart,
}

impl BootValue {
    pub fn from_nibble(c: char) -> Option<Self> {
        Some(match c.to_ascii_lowercase() {
            '0' => Self::SdCardDetect,
            '1' => Self::SdCard,
            '2' => Self::Network,
            '3' => Self::RpiBoot,
            '4' => Self::UsbMsd,
            '5' => Self::BcmUsbMsd,
            '6' => Self::Nvme,
            '7' => Self::Http,
            'e' => Self::Stop,
            'f' => Self::Restart,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SdCardDetect => "SD_CARD_DETECT",
            Self::SdCard => "SD_CARD",
            Self::Network => "NETWORK",
            Self::RpiBoot => "RPIBOOT",
            Self::UsbMsd => "USB_MSD",
            Self::BcmUsbMsd => "BCM_USB_MSD",
            Self::Nvme => "NVME",
            Self::Http => "HTTP",
            Self::Stop => "STOP",
            Self::Restart => "RESTART",
        }
    }
}

/// `BOOT_ORDER` value; the firmware tries nibbles right to left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootOrder {
    value: String,
}

impl BootOrder {
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let digits = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .ok_or_else(|| anyhow!("boot order {value:?} lacks 0x prefix"))?;
        if digits.is_empty() {
            bail!("empty boot order");
        }
        if let Some(bad) = digits.chars().find(|c| BootValue::from_nibble(*c).is_none()) {
            bail!("unknown boot mode {bad:?} in {value:?}");
        }
        Ok(Self {
            value: format!("0x{}", digits.to_ascii_lowercase()),
        })
    }

    /// Finds `BOOT_ORDER` in `rpi-eeprom-config` output.
    pub fn from_config(text: &str) -> Result<Self> {
        let re = Regex::new(r"^BOOT_ORDER\s*=\s*(0[xX][0-9A-Fa-f]+)\s*$")?;
        text.lines()
            .filter_map(|line| re.captures(line.trim()))
            .map(|c| Self::parse(&c[1]))
            .next()
            .unwrap_or_else(|| Err(anyhow!("rpi-eeprom-config has no BOOT_ORDER")))
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn entries(&self) -> Vec<BootValue> {
        self.value[2..]
            .chars()
            .rev()
            .filter_map(BootValue::from_nibble)
            .collect()
    }

    pub fn first(&self) -> Option<BootValue> {
        self.entries().first().copied()
    }
}

impl fmt::Display for BootOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.entries().into_iter().map(BootValue::name).collect();
        f.write_str(&names.join(", "))
    }
}

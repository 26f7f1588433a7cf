use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use time::{PrimitiveDateTime, macros::datetime, macros::format_description};

use crate::utils::process::{CmdOutput, CmdSpec, Runner};

pub const REQ_BINS: &[&str] = &["timedatectl", "hwclock"];

/// Maximum drift between system clock and RTC considered in sync.
const MAX_DRIFT_SECS: i64 = 120;

type DynRunner = dyn Runner + Send + Sync;

pub trait ClockPort: Send + Sync {
    fn query(&self) -> Result<ClockInfo>;
    /// Copies system time to the hardware clock.
    fn write_hwclock(&self) -> Result<CmdOutput>;
}

pub struct ClockCli {
    runner: Arc<DynRunner>,
}

impl ClockCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self { runner }
    }
}

impl ClockPort for ClockCli {
    fn query(&self) -> Result<ClockInfo> {
        let show = self
            .runner
            .run_output(&CmdSpec::new("timedatectl").arg("show"))?;
        let sync = self
            .runner
            .run_output(&CmdSpec::new("timedatectl").arg("show-timesync"))?;
        let text = format!("{}\n{}", show.stdout.trim(), sync.stdout.trim());
        Ok(ClockInfo::parse(show.code + sync.code, &text))
    }

    fn write_hwclock(&self) -> Result<CmdOutput> {
        self.runner.run_output(&CmdSpec::new("hwclock").arg("-w"))
    }
}

/// Clock state as reported by `timedatectl show` / `show-timesync`.
///
/// Timestamps are kept as printed (local wall time); both are rendered in
/// the same zone so their difference is meaningful.
#[derive(Debug, Clone, Default)]
pub struct ClockInfo {
    pub retcode: i32,
    pub raw: BTreeMap<String, String>,
    pub timezone: String,
    pub local_rtc: bool,
    pub can_ntp: bool,
    pub ntp_enabled: bool,
    pub ntp_synced: bool,
    pub local_time: Option<PrimitiveDateTime>,
    pub rtc_time: Option<PrimitiveDateTime>,
}

impl ClockInfo {
    pub fn parse(retcode: i32, text: &str) -> Self {
        let raw: BTreeMap<String, String> = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| match l.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
                None => (l.trim().to_string(), String::new()),
            })
            .collect();
        let flag = |key: &str, yes: &str| raw.get(key).is_some_and(|v| v == yes);

        Self {
            retcode,
            timezone: raw.get("Timezone").cloned().unwrap_or_default(),
            local_rtc: flag("LocalRTC", "yes"),
            can_ntp: flag("CanNTP", "yes"),
            ntp_enabled: flag("NTP", "active") || flag("NTP", "yes"),
            ntp_synced: flag("NTPSynchronized", "yes"),
            local_time: raw.get("TimeUSec").and_then(|v| parse_stamp(v)),
            rtc_time: raw.get("RTCTimeUSec").and_then(|v| parse_stamp(v)),
            raw,
        }
    }

    pub fn failed(&self) -> bool {
        self.retcode != 0
    }

    pub fn has_rtc(&self) -> bool {
        self.rtc_time.is_some()
    }

    pub fn sys_and_rtc_synced(&self) -> bool {
        match (self.local_time, self.rtc_time) {
            (Some(sys), Some(rtc)) => (rtc - sys).whole_seconds().abs() <= MAX_DRIFT_SECS,
            _ => true,
        }
    }

    pub fn all_good(&self) -> bool {
        self.ntp_enabled && self.ntp_synced && self.sys_and_rtc_synced()
    }

    pub fn ntp_status_human(&self) -> &'static str {
        if self.ntp_synced {
            "Synced"
        } else if !self.can_ntp {
            "Not installed"
        } else if !self.ntp_enabled {
            "Not enabled"
        } else {
            "Not synced"
        }
    }

    pub fn warnings(&self) -> Vec<String> {
        let out_of_sync = datetime!(2025-01-01 0:00);
        let mut warnings = Vec::new();
        if !self.ntp_enabled {
            warnings.push(
                "NTP Syncing is disabled. System clock will not auto sync when online.".into(),
            );
        }
        if !self.ntp_synced {
            warnings.push("System time is not synced via NTP. It's normal when offline.".into());
        }
        if self.local_time.is_some_and(|t| t <= out_of_sync) {
            warnings.push("System time is in the past.".into());
        }
        if self.rtc_time.is_some_and(|t| t <= out_of_sync) {
            warnings.push("RTC time is in the past.".into());
        }
        warnings
    }
}

/// `Sat 2025-01-18 10:22:33 CET` (fractional seconds tolerated).
fn parse_stamp(value: &str) -> Option<PrimitiveDateTime> {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let mut tokens = value.split_whitespace();
    let first = tokens.next()?;
    let (date, clock) = if first.contains('-') {
        (first, tokens.next()?)
    } else {
        (tokens.next()?, tokens.next()?)
    };
    let clock = clock.split('.').next()?;
    PrimitiveDateTime::parse(&format!("{date} {clock}"), fmt).ok()
}

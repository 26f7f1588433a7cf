use std::sync::Arc;

use anyhow::Result;
use tracing as log;

use crate::{
    provisioning::{Environment, Step, StepKind, StepResult, check},
    tooling::ClockPort,
};

/// Copies the NTP-synced system time into the board's RTC.
pub struct HardwareClockStep {
    clock: Arc<dyn ClockPort>,
}

impl HardwareClockStep {
    pub fn new(clock: Arc<dyn ClockPort>) -> Self {
        Self { clock }
    }
}

impl Step for HardwareClockStep {
    fn kind(&self) -> StepKind {
        StepKind::HardwareClock
    }

    fn run(&mut self, env: &Environment, _verbose: bool) -> Result<StepResult> {
        let info = &env.host.clock;
        if !info.has_rtc() {
            return Ok(StepResult::failed("RTC not found. Probably not a Pi5"));
        }
        if !info.ntp_synced {
            return Ok(StepResult::failed("System clock is not NTP-synchronized")
                .with_advice("Check Internet connection"));
        }

        let written = self
            .clock
            .write_hwclock()
            .and_then(|out| check(out, "Failed to write to HW Clock"));
        Ok(match written {
            Ok(_) => {
                log::debug!("[hwclock] RTC set from system time");
                StepResult::success("HW Clock set from NTP time")
            }
            Err(e) => StepResult::from_error(&e, &[]),
        })
    }
}

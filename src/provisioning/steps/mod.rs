use std::sync::Arc;

use super::{Step, StepFactory, StepKind};
use crate::{config::Config, tooling::Toolbox};

mod bootorder;
mod docker;
mod hwclock;
mod imager;
mod offspot;
mod resize;

pub use bootorder::BootOrderStep;
pub use docker::DockerStep;
pub use hwclock::HardwareClockStep;
pub use imager::ImagerStep;
pub use offspot::OffspotYamlStep;
pub use resize::ResizePartitionStep;

/// Production steps wired to the real tool ports.
pub struct DefaultSteps {
    tools: Toolbox,
    cfg: Arc<Config>,
}

impl DefaultSteps {
    pub fn new(tools: Toolbox, cfg: Arc<Config>) -> Self {
        Self { tools, cfg }
    }
}

impl StepFactory for DefaultSteps {
    fn build(&self, kind: StepKind) -> Box<dyn Step> {
        let t = &self.tools;
        match kind {
            StepKind::HardwareClock => Box::new(HardwareClockStep::new(t.clock())),
            StepKind::Imager => Box::new(ImagerStep::new(
                t.imager(),
                t.mount(),
                self.cfg.imager.poll_timeout,
            )),
            StepKind::BootOrder => Box::new(BootOrderStep::new(t.eeprom(), self.cfg.eeprom.clone())),
            StepKind::ResizePartition => Box::new(ResizePartitionStep::new(t.disk(), t.mount())),
            StepKind::OffspotYaml => Box::new(OffspotYamlStep::new(t.mount(), self.cfg.offspot.clone())),
            StepKind::Docker => Box::new(DockerStep::new(
                t.mount(),
                t.chroot(),
                self.cfg.chroot.clone(),
            )),
        }
    }
}

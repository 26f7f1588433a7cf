use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use serde_yaml::{Mapping, Number, Value};
use tracing as log;

use crate::{
    config::Offspot,
    provisioning::{Environment, Step, StepKind, StepResult, inside},
    tooling::MountPort,
};

/// Patches the hotspot's runtime configuration on the boot partition.
pub struct OffspotYamlStep {
    mount: Arc<dyn MountPort>,
    settings: Offspot,
    mountpoint: Option<PathBuf>,
}

impl OffspotYamlStep {
    pub fn new(mount: Arc<dyn MountPort>, settings: Offspot) -> Self {
        Self {
            mount,
            settings,
            mountpoint: None,
        }
    }

    fn update(&mut self, env: &Environment, verbose: bool) -> Result<()> {
        let boot = env.target_partition(1);
        let mp = self
            .mount
            .mount_to_temp(&boot, true)
            .context("Failed to mount boot partition")?;
        self.mountpoint = Some(mp.clone());

        let patched = inside(&mp, &self.settings.yaml_path).and_then(|path| {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            let updated = patch(&text, self.settings.rtc_charger)?;
            fs::write(&path, &updated).with_context(|| format!("write {}", path.display()))?;
            self.mount.sync();
            if verbose {
                log::info!("[offspot] {}:\n{updated}", path.display());
            }
            Ok(())
        });

        let released = self.release_mount();
        patched.context("Failed to update offspot.yaml")?;
        released.context("Failed to unmount boot partition")
    }

    /// Forgets the mountpoint only once it is really gone.
    fn release_mount(&mut self) -> Result<()> {
        if let Some(mp) = &self.mountpoint {
            self.mount.unmount(mp)?;
            self.mountpoint = None;
        }
        Ok(())
    }
}

impl Step for OffspotYamlStep {
    fn kind(&self) -> StepKind {
        StepKind::OffspotYaml
    }

    fn run(&mut self, env: &Environment, verbose: bool) -> Result<StepResult> {
        Ok(match self.update(env, verbose) {
            Ok(()) => StepResult::success(format!(
                "RTC charger enabled ({}) in {}",
                self.settings.rtc_charger,
                self.settings.yaml_path.display()
            )),
            Err(e) => StepResult::from_error(&e, &[format!("partition: {}", env.target_partition(1).display())]),
        })
    }

    fn cleanup(&mut self) -> Result<()> {
        self.release_mount()
    }
}

/// Sets `rtc.charger`, keeping every other key, including the rest of `rtc`.
fn patch(text: &str, charger: u32) -> Result<String> {
    let mut doc: Value = serde_yaml::from_str(text).context("parse YAML")?;
    if doc.is_null() {
        doc = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(root) = &mut doc else {
        bail!("top level is not a mapping");
    };
    let rtc = root
        .entry(Value::String("rtc".into()))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if rtc.is_null() {
        *rtc = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(rtc) = rtc else {
        bail!("rtc is not a mapping");
    };
    rtc.insert(
        Value::String("charger".into()),
        Value::Number(Number::from(u64::from(charger))),
    );
    serde_yaml::to_string(&doc).context("serialize YAML")
}

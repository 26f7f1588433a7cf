use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use config as cfg;
use serde::{Deserialize, Serialize};

use crate::{tooling::eeprom::BootOrder, utils::human::parse_size};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/provisioner/config.toml";
pub const ENV_PREFIX: &str = "PROVISIONER";

/// Effective settings, built once in `main` and handed to every component.
#[derive(Debug, Clone)]
pub struct Config {
    pub debug: bool,
    /// Read Pi-specific files (devicetree, filesystems) from the CWD.
    pub fake_pi: bool,
    pub images: Images,
    pub imager: Imager,
    pub timing: Timing,
    pub eeprom: Eeprom,
    pub offspot: Offspot,
    pub network: Network,
    pub chroot: Chroot,
}

#[derive(Debug, Clone)]
pub struct Images {
    /// Files below this many bytes are never probed.
    pub min_size: u64,
    pub suffix: String,
    pub media_fstype: String,
}

#[derive(Debug, Clone)]
pub struct Imager {
    pub binary: String,
    pub poll_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Timing {
    pub mount_settle: Duration,
    pub unmount_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct Eeprom {
    /// `0x`-prefixed hex, nibbles read right to left.
    pub boot_order: String,
    pub power_off_on_halt: bool,
}

#[derive(Debug, Clone)]
pub struct Offspot {
    pub rtc_charger: u32,
    /// Relative to the boot partition root.
    pub yaml_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Network {
    pub probe_url: String,
    pub ethernet_iface: String,
    pub wireless_iface: String,
}

#[derive(Debug, Clone)]
pub struct Chroot {
    pub helper_dir: PathBuf,
    pub resolv_conf: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            fake_pi: false,
            images: Images {
                min_size: 300_000_000,
                suffix: ".img".into(),
                media_fstype: "exfat".into(),
            },
            imager: Imager {
                binary: "rpi-imager".into(),
                poll_timeout: Duration::from_millis(500),
            },
            timing: Timing {
                mount_settle: Duration::from_millis(500),
                unmount_delay: Duration::from_millis(2000),
            },
            eeprom: Eeprom {
                boot_order: "0xf416".into(),
                power_off_on_halt: true,
            },
            offspot: Offspot {
                rtc_charger: 30_000,
                yaml_path: PathBuf::from("offspot.yaml"),
            },
            network: Network {
                probe_url: "https://wikipedia.org".into(),
                ethernet_iface: "eth0".into(),
                wireless_iface: "wlan0".into(),
            },
            chroot: Chroot {
                helper_dir: PathBuf::from("/usr/bin"),
                resolv_conf: PathBuf::from("/etc/resolv.conf"),
            },
        }
    }
}

impl Config {
    /// Layers the optional TOML file with `PROVISIONER_*` variables
    /// (nested keys joined by `__`, e.g. `PROVISIONER_IMAGES__MIN_SIZE`).
    pub fn load(path: &Path) -> Result<Self> {
        let raw: RawConfig = cfg::Config::builder()
            .add_source(
                cfg::File::new(&path.to_string_lossy(), cfg::FileFormat::Toml).required(false),
            )
            .add_source(
                cfg::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("load {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("deserialize {}", path.display()))?;

        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let d = Config::default();
        let n = config_helpers::Normalizer;

        let min_size = match raw.images.min_size {
            None => d.images.min_size,
            Some(RawSize::Bytes(b)) => b,
            Some(RawSize::Text(t)) => {
                parse_size(&t).with_context(|| format!("bad images.min_size '{t}'"))?
            }
        };
        if min_size == 0 {
            bail!("images.min_size must be greater than zero");
        }
        let suffix = n.trim_opt(raw.images.suffix).unwrap_or(d.images.suffix);
        if !suffix.starts_with('.') {
            bail!("images.suffix must start with a dot, got '{suffix}'");
        }
        let images = Images {
            min_size,
            suffix,
            media_fstype: n
                .trim_opt(raw.images.media_fstype)
                .unwrap_or(d.images.media_fstype),
        };

        let poll_ms = raw
            .imager
            .poll_timeout_ms
            .unwrap_or(d.imager.poll_timeout.as_millis() as u64);
        if poll_ms == 0 {
            bail!("imager.poll_timeout_ms must be greater than zero");
        }
        let imager = Imager {
            binary: n.trim_opt(raw.imager.binary).unwrap_or(d.imager.binary),
            poll_timeout: Duration::from_millis(poll_ms),
        };

        let timing = Timing {
            mount_settle: raw
                .timing
                .mount_settle_ms
                .map(Duration::from_millis)
                .unwrap_or(d.timing.mount_settle),
            unmount_delay: raw
                .timing
                .unmount_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(d.timing.unmount_delay),
        };

        let boot_order = n
            .trim_opt(raw.eeprom.boot_order)
            .unwrap_or(d.eeprom.boot_order);
        let boot_order = BootOrder::parse(&boot_order)
            .with_context(|| format!("bad eeprom.boot_order '{boot_order}'"))?;
        let eeprom = Eeprom {
            boot_order: boot_order.value().to_string(),
            power_off_on_halt: raw
                .eeprom
                .power_off_on_halt
                .unwrap_or(d.eeprom.power_off_on_halt),
        };

        let yaml_path = n
            .trim_opt(raw.offspot.yaml_path)
            .map(PathBuf::from)
            .unwrap_or(d.offspot.yaml_path);
        if yaml_path.is_absolute() {
            bail!("offspot.yaml_path must be relative to the boot partition");
        }
        let offspot = Offspot {
            rtc_charger: raw.offspot.rtc_charger.unwrap_or(d.offspot.rtc_charger),
            yaml_path,
        };

        let probe_url = n
            .trim_opt(raw.network.probe_url)
            .unwrap_or(d.network.probe_url);
        if !probe_url.starts_with("https://") {
            bail!("network.probe_url must be an https:// URL, got '{probe_url}'");
        }
        let network = Network {
            probe_url,
            ethernet_iface: n
                .trim_opt(raw.network.ethernet_iface)
                .unwrap_or(d.network.ethernet_iface),
            wireless_iface: n
                .trim_opt(raw.network.wireless_iface)
                .unwrap_or(d.network.wireless_iface),
        };

        let chroot = Chroot {
            helper_dir: n
                .trim_opt(raw.chroot.helper_dir)
                .map(PathBuf::from)
                .unwrap_or(d.chroot.helper_dir),
            resolv_conf: n
                .trim_opt(raw.chroot.resolv_conf)
                .map(PathBuf::from)
                .unwrap_or(d.chroot.resolv_conf),
        };

        Ok(Self {
            debug: raw.debug.unwrap_or(false),
            fake_pi: raw.fake_pi.unwrap_or(false),
            images,
            imager,
            timing,
            eeprom,
            offspot,
            network,
            chroot,
        })
    }

    /// Base directory for devicetree-like files.
    pub fn devicetree_dir(&self) -> PathBuf {
        if self.fake_pi {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("devicetree")
        } else {
            PathBuf::from("/sys/firmware/devicetree/base")
        }
    }

    pub fn filesystems_file(&self) -> PathBuf {
        if self.fake_pi {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("filesystems")
        } else {
            PathBuf::from("/proc/filesystems")
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Out<'a> {
            debug: bool,
            fake_pi: bool,
            images: ImagesOut<'a>,
            imager: ImagerOut<'a>,
            timing: TimingOut,
            eeprom: EepromOut<'a>,
            offspot: OffspotOut,
            network: &'a RawNetworkOut<'a>,
            chroot: ChrootOut,
        }
        #[derive(Serialize)]
        struct ImagesOut<'a> {
            min_size: u64,
            suffix: &'a str,
            media_fstype: &'a str,
        }
        #[derive(Serialize)]
        struct ImagerOut<'a> {
            binary: &'a str,
            poll_timeout_ms: u64,
        }
        #[derive(Serialize)]
        struct TimingOut {
            mount_settle_ms: u64,
            unmount_delay_ms: u64,
        }
        #[derive(Serialize)]
        struct EepromOut<'a> {
            boot_order: &'a str,
            power_off_on_halt: bool,
        }
        #[derive(Serialize)]
        struct OffspotOut {
            rtc_charger: u32,
            yaml_path: String,
        }
        #[derive(Serialize)]
        struct RawNetworkOut<'a> {
            probe_url: &'a str,
            ethernet_iface: &'a str,
            wireless_iface: &'a str,
        }
        #[derive(Serialize)]
        struct ChrootOut {
            helper_dir: String,
            resolv_conf: String,
        }

        let network = RawNetworkOut {
            probe_url: &self.network.probe_url,
            ethernet_iface: &self.network.ethernet_iface,
            wireless_iface: &self.network.wireless_iface,
        };
        let out = Out {
            debug: self.debug,
            fake_pi: self.fake_pi,
            images: ImagesOut {
                min_size: self.images.min_size,
                suffix: &self.images.suffix,
                media_fstype: &self.images.media_fstype,
            },
            imager: ImagerOut {
                binary: &self.imager.binary,
                poll_timeout_ms: self.imager.poll_timeout.as_millis() as u64,
            },
            timing: TimingOut {
                mount_settle_ms: self.timing.mount_settle.as_millis() as u64,
                unmount_delay_ms: self.timing.unmount_delay.as_millis() as u64,
            },
            eeprom: EepromOut {
                boot_order: &self.eeprom.boot_order,
                power_off_on_halt: self.eeprom.power_off_on_halt,
            },
            offspot: OffspotOut {
                rtc_charger: self.offspot.rtc_charger,
                yaml_path: self.offspot.yaml_path.display().to_string(),
            },
            network: &network,
            chroot: ChrootOut {
                helper_dir: self.chroot.helper_dir.display().to_string(),
                resolv_conf: self.chroot.resolv_conf.display().to_string(),
            },
        };
        toml::to_string_pretty(&out).map_err(|e| anyhow!("render config: {e}"))
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    debug: Option<bool>,
    fake_pi: Option<bool>,
    #[serde(default)]
    images: RawImages,
    #[serde(default)]
    imager: RawImager,
    #[serde(default)]
    timing: RawTiming,
    #[serde(default)]
    eeprom: RawEeprom,
    #[serde(default)]
    offspot: RawOffspot,
    #[serde(default)]
    network: RawNetwork,
    #[serde(default)]
    chroot: RawChroot,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSize {
    Bytes(u64),
    Text(String),
}

#[derive(Debug, Deserialize, Default)]
struct RawImages {
    min_size: Option<RawSize>,
    suffix: Option<String>,
    media_fstype: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawImager {
    binary: Option<String>,
    poll_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RawTiming {
    mount_settle_ms: Option<u64>,
    unmount_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RawEeprom {
    boot_order: Option<String>,
    power_off_on_halt: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct RawOffspot {
    rtc_charger: Option<u32>,
    yaml_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawNetwork {
    probe_url: Option<String>,
    ethernet_iface: Option<String>,
    wireless_iface: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawChroot {
    helper_dir: Option<String>,
    resolv_conf: Option<String>,
}

mod config_helpers {
    pub(super) struct Normalizer;

    impl Normalizer {
        #[inline]
        pub fn trim_opt(&self, s: Option<String>) -> Option<String> {
            s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        }
    }
}

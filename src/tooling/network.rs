use std::{
    collections::BTreeMap,
    net::{SocketAddr, TcpStream},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use regex::Regex;
use tracing as log;

use crate::{
    config::Network,
    utils::process::{CmdSpec, Runner, StdioSpec},
};

pub const REQ_BINS: &[&str] = &["nmcli", "iw", "curl"];

const PROBE_TIMEOUT_SECS: u64 = 8;

type DynRunner = dyn Runner + Send + Sync;

pub trait NetworkPort: Send + Sync {
    fn interfaces(&self) -> Result<BTreeMap<String, Interface>>;
    fn regdomain(&self) -> Option<String>;
    fn internet(&self) -> InternetCheck;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub kind: String,
    pub hwaddr: String,
    /// NetworkManager state, e.g. `100 (connected)`.
    pub state: String,
    pub connection: String,
    pub ip4_address: Option<String>,
    pub ip4_gateway: Option<String>,
    pub ip4_dns: Option<String>,
}

impl Interface {
    pub fn connected(&self) -> bool {
        self.state.starts_with("100 ")
    }

    pub fn available(&self) -> bool {
        !self.state.starts_with("20 ")
    }

    /// `100 (connected)` → `Connected`.
    pub fn status(&self) -> String {
        let inner = self
            .state
            .split_once('(')
            .map(|(_, rest)| rest.trim_end_matches(')'))
            .unwrap_or(&self.state);
        let mut chars = inner.chars();
        match chars.next() {
            Some(c) => c.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InternetCheck {
    pub connect_ip: bool,
    pub http: bool,
    pub https: bool,
}

impl InternetCheck {
    pub fn status(&self) -> &'static str {
        if self.https {
            "Connected"
        } else if self.http {
            "Connected (SSL not working)"
        } else if self.connect_ip {
            "Connected (HTTP/s not working)"
        } else {
            "Not connected"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectedTo {
    None,
    Ethernet,
    Wireless,
    Both,
}

impl ConnectedTo {
    pub fn human(self) -> &'static str {
        match self {
            Self::None => "Not connected",
            Self::Ethernet => "Wired",
            Self::Wireless => "Wireless",
            Self::Both => "Wired and Wireless",
        }
    }
}

/// Network facts snapshot used by readiness checks and status output.
#[derive(Debug, Clone, Default)]
pub struct NetworkFacts {
    pub interfaces: BTreeMap<String, Interface>,
    pub internet: InternetCheck,
    pub regdomain: Option<String>,
    pub ethernet_iface: String,
    pub wireless_iface: String,
}

impl NetworkFacts {
    pub fn query(port: &dyn NetworkPort, cfg: &Network) -> Self {
        let interfaces = port.interfaces().unwrap_or_else(|e| {
            log::warn!("[network] cannot list interfaces: {e:#}");
            BTreeMap::new()
        });
        Self {
            interfaces,
            internet: port.internet(),
            regdomain: port.regdomain(),
            ethernet_iface: cfg.ethernet_iface.clone(),
            wireless_iface: cfg.wireless_iface.clone(),
        }
    }

    fn iface_connected(&self, name: &str) -> bool {
        self.interfaces.get(name).is_some_and(Interface::connected)
    }

    pub fn connected_to(&self) -> ConnectedTo {
        match (
            self.iface_connected(&self.ethernet_iface),
            self.iface_connected(&self.wireless_iface),
        ) {
            (true, true) => ConnectedTo::Both,
            (true, false) => ConnectedTo::Ethernet,
            (false, true) => ConnectedTo::Wireless,
            (false, false) => ConnectedTo::None,
        }
    }

    pub fn is_not_connected(&self) -> bool {
        self.connected_to() == ConnectedTo::None
    }

    pub fn is_multi_connected(&self) -> bool {
        self.connected_to() == ConnectedTo::Both
    }

    pub fn all_good(&self) -> bool {
        self.internet.https && !self.is_not_connected() && !self.is_multi_connected()
    }
}

pub struct NetworkCli {
    runner: Arc<DynRunner>,
    probe_url: String,
}

impl NetworkCli {
    pub fn new(runner: Arc<DynRunner>, cfg: &Network) -> Self {
        Self {
            runner,
            probe_url: cfg.probe_url.clone(),
        }
    }

    fn test_ip4(&self) -> bool {
        let addr = SocketAddr::from(([1, 1, 1, 1], 53));
        TcpStream::connect_timeout(&addr, Duration::from_secs(PROBE_TIMEOUT_SECS)).is_ok()
    }

    /// HTTP status is 200 after following redirects.
    fn test_url(&self, url: &str) -> bool {
        let cmd = CmdSpec::new("curl")
            .args(["-s", "-L", "-o", "/dev/null", "-w", "%{http_code}"])
            .args(["--max-time", &PROBE_TIMEOUT_SECS.to_string()])
            .arg(url)
            .stderr(StdioSpec::Null);
        match self.runner.run_output(&cmd) {
            Ok(out) => out.stdout.trim() == "200",
            Err(e) => {
                log::debug!("[network] probe {url} failed: {e:#}");
                false
            }
        }
    }
}

impl NetworkPort for NetworkCli {
    fn interfaces(&self) -> Result<BTreeMap<String, Interface>> {
        let cmd = CmdSpec::new("nmcli").args([
            "-t",
            "-f",
            "GENERAL.DEVICE,GENERAL.TYPE,GENERAL.HWADDR,GENERAL.STATE,GENERAL.CONNECTION,IP4.ADDRESS,IP4.GATEWAY,IP4.DNS",
            "device",
            "show",
        ]);
        let out = self.runner.run_capture(&cmd).context("nmcli device show")?;
        Ok(parse_nmcli_devices(&out))
    }

    fn regdomain(&self) -> Option<String> {
        let out = self
            .runner
            .run_output(&CmdSpec::new("iw").args(["reg", "get"]))
            .ok()?;
        if !out.success() {
            return None;
        }
        parse_regdomain(&out.stdout)
    }

    fn internet(&self) -> InternetCheck {
        // each test implies the previous one
        let connect_ip = self.test_ip4();
        let http = connect_ip && self.test_url("http://wikipedia.org");
        let https = http && self.test_url(&self.probe_url);
        InternetCheck {
            connect_ip,
            http,
            https,
        }
    }
}

/// Parses `nmcli -t device show` (one `KEY:value` per line, `:` escaped as
/// `\:` in values, devices separated by blank lines).
pub fn parse_nmcli_devices(text: &str) -> BTreeMap<String, Interface> {
    let mut out = BTreeMap::new();
    let mut cur: Option<Interface> = None;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.replace("\\:", ":");
        let value = value.trim();
        if key == "GENERAL.DEVICE" {
            if let Some(done) = cur.take() {
                out.insert(done.name.clone(), done);
            }
            cur = Some(Interface {
                name: value.to_string(),
                ..Default::default()
            });
            continue;
        }
        let Some(iface) = cur.as_mut() else {
            continue;
        };
        let opt = || (!value.is_empty() && value != "--").then(|| value.to_string());
        match key {
            "GENERAL.TYPE" => iface.kind = value.to_string(),
            "GENERAL.HWADDR" => iface.hwaddr = value.to_string(),
            "GENERAL.STATE" => iface.state = value.to_string(),
            "GENERAL.CONNECTION" => iface.connection = value.to_string(),
            "IP4.ADDRESS[1]" => {
                iface.ip4_address = opt().map(|v| v.split('/').next().unwrap_or("").to_string())
            }
            "IP4.GATEWAY" => iface.ip4_gateway = opt(),
            "IP4.DNS[1]" => iface.ip4_dns = opt(),
            _ => {}
        }
    }
    if let Some(done) = cur.take() {
        out.insert(done.name.clone(), done);
    }
    out
}

fn parse_regdomain(text: &str) -> Option<String> {
    let re = Regex::new(r"^country ([0-9A-Z]+): (.+)$").ok()?;
    text.lines()
        .find_map(|l| re.captures(l.trim()).map(|c| c[1].to_string()))
}

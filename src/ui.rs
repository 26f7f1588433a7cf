use prettytable::{Cell, Row, Table};

use crate::{
    catalog::ImageFileInfo,
    host::{Host, Readiness},
    inventory::Disk,
    provisioning::{
        Environment, StepKind,
        manager::{Outcome, PipelineReport, REBOOT_ADVICE},
    },
    tooling::eeprom::BootValue,
    utils::human::{format_duration, format_size, yesno},
};

fn kv(table: &mut Table, key: &str, value: impl AsRef<str>) {
    table.add_row(Row::new(vec![Cell::new(key), Cell::new(value.as_ref())]));
}

fn or_none(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("-")
}

/// `[2/6]`
pub fn step_prefix(kind: StepKind) -> String {
    format!("[{}/{}]", kind.index() + 1, StepKind::ALL.len())
}

pub fn host_table(host: &Host) -> Table {
    let mut table = Table::new();
    kv(&mut table, "Host Hardware", &host.model);
    kv(&mut table, "Host S/N", host.serial_number.to_uppercase());
    let boot_order = match &host.boot_order {
        Some(bo) if bo.first() == Some(BootValue::Nvme) => bo.to_string(),
        Some(bo) => format!("{bo} (NVMe is not first)"),
        None => "Unknown".into(),
    };
    kv(&mut table, "Host BOOT Order", boot_order);

    let net = &host.network;
    kv(&mut table, "Internet", net.internet.status());
    kv(&mut table, "Network", net.connected_to().human());
    for name in [&net.ethernet_iface, &net.wireless_iface] {
        let cell = match net.interfaces.get(name) {
            Some(iface) => format!(
                "{}\n  IP: {}\n  GW: {}\n  DNS: {}\n  HW: {}",
                iface.status(),
                or_none(&iface.ip4_address),
                or_none(&iface.ip4_gateway),
                or_none(&iface.ip4_dns),
                iface.hwaddr
            ),
            None => "Not found".into(),
        };
        kv(&mut table, name, cell);
    }
    kv(&mut table, "WiFi Country (OS)", or_none(&net.regdomain));

    let clock = &host.clock;
    kv(&mut table, "NTP", clock.ntp_status_human());
    kv(&mut table, "Timezone (OS)", &clock.timezone);
    kv(&mut table, "RTC Clock Found", yesno(clock.has_rtc()));
    let stamp = |t: Option<time::PrimitiveDateTime>| t.map_or_else(|| "-".to_string(), |t| t.to_string());
    kv(&mut table, "System Clock", stamp(clock.local_time));
    kv(&mut table, "RTC Clock", stamp(clock.rtc_time));
    for warning in clock.warnings() {
        kv(&mut table, "Clock warning", warning);
    }

    kv(
        &mut table,
        "ProvisionOS Disk",
        host.provisionos_disk()
            .map_or_else(|| "Unknown".to_string(), |d| format!("{d} ({})", d.name)),
    );
    let targets = host.target_disks();
    let target = match targets.as_slice() {
        [] => "None".to_string(),
        [only] => only.to_string(),
        [first, rest @ ..] => format!("{first} (+{} other)", rest.len()),
    };
    kv(&mut table, "Target Disk", target);
    let total: u64 = host.images.iter().map(|i| i.size).sum();
    let mut devices: Vec<&str> = host.images.iter().map(|i| i.device.as_str()).collect();
    devices.sort_unstable();
    devices.dedup();
    kv(
        &mut table,
        "Images Found",
        format!(
            "{} images, totaling {} on {} disks",
            host.images.len(),
            format_size(total),
            devices.len()
        ),
    );
    table
}

fn role(host: &Host, disk: &Disk) -> &'static str {
    if host.provisionos_disk().is_some_and(|d| d.name == disk.name) {
        "ProvisionOS"
    } else if host.target_disks().iter().any(|d| d.name == disk.name) {
        "Target"
    } else if host.media_disks().iter().any(|d| d.name == disk.name) {
        "Source"
    } else {
        "-"
    }
}

pub fn disks_table(host: &Host) -> Table {
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("Disk"),
        Cell::new("Path"),
        Cell::new("Size"),
        Cell::new("Mounted"),
        Cell::new("Role"),
    ]));
    for disk in &host.inventory.disks {
        table.add_row(Row::new(vec![
            Cell::new(&disk.to_string()),
            Cell::new(&disk.path.display().to_string()),
            Cell::new(&disk.size_human()),
            Cell::new(yesno(disk.is_mounted())),
            Cell::new(role(host, disk)),
        ]));
    }
    table
}

pub fn images_table(images: &[ImageFileInfo]) -> Table {
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("#"),
        Cell::new("Size"),
        Cell::new("Kind"),
        Cell::new("Image"),
        Cell::new("Device"),
        Cell::new("File"),
    ]));
    for (i, image) in images.iter().enumerate() {
        table.add_row(Row::new(vec![
            Cell::new(&(i + 1).to_string()),
            Cell::new(&format_size(image.size)),
            Cell::new(image.kind().as_str()),
            Cell::new(&image.human()),
            Cell::new(&image.device),
            Cell::new(&image.relpath.display().to_string()),
        ]));
    }
    table
}

pub fn readiness_line(readiness: &Readiness) -> String {
    match readiness {
        Readiness::Ready => "Ready for auto-provisioning".into(),
        Readiness::NotReady(reason) => format!("Not ready: {reason}"),
    }
}

pub fn plan_table(env: &Environment) -> Table {
    let mut table = Table::new();
    kv(&mut table, "Image", env.image.name());
    kv(
        &mut table,
        "File",
        format!("/dev/{}:{}", env.image.device, env.image.relpath.display()),
    );
    kv(&mut table, "Image size", format_size(env.image.size));
    kv(
        &mut table,
        "Target disk",
        format!("{} ({})", env.target_disk, env.target_disk.path.display()),
    );
    table
}

pub fn report_table(report: &PipelineReport) -> Table {
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("Step"),
        Cell::new("Result"),
        Cell::new("Details"),
    ]));
    for (kind, result) in &report.results {
        let mut details = result.text().to_string();
        if let Some(advice) = &result.advice {
            details.push_str(&format!("\n{advice}"));
        }
        table.add_row(Row::new(vec![
            Cell::new(&format!("{} {}", step_prefix(*kind), kind.name())),
            Cell::new(if result.succeeded { "OK" } else { "FAILED" }),
            Cell::new(&details),
        ]));
    }
    if let Outcome::Aborted { kind, error } = &report.outcome {
        table.add_row(Row::new(vec![
            Cell::new(&format!("{} {}", step_prefix(*kind), kind.name())),
            Cell::new("ERROR"),
            Cell::new(error),
        ]));
    }
    table
}

/// Closing lines after a run.
pub fn report_summary(report: &PipelineReport) -> Vec<String> {
    let mut lines = Vec::new();
    match &report.outcome {
        Outcome::Completed => lines.push("Provisioning completed successfully".into()),
        Outcome::Failed(kind) | Outcome::Aborted { kind, .. } => {
            lines.push(format!("Provisioning failed at step {}", kind.name()))
        }
        Outcome::Stopped(kind) => {
            lines.push(format!("Provisioning stopped before step {}", kind.name()))
        }
        Outcome::Rejected(reason) => lines.push(format!("Provisioning refused: {reason}")),
    }
    lines.push(format!("Duration: {}", format_duration(report.duration)));
    if report.cleanup_failures > 0 {
        lines.push(format!("{} step cleanup(s) failed", report.cleanup_failures));
    }
    if report.reboot_advised() {
        lines.push(REBOOT_ADVICE.into());
    } else if report.succeeded() {
        lines.push("Please reboot.".into());
    }
    lines
}

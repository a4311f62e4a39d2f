//! Provenance records: who ran a task, where, and on what machine.

use chrono::{DateTime, Local};
use fab_core::Chip;
use log::warn;
use sysinfo::System;

/// Best-effort default gateway IPv4 and interface MAC. Only available on
/// Linux hosts, where the routing table is exposed under /proc.
fn default_gateway() -> Option<(String, String)> {
    let table = std::fs::read_to_string("/proc/net/route").ok()?;
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[1] != "00000000" {
            continue;
        }
        let iface = fields[0];
        let raw = u32::from_str_radix(fields[2], 16).ok()?;
        let octets = raw.to_le_bytes();
        let ipaddr = format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
        let macaddr = std::fs::read_to_string(format!("/sys/class/net/{}/address", iface))
            .ok()?
            .trim()
            .to_string();
        return Some((ipaddr, macaddr));
    }
    None
}

fn cloud_region() -> String {
    // placeholder until provider detection is wired up
    "local".to_string()
}

/// Store the provenance record for one completed task under
/// `record/<job>/<step>/<index>`.
pub fn make_record(
    chip: &mut Chip,
    job: &str,
    step: &str,
    index: &str,
    start: DateTime<Local>,
    end: DateTime<Local>,
    toolversion: Option<&str>,
) {
    let base = ["record", job, step, index];
    let set = |chip: &mut Chip, leaf: &str, value: String| {
        chip.set(&[base[0], base[1], base[2], base[3], leaf], value);
    };

    let userid = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    set(chip, "userid", userid);

    set(chip, "starttime", start.format("%Y-%m-%d %H:%M:%S").to_string());
    set(chip, "endtime", end.format("%Y-%m-%d %H:%M:%S").to_string());
    set(chip, "region", cloud_region());

    if let Some(machine) = System::host_name() {
        set(chip, "machine", machine);
    }
    match default_gateway() {
        Some((ipaddr, macaddr)) => {
            set(chip, "ipaddr", ipaddr);
            set(chip, "macaddr", macaddr);
        }
        None => warn!("could not find default network interface info"),
    }

    let platform = match std::env::consts::OS {
        "macos" => "macos".to_string(),
        other => other.to_string(),
    };
    set(chip, "platform", platform);
    if std::env::consts::OS == "linux" {
        set(chip, "distro", System::distribution_id());
    }
    set(chip, "arch", std::env::consts::ARCH.to_string());

    let software = chip.get_str(&["version", "software"]);
    if let Some(software) = software {
        chip.set(&[base[0], base[1], base[2], base[3], "version", "software"], software);
    }
    if let Some(tool) = toolversion {
        chip.set(&[base[0], base[1], base[2], base[3], "version", "tool"], tool);
    }
    if let Some(os) = System::os_version() {
        chip.set(&[base[0], base[1], base[2], base[3], "version", "os"], os);
    }
    if let Some(kernel) = System::kernel_version() {
        chip.set(&[base[0], base[1], base[2], base[3], "version", "kernel"], kernel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_fields_populated() {
        let mut chip = Chip::new(Some("top"));
        let now = Local::now();
        make_record(&mut chip, "job0", "syn", "0", now, now, Some("0.9.1"));

        assert!(chip.get_str(&["record", "job0", "syn", "0", "userid"]).is_some());
        assert!(chip.get_str(&["record", "job0", "syn", "0", "starttime"]).is_some());
        assert_eq!(
            chip.get_str(&["record", "job0", "syn", "0", "region"]).as_deref(),
            Some("local")
        );
        assert_eq!(
            chip.get_str(&["record", "job0", "syn", "0", "version", "tool"]).as_deref(),
            Some("0.9.1")
        );
        assert!(!chip.has_error());
    }
}

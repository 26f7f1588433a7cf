//! MBR disk identifiers as seen by fdisk and referenced by `PARTUUID=`.

use rand::Rng;
use regex::Regex;

/// Fresh random 32-bit identifier as 8 lowercase hex digits.
pub fn new_disk_id() -> String {
    let mut rng = rand::rng();
    loop {
        let id: u32 = rng.random();
        // 0 means "no identifier" to the firmware
        if id != 0 {
            return format!("{id:08x}");
        }
    }
}

/// Extracts the identifier from `fdisk -l` output (`Disk identifier: 0x…`).
pub fn parse_disk_identifier(fdisk_output: &str) -> Option<String> {
    let re = Regex::new(r"^Disk identifier: 0x([a-f0-9]{8})$").ok()?;
    fdisk_output
        .lines()
        .filter_map(|line| re.captures(line.trim()))
        .map(|c| c[1].to_string())
        .last()
}

/// Rewrites `PARTUUID=<old>-NN` references only, leaving any other
/// occurrence of the old digits untouched. Returns the new text and the
/// number of references rewritten.
pub fn replace_partuuid_refs(text: &str, old_id: &str, new_id: &str) -> (String, usize) {
    let pattern = format!(r"PARTUUID={}-([0-9a-f]{{2}})\b", regex::escape(old_id));
    let Ok(re) = Regex::new(&pattern) else {
        return (text.to_string(), 0);
    };
    let count = re.find_iter(text).count();
    let replaced = re
        .replace_all(text, format!("PARTUUID={new_id}-${{1}}").as_str())
        .into_owned();
    (replaced, count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_8_hex() {
        let id = new_disk_id();
        assert_eq!(id.len(), 8);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(id, "00000000");
    }

    #[test]
    fn parses_fdisk_listing() {
        let out = "Disk /dev/nvme0n1: 238.47 GiB, 256060514304 bytes, 500118192 sectors\n\
                   Disklabel type: dos\n\
                   Disk identifier: 0x8a438930\n";
        assert_eq!(parse_disk_identifier(out).as_deref(), Some("8a438930"));
        assert_eq!(parse_disk_identifier("Disklabel type: gpt"), None);
    }

    #[test]
    fn rewrites_only_partuuid_tokens() {
        let fstab = "proc /proc proc defaults 0 0\n\
                     PARTUUID=8a438930-01 /boot/firmware vfat defaults 0 2\n\
                     PARTUUID=8a438930-02 / ext4 defaults,noatime 0 1\n\
                     # backup tag 8a438930 kept as-is\n";
        let (out, n) = replace_partuuid_refs(fstab, "8a438930", "0badf00d");
        assert_eq!(n, 2);
        assert!(out.contains("PARTUUID=0badf00d-01 /boot/firmware"));
        assert!(out.contains("PARTUUID=0badf00d-02 / ext4"));
        assert!(out.contains("# backup tag 8a438930 kept as-is"));
    }

    #[test]
    fn cmdline_single_line() {
        let cmdline = "console=tty1 root=PARTUUID=8a438930-02 rootfstype=ext4 fsck.repair=yes";
        let (out, n) = replace_partuuid_refs(cmdline, "8a438930", "12345678");
        assert_eq!(n, 1);
        assert_eq!(
            out,
            "console=tty1 root=PARTUUID=12345678-02 rootfstype=ext4 fsck.repair=yes"
        );
    }
}

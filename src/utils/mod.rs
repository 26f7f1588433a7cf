pub mod bins;
pub mod ids;
pub mod lock;
pub mod process;

pub mod time {
    use time::{Duration, OffsetDateTime};

    #[inline]
    pub fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    /// Seconds between two instants, never negative.
    pub fn seconds_between(start: OffsetDateTime, end: OffsetDateTime) -> f64 {
        let d: Duration = end - start;
        d.as_seconds_f64().max(0.0)
    }

    #[cfg(test)]
    mod tests {
        use time::macros::datetime;

        #[test]
        fn seconds_between_clamps() {
            let a = datetime!(2025-01-01 0:00 UTC);
            let b = datetime!(2025-01-01 0:01 UTC);
            assert_eq!(super::seconds_between(a, b), 60.0);
            assert_eq!(super::seconds_between(b, a), 0.0);
        }
    }
}

pub mod human {
    use anyhow::{Result, anyhow, bail};

    const DECIMAL: &[&str] = &["bytes", "KB", "MB", "GB", "TB", "PB"];

    pub fn format_size(size: u64) -> String {
        if size < 1000 {
            return if size == 1 {
                "1 byte".to_string()
            } else {
                format!("{size} bytes")
            };
        }
        let mut value = size as f64;
        let mut unit = 0;
        while value >= 1000.0 && unit < DECIMAL.len() - 1 {
            value /= 1000.0;
            unit += 1;
        }
        let txt = format!("{value:.2}");
        let txt = txt.trim_end_matches('0').trim_end_matches('.');
        format!("{txt} {}", DECIMAL[unit])
    }

    /// Accepts plain bytes or a number with a decimal (KB, MB…) or
    /// binary (KiB, MiB…) unit.
    pub fn parse_size(text: &str) -> Result<u64> {
        let s = text.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (num, unit) = s.split_at(split);
        if num.is_empty() {
            bail!("invalid size: {text:?}");
        }
        let value: f64 = num
            .parse()
            .map_err(|_| anyhow!("invalid size number: {text:?}"))?;
        let unit = unit.trim().to_ascii_lowercase();
        let mult: u64 = match unit.as_str() {
            "" | "b" | "bytes" => 1,
            "k" | "kb" => 1000,
            "m" | "mb" => 1000_u64.pow(2),
            "g" | "gb" => 1000_u64.pow(3),
            "t" | "tb" => 1000_u64.pow(4),
            "kib" => 1 << 10,
            "mib" => 1 << 20,
            "gib" => 1 << 30,
            "tib" => 1 << 40,
            other => bail!("unknown size unit {other:?} in {text:?}"),
        };
        Ok((value * mult as f64).round() as u64)
    }

    pub fn format_duration(seconds: f64) -> String {
        if seconds < 0.0 {
            return "n/a".to_string();
        }
        let total = seconds.round() as u64;
        let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
        let plural = |n: u64, word: &str| {
            if n == 1 {
                format!("1 {word}")
            } else {
                format!("{n} {word}s")
            }
        };
        match (h, m) {
            (0, 0) => plural(s, "second"),
            (0, _) if s == 0 => plural(m, "minute"),
            (0, _) => format!("{} and {}", plural(m, "minute"), plural(s, "second")),
            _ if m == 0 => plural(h, "hour"),
            _ => format!("{} and {}", plural(h, "hour"), plural(m, "minute")),
        }
    }

    pub fn yesno(value: bool) -> &'static str {
        if value { "yes" } else { "no" }
    }

}

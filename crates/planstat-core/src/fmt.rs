//! Formatting helpers shared by the binaries.
//!
//! Functions whose output differs between one-line log records and the
//! dump tool's per-packet lines are parameterized via [`FmtStyle`].

use chrono::DateTime;
use std::time::Duration;

/// Compact (log fields) vs detailed (dump output) rendering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FmtStyle {
    /// No spaces, short suffixes ("1.5G", "250ms")
    Compact,
    /// Spaces, full suffixes ("1.5 GiB", "250.0 ms")
    Detail,
}

// ---------------------------------------------------------------------------
// Style-parameterized functions
// ---------------------------------------------------------------------------

/// Format byte count as human-readable size.
///
/// Compact: `"1.5G"`, `"100.3M"`, `"50.0K"`, `"512B"`
/// Detail:  `"1.5 GiB"`, `"100.3 MiB"`, `"50.0 KiB"`, `"512 B"`
pub fn format_bytes(bytes: u64, style: FmtStyle) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    let (g, m, k, b) = match style {
        FmtStyle::Compact => ("G", "M", "K", "B"),
        FmtStyle::Detail => (" GiB", " MiB", " KiB", " B"),
    };
    let f = bytes as f64;
    if bytes >= GIB {
        format!("{:.1}{}", f / GIB as f64, g)
    } else if bytes >= MIB {
        format!("{:.1}{}", f / MIB as f64, m)
    } else if bytes >= KIB {
        format!("{:.1}{}", f / KIB as f64, k)
    } else {
        format!("{}{}", bytes, b)
    }
}

/// Format a duration in milliseconds.
///
/// Compact: `"1.5s"`, `"250ms"`
/// Detail:  `"1.500 s"`, `"250.000 ms"`, matching EXPLAIN ANALYZE precision
pub fn format_ms(duration: Duration, style: FmtStyle) -> String {
    let ms = duration.as_secs_f64() * 1000.0;
    match style {
        FmtStyle::Compact => {
            if ms >= 1000.0 {
                format!("{:.1}s", ms / 1000.0)
            } else {
                format!("{:.0}ms", ms)
            }
        }
        FmtStyle::Detail => {
            if ms >= 1000.0 {
                format!("{:.3} s", ms / 1000.0)
            } else {
                format!("{:.3} ms", ms)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Style-independent functions
// ---------------------------------------------------------------------------

/// Format epoch seconds as a UTC timestamp, or `"-"` for zero.
pub fn format_epoch(secs: i64) -> String {
    if secs == 0 {
        return "-".to_string();
    }
    DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// Format fractional epoch seconds with millisecond precision.
pub fn format_epoch_f64(secs: f64) -> String {
    if !secs.is_finite() || secs <= 0.0 {
        return "-".to_string();
    }
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9) as u32;
    DateTime::from_timestamp(whole, nanos)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| format!("{secs:.3}"))
}

/// Percentage of `part` in `total`, zero when `total` is zero.
pub fn pct(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512, FmtStyle::Compact), "512B");
        assert_eq!(format_bytes(512, FmtStyle::Detail), "512 B");
        assert_eq!(format_bytes(1536, FmtStyle::Compact), "1.5K");
        assert_eq!(format_bytes(3 * 1024 * 1024, FmtStyle::Detail), "3.0 MiB");
        assert_eq!(format_bytes(2 * 1024 * 1024 * 1024, FmtStyle::Compact), "2.0G");
    }

    #[test]
    fn test_format_ms() {
        assert_eq!(format_ms(Duration::from_millis(250), FmtStyle::Compact), "250ms");
        assert_eq!(format_ms(Duration::from_millis(1500), FmtStyle::Compact), "1.5s");
        assert_eq!(format_ms(Duration::from_micros(1250), FmtStyle::Detail), "1.250 ms");
        assert_eq!(format_ms(Duration::from_millis(2500), FmtStyle::Detail), "2.500 s");
    }

    #[test]
    fn test_format_epoch() {
        assert_eq!(format_epoch(0), "-");
        assert_eq!(format_epoch(1_700_000_000), "2023-11-14 22:13:20");
        assert_eq!(format_epoch_f64(0.0), "-");
        assert_eq!(format_epoch_f64(1_700_000_000.5), "2023-11-14 22:13:20.500");
    }

    #[test]
    fn test_pct() {
        assert_eq!(pct(1, 0), 0.0);
        assert_eq!(pct(1, 4), 25.0);
    }
}

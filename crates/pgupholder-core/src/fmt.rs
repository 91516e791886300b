//! Shared formatting helpers for log lines and report summaries.
//!
//! Pure functions only, no I/O and no locale handling.

/// Format byte count as human-readable size: `"1.5G"`, `"100.3M"`, `"512B"`.
pub fn format_bytes(bytes: u64) -> String {
    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;
    const KB: u64 = 1024;

    let f = bytes as f64;
    if bytes >= GB {
        format!("{:.1}G", f / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", f / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", f / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Format duration in milliseconds: `"250ms"`, `"3.2s"`, `"4m10s"`.
pub fn format_ms(ms: i64) -> String {
    if ms < 0 {
        return "-".to_string();
    }
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        let secs = ms / 1000;
        format!("{}m{}s", secs / 60, secs % 60)
    }
}

/// Format a 0..1 ratio as a percentage: `"94.7%"`.
pub fn format_ratio(ratio: f64) -> String {
    format!("{:.1}%", ratio * 100.0)
}

/// Truncate a SQL sample for display, keeping it on one line.
pub fn truncate_sql(sql: &str, max_chars: usize) -> String {
    let one_line: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if one_line.chars().count() <= max_chars {
        one_line
    } else {
        let truncated: String = one_line.chars().take(max_chars).collect();
        format!("{}…", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_picks_unit() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.0K");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0M");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0G");
    }

    #[test]
    fn format_ms_scales() {
        assert_eq!(format_ms(250), "250ms");
        assert_eq!(format_ms(3200), "3.2s");
        assert_eq!(format_ms(250_000), "4m10s");
        assert_eq!(format_ms(-1), "-");
    }

    #[test]
    fn truncate_sql_collapses_whitespace() {
        let sql = "SELECT *\n  FROM orders\n  WHERE status = $1";
        assert_eq!(truncate_sql(sql, 100), "SELECT * FROM orders WHERE status = $1");
        assert_eq!(truncate_sql(sql, 8), "SELECT *…");
    }
}

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Logs how long a scope took when dropped.
pub struct Timer {
    label: String,
    start: Instant,
}

impl Timer {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        info!("⏱  Starting: {}", label);
        Self {
            label,
            start: Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        info!("⏱  Finished: {} (took {:.2?})", self.label, self.start.elapsed());
    }
}

/// Format a large integer with thousands separators.
pub fn fmt_number(n: i64) -> String {
    let s = n.abs().to_string();
    let mut result = String::new();
    for (i, ch) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(ch);
    }
    if n < 0 {
        result.push('-');
    }
    result.chars().rev().collect()
}

/// Money amount: whole numbers without decimals, otherwise two places.
/// 1250.0 → "1,250" | 100.5 → "100.50"
pub fn fmt_amount(v: f64) -> String {
    let cents = (v * 100.0).round() as i64;
    let whole = fmt_number(cents / 100);
    let frac = (cents % 100).abs();
    if frac == 0 {
        whole
    } else {
        format!("{}.{:02}", whole, frac)
    }
}

/// Open `path` for appending, creating parent directories as needed.
/// The `Arc` lets the file serve as a `tracing_subscriber` writer.
pub fn open_log_file(path: &Path) -> Result<Arc<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;
    Ok(Arc::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_number() {
        assert_eq!(fmt_number(1_234_567), "1,234,567");
        assert_eq!(fmt_number(0), "0");
        assert_eq!(fmt_number(-42_000), "-42,000");
        assert_eq!(fmt_number(999), "999");
    }

    #[test]
    fn test_fmt_amount() {
        assert_eq!(fmt_amount(1250.0), "1,250");
        assert_eq!(fmt_amount(100.5), "100.50");
        assert_eq!(fmt_amount(1_000_000.25), "1,000,000.25");
    }

    #[test]
    fn test_open_log_file_appends_and_creates_dirs() {
        use std::io::Write;

        let dir = std::env::temp_dir().join(format!("ipo_alert_log_{}", std::process::id()));
        let path = dir.join("nested").join("ipo_alert.log");

        writeln!(&*open_log_file(&path).unwrap(), "first").unwrap();
        writeln!(&*open_log_file(&path).unwrap(), "second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");

        fs::remove_dir_all(&dir).ok();
    }
}

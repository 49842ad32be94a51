//! 大小、速度、时间的显示格式（十进制单位）

use std::time::Duration;

/// 字节数转换为可读格式
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    if bytes < 1000 {
        return format!("{}B", bytes);
    }

    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1000.0 {
            return format!("{:.1}{}", size, unit);
        }
        size /= 1000.0;
    }
    format!("{:.2}TB", size)
}

/// 计算平均速度（MB/s）
pub fn calc_speed(bytes: u64, duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs <= 0.0 {
        return "0.00 MB/s".to_string();
    }
    format!("{:.2} MB/s", bytes as f64 / secs / 1000.0 / 1000.0)
}

/// 剩余时间：`45s`、`03m:07s`、`2h:05m`
pub fn format_remaining(remaining: Duration) -> String {
    let secs = remaining.as_secs_f64();
    if secs < 60.0 {
        format!("{:.0}s", secs)
    } else if secs < 3600.0 {
        let total = secs as u64;
        format!("{:02}m:{:02}s", total / 60, total % 60)
    } else {
        let total = secs as u64;
        format!("{}h:{:02}m", total / 3600, (total % 3600) / 60)
    }
}

/// ETA 显示，无法估算时返回 "calculating..."
pub fn format_eta(eta: Option<Duration>) -> String {
    eta.map(format_remaining)
        .unwrap_or_else(|| "calculating...".to_string())
}

/// 总耗时：`42s` 或 `05m:30s`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 60.0 {
        format!("{:.0}s", secs)
    } else {
        let total = secs as u64;
        format!("{:02}m:{:02}s", total / 60, total % 60)
    }
}

/// 过长路径中间用 `...` 截断
pub fn truncate_path(path: &str, max_len: usize) -> String {
    let chars: Vec<char> = path.chars().collect();
    if chars.len() <= max_len {
        return path.to_string();
    }
    if max_len < 10 {
        return chars[..max_len].iter().collect();
    }
    let start_len = (max_len - 3) / 2;
    let end_len = max_len - 3 - start_len;
    let start: String = chars[..start_len].iter().collect();
    let end: String = chars[chars.len() - end_len..].iter().collect();
    format!("{}...{}", start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0B");
        assert_eq!(format_size(999), "999B");
        assert_eq!(format_size(1500), "1.5KB");
        assert_eq!(format_size(2_500_000), "2.5MB");
        assert_eq!(format_size(3_000_000_000), "3.0GB");
        assert_eq!(format_size(4_200_000_000_000), "4.20TB");
    }

    #[test]
    fn test_calc_speed() {
        assert_eq!(calc_speed(5_000_000, Duration::from_secs(2)), "2.50 MB/s");
        assert_eq!(calc_speed(5_000_000, Duration::ZERO), "0.00 MB/s");
    }

    #[test]
    fn test_format_remaining() {
        assert_eq!(format_remaining(Duration::from_secs(45)), "45s");
        assert_eq!(format_remaining(Duration::from_secs(187)), "03m:07s");
        assert_eq!(format_remaining(Duration::from_secs(7500)), "2h:05m");
        assert_eq!(format_eta(None), "calculating...");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(42)), "42s");
        assert_eq!(format_elapsed(Duration::from_secs(330)), "05m:30s");
    }

    #[test]
    fn test_truncate_path() {
        assert_eq!(truncate_path("short.txt", 40), "short.txt");
        let long = "a/very/long/path/that/goes/on/and/on/forever/file.bin";
        let cut = truncate_path(long, 20);
        assert_eq!(cut.chars().count(), 20);
        assert!(cut.starts_with("a/very/l"));
        assert!(cut.ends_with("file.bin"));
    }
}

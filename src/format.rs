// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Human-readable rendering of progress.
//!
//! Everything the user sees about an in-flight download comes out of
//! [`render_message`]; transports only relay the returned string.

use crate::progress::ProgressSnapshot;

/// Width of the progress bar used in status messages.
pub const DEFAULT_BAR_WIDTH: usize = 20;

/// Glyph for a filled bar cell.
pub const BAR_FULL: char = '█';

/// Glyph for an empty bar cell.
pub const BAR_EMPTY: char = '░';

/// Shown until the fetch backend reports its first progress event.
pub const INITIALIZING_MESSAGE: &str = "⏳ Initializing download...";

/// Placeholder for an unknown or not-yet-computed duration.
pub const DURATION_UNKNOWN: &str = "computing";

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Format a duration in seconds.
///
/// Absent, negative, or NaN input renders as `"computing"`. Values are
/// truncated, never rounded: `59.9` is `"59s"`.
pub fn format_duration(seconds: Option<f64>) -> String {
    let secs = match seconds {
        Some(s) if s >= 0.0 => s as u64,
        _ => return DURATION_UNKNOWN.to_string(),
    };

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Format a byte count using the smallest unit that fits (B, KB, MB).
pub fn format_size(bytes: u64) -> String {
    if bytes < KIB {
        format!("{} B", bytes)
    } else if bytes < MIB {
        format!("{:.1} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{:.1} MB", bytes as f64 / MIB as f64)
    }
}

/// Render a fixed-width bar: `floor(width * percentage / 100)` full cells,
/// clamped to `[0, width]`, followed by empty cells.
pub fn render_progress_bar(percentage: f64, width: usize) -> String {
    let raw = (width as f64 * percentage / 100.0).floor();
    let filled = if raw.is_nan() || raw <= 0.0 {
        0
    } else {
        (raw as usize).min(width)
    };

    let mut bar = String::with_capacity(width * BAR_FULL.len_utf8());
    bar.extend(std::iter::repeat(BAR_FULL).take(filled));
    bar.extend(std::iter::repeat(BAR_EMPTY).take(width - filled));
    bar
}

/// Compose the multi-line status block for a session.
///
/// `None` means no progress event has arrived yet.
pub fn render_message(snapshot: Option<&ProgressSnapshot>) -> String {
    render_message_with_width(snapshot, DEFAULT_BAR_WIDTH)
}

/// [`render_message`] with a custom bar width.
pub fn render_message_with_width(snapshot: Option<&ProgressSnapshot>, width: usize) -> String {
    let snapshot = match snapshot {
        Some(s) => s,
        None => return INITIALIZING_MESSAGE.to_string(),
    };

    let percentage = snapshot.percentage();
    let mib = MIB as f64;

    let mut message = String::from("📥 Downloading...\n\n");
    message.push_str(&format!("📊 Progress: {:.1}%\n", percentage));
    message.push_str(&render_progress_bar(percentage, width));
    message.push_str("\n\n");
    message.push_str(&format!(
        "📁 Downloaded: {:.1} MB / {:.1} MB\n",
        snapshot.downloaded_bytes as f64 / mib,
        snapshot.total_bytes as f64 / mib
    ));
    message.push_str(&format!(
        "⚡ Speed: {:.2} MB/s\n",
        snapshot.speed_bytes_per_sec / mib
    ));
    message.push_str(&format!(
        "⏱️ Time left: {}",
        format_duration(snapshot.eta_seconds.map(|s| s as f64))
    ));
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(bar: &str, glyph: char) -> usize {
        bar.chars().filter(|c| *c == glyph).count()
    }

    #[test]
    fn test_format_duration_unknown() {
        assert_eq!(format_duration(None), "computing");
        assert_eq!(format_duration(Some(-1.0)), "computing");
        assert_eq!(format_duration(Some(f64::NAN)), "computing");
    }

    #[test]
    fn test_format_duration_truncates() {
        assert_eq!(format_duration(Some(0.0)), "0s");
        assert_eq!(format_duration(Some(59.9)), "59s");
        assert_eq!(format_duration(Some(60.0)), "1m 0s");
        assert_eq!(format_duration(Some(125.7)), "2m 5s");
        assert_eq!(format_duration(Some(3599.0)), "59m 59s");
        assert_eq!(format_duration(Some(3600.0)), "1h 0m");
        assert_eq!(format_duration(Some(3661.0)), "1h 1m");
    }

    #[test]
    fn test_format_size_unit_boundaries() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(MIB - 1), "1024.0 KB");
        assert_eq!(format_size(MIB), "1.0 MB");
        assert_eq!(format_size(50 * MIB), "50.0 MB");
    }

    #[test]
    fn test_format_size_monotonic_across_units() {
        let samples = [0, 1, 512, 1023, 1024, 4096, 1_000_000, MIB, 3 * MIB, 900 * MIB];
        let scaled: Vec<f64> = samples
            .iter()
            .map(|b| {
                let s = format_size(*b);
                let (num, unit) = s.split_once(' ').unwrap();
                let factor = match unit {
                    "B" => 1.0,
                    "KB" => KIB as f64,
                    "MB" => MIB as f64,
                    other => panic!("unexpected unit {}", other),
                };
                num.parse::<f64>().unwrap() * factor
            })
            .collect();
        assert!(scaled.windows(2).all(|w| w[0] <= w[1]), "{:?}", scaled);
    }

    #[test]
    fn test_progress_bar_extremes() {
        let empty = render_progress_bar(0.0, 20);
        assert_eq!(count(&empty, BAR_EMPTY), 20);
        assert_eq!(count(&empty, BAR_FULL), 0);

        let full = render_progress_bar(100.0, 20);
        assert_eq!(count(&full, BAR_FULL), 20);
        assert_eq!(count(&full, BAR_EMPTY), 0);
    }

    #[test]
    fn test_progress_bar_half_and_clamping() {
        assert_eq!(count(&render_progress_bar(50.0, 20), BAR_FULL), 10);
        assert_eq!(count(&render_progress_bar(54.9, 20), BAR_FULL), 10);
        assert_eq!(count(&render_progress_bar(250.0, 20), BAR_FULL), 20);
        assert_eq!(count(&render_progress_bar(-5.0, 20), BAR_FULL), 0);
        assert_eq!(render_progress_bar(f64::NAN, 4).chars().count(), 4);
        assert_eq!(render_progress_bar(33.0, 10).chars().count(), 10);
    }

    #[test]
    fn test_render_message_initializing() {
        assert_eq!(render_message(None), INITIALIZING_MESSAGE);
    }

    #[test]
    fn test_render_message_complete() {
        let snapshot = ProgressSnapshot::new(26_738_688, Some(26_738_688), Some(2.0 * MIB as f64), Some(0));
        let message = render_message(Some(&snapshot));

        assert!(message.contains("100.0%"));
        assert!(message.contains(&render_progress_bar(100.0, DEFAULT_BAR_WIDTH)));
        assert!(message.contains("25.5 MB / 25.5 MB"));
        assert!(message.contains("2.00 MB/s"));
        assert!(message.contains("Time left: 0s"));
    }

    #[test]
    fn test_render_message_unknown_eta_differs_from_zero() {
        let unknown = ProgressSnapshot::new(10, Some(100), None, None);
        let zero = ProgressSnapshot::new(10, Some(100), None, Some(0));

        assert!(render_message(Some(&unknown)).contains("Time left: computing"));
        assert!(render_message(Some(&zero)).contains("Time left: 0s"));
    }
}

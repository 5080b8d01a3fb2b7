//! Video statistics windows and the optional text sidecar file.
//!
//! One line is appended per output window: delivery timing, loss and
//! per-zone macroblock status, plus the radio RSSI when the host supplies
//! it. The format is a stable tab-separated table with a single header
//! line, meant for offline link-quality analysis.

use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::Path;

use crate::error::Result;
use crate::rtcp::{VideoStats, MB_STATUS_CLASS_COUNT, MB_STATUS_ZONE_COUNT};

/// Periodic window gate for statistics output.
#[derive(Debug, Clone, Copy)]
pub struct StatsWindow {
    interval_us: u64,
    last_output_us: u64,
}

impl StatsWindow {
    pub fn new(interval_us: u64) -> Self {
        Self {
            interval_us,
            last_output_us: 0,
        }
    }

    /// True when a new window has elapsed at `now_us`; arms the next one.
    pub fn due(&mut self, now_us: u64) -> bool {
        if self.interval_us == 0 {
            return false;
        }
        if self.last_output_us == 0 || now_us.saturating_sub(self.last_output_us) >= self.interval_us
        {
            self.last_output_us = now_us;
            true
        } else {
            false
        }
    }
}

/// Append-only sidecar writer.
#[derive(Debug)]
pub struct StatsFileWriter {
    out: BufWriter<File>,
}

impl StatsFileWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = Self {
            out: BufWriter::new(file),
        };
        writer.write_header()?;
        Ok(writer)
    }

    fn write_header(&mut self) -> Result<()> {
        let mut columns = vec![
            "timestamp_us".to_string(),
            "rssi".into(),
            "total_frames".into(),
            "output_frames".into(),
            "errored_output_frames".into(),
            "missed_frames".into(),
            "discarded_frames".into(),
            "timestamp_delta_integral".into(),
            "timestamp_delta_integral_sq".into(),
            "timing_error_integral".into(),
            "timing_error_integral_sq".into(),
            "estimated_latency_integral".into(),
            "estimated_latency_integral_sq".into(),
            "errored_seconds".into(),
        ];
        for zone in 0..MB_STATUS_ZONE_COUNT {
            columns.push(format!("errored_seconds_zone{zone}"));
        }
        for class in 0..MB_STATUS_CLASS_COUNT {
            for zone in 0..MB_STATUS_ZONE_COUNT {
                columns.push(format!("mb_class{class}_zone{zone}"));
            }
        }
        writeln!(self.out, "{}", columns.join("\t"))?;
        Ok(())
    }

    pub fn append(&mut self, stats: &VideoStats) -> Result<()> {
        let mut fields = vec![
            stats.timestamp_us.to_string(),
            stats.rssi.to_string(),
            stats.total_frame_count.to_string(),
            stats.output_frame_count.to_string(),
            stats.errored_output_frame_count.to_string(),
            stats.missed_frame_count.to_string(),
            stats.discarded_frame_count.to_string(),
            stats.timestamp_delta_integral.to_string(),
            stats.timestamp_delta_integral_sq.to_string(),
            stats.timing_error_integral.to_string(),
            stats.timing_error_integral_sq.to_string(),
            stats.estimated_latency_integral.to_string(),
            stats.estimated_latency_integral_sq.to_string(),
            stats.errored_second_count.to_string(),
        ];
        for zone in 0..MB_STATUS_ZONE_COUNT {
            fields.push(stats.errored_second_count_by_zone[zone].to_string());
        }
        for class in 0..MB_STATUS_CLASS_COUNT {
            for zone in 0..MB_STATUS_ZONE_COUNT {
                fields.push(stats.macroblock_status[class][zone].to_string());
            }
        }
        writeln!(self.out, "{}", fields.join("\t"))?;
        self.out.flush()?;
        Ok(())
    }
}

/// Fold per-frame delivery timing into the stats integrals.
///
/// `timestamp_delta` tracks inter-frame spacing, `timing_error` the
/// deviation from the nominal frame interval, `estimated_latency` the
/// acquisition-to-delivery time through the recovered sender clock.
pub fn accumulate_timing(
    stats: &mut VideoStats,
    frame_interval_us: u64,
    prev_frame_ntp_us: u64,
    frame_ntp_us: u64,
    delivery_latency_us: u64,
) {
    if prev_frame_ntp_us != 0 && frame_ntp_us > prev_frame_ntp_us {
        let delta = frame_ntp_us - prev_frame_ntp_us;
        stats.timestamp_delta_integral += delta;
        stats.timestamp_delta_integral_sq += delta * delta;
        if frame_interval_us > 0 {
            let error = delta.abs_diff(frame_interval_us);
            stats.timing_error_integral += error;
            stats.timing_error_integral_sq += error * error;
        }
    }
    stats.estimated_latency_integral += delivery_latency_us;
    stats.estimated_latency_integral_sq += delivery_latency_us * delivery_latency_us;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_cadence() {
        let mut w = StatsWindow::new(1_000_000);
        assert!(w.due(100));
        assert!(!w.due(500_000));
        assert!(w.due(1_100_100));
        assert!(!w.due(1_200_000));
    }

    #[test]
    fn test_window_disabled() {
        let mut w = StatsWindow::new(0);
        assert!(!w.due(10_000_000));
    }

    #[test]
    fn test_sidecar_rows() {
        let dir = std::env::temp_dir().join(format!("uavlink-stats-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("videostats.tsv");

        let mut writer = StatsFileWriter::create(&path).unwrap();
        let mut stats = VideoStats {
            timestamp_us: 42,
            total_frame_count: 10,
            output_frame_count: 9,
            rssi: -60,
            ..Default::default()
        };
        stats.macroblock_status[1][2] = 7;
        writer.append(&stats).unwrap();
        drop(writer);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let header_cols = lines[0].split('\t').count();
        let row_cols = lines[1].split('\t').count();
        assert_eq!(header_cols, row_cols);
        assert!(lines[1].starts_with("42\t-60\t10\t9"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_timing_accumulation() {
        let mut stats = VideoStats::default();
        accumulate_timing(&mut stats, 33_333, 1_000_000, 1_033_333, 15_000);
        accumulate_timing(&mut stats, 33_333, 1_033_333, 1_070_000, 18_000);
        assert_eq!(stats.timestamp_delta_integral, 33_333 + 36_667);
        assert_eq!(stats.timing_error_integral, 0 + 3_334);
        assert_eq!(stats.estimated_latency_integral, 33_000);
    }
}

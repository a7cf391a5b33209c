//! Endurance results: latency statistics and the CSV reports.

use crate::error::AppResult;
use log::info;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// Columns of `entertainment_results.csv`.
pub const ENTERTAINMENT_HEADER: [&str; 10] = [
    "Lifecycle",
    "switches",
    "ent_failure_rate",
    "ent_failures",
    "ent_total",
    "latency_max",
    "latency_min",
    "latency_avg",
    "latency_median",
    "color",
];

/// Columns of `phone_results.csv`.
pub const PHONE_HEADER: [&str; 13] = [
    "Lifecycle",
    "switches",
    "outgoing_failure_rate",
    "outgoing_failures",
    "outgoing_total",
    "incoming_failure_rate",
    "incoming_failures",
    "incoming_total",
    "latency_max",
    "latency_min",
    "latency_avg",
    "latency_median",
    "color",
];

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Summary of the positive latencies of one leg, rounded to 4 decimals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
    /// Slowest round trip
    pub max: f64,
    /// Fastest round trip
    pub min: f64,
    /// Arithmetic mean
    pub avg: f64,
    /// Element at `len / 2` of the sorted samples
    pub median: f64,
    /// Number of positive samples
    pub samples: usize,
}

impl LatencyStats {
    /// `None` when no sample is above zero.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let mut valid: Vec<f64> = samples.iter().copied().filter(|&l| l > 0.0).map(round4).collect();
        if valid.is_empty() {
            return None;
        }
        valid.sort_by(f64::total_cmp);
        let sum: f64 = valid.iter().sum();
        Some(Self {
            max: valid[valid.len() - 1],
            min: valid[0],
            avg: round4(sum / valid.len() as f64),
            median: valid[valid.len() / 2],
            samples: valid.len(),
        })
    }
}

/// Counters of one validated leg.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LegStats {
    /// Frequency changes evaluated, passed or failed
    pub total: u32,
    /// Echoed within the response budget
    pub passes: u32,
    /// Not echoed in time
    pub failures: u32,
}

impl LegStats {
    /// Counts a successful change.
    pub fn pass(&mut self) {
        self.total += 1;
        self.passes += 1;
    }

    /// Counts a failed change.
    pub fn fail(&mut self) {
        self.total += 1;
        self.failures += 1;
    }

    /// Failure rate in percent, 0 when nothing was evaluated.
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        f64::from(self.failures) / f64::from(self.total) * 100.0
    }
}

/// Outcome of one `switch_bluetooth_services` run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SwitchReport {
    /// Entertainment to call transitions
    pub switches: u32,
    /// A2DP to microphone
    pub entertainment: LegStats,
    /// Simulator to device to microphone
    pub incoming: LegStats,
    /// Speaker to device to SCO
    pub outgoing: LegStats,
    /// `None` when no entertainment round trip succeeded
    pub entertainment_latency: Option<LatencyStats>,
    /// `None` when no phone round trip succeeded
    pub phone_latency: Option<LatencyStats>,
}

impl SwitchReport {
    /// Logs counters and latencies at info level.
    pub fn log_summary(&self) {
        info!("Number of Switches: {}", self.switches);
        let legs = [
            ("Entertainment", &self.entertainment),
            ("Incoming Phone", &self.incoming),
            ("Outgoing Phone", &self.outgoing),
        ];
        for (name, leg) in legs {
            if leg.total > 0 {
                info!(
                    "{} Failure rate {}% ({}/{}/{})",
                    name,
                    leg.failure_rate(),
                    leg.passes,
                    leg.failures,
                    leg.total
                );
            }
        }
        for (name, latency) in [("Phone", &self.phone_latency), ("Entertainment", &self.entertainment_latency)] {
            match latency {
                Some(l) => info!(
                    "{} Latencies. Max={} Min={} Avg={} Median={}",
                    name, l.max, l.min, l.avg, l.median
                ),
                None => info!("No positive {} latency was measured", name.to_lowercase()),
            }
        }
    }
}

fn latency_cells(latency: Option<&LatencyStats>) -> [String; 4] {
    match latency {
        Some(l) => [l.max.to_string(), l.min.to_string(), l.avg.to_string(), l.median.to_string()],
        None => Default::default(),
    }
}

fn color(failed: bool) -> &'static str {
    if failed {
        "red"
    } else {
        "green"
    }
}

/// Appends per-lifecycle rows to `endurance_report/bt_ent.csv` and `bt_phone.csv`.
#[derive(Debug, Clone)]
pub struct EnduranceReportWriter {
    entertainment_path: PathBuf,
    phone_path: PathBuf,
}

impl EnduranceReportWriter {
    /// Creates both report files with their headers, truncating old ones.
    pub fn prepare_reports(results_dir: &Path) -> AppResult<Self> {
        let dir = results_dir.join("endurance_report");
        if !dir.exists() {
            info!("Creating report directory '{}'", dir.display());
            fs::create_dir_all(&dir)?;
        }
        let writer = Self {
            entertainment_path: dir.join("bt_ent.csv"),
            phone_path: dir.join("bt_phone.csv"),
        };

        let mut ent = csv::Writer::from_path(&writer.entertainment_path)?;
        ent.write_record(ENTERTAINMENT_HEADER)?;
        ent.flush()?;
        let mut phone = csv::Writer::from_path(&writer.phone_path)?;
        phone.write_record(PHONE_HEADER)?;
        phone.flush()?;
        Ok(writer)
    }

    /// Path of the entertainment CSV.
    pub fn entertainment_path(&self) -> &Path {
        &self.entertainment_path
    }

    /// Path of the phone CSV.
    pub fn phone_path(&self) -> &Path {
        &self.phone_path
    }

    fn appender(path: &Path) -> AppResult<csv::Writer<fs::File>> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(csv::Writer::from_writer(file))
    }

    /// Appends one row per CSV for `lifecycle`.
    pub fn append_report_rows(&self, lifecycle: u32, report: &SwitchReport) -> AppResult<()> {
        let ent = &report.entertainment;
        let mut row = vec![
            lifecycle.to_string(),
            report.switches.to_string(),
            ent.failure_rate().to_string(),
            ent.failures.to_string(),
            ent.total.to_string(),
        ];
        row.extend(latency_cells(report.entertainment_latency.as_ref()));
        row.push(color(ent.failures > 0).to_string());
        let mut writer = Self::appender(&self.entertainment_path)?;
        writer.write_record(&row)?;
        writer.flush()?;

        let (outgoing, incoming) = (&report.outgoing, &report.incoming);
        let mut row = vec![
            lifecycle.to_string(),
            report.switches.to_string(),
            outgoing.failure_rate().to_string(),
            outgoing.failures.to_string(),
            outgoing.total.to_string(),
            incoming.failure_rate().to_string(),
            incoming.failures.to_string(),
            incoming.total.to_string(),
        ];
        row.extend(latency_cells(report.phone_latency.as_ref()));
        row.push(color(outgoing.failures > 0 || incoming.failures > 0).to_string());
        let mut writer = Self::appender(&self.phone_path)?;
        writer.write_record(&row)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_stats_filter_and_round() {
        let stats = LatencyStats::from_samples(&[0.123456, -0.5, 0.0, 0.3, 0.2]).unwrap();
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.max, 0.3);
        assert_eq!(stats.min, 0.1235);
        assert_eq!(stats.avg, 0.2078);
        // sorted [0.1235, 0.2, 0.3], index 1
        assert_eq!(stats.median, 0.2);
    }

    #[test]
    fn test_median_of_even_count_takes_upper_middle() {
        let stats = LatencyStats::from_samples(&[0.4, 0.1, 0.3, 0.2]).unwrap();
        assert_eq!(stats.median, 0.3);
    }

    #[test]
    fn test_no_positive_latency() {
        assert_eq!(LatencyStats::from_samples(&[0.0, -1.0]), None);
        assert_eq!(LatencyStats::from_samples(&[]), None);
    }

    #[test]
    fn test_leg_failure_rate() {
        let mut leg = LegStats::default();
        assert_eq!(leg.failure_rate(), 0.0);
        leg.pass();
        leg.pass();
        leg.pass();
        leg.fail();
        assert_eq!(leg.total, 4);
        assert_eq!(leg.failure_rate(), 25.0);
    }

    #[test]
    fn test_reports_have_headers_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let writer = EnduranceReportWriter::prepare_reports(dir.path()).unwrap();

        let mut report = SwitchReport {
            switches: 2,
            entertainment_latency: LatencyStats::from_samples(&[0.25]),
            ..Default::default()
        };
        report.entertainment.pass();
        report.incoming.pass();
        report.outgoing.fail();
        writer.append_report_rows(1, &report).unwrap();

        let ent = fs::read_to_string(writer.entertainment_path()).unwrap();
        let lines: Vec<&str> = ent.lines().collect();
        assert_eq!(lines[0], ENTERTAINMENT_HEADER.join(","));
        assert_eq!(lines[1], "1,2,0,0,1,0.25,0.25,0.25,0.25,green");

        let phone = fs::read_to_string(writer.phone_path()).unwrap();
        let lines: Vec<&str> = phone.lines().collect();
        assert_eq!(lines[0], PHONE_HEADER.join(","));
        assert_eq!(lines[1], "1,2,100,1,1,0,0,1,,,,,red");
    }

    #[test]
    fn test_summary_serializes_missing_latency_as_null() {
        let mut report = SwitchReport {
            switches: 3,
            phone_latency: LatencyStats::from_samples(&[0.5]),
            ..Default::default()
        };
        report.incoming.pass();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["switches"], 3);
        assert_eq!(json["incoming"]["passes"], 1);
        assert_eq!(json["phone_latency"]["median"], 0.5);
        assert!(json["entertainment_latency"].is_null());
    }
}

//! Small helpers shared by the workspace crates: step timings and memory reporting.

use std::{
    collections::HashMap,
    fs::OpenOptions,
    path::Path,
    time::{Duration, Instant},
};

use bytesize::ByteSize;
use csv::WriterBuilder;
use tracing::info;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TimingsError {
    #[error("step {0} is not part of this timing report")]
    UnknownStep(String),
    #[error("step {0} was already recorded, a report holds one run at a time")]
    AlreadyRecorded(String),
}

/// Resident memory of the current process, if the platform reports it.
pub fn resident_memory() -> Option<ByteSize> {
    memory_stats::memory_stats().map(|stats| ByteSize::b(stats.physical_mem as u64))
}

/// Human readable byte count, e.g. `44.7 MiB`.
pub fn format_bytes(bytes: u64) -> String {
    ByteSize::b(bytes).to_string()
}

/// Collects the wall-clock duration of a fixed set of named steps for a single run.
///
/// One row per run: recording the same step twice is an error. The row can be
/// appended to a CSV file, the header line is written when the file is new.
#[derive(Debug)]
pub struct Timings {
    steps: Vec<String>,
    elapsed: HashMap<String, Duration>,
}

impl Timings {
    pub fn from_steps<S: IntoIterator<Item = T>, T: Into<String>>(steps: S) -> Self {
        Self {
            steps: steps.into_iter().map(Into::into).collect(),
            elapsed: HashMap::new(),
        }
    }

    /// Runs `f`, storing how long it took under `step`.
    pub fn record<A, F: FnOnce() -> A>(&mut self, step: &str, f: F) -> Result<A, TimingsError> {
        self.check(step)?;
        let now = Instant::now();
        let output = f();
        let elapsed = now.elapsed();
        match resident_memory() {
            Some(rss) => info!("STEP: {step} took {}ms (rss {rss})", elapsed.as_millis()),
            None => info!("STEP: {step} took {}ms", elapsed.as_millis()),
        }
        self.elapsed.insert(step.to_string(), elapsed);
        Ok(output)
    }

    pub fn elapsed(&self, step: &str) -> Option<Duration> {
        self.elapsed.get(step).copied()
    }

    pub fn total(&self) -> Duration {
        self.elapsed.values().sum()
    }

    fn check(&self, step: &str) -> Result<(), TimingsError> {
        if !self.steps.iter().any(|s| s == step) {
            return Err(TimingsError::UnknownStep(step.to_string()));
        }
        if self.elapsed.contains_key(step) {
            return Err(TimingsError::AlreadyRecorded(step.to_string()));
        }
        Ok(())
    }

    /// Appends this run as a CSV row of milliseconds. Steps that did not run are left empty.
    pub fn flush_csv<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let file_exists = path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut writer = WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if !file_exists {
            writer.write_record(&self.steps)?;
        }
        let values: Vec<String> = self
            .steps
            .iter()
            .map(|s| {
                self.elapsed
                    .get(s)
                    .map(|d| d.as_millis().to_string())
                    .unwrap_or_default()
            })
            .collect();
        writer.write_record(&values)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_record_rejects_unknown_and_repeated_steps() {
        let mut timings = Timings::from_steps(["fetch", "export"]);
        assert_eq!(timings.record("fetch", || 42), Ok(42));
        assert!(timings.elapsed("fetch").is_some());
        assert_eq!(
            timings.record("fetch", || ()),
            Err(TimingsError::AlreadyRecorded("fetch".to_string()))
        );
        assert_eq!(
            timings.record("train", || ()),
            Err(TimingsError::UnknownStep("train".to_string()))
        );
        assert!(timings.elapsed("export").is_none());
        assert_eq!(timings.total(), timings.elapsed("fetch").unwrap());
    }

    #[test]
    fn test_flush_appends_rows_with_single_header() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("timings.csv");

        let mut first = Timings::from_steps(["a", "b"]);
        first.record("a", || ())?;
        first.flush_csv(&path)?;

        let mut second = Timings::from_steps(["a", "b"]);
        second.record("b", || ())?;
        second.flush_csv(&path)?;

        let content = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "a,b");
        assert!(lines[1].ends_with(','));
        assert!(lines[2].starts_with(','));
        Ok(())
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert!(format_bytes(3 * 1024 * 1024).starts_with('3'));
    }
}

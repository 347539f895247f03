//! Fixed-duration sampling loop that appends one csv row per iteration.

use std::{
    fs::File,
    io::Write,
    path::Path,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant, SystemTime},
};

use anyhow::Context;
use log::{debug, info, warn};

use crate::{channel::header, error::ConfigError, Channel, Sampler, SENTINEL};

/// Duration and pacing of a logger run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoggerConfig {
    pub duration: Duration,
    /// Minimum time between the starts of two iterations. Zero means "as fast as possible".
    pub interval: Duration,
}

impl LoggerConfig {
    /// Validates durations given in seconds.
    pub fn from_secs(duration: f64, interval: f64) -> Result<LoggerConfig, ConfigError> {
        let duration = crate::duration_from_secs(duration)?;
        if !(interval >= 0.0) || !interval.is_finite() {
            return Err(ConfigError::NegativeInterval(interval));
        }
        Ok(LoggerConfig {
            duration,
            interval: crate::checked_secs("interval", interval)?,
        })
    }
}

/// Cancellation flag shared between a logger and whoever may interrupt it.
///
/// Unlike a plain atomic flag, it also wakes up a logger that is waiting for its next iteration.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Cancellation {
    pub fn new() -> Cancellation {
        Cancellation::default()
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits until `timeout` elapses or the flag is set. Returns `true` if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (cancelled, _) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cancelled
    }
}

/// One row of a time series. A `None` value is a failed read.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// seconds since the Unix epoch
    pub timestamp: f64,
    pub values: Vec<Option<f64>>,
}

/// Append-only csv writer of a time series.
///
/// The header is written on creation, every row is flushed as soon as it's appended.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
    columns: usize,
}

impl CsvSink<File> {
    /// Creates (or truncates) the csv file at `path`.
    pub fn create(path: &Path, channels: &[Channel]) -> anyhow::Result<CsvSink<File>> {
        let file = File::create(path).with_context(|| format!("create {}", path.to_string_lossy()))?;
        CsvSink::new(file, channels)
    }
}

impl<W: Write> CsvSink<W> {
    pub fn new(out: W, channels: &[Channel]) -> anyhow::Result<CsvSink<W>> {
        let mut writer = csv::Writer::from_writer(out);
        let header = header(channels);
        writer.write_record(&header)?;
        writer.flush()?;
        Ok(CsvSink {
            writer,
            columns: header.len(),
        })
    }

    /// Writes a whole row. Failed values are written as the sentinel.
    pub fn append(&mut self, sample: &Sample) -> anyhow::Result<()> {
        anyhow::ensure!(
            sample.values.len() + 1 == self.columns,
            "sample has {} values but the header has {} columns",
            sample.values.len(),
            self.columns
        );
        let mut record = Vec::with_capacity(self.columns);
        record.push(format!("{:.6}", sample.timestamp));
        record.extend(sample.values.iter().map(|v| v.unwrap_or(SENTINEL).to_string()));
        self.writer.write_record(&record)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and returns the underlying writer.
    pub fn finish(self) -> anyhow::Result<W> {
        self.writer.into_inner().map_err(|e| anyhow::anyhow!("failed to flush the csv sink: {}", e.error()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The duration has elapsed.
    Completed,
    /// The run was cancelled before the end.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogSummary {
    pub rows: usize,
    pub outcome: Outcome,
    /// Number of failed reads, per channel name, in channel order.
    pub failures: Vec<(String, usize)>,
}

/// Samples a fixed set of channels at regular intervals, for a fixed duration.
pub struct TimeSeriesLogger<S: Sampler> {
    channels: Vec<Channel>,
    sampler: S,
    config: LoggerConfig,
}

impl<S: Sampler> TimeSeriesLogger<S> {
    pub fn new(channels: Vec<Channel>, sampler: S, config: LoggerConfig) -> Result<TimeSeriesLogger<S>, ConfigError> {
        crate::channel::check_channels(&channels)?;
        Ok(TimeSeriesLogger {
            channels,
            sampler,
            config,
        })
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Runs the sampling loop until the duration elapses or `cancel` is set.
    ///
    /// All the channels of an iteration share the same timestamp. A failed read doesn't stop
    /// the loop: the sentinel is written instead. When cancelled, the iteration in progress is
    /// dropped and the sink is closed, so the output only contains whole rows.
    pub fn run<W: Write>(&mut self, mut sink: CsvSink<W>, cancel: &Cancellation) -> anyhow::Result<LogSummary> {
        let LoggerConfig { duration, interval } = self.config;
        info!(
            "logging {} channel(s) for {:?}, interval {:?}",
            self.channels.len(),
            duration,
            interval
        );

        let mut failures = vec![0usize; self.channels.len()];
        let mut rows = 0;

        // Timestamps are derived from a monotonic clock, so that they never decrease.
        let start = Instant::now();
        let start_epoch = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH)?.as_secs_f64();
        let deadline = start
            .checked_add(duration)
            .ok_or_else(|| anyhow::anyhow!("duration {duration:?} is too large"))?;
        let mut next_start = start;

        let outcome = loop {
            if cancel.is_cancelled() {
                break Outcome::Interrupted;
            }
            let now = Instant::now();
            if now >= deadline {
                break Outcome::Completed;
            }
            let timestamp = start_epoch + (now - start).as_secs_f64();

            let polled = self.sampler.poll();
            if let Err(e) = &polled {
                warn!("failed to refresh the samplers: {e}");
            }
            let mut values = Vec::with_capacity(self.channels.len());
            for channel in &self.channels {
                let value = match &polled {
                    Ok(()) => self.sampler.read(channel),
                    Err(_) => Err(crate::SampleError::unavailable(channel.name(), "refresh failed")),
                };
                match value {
                    Ok(v) => values.push(Some(v)),
                    Err(e) => {
                        warn!("{channel}: {e}, writing {SENTINEL} instead");
                        values.push(None);
                    }
                }
            }

            if cancel.is_cancelled() {
                debug!("cancelled while sampling, dropping the current row");
                break Outcome::Interrupted;
            }
            let sample = Sample { timestamp, values };
            sink.append(&sample)?;
            rows += 1;
            for (count, _) in failures.iter_mut().zip(&sample.values).filter(|(_, v)| v.is_none()) {
                *count += 1;
            }

            if !interval.is_zero() {
                let now = Instant::now();
                // don't try to catch up after a slow iteration
                next_start = next_start.checked_add(interval).unwrap_or(deadline).max(now);
                let wake_up = next_start.min(deadline);
                if wake_up > now && cancel.wait_timeout(wake_up - now) {
                    break Outcome::Interrupted;
                }
            }
        };

        sink.finish()?;

        let failures: Vec<(String, usize)> = self
            .channels
            .iter()
            .map(|c| c.name().to_owned())
            .zip(failures)
            .collect();
        for (name, n) in failures.iter().filter(|(_, n)| *n > 0) {
            warn!("{name}: {n}/{rows} reads failed and were replaced by {SENTINEL}");
        }
        info!("{rows} row(s) written, {outcome:?}");

        Ok(LogSummary {
            rows,
            outcome,
            failures,
        })
    }
}

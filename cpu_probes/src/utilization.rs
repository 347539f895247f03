// Per-cpu utilization, computed from the tick counters of /proc/stat.

use std::{collections::BTreeMap, time::Duration};

use log::debug;
use procfs::{CpuTime, CurrentSI, KernelStats};

use crate::{error::SampleError, Channel, Sampler, Source};

const SOURCE_NAME: &str = "/proc/stat";

/// Default time between the two snapshots of a refresh.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(100);

/// Tick counters of one cpu, reduced to what the utilization needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTicks {
    pub busy: u64,
    pub total: u64,
}

impl From<&CpuTime> for CpuTicks {
    fn from(t: &CpuTime) -> CpuTicks {
        let idle = t.idle + t.iowait.unwrap_or(0);
        // guest time is already included in user time
        let busy = t.user + t.nice + t.system + t.irq.unwrap_or(0) + t.softirq.unwrap_or(0) + t.steal.unwrap_or(0);
        CpuTicks {
            busy,
            total: busy + idle,
        }
    }
}

/// Returns the utilization, in percent, of a cpu between two snapshots.
///
/// Like `top`, an interval without any tick counts as idle.
pub fn utilization_between(before: CpuTicks, after: CpuTicks) -> f64 {
    let total = after.total.saturating_sub(before.total);
    if total == 0 {
        return 0.0;
    }
    let busy = after.busy.saturating_sub(before.busy).min(total);
    100.0 * busy as f64 / total as f64
}

/// Samples the utilization of individual cpus.
///
/// Each [Sampler::poll] blocks for the measurement window: it takes a snapshot
/// of the counters of all the cpus, waits, takes another one and computes the
/// utilization of every cpu over the window.
pub struct UtilizationSampler {
    window: Duration,
    /// Utilization of each cpu computed by the last poll, by cpu id.
    current: BTreeMap<u32, f64>,
}

impl Default for UtilizationSampler {
    fn default() -> Self {
        UtilizationSampler::new(DEFAULT_WINDOW)
    }
}

impl UtilizationSampler {
    pub fn new(window: Duration) -> UtilizationSampler {
        UtilizationSampler {
            window,
            current: BTreeMap::new(),
        }
    }
}

/// Associates the per-cpu lines of /proc/stat with their cpu id.
///
/// /proc/stat only lists the online cpus, in increasing order, and procfs drops their number.
pub fn ticks_by_cpu(online: &[u32], ticks: Vec<CpuTicks>) -> Result<BTreeMap<u32, CpuTicks>, SampleError> {
    if online.len() != ticks.len() {
        return Err(SampleError::unavailable(
            SOURCE_NAME,
            format!("{} cpu lines for {} online cpus", ticks.len(), online.len()),
        ));
    }
    let mut sorted = online.to_vec();
    sorted.sort_unstable();
    Ok(sorted.into_iter().zip(ticks).collect())
}

fn online() -> Result<Vec<u32>, SampleError> {
    crate::online_cpus().map_err(|e| SampleError::unavailable(SOURCE_NAME, format!("{e:#}")))
}

fn snapshot() -> Result<BTreeMap<u32, CpuTicks>, SampleError> {
    let online_before = online()?;
    let stats = KernelStats::current().map_err(|e| SampleError::unavailable(SOURCE_NAME, e))?;
    if online()? != online_before {
        return Err(SampleError::unavailable(SOURCE_NAME, "cpu hotplug during the snapshot"));
    }
    ticks_by_cpu(&online_before, stats.cpu_time.iter().map(CpuTicks::from).collect())
}

/// Utilization of the cpus present in both snapshots.
pub fn utilization_by_cpu(before: &BTreeMap<u32, CpuTicks>, after: &BTreeMap<u32, CpuTicks>) -> BTreeMap<u32, f64> {
    before
        .iter()
        .filter_map(|(cpu, b)| after.get(cpu).map(|a| (*cpu, utilization_between(*b, *a))))
        .collect()
}

impl Sampler for UtilizationSampler {
    fn poll(&mut self) -> Result<(), SampleError> {
        self.current.clear();
        let before = snapshot()?;
        std::thread::sleep(self.window);
        let after = snapshot()?;
        self.current = utilization_by_cpu(&before, &after);
        debug!("cpu utilization: {:?}", self.current);
        Ok(())
    }

    fn read(&mut self, channel: &Channel) -> Result<f64, SampleError> {
        match channel.source() {
            Source::Utilization { cpu } => self.current.get(&cpu).copied().ok_or_else(|| {
                SampleError::unavailable(SOURCE_NAME, format!("no utilization for cpu {cpu}"))
            }),
            other => Err(SampleError::unavailable(
                SOURCE_NAME,
                format!("cannot read {} channels", other.kind()),
            )),
        }
    }
}

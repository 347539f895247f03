use std::{
    fs,
    num::ParseIntError,
    time::{Duration, Instant},
};

pub mod channel;
pub mod combine;
mod command;
pub mod error;
pub mod experiment;
pub mod frequency;
pub mod load;
pub mod logger;
pub mod msr;
pub mod overflow;
pub mod powercap;
pub mod sampler_set;
pub mod series;
pub mod utilization;

pub use channel::{Channel, Source, SourceKind};
pub use command::Privilege;
pub use error::{ConfigError, CorrectionError, SampleError};

/// Value written in place of a reading that failed.
pub const SENTINEL: f64 = 0.0;

/// Reads channel values from one kind of OS or hardware source.
///
/// ## Usage
///
/// ```no_run
/// use cpu_probes::{Channel, Sampler, utilization::UtilizationSampler};
///
/// let channels: Vec<Channel> = vec!["util:0".parse()?, "util:1".parse()?];
/// let mut sampler = UtilizationSampler::default();
/// loop {
///     sampler.poll()?;
///     for c in &channels {
///         println!("{}: {}%", c.name(), sampler.read(c)?);
///     }
/// }
/// # Ok::<(), anyhow::Error>(())
/// ```
///
/// A sampler is called once per logger iteration and must not keep any state
/// between iterations other than what the source itself holds (for instance
/// an open file to a hardware counter).
pub trait Sampler: Send {
    /// Refreshes the source before the channels of one iteration are read.
    ///
    /// Most sources are read directly by [Sampler::read] and don't need this.
    fn poll(&mut self) -> Result<(), SampleError> {
        Ok(())
    }

    /// Returns the current value of `channel`.
    ///
    /// Reading a channel whose source this sampler doesn't handle is a
    /// [SampleError::SourceUnavailable] error.
    fn read(&mut self, channel: &Channel) -> Result<f64, SampleError>;
}

impl<S: Sampler + ?Sized> Sampler for Box<S> {
    fn poll(&mut self) -> Result<(), SampleError> {
        (**self).poll()
    }

    fn read(&mut self, channel: &Channel) -> Result<f64, SampleError> {
        (**self).read(channel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuId {
    pub cpu: u32,
    pub socket: u32,
}

/// Converts a duration given in seconds, which must be strictly positive.
///
/// The duration must also fit after the current instant, so that a deadline can be computed.
pub fn duration_from_secs(secs: f64) -> Result<Duration, ConfigError> {
    if !(secs > 0.0) || !secs.is_finite() {
        return Err(ConfigError::NonPositiveDuration(secs));
    }
    checked_secs("duration", secs)
}

/// Converts a number of seconds that is already known to be positive and finite.
pub(crate) fn checked_secs(name: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    let too_long = || ConfigError::TooLong { name, value: secs };
    let duration = Duration::try_from_secs_f64(secs).map_err(|_| too_long())?;
    Instant::now().checked_add(duration).ok_or_else(too_long)?;
    Ok(duration)
}

/// Lists the online cpus, as reported by the kernel.
pub fn online_cpus() -> anyhow::Result<Vec<u32>> {
    let list = fs::read_to_string("/sys/devices/system/cpu/online")?;
    parse_cpu_list(&list)
}

/// Parses a kernel cpu list such as `0,64`, `0-3` or `0-1,64-66`.
pub fn parse_cpu_list(cpulist: &str) -> anyhow::Result<Vec<u32>> {
    // handles "n" or "start-end"
    fn parse_cpulist_item(item: &str) -> anyhow::Result<Vec<u32>> {
        let bounds: Vec<u32> = item
            .split('-')
            .map(str::parse)
            .collect::<Result<Vec<u32>, ParseIntError>>()?;

        match bounds.as_slice() {
            &[start, end] if start <= end => Ok((start..=end).collect()),
            &[n] => Ok(vec![n]),
            _ => Err(anyhow::anyhow!("invalid cpulist: {}", item)),
        }
    }

    let cpus: Vec<u32> = cpulist
        .trim_end()
        .split(',')
        .map(parse_cpulist_item)
        .collect::<anyhow::Result<Vec<Vec<u32>>>>()?
        .into_iter() // not the same as iter() !
        .flatten()
        .collect();

    Ok(cpus)
}

/// Formats a list of cpus as a comma-separated string, the format expected by `taskset` and `cpupower`.
pub fn format_cpu_list(cpus: &[u32]) -> String {
    mkstring(cpus, ",")
}

/// Takes a slice of elements that can be converted to strings, converts them and joins them all.
pub fn mkstring<A: ToString>(elems: &[A], sep: &str) -> String {
    elems.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(sep)
}

//! Current frequency of individual cores.

use std::{fs, path::PathBuf};

use clap::ValueEnum;
use log::debug;
use regex::Regex;

use crate::{command::run_command, error::SampleError, Channel, Privilege, Sampler, Source};

const CPU_SYSFS_PATH: &str = "/sys/devices/system/cpu";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FrequencyBackend {
    /// cpufreq files in sysfs
    Sysfs,
    /// `cpupower frequency-info`
    Cpupower,
}

/// Reads `scaling_cur_freq` from the cpufreq sysfs.
pub struct SysfsFrequencySampler {
    root: PathBuf,
}

impl Default for SysfsFrequencySampler {
    fn default() -> Self {
        SysfsFrequencySampler::with_root(CPU_SYSFS_PATH)
    }
}

impl SysfsFrequencySampler {
    /// Reads the cpufreq files below `root` instead of `/sys/devices/system/cpu`.
    pub fn with_root(root: impl Into<PathBuf>) -> SysfsFrequencySampler {
        SysfsFrequencySampler { root: root.into() }
    }

    fn freq_path(&self, cpu: u32) -> PathBuf {
        self.root.join(format!("cpu{cpu}/cpufreq/scaling_cur_freq"))
    }
}

impl Sampler for SysfsFrequencySampler {
    fn read(&mut self, channel: &Channel) -> Result<f64, SampleError> {
        let Source::Frequency { cpu } = channel.source() else {
            return Err(SampleError::unavailable("cpufreq", format!("cannot read {}", channel)));
        };
        let path = self.freq_path(cpu);
        let source_name = path.to_string_lossy().into_owned();
        let content = fs::read_to_string(&path).map_err(|e| SampleError::unavailable(&source_name, e))?;
        let khz: f64 = content
            .trim_end()
            .parse()
            .map_err(|_| SampleError::parse(&source_name, content.trim_end()))?;
        Ok(khz / 1000.0)
    }
}

/// Runs `cpupower -c <cpu> frequency-info` for each read.
pub struct CpupowerSampler {
    privilege: Privilege,
    regex: Regex,
}

impl CpupowerSampler {
    pub fn new(privilege: Privilege) -> anyhow::Result<CpupowerSampler> {
        // the line looks like "  current CPU frequency: 1.20 GHz (asserted by call to kernel)"
        let regex = Regex::new(r"current CPU frequency:\s*([0-9.]+)\s*([kMG]?Hz)\s*\(asserted by call to kernel\)")?;
        Ok(CpupowerSampler { privilege, regex })
    }

    /// Extracts the frequency, in MHz, from the output of `cpupower frequency-info`.
    pub fn parse_frequency_info(&self, stdout: &str) -> Result<f64, SampleError> {
        let invalid = || SampleError::parse("`cpupower frequency-info`", stdout.trim_end());
        let captures = self.regex.captures(stdout).ok_or_else(invalid)?;
        let value: f64 = captures[1].parse().map_err(|_| invalid())?;
        let mhz = match &captures[2] {
            "GHz" => value * 1000.0,
            "MHz" => value,
            "kHz" => value / 1000.0,
            _ => value / 1_000_000.0,
        };
        Ok(mhz)
    }
}

impl Sampler for CpupowerSampler {
    fn read(&mut self, channel: &Channel) -> Result<f64, SampleError> {
        let Source::Frequency { cpu } = channel.source() else {
            return Err(SampleError::unavailable("`cpupower`", format!("cannot read {}", channel)));
        };
        let args = vec!["-c".to_owned(), cpu.to_string(), "frequency-info".to_owned()];
        let stdout = run_command("cpupower", &args, self.privilege)?;
        let mhz = self.parse_frequency_info(&stdout)?;
        debug!("cpu {cpu}: {mhz} MHz");
        Ok(mhz)
    }
}

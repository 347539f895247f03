// According to Intel 64 and IA-32 architectures software developer's manual, volume 4,
// MSR_UNCORE_PERF_STATUS (0x621) reports the current ratio of the uncore clock.

use std::{fs::File, io, os::unix::prelude::FileExt};

use anyhow::Context;
use clap::ValueEnum;
use log::debug;

use crate::{command::run_command, error::SampleError, Channel, Privilege, Sampler, Source};

type Addr = u64;

pub const MSR_UNCORE_PERF_STATUS: Addr = 0x00000621;

/// The current uncore ratio is at bits 6:0
const UNCORE_RATIO_MASK: u64 = 0x7f;

/// The uncore ratio is a multiple of the 100MHz bus clock.
const BUS_CLOCK_MHZ: f64 = 100.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum UncoreBackend {
    /// /dev/cpu/<cpu>/msr
    Msr,
    /// `rdmsr 0x621`
    Rdmsr,
}

/// Converts a raw value of MSR_UNCORE_PERF_STATUS to a frequency in MHz.
pub fn uncore_mhz(msr_value: u64) -> f64 {
    (msr_value & UNCORE_RATIO_MASK) as f64 * BUS_CLOCK_MHZ
}

fn read_msr(msr: &File, at: Addr) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    msr.read_exact_at(&mut buf, at)?;
    Ok(u64::from_ne_bytes(buf))
}

/// Reads the uncore frequency via the msr device of one cpu (the `msr` kernel module must be loaded).
pub struct MsrUncoreSampler {
    /// MSR file descriptor for the cpu
    fd: File,
    cpu: u32,
}

impl MsrUncoreSampler {
    pub fn open(cpu: u32) -> anyhow::Result<MsrUncoreSampler> {
        let path = format!("/dev/cpu/{cpu}/msr");
        let fd = File::open(&path).with_context(|| format!("open {path} (is the msr module loaded?)"))?;
        Ok(MsrUncoreSampler { fd, cpu })
    }
}

impl Sampler for MsrUncoreSampler {
    fn read(&mut self, channel: &Channel) -> Result<f64, SampleError> {
        let source_name = format!("/dev/cpu/{}/msr", self.cpu);
        if channel.source() != Source::UncoreFrequency {
            return Err(SampleError::unavailable(source_name, format!("cannot read {}", channel)));
        }
        let msr_value = read_msr(&self.fd, MSR_UNCORE_PERF_STATUS).map_err(|e| SampleError::unavailable(source_name, e))?;
        debug!("MSR {MSR_UNCORE_PERF_STATUS:#x}: {msr_value:#x}");
        Ok(uncore_mhz(msr_value))
    }
}

/// Reads the uncore frequency by running `rdmsr 0x621` (from msr-tools).
pub struct RdmsrSampler {
    privilege: Privilege,
}

impl RdmsrSampler {
    pub fn new(privilege: Privilege) -> RdmsrSampler {
        RdmsrSampler { privilege }
    }
}

/// Parses the output of `rdmsr`, a hexadecimal value without prefix (e.g. `1c1c`).
pub fn parse_rdmsr_output(stdout: &str) -> Result<u64, SampleError> {
    let trimmed = stdout.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    u64::from_str_radix(digits, 16).map_err(|_| SampleError::parse("`rdmsr`", trimmed))
}

impl Sampler for RdmsrSampler {
    fn read(&mut self, channel: &Channel) -> Result<f64, SampleError> {
        if channel.source() != Source::UncoreFrequency {
            return Err(SampleError::unavailable("`rdmsr`", format!("cannot read {}", channel)));
        }
        let args = vec![format!("{MSR_UNCORE_PERF_STATUS:#x}")];
        let stdout = run_command("rdmsr", &args, self.privilege)?;
        Ok(uncore_mhz(parse_rdmsr_output(&stdout)?))
    }
}

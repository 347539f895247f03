// See https://www.kernel.org/doc/html/latest/power/powercap/powercap.html
// for an explanation of the Power Capping framework.

use std::{
    collections::HashMap,
    fmt::Display,
    fs::{self, File},
    io::{Read, Seek},
    path::{Path, PathBuf},
};

use anyhow::Context;
use clap::ValueEnum;
use log::debug;

use crate::{command::run_command, error::ConfigError, error::SampleError, Channel, Privilege, Sampler, Source};

pub const POWERCAP_RAPL_PATH: &str = "/sys/devices/virtual/powercap/intel-rapl";
const POWER_ZONE_PREFIX: &str = "intel-rapl";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum EnergyBackend {
    /// energy_uj files in the powercap sysfs
    Powercap,
    /// `powercap-info -p intel-rapl -z <zone> -j`
    PowercapInfo,
}

/// A power zone.
#[derive(Debug, Clone)]
pub struct PowerZone {
    /// The name of the zone, as returned by powercap, for instance `package-0` or `core`.
    pub name: String,

    /// The path of the zone in sysfs, for instance
    /// `/sys/devices/virtual/powercap/intel-rapl/intel-rapl:0`.
    ///
    /// Note that in the above path, `intel-rapl` is the "control type"
    /// and "intel-rapl:0" is the power zone.
    pub path: PathBuf,

    /// The sub-zones (can be empty).
    pub children: Vec<PowerZone>,
}

impl PowerZone {
    pub fn energy_path(&self) -> PathBuf {
        self.path.join("energy_uj")
    }

    pub fn max_energy_path(&self) -> PathBuf {
        self.path.join("max_energy_range_uj")
    }

    /// The zone index used by `energy:<zone>` channels, e.g. 0 for `intel-rapl:0`.
    /// Sub-zones such as `intel-rapl:0:1` have no index.
    pub fn zone_index(&self) -> Option<u32> {
        let file_name = self.path.file_name()?.to_string_lossy();
        let suffix = file_name.strip_prefix(POWER_ZONE_PREFIX)?.strip_prefix(':')?;
        suffix.parse().ok()
    }

    fn fmt_rec(&self, f: &mut std::fmt::Formatter<'_>, level: i8) -> std::fmt::Result {
        let mut indent = "  ".repeat(level as _);
        if level > 0 {
            indent.insert(0, '\n');
        }

        let powercap_name = &self.name;
        let path = self.path.to_string_lossy();

        write!(f, "{indent}- {powercap_name} \t\t: {path}")?;
        for subzone in &self.children {
            subzone.fmt_rec(f, level + 1)?;
        }
        Ok(())
    }
}

impl Display for PowerZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_rec(f, 0)
    }
}

/// Discovers the RAPL power zones (and their sub-zones) below `root`, usually [POWERCAP_RAPL_PATH].
pub fn all_power_zones(root: &Path) -> anyhow::Result<Vec<PowerZone>> {
    /// Recursively explore a power zone
    fn explore_rec(dir: &Path) -> anyhow::Result<Vec<PowerZone>> {
        let mut zones = Vec::new();
        for e in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.to_string_lossy()))? {
            let entry = e?;
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().to_string();

            if path.is_dir() && file_name.starts_with(POWER_ZONE_PREFIX) {
                let name_path = path.join("name");
                let name = fs::read_to_string(&name_path)
                    .with_context(|| format!("read {}", name_path.to_string_lossy()))?
                    .trim()
                    .to_owned();
                let children = explore_rec(&path)?; // recursively explore
                zones.push(PowerZone { name, path, children });
            }
        }
        zones.sort_by_key(|z| z.path.to_string_lossy().to_string());
        Ok(zones)
    }
    explore_rec(root)
}

/// Energy sampler based on the powercap sysfs.
pub struct PowercapSampler {
    /// Ready-to-use powercap zones, by zone index
    zones: HashMap<u32, OpenedZone>,
    /// reused for all the reads
    buf: Vec<u8>,
}

struct OpenedZone {
    file: File,
    /// The maximum energy value for this zone, as reported by `max_energy_range_uj`
    max_energy_uj: Option<u64>,
}

impl PowercapSampler {
    /// Opens the `energy_uj` file of the zone of every energy channel.
    ///
    /// A channel that refers to a zone that doesn't exist below `root` is a configuration error.
    pub fn open(root: &Path, channels: &[Channel]) -> anyhow::Result<PowercapSampler> {
        let top_zones = all_power_zones(root)?;
        let mut zones = HashMap::new();

        for channel in channels {
            let Source::Energy { zone: index } = channel.source() else {
                continue;
            };
            let zone = top_zones
                .iter()
                .find(|z| z.zone_index() == Some(index))
                .ok_or_else(|| ConfigError::UnknownZone {
                    channel: channel.name().to_owned(),
                    zone: index,
                })?;

            let file = File::open(zone.energy_path())
                .with_context(|| format!("open {}", zone.energy_path().to_string_lossy()))?;

            // not all kernels expose it, and it's only informative here
            let max_energy_uj = fs::read_to_string(zone.max_energy_path())
                .ok()
                .and_then(|s| s.trim_end().parse().ok());
            debug!("zone {index} ({}): max energy {max_energy_uj:?} µJ", zone.name);

            zones.insert(index, OpenedZone { file, max_energy_uj });
        }

        Ok(PowercapSampler {
            zones,
            // the size of the content of the file `energy_uj` should never exceed those of `max_energy_range_uj`,
            // which is 16 bytes on all our test machines
            buf: Vec::with_capacity(16),
        })
    }

    /// The counter range reported by the kernel for `zone`, if known.
    pub fn max_energy_uj(&self, zone: u32) -> Option<u64> {
        self.zones.get(&zone).and_then(|z| z.max_energy_uj)
    }
}

impl Sampler for PowercapSampler {
    fn read(&mut self, channel: &Channel) -> Result<f64, SampleError> {
        let Source::Energy { zone: index } = channel.source() else {
            return Err(SampleError::unavailable("powercap", format!("cannot read {}", channel)));
        };
        let source_name = format!("powercap zone {index}");
        let zone = self
            .zones
            .get_mut(&index)
            .ok_or_else(|| SampleError::unavailable(&source_name, "zone not opened"))?;

        // read the file from the beginning
        self.buf.clear();
        zone.file.rewind().map_err(|e| SampleError::unavailable(&source_name, e))?;
        zone.file
            .read_to_end(&mut self.buf)
            .map_err(|e| SampleError::unavailable(&source_name, e))?;

        let content = String::from_utf8_lossy(&self.buf);
        let counter_value: u64 = content
            .trim_end()
            .parse()
            .map_err(|_| SampleError::parse(&source_name, content.trim_end()))?;
        debug!("zone {index}: {counter_value} µJ");
        Ok(counter_value as f64)
    }
}

/// Energy sampler that runs `powercap-info` for each read.
pub struct PowercapInfoSampler {
    privilege: Privilege,
}

impl PowercapInfoSampler {
    pub fn new(privilege: Privilege) -> PowercapInfoSampler {
        PowercapInfoSampler { privilege }
    }
}

/// Parses the output of `powercap-info -j`: a single counter value in µJ.
pub fn parse_energy_counter(stdout: &str) -> Result<f64, SampleError> {
    stdout
        .trim()
        .parse::<u64>()
        .map(|uj| uj as f64)
        .map_err(|_| SampleError::parse("`powercap-info`", stdout.trim()))
}

impl Sampler for PowercapInfoSampler {
    fn read(&mut self, channel: &Channel) -> Result<f64, SampleError> {
        let Source::Energy { zone } = channel.source() else {
            return Err(SampleError::unavailable("`powercap-info`", format!("cannot read {}", channel)));
        };
        let args = vec![
            "-p".to_owned(),
            "intel-rapl".to_owned(),
            "-z".to_owned(),
            zone.to_string(),
            "-j".to_owned(),
        ];
        let stdout = run_command("powercap-info", &args, self.privilege)?;
        parse_energy_counter(&stdout)
    }
}

use std::{collections::HashSet, fmt::Display, str::FromStr};

use enum_map::Enum;
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::ConfigError;

/// Name of the first column of every time series.
pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// The kind of source a channel is read from. Each kind has its own sampler backend.
#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// cpu utilization, in percent
    Utilization,
    /// core frequency, in MHz
    Frequency,
    /// raw energy counter of a RAPL zone, in µJ
    Energy,
    /// uncore frequency, in MHz
    UncoreFrequency,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Utilization,
        SourceKind::Frequency,
        SourceKind::Energy,
        SourceKind::UncoreFrequency,
    ];
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            SourceKind::Utilization => "utilization",
            SourceKind::Frequency => "frequency",
            SourceKind::Energy => "energy",
            SourceKind::UncoreFrequency => "uncore frequency",
        };
        f.write_str(str)
    }
}

/// One measurable quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Utilization { cpu: u32 },
    Frequency { cpu: u32 },
    Energy { zone: u32 },
    UncoreFrequency,
}

impl Source {
    pub fn kind(&self) -> SourceKind {
        match self {
            Source::Utilization { .. } => SourceKind::Utilization,
            Source::Frequency { .. } => SourceKind::Frequency,
            Source::Energy { .. } => SourceKind::Energy,
            Source::UncoreFrequency => SourceKind::UncoreFrequency,
        }
    }

    /// The cpu this source is attached to, if any.
    pub fn cpu(&self) -> Option<u32> {
        match self {
            Source::Utilization { cpu } | Source::Frequency { cpu } => Some(*cpu),
            _ => None,
        }
    }

    /// The column name used in the csv header.
    pub fn column_name(&self) -> String {
        match self {
            Source::Utilization { cpu } => format!("cpu_core_{cpu}"),
            Source::Frequency { cpu } => format!("core_{cpu}_freq"),
            Source::Energy { zone } => format!("energy_zone_{zone}"),
            Source::UncoreFrequency => String::from("uncore_freq"),
        }
    }
}

/// A named source. The name is the column of the channel in the csv output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    name: String,
    source: Source,
}

impl Channel {
    pub fn new(source: Source) -> Channel {
        Channel {
            name: source.column_name(),
            source,
        }
    }

    /// Creates a channel with a custom column name.
    pub fn named(name: impl Into<String>, source: Source) -> Channel {
        Channel {
            name: name.into(),
            source,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> Source {
        self.source
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

impl FromStr for Channel {
    type Err = ConfigError;

    /// Accepts the short syntax (`util:3`, `freq:3`, `energy:0`, `uncore`)
    /// as well as the column names (`cpu_core_3`, `core_3_freq`, `energy_zone_0`, `uncore_freq`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidChannel(s.to_owned());
        let s_trim = s.trim();
        if s_trim == "uncore" || s_trim == "uncore_freq" {
            return Ok(Channel::new(Source::UncoreFrequency));
        }

        lazy_static! {
            static ref CHANNEL_RE: Regex = Regex::new(
                r"^(?:util:(?P<util>\d+)|cpu_core_(?P<cpu_core>\d+)|freq:(?P<freq>\d+)|core_(?P<core_freq>\d+)_freq|energy:(?P<energy>\d+)|energy_zone_(?P<energy_zone>\d+))$"
            )
            .unwrap();
        }
        let groups: [(&str, fn(u32) -> Source); 6] = [
            ("util", |cpu| Source::Utilization { cpu }),
            ("cpu_core", |cpu| Source::Utilization { cpu }),
            ("freq", |cpu| Source::Frequency { cpu }),
            ("core_freq", |cpu| Source::Frequency { cpu }),
            ("energy", |zone| Source::Energy { zone }),
            ("energy_zone", |zone| Source::Energy { zone }),
        ];
        let captures = CHANNEL_RE.captures(s_trim).ok_or_else(invalid)?;
        for (group, make_source) in groups {
            if let Some(index) = captures.name(group) {
                let index: u32 = index.as_str().parse().map_err(|_| invalid())?;
                return Ok(Channel::new(make_source(index)));
            }
        }
        Err(invalid())
    }
}

/// Parses a comma-separated list of channels, preserving the declared order.
pub fn parse_channel_list(list: &str) -> Result<Vec<Channel>, ConfigError> {
    let channels = list
        .split(',')
        .filter(|item| !item.trim().is_empty())
        .map(Channel::from_str)
        .collect::<Result<Vec<Channel>, ConfigError>>()?;
    check_channels(&channels)?;
    Ok(channels)
}

/// Checks that the channel set is usable: non-empty and without duplicate columns.
pub fn check_channels(channels: &[Channel]) -> Result<(), ConfigError> {
    if channels.is_empty() {
        return Err(ConfigError::NoChannel);
    }
    let mut seen = HashSet::with_capacity(channels.len());
    for c in channels {
        if !seen.insert(c.name()) {
            return Err(ConfigError::DuplicateChannel(c.name().to_owned()));
        }
    }
    Ok(())
}

/// Checks that every cpu-bound channel refers to an online cpu.
pub fn check_cpus(channels: &[Channel], online: &[u32]) -> Result<(), ConfigError> {
    for c in channels {
        if let Some(cpu) = c.source().cpu() {
            if !online.contains(&cpu) {
                return Err(ConfigError::CpuOutOfRange {
                    channel: c.name().to_owned(),
                    cpu,
                    online: crate::format_cpu_list(online),
                });
            }
        }
    }
    Ok(())
}

/// The csv header of a time series: `timestamp` then one column per channel, in order.
pub fn header(channels: &[Channel]) -> Vec<String> {
    std::iter::once(TIMESTAMP_COLUMN.to_owned())
        .chain(channels.iter().map(|c| c.name().to_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_short_syntax() -> anyhow::Result<()> {
        let channels = parse_channel_list("util:3,freq:5,energy:0,uncore")?;
        let sources: Vec<Source> = channels.iter().map(Channel::source).collect();
        assert_eq!(
            sources,
            vec![
                Source::Utilization { cpu: 3 },
                Source::Frequency { cpu: 5 },
                Source::Energy { zone: 0 },
                Source::UncoreFrequency,
            ]
        );
        Ok(())
    }

    #[test]
    fn test_parse_column_names() -> anyhow::Result<()> {
        let channels = parse_channel_list("cpu_core_3, core_5_freq, energy_zone_1, uncore_freq")?;
        let names: Vec<&str> = channels.iter().map(Channel::name).collect();
        assert_eq!(names, vec!["cpu_core_3", "core_5_freq", "energy_zone_1", "uncore_freq"]);
        Ok(())
    }

    #[test]
    fn test_header_follows_declaration_order() -> anyhow::Result<()> {
        let channels = parse_channel_list("energy:1,energy:0")?;
        assert_eq!(header(&channels), vec!["timestamp", "energy_zone_1", "energy_zone_0"]);
        Ok(())
    }

    #[test]
    fn test_invalid_channels() {
        assert_eq!(
            parse_channel_list("util:x"),
            Err(ConfigError::InvalidChannel("util:x".to_owned()))
        );
        assert!(matches!(parse_channel_list("temp:0"), Err(ConfigError::InvalidChannel(_))));
        assert!(matches!(parse_channel_list("util:-1"), Err(ConfigError::InvalidChannel(_))));
        assert!(matches!(parse_channel_list("util:99999999999"), Err(ConfigError::InvalidChannel(_))));
        assert!(matches!(parse_channel_list("energy:1_freq"), Err(ConfigError::InvalidChannel(_))));
        assert_eq!(parse_channel_list(""), Err(ConfigError::NoChannel));
        assert_eq!(
            parse_channel_list("util:1,cpu_core_1"),
            Err(ConfigError::DuplicateChannel("cpu_core_1".to_owned()))
        );
    }

    #[test]
    fn test_check_cpus() -> anyhow::Result<()> {
        let channels = parse_channel_list("util:0,freq:3,energy:9")?;
        assert!(check_cpus(&channels, &[0, 1, 2, 3]).is_ok());
        assert!(matches!(
            check_cpus(&channels, &[0, 1]),
            Err(ConfigError::CpuOutOfRange { cpu: 3, .. })
        ));
        Ok(())
    }
}

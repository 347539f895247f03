use std::{path::PathBuf, time::Duration};

use enum_map::EnumMap;
use log::{info, warn};

use crate::{
    channel::check_channels,
    error::{ConfigError, SampleError},
    frequency::{CpupowerSampler, FrequencyBackend, SysfsFrequencySampler},
    msr::{MsrUncoreSampler, RdmsrSampler, UncoreBackend},
    powercap::{EnergyBackend, PowercapInfoSampler, PowercapSampler, POWERCAP_RAPL_PATH},
    utilization::{UtilizationSampler, DEFAULT_WINDOW},
    Channel, Privilege, Sampler, SourceKind,
};

/// Which backend reads each kind of source, and how.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub utilization_window: Duration,
    pub frequency: FrequencyBackend,
    pub energy: EnergyBackend,
    pub uncore: UncoreBackend,
    /// privilege of the command-line backends
    pub privilege: Privilege,
    pub powercap_root: PathBuf,
    /// cpu whose msr device is read for the uncore frequency
    pub msr_cpu: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            utilization_window: DEFAULT_WINDOW,
            frequency: FrequencyBackend::Sysfs,
            energy: EnergyBackend::Powercap,
            uncore: UncoreBackend::Msr,
            privilege: Privilege::User,
            powercap_root: PathBuf::from(POWERCAP_RAPL_PATH),
            msr_cpu: 0,
        }
    }
}

/// Routes each channel to the sampler registered for its kind of source.
#[derive(Default)]
pub struct SamplerSet {
    backends: EnumMap<SourceKind, Option<Box<dyn Sampler>>>,
    /// Error of the last poll of each backend. Reads of a backend that failed to poll fail too.
    poll_errors: EnumMap<SourceKind, Option<String>>,
}

impl SamplerSet {
    pub fn new() -> SamplerSet {
        SamplerSet::default()
    }

    /// Registers the sampler of one kind of source, replacing the previous one.
    pub fn register(&mut self, kind: SourceKind, sampler: Box<dyn Sampler>) -> &mut SamplerSet {
        self.backends[kind] = Some(sampler);
        self
    }

    /// Builds the samplers needed by `channels` and only those.
    ///
    /// Everything that can be checked before sampling is checked here: the channel set,
    /// the cpus of the cpu-bound channels and the zones of the energy channels.
    pub fn for_channels(channels: &[Channel], config: &BackendConfig, online_cpus: &[u32]) -> anyhow::Result<SamplerSet> {
        check_channels(channels)?;
        crate::channel::check_cpus(channels, online_cpus)?;

        let mut set = SamplerSet::new();
        for kind in SourceKind::ALL {
            if !channels.iter().any(|c| c.source().kind() == kind) {
                continue;
            }
            let sampler: Box<dyn Sampler> = match kind {
                SourceKind::Utilization => Box::new(UtilizationSampler::new(config.utilization_window)),
                SourceKind::Frequency => match config.frequency {
                    FrequencyBackend::Sysfs => Box::new(SysfsFrequencySampler::default()),
                    FrequencyBackend::Cpupower => Box::new(CpupowerSampler::new(config.privilege)?),
                },
                SourceKind::Energy => match config.energy {
                    EnergyBackend::Powercap => Box::new(PowercapSampler::open(&config.powercap_root, channels)?),
                    EnergyBackend::PowercapInfo => Box::new(PowercapInfoSampler::new(config.privilege)),
                },
                SourceKind::UncoreFrequency => match config.uncore {
                    UncoreBackend::Msr => Box::new(MsrUncoreSampler::open(config.msr_cpu)?),
                    UncoreBackend::Rdmsr => Box::new(RdmsrSampler::new(config.privilege)),
                },
            };
            info!("{kind} channels: {} backend", backend_name(kind, config));
            set.register(kind, sampler);
        }
        set.check_covers(channels)?;
        Ok(set)
    }

    /// Checks that every channel has a sampler.
    pub fn check_covers(&self, channels: &[Channel]) -> Result<(), ConfigError> {
        for c in channels {
            let kind = c.source().kind();
            if self.backends[kind].is_none() {
                return Err(ConfigError::MissingBackend(kind.to_string()));
            }
        }
        Ok(())
    }
}

fn backend_name(kind: SourceKind, config: &BackendConfig) -> String {
    match kind {
        SourceKind::Utilization => String::from("procfs"),
        SourceKind::Frequency => format!("{:?}", config.frequency),
        SourceKind::Energy => format!("{:?}", config.energy),
        SourceKind::UncoreFrequency => format!("{:?}", config.uncore),
    }
}

impl Sampler for SamplerSet {
    /// Polls every registered sampler. A failure is remembered and reported by the
    /// reads of the affected channels, so that the other kinds of channels still get their values.
    fn poll(&mut self) -> Result<(), SampleError> {
        for (kind, backend) in self.backends.iter_mut() {
            self.poll_errors[kind] = None;
            if let Some(sampler) = backend {
                if let Err(e) = sampler.poll() {
                    warn!("failed to poll the {kind} sampler: {e}");
                    self.poll_errors[kind] = Some(e.to_string());
                }
            }
        }
        Ok(())
    }

    fn read(&mut self, channel: &Channel) -> Result<f64, SampleError> {
        let kind = channel.source().kind();
        if let Some(reason) = &self.poll_errors[kind] {
            return Err(SampleError::unavailable(kind.to_string(), reason));
        }
        match &mut self.backends[kind] {
            Some(sampler) => sampler.read(channel),
            None => Err(SampleError::unavailable(kind.to_string(), "no sampler registered")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Source;

    /// Returns `value` for any channel, fails to poll if asked to.
    struct Constant {
        value: f64,
        fail_poll: bool,
    }

    impl Sampler for Constant {
        fn poll(&mut self) -> Result<(), SampleError> {
            if self.fail_poll {
                Err(SampleError::unavailable("constant", "poll failure"))
            } else {
                Ok(())
            }
        }

        fn read(&mut self, _channel: &Channel) -> Result<f64, SampleError> {
            Ok(self.value)
        }
    }

    #[test]
    fn test_routes_by_kind() -> anyhow::Result<()> {
        let mut set = SamplerSet::new();
        set.register(SourceKind::Utilization, Box::new(Constant { value: 1.0, fail_poll: false }))
            .register(SourceKind::Energy, Box::new(Constant { value: 2.0, fail_poll: false }));

        set.poll()?;
        assert_eq!(set.read(&Channel::new(Source::Utilization { cpu: 4 }))?, 1.0);
        assert_eq!(set.read(&Channel::new(Source::Energy { zone: 0 }))?, 2.0);
        assert!(set.read(&Channel::new(Source::UncoreFrequency)).is_err());
        Ok(())
    }

    #[test]
    fn test_poll_failure_only_affects_its_kind() -> anyhow::Result<()> {
        let mut set = SamplerSet::new();
        set.register(SourceKind::Utilization, Box::new(Constant { value: 1.0, fail_poll: true }))
            .register(SourceKind::Frequency, Box::new(Constant { value: 800.0, fail_poll: false }));

        set.poll()?;
        assert!(matches!(
            set.read(&Channel::new(Source::Utilization { cpu: 0 })),
            Err(SampleError::SourceUnavailable { .. })
        ));
        assert_eq!(set.read(&Channel::new(Source::Frequency { cpu: 0 }))?, 800.0);
        Ok(())
    }

    #[test]
    fn test_check_covers() {
        let mut set = SamplerSet::new();
        set.register(SourceKind::Frequency, Box::new(Constant { value: 0.0, fail_poll: false }));
        assert!(set.check_covers(&[Channel::new(Source::Frequency { cpu: 1 })]).is_ok());
        assert_eq!(
            set.check_covers(&[Channel::new(Source::UncoreFrequency)]),
            Err(ConfigError::MissingBackend("uncore frequency".to_owned()))
        );
    }

    #[test]
    fn test_for_channels_rejects_offline_cpu() -> anyhow::Result<()> {
        let channels = vec![Channel::new(Source::Utilization { cpu: 12 })];
        let err = SamplerSet::for_channels(&channels, &BackendConfig::default(), &[0, 1, 2, 3])
            .err()
            .expect("cpu 12 is not online");
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::CpuOutOfRange { cpu: 12, .. })
        ));
        Ok(())
    }
}

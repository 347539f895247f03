use thiserror::Error;

/// Invalid setup detected before any sample is taken.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid channel '{0}', expected util:<cpu>, freq:<cpu>, energy:<zone> or uncore")]
    InvalidChannel(String),

    #[error("cpu {cpu} of channel '{channel}' is not online (online cpus: {online})")]
    CpuOutOfRange { channel: String, cpu: u32, online: String },

    #[error("energy zone {zone} of channel '{channel}' does not exist")]
    UnknownZone { channel: String, zone: u32 },

    #[error("duplicate channel '{0}'")]
    DuplicateChannel(String),

    #[error("at least one channel is required")]
    NoChannel,

    #[error("duration must be strictly positive, got {0} s")]
    NonPositiveDuration(f64),

    #[error("interval must be positive or zero, got {0} s")]
    NegativeInterval(f64),

    #[error("{name} of {value} s is too large")]
    TooLong { name: &'static str, value: f64 },

    #[error("no sampler backend registered for {0} channels")]
    MissingBackend(String),

    #[error("{name} must be in [{min}, {max}], got {value}")]
    OutOfRange { name: &'static str, value: f64, min: f64, max: f64 },
}

/// A failed read of one channel. The logger recovers from it by writing a sentinel.
#[derive(Error, Debug)]
pub enum SampleError {
    #[error("{source_name} is unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    #[error("failed to parse the output of {source_name}: '{input}'")]
    Parse { source_name: String, input: String },
}

impl SampleError {
    pub fn unavailable(source_name: impl Into<String>, reason: impl ToString) -> SampleError {
        SampleError::SourceUnavailable {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn parse(source_name: impl Into<String>, input: impl Into<String>) -> SampleError {
        SampleError::Parse {
            source_name: source_name.into(),
            input: input.into(),
        }
    }
}

/// Failure of a derived computation on a closed time series.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CorrectionError {
    #[error("at least 2 samples are required, got {got}")]
    InsufficientSamples { got: usize },

    #[error("{timestamps} timestamps but {values} counter values")]
    LengthMismatch { timestamps: usize, values: usize },

    #[error("column '{0}' not found")]
    MissingColumn(String),
}

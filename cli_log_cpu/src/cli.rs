use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cpu_probes::{
    frequency::FrequencyBackend, msr::UncoreBackend, overflow::DEFAULT_MODULUS, overflow::MICROJOULES,
    powercap::EnergyBackend, Channel,
};

#[derive(Parser)]
#[command(author, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Only show info about the cpus and the power zones, then exit.
    Info,

    /// Sample some channels for a fixed duration and write them to a csv file.
    Log {
        /// Output csv file. Defaults to `<kind>-<date>.csv`.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Duration of the measurement, in seconds.
        #[arg(short, long)]
        duration: f64,

        /// The channels to record, e.g. `util:0,freq:0,energy:0,uncore`.
        #[arg(short, long, value_delimiter = ',', required = true)]
        channels: Vec<Channel>,

        /// Minimum time between two samples, in seconds. Zero means as fast as possible.
        #[arg(short, long, default_value_t = 0.0)]
        interval: f64,

        #[command(flatten)]
        backends: BackendArgs,
    },

    /// Compute the power of every energy zone of an energy csv.
    Power {
        /// Energy csv written by the `log` command.
        input: PathBuf,

        /// Output csv file. Defaults to `<input>-power.csv`.
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        counter: CounterArgs,
    },

    /// Combine the energy csv of repeated runs into the mean and std of their power.
    Combine {
        /// Energy csv files, one per run.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Output csv file. Defaults to `combined-<date>.csv`.
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        counter: CounterArgs,
    },

    /// Busy some cpus for a fixed duration.
    Busy {
        /// Duration of the load, in seconds.
        #[arg(short, long)]
        duration: f64,

        /// Number of busy threads. Ignored if --cores is set.
        #[arg(short, long, default_value_t = 1)]
        threads: usize,

        /// Cpus to pin the threads to, one thread per cpu, e.g. `0-3,8`.
        #[arg(long)]
        cores: Option<String>,
    },

    /// Run a power experiment on a remote node, through ssh.
    Experiment {
        /// The node to run the experiment on.
        #[arg(long, default_value = "node-0")]
        node: String,

        /// Ssh user.
        #[arg(long)]
        user: Option<String>,

        /// Duration of the experiment, in seconds.
        #[arg(short, long, default_value_t = 60.0)]
        duration: f64,

        /// Fraction of the cpus of the load socket to busy, in [0, 1].
        #[arg(short, long, default_value_t = 0.5)]
        utilization: f64,

        /// Socket that runs the busy loops.
        #[arg(long, default_value_t = 1)]
        load_socket: u32,

        /// Power governor of all the cpus.
        #[arg(long, default_value = "userspace")]
        governor: String,

        /// Frequency of all the cpus.
        #[arg(long, default_value = "0.8GHz")]
        frequency: String,

        /// Energy csv written on the node.
        #[arg(short, long, default_value = "energy/energy.csv")]
        output: String,

        /// Disable turbo boost before the experiment.
        #[arg(long)]
        disable_turbo: bool,

        /// Directory of the node where the commands run.
        #[arg(long)]
        workdir: Option<String>,

        /// Path of this program on the node.
        #[arg(long, default_value = "cli_log_cpu")]
        program: String,
    },
}

/// How the channels are read.
#[derive(clap::Args, Debug)]
pub struct BackendArgs {
    #[arg(long, value_enum, default_value_t = FrequencyBackend::Sysfs)]
    pub frequency_backend: FrequencyBackend,

    #[arg(long, value_enum, default_value_t = EnergyBackend::Powercap)]
    pub energy_backend: EnergyBackend,

    #[arg(long, value_enum, default_value_t = UncoreBackend::Msr)]
    pub uncore_backend: UncoreBackend,

    /// Run the command-line backends with `sudo -n`.
    #[arg(long)]
    pub sudo: bool,

    /// Measurement window of the utilization, in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub window_ms: u64,

    /// Cpu whose msr device is read for the uncore frequency.
    #[arg(long, default_value_t = 0)]
    pub msr_cpu: u32,
}

/// How the energy counters are converted.
#[derive(clap::Args, Debug)]
pub struct CounterArgs {
    /// Value at which the energy counters wrap around.
    #[arg(long, default_value_t = DEFAULT_MODULUS)]
    pub modulus: f64,

    /// Joules per counter unit.
    #[arg(long, default_value_t = MICROJOULES)]
    pub unit_scale: f64,
}

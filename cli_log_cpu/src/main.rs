use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use log::{info, warn};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use cli::{BackendArgs, Cli, Commands, CounterArgs};
use cpu_probes::{
    combine::{combine_runs, power_range},
    experiment::{run_experiment, ExperimentConfig, SshExecutor},
    load::{run_busy_load, LoadConfig},
    logger::{Cancellation, CsvSink, LoggerConfig, Outcome, TimeSeriesLogger},
    overflow::{power_of_energy_series, write_power_csv, PowerConfig},
    powercap::{all_power_zones, POWERCAP_RAPL_PATH},
    sampler_set::{BackendConfig, SamplerSet},
    series::TimeSeries,
    Channel, Privilege, SourceKind,
};

mod cli;

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<(), anyhow::Error> {
    // initialize logger
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    // parse CLI arguments
    let cli = Cli::parse();

    // run the command
    match cli.command {
        Commands::Info => print_info()?,
        Commands::Log {
            output,
            duration,
            channels,
            interval,
            backends,
        } => run_logger(output, duration, channels, interval, backends).await?,
        Commands::Power { input, output, counter } => {
            let series = TimeSeries::load(&input)?;
            let powers = power_of_energy_series(&series, &power_config(&counter))?;
            let output = output.unwrap_or_else(|| sibling_with_suffix(&input, "-power.csv"));
            let file = File::create(&output).with_context(|| format!("create {}", output.to_string_lossy()))?;
            let undefined = write_power_csv(&powers, file)?;
            if undefined > 0 {
                warn!("{undefined} power value(s) are undefined (non-increasing timestamps), left empty");
            }
            info!("{} power zone(s) written to {}", powers.len(), output.to_string_lossy());
        }
        Commands::Combine { inputs, output, counter } => {
            let runs = inputs
                .iter()
                .map(|path| TimeSeries::load(path))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let combined = combine_runs(&runs, &power_config(&counter))?;
            if let Some((min, max)) = power_range(&combined) {
                info!("power range without outliers: [{min:.3}, {max:.3}] W");
            }
            let output = match output {
                Some(path) => path,
                None => PathBuf::from(default_file_name("combined")?),
            };
            let file = File::create(&output).with_context(|| format!("create {}", output.to_string_lossy()))?;
            combined.write_csv(file)?;
            info!(
                "{} run(s) combined into {} ({} points)",
                combined.runs,
                output.to_string_lossy(),
                combined.timestamps.len()
            );
        }
        Commands::Busy {
            duration,
            threads,
            cores,
        } => {
            let cores = cores.map(|list| cpu_probes::parse_cpu_list(&list)).transpose()?;
            let config = LoadConfig::new(duration, threads, cores)?;
            let cancel = Cancellation::new();
            let task = tokio::task::spawn_blocking({
                let cancel = cancel.clone();
                move || run_busy_load(&config, &cancel)
            });
            let reports = run_until_signal(task, &cancel).await?;
            if reports.iter().any(|r| r.interrupted) {
                println!("Interrupted. Exiting.");
            }
        }
        Commands::Experiment {
            node,
            user,
            duration,
            utilization,
            load_socket,
            governor,
            frequency,
            output,
            disable_turbo,
            workdir,
            program,
        } => {
            let mut config = ExperimentConfig::new(node, duration, utilization)?;
            config.load_socket = load_socket;
            config.governor = governor;
            config.frequency = frequency;
            config.output = output;
            config.disable_turbo = disable_turbo;
            config.workdir = workdir;
            config.program = program;
            let executor = SshExecutor::new(user);
            tokio::task::spawn_blocking(move || run_experiment(&executor, &config)).await??;
        }
    }

    Ok(())
}

fn print_info() -> anyhow::Result<()> {
    let cpus = cpu_probes::online_cpus()?;
    println!("{} online cpus: {}", cpus.len(), cpu_probes::format_cpu_list(&cpus));

    match all_power_zones(Path::new(POWERCAP_RAPL_PATH)) {
        Ok(zones) => {
            println!("\nFound powercap zones:");
            for zone in &zones {
                println!("{zone}");
            }
        }
        Err(e) => warn!("no powercap zone: {e:#}"),
    }

    println!("\nChannels: util:<cpu>, freq:<cpu>, energy:<zone>, uncore");
    Ok(())
}

async fn run_logger(
    output: Option<PathBuf>,
    duration: f64,
    channels: Vec<Channel>,
    interval: f64,
    backends: BackendArgs,
) -> anyhow::Result<()> {
    // check everything before creating the output file
    let config = LoggerConfig::from_secs(duration, interval)?;
    let online_cpus = cpu_probes::online_cpus()?;
    let sampler = SamplerSet::for_channels(&channels, &backend_config(&backends), &online_cpus)?;
    let mut logger = TimeSeriesLogger::new(channels, sampler, config)?;

    let output = match output {
        Some(path) => path,
        None => PathBuf::from(default_file_name(file_kind(logger.channels()))?),
    };
    let sink = CsvSink::create(&output, logger.channels())?;
    info!("writing to {}", output.to_string_lossy());

    let cancel = Cancellation::new();
    let task = tokio::task::spawn_blocking({
        let cancel = cancel.clone();
        move || logger.run(sink, &cancel)
    });
    let summary = run_until_signal(task, &cancel).await??;
    if summary.outcome == Outcome::Interrupted {
        println!("Interrupted. Exiting.");
    }
    Ok(())
}

/// Waits for a blocking task, cancelling it on Ctrl-C or SIGTERM.
async fn run_until_signal<T: Send + 'static>(mut task: JoinHandle<T>, cancel: &Cancellation) -> anyhow::Result<T> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = &mut task => return Ok(res?),
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, stopping"),
        _ = sigterm.recv() => info!("SIGTERM received, stopping"),
    }
    cancel.cancel();
    task.await.map_err(|e| anyhow!("task failed after cancellation: {e}"))
}

fn backend_config(args: &BackendArgs) -> BackendConfig {
    BackendConfig {
        utilization_window: Duration::from_millis(args.window_ms),
        frequency: args.frequency_backend,
        energy: args.energy_backend,
        uncore: args.uncore_backend,
        privilege: if args.sudo { Privilege::Sudo } else { Privilege::User },
        msr_cpu: args.msr_cpu,
        ..BackendConfig::default()
    }
}

fn power_config(args: &CounterArgs) -> PowerConfig {
    PowerConfig {
        modulus: args.modulus,
        unit_to_joules: args.unit_scale,
    }
}

/// Prefix of the default output file, after the kind of the channels.
fn file_kind(channels: &[Channel]) -> &'static str {
    let mut kinds = channels.iter().map(|c| c.source().kind());
    let first = kinds.next();
    if kinds.any(|k| Some(k) != first) {
        return "log";
    }
    match first {
        Some(SourceKind::Utilization) => "cpu",
        Some(SourceKind::Frequency) => "freq",
        Some(SourceKind::Energy) => "energy",
        Some(SourceKind::UncoreFrequency) => "uncore_freq",
        None => "log",
    }
}

fn default_file_name(kind: &str) -> anyhow::Result<String> {
    let now = OffsetDateTime::now_utc().format(&Rfc3339)?;
    Ok(format!("{kind}-{now}.csv"))
}

/// `dir/run.csv` -> `dir/run<suffix>`
fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!("{stem}{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_kind() -> anyhow::Result<()> {
        let channels = |list: &str| cpu_probes::channel::parse_channel_list(list);
        assert_eq!(file_kind(&channels("util:0,util:1")?), "cpu");
        assert_eq!(file_kind(&channels("energy:0,energy:1")?), "energy");
        assert_eq!(file_kind(&channels("uncore")?), "uncore_freq");
        assert_eq!(file_kind(&channels("util:0,freq:0")?), "log");
        Ok(())
    }

    #[test]
    fn test_sibling_with_suffix() {
        assert_eq!(
            sibling_with_suffix(Path::new("data/energy.csv"), "-power.csv"),
            PathBuf::from("data/energy-power.csv")
        );
    }

    #[test]
    fn test_cli_parses_channels() {
        let cli = Cli::try_parse_from(["cli_log_cpu", "log", "-d", "2", "-c", "util:0,energy_zone_1", "-i", "0.5"])
            .expect("valid command line");
        match cli.command {
            Commands::Log {
                channels, interval, ..
            } => {
                assert_eq!(channels.len(), 2);
                assert_eq!(channels[1].name(), "energy_zone_1");
                assert_eq!(interval, 0.5);
            }
            _ => panic!("expected the log command"),
        }
        assert!(Cli::try_parse_from(["cli_log_cpu", "log", "-d", "2", "-c", "bogus:1"]).is_err());
    }
}

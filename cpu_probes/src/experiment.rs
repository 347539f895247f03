//! Remote power experiment: configures the cpus of a node, then runs an energy logger
//! and busy loops on it concurrently.

use std::{
    collections::BTreeMap,
    process::Command,
    sync::Mutex,
    thread,
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use log::{debug, error, info};

use crate::{error::ConfigError, format_cpu_list, mkstring, CpuId};

/// Result of a command run on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout_lines: Vec<String>,
    pub stderr: String,
    /// exit status, -1 if the command was killed by a signal
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turns a non-zero exit status into an error.
    pub fn check(self, node: &str, command: &str) -> anyhow::Result<CommandOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(anyhow!(
                "`{command}` failed on {node} with status {}: {}",
                self.status,
                self.stderr.trim()
            ))
        }
    }
}

/// Runs shell commands on remote nodes.
pub trait RemoteExecutor: Sync {
    fn run_on_node(&self, node: &str, command: &str) -> anyhow::Result<CommandOutput>;
}

/// Runs the commands with the `ssh` binary, in batch mode (no password prompt).
#[derive(Debug, Clone, Default)]
pub struct SshExecutor {
    pub user: Option<String>,
}

impl SshExecutor {
    pub fn new(user: Option<String>) -> SshExecutor {
        SshExecutor { user }
    }

    fn destination(&self, node: &str) -> String {
        match &self.user {
            Some(user) => format!("{user}@{node}"),
            None => node.to_owned(),
        }
    }
}

impl RemoteExecutor for SshExecutor {
    fn run_on_node(&self, node: &str, command: &str) -> anyhow::Result<CommandOutput> {
        let destination = self.destination(node);
        debug!("ssh {destination} '{command}'");
        let output = Command::new("ssh")
            .args(["-o", "BatchMode=yes", &destination, command])
            .output()
            .with_context(|| format!("failed to run ssh {destination}"))?;
        Ok(CommandOutput {
            stdout_lines: String::from_utf8_lossy(&output.stdout).lines().map(str::to_owned).collect(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code().unwrap_or(-1),
        })
    }
}

/// Cpus of each socket, in increasing order.
pub type Topology = BTreeMap<u32, Vec<u32>>;

pub const TOPOLOGY_COMMAND: &str = "lscpu -p=cpu,node";

/// Parses the output of `lscpu -p=cpu,node`. Comment lines start with `#`.
pub fn parse_topology<S: AsRef<str>>(lines: &[S]) -> anyhow::Result<Topology> {
    let mut topology = Topology::new();
    for line in lines.iter().map(|l| l.as_ref().trim()) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let id = match line.split(',').collect::<Vec<_>>().as_slice() {
            [cpu, socket] => CpuId {
                cpu: cpu.parse().with_context(|| format!("invalid cpu in '{line}'"))?,
                socket: socket.parse().with_context(|| format!("invalid node in '{line}'"))?,
            },
            _ => bail!("invalid lscpu line '{line}', expected <cpu>,<node>"),
        };
        topology.entry(id.socket).or_default().push(id.cpu);
    }
    for cpus in topology.values_mut() {
        cpus.sort_unstable();
    }
    if topology.is_empty() {
        bail!("empty cpu topology");
    }
    Ok(topology)
}

/// Queries the cpu topology of a node.
pub fn node_topology(executor: &dyn RemoteExecutor, node: &str) -> anyhow::Result<Topology> {
    let output = executor
        .run_on_node(node, TOPOLOGY_COMMAND)?
        .check(node, TOPOLOGY_COMMAND)
        .context("failed to get the cpu topology")?;
    parse_topology(&output.stdout_lines)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub node: String,
    pub duration: Duration,
    /// fraction of the cpus of the load socket to busy, in [0, 1]
    pub utilization: f64,
    /// socket that runs the busy loops
    pub load_socket: u32,
    pub governor: String,
    /// frequency given to `cpupower frequency-set -f`, e.g. `0.8GHz`
    pub frequency: String,
    /// energy csv written on the node
    pub output: String,
    pub disable_turbo: bool,
    /// directory where the remote commands run
    pub workdir: Option<String>,
    /// path of the measurement binary on the node
    pub program: String,
}

impl ExperimentConfig {
    pub fn new(node: impl Into<String>, duration_secs: f64, utilization: f64) -> Result<ExperimentConfig, ConfigError> {
        let duration = crate::duration_from_secs(duration_secs)?;
        if !(0.0..=1.0).contains(&utilization) {
            return Err(ConfigError::OutOfRange {
                name: "utilization",
                value: utilization,
                min: 0.0,
                max: 1.0,
            });
        }
        Ok(ExperimentConfig {
            node: node.into(),
            duration,
            utilization,
            load_socket: 1,
            governor: String::from("userspace"),
            frequency: String::from("0.8GHz"),
            output: String::from("energy/energy.csv"),
            disable_turbo: false,
            workdir: None,
            program: String::from("cli_log_cpu"),
        })
    }

    fn in_workdir(&self, command: String) -> String {
        match &self.workdir {
            Some(dir) => format!("cd {dir} && {command}"),
            None => command,
        }
    }
}

/// The commands of an experiment, derived from the configuration and the node topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentPlan {
    /// run one after the other, before the measurement
    pub setup: Vec<String>,
    /// energy logger, always the first task
    pub logger: String,
    /// one busy loop per loaded cpu
    pub busy_loops: Vec<String>,
    pub loaded_cpus: Vec<u32>,
    pub logger_cpu: u32,
}

impl ExperimentPlan {
    pub fn tasks(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.logger).chain(self.busy_loops.iter())
    }
}

/// Number of cpus to busy: `floor(n_cpus * utilization)`.
pub fn loaded_cpu_count(n_cpus: usize, utilization: f64) -> usize {
    (n_cpus as f64 * utilization).floor() as usize
}

pub fn plan_experiment(config: &ExperimentConfig, topology: &Topology) -> anyhow::Result<ExperimentPlan> {
    let load_cpus = topology
        .get(&config.load_socket)
        .ok_or_else(|| anyhow!("socket {} does not exist, the node has sockets {:?}", config.load_socket, topology.keys()))?;
    let logger_cpu = topology
        .iter()
        .find(|(socket, _)| **socket != config.load_socket)
        .and_then(|(_, cpus)| cpus.first().copied())
        .ok_or_else(|| anyhow!("the energy logger needs a socket other than the load socket {}", config.load_socket))?;

    let mut setup = Vec::new();
    if config.disable_turbo {
        setup.push(String::from("echo 1 | sudo tee /sys/devices/system/cpu/intel_pstate/no_turbo"));
    }
    if let Some((dir, _)) = config.output.rsplit_once('/') {
        setup.push(config.in_workdir(format!("mkdir -p {dir}")));
    }
    setup.push(format!("sudo cpupower -c all frequency-set -g {}", config.governor));
    for cpus in topology.values() {
        setup.push(format!("sudo cpupower -c {} frequency-set -f {}", format_cpu_list(cpus), config.frequency));
    }

    let duration = config.duration.as_secs_f64();
    let zones: Vec<String> = (0..topology.len()).map(|z| format!("energy:{z}")).collect();
    let logger = config.in_workdir(format!(
        "taskset -c {logger_cpu} {} log --output {} --duration {duration} --channels {}",
        config.program,
        config.output,
        mkstring(&zones, ",")
    ));

    let loaded_cpus: Vec<u32> = load_cpus[..loaded_cpu_count(load_cpus.len(), config.utilization)].to_vec();
    let busy_loops = loaded_cpus
        .iter()
        .map(|cpu| config.in_workdir(format!("taskset -c {cpu} {} busy --duration {duration}", config.program)))
        .collect();

    Ok(ExperimentPlan {
        setup,
        logger,
        busy_loops,
        loaded_cpus,
        logger_cpu,
    })
}

/// Outcome of a completed experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentReport {
    pub topology: Topology,
    pub plan: ExperimentPlan,
}

/// Runs the experiment described by `config` on its node.
///
/// The setup commands run in order and the first failure aborts the experiment.
/// Then every task runs in its own thread; all of them are waited for, and the failed ones are reported together.
pub fn run_experiment(executor: &dyn RemoteExecutor, config: &ExperimentConfig) -> anyhow::Result<ExperimentReport> {
    let node = config.node.as_str();
    info!("Getting the cpu topology of {node}...");
    let topology = node_topology(executor, node)?;
    info!("cpu topology: {topology:?}");

    let plan = plan_experiment(config, &topology)?;
    info!("Setting the power governor and frequencies...");
    for command in &plan.setup {
        executor.run_on_node(node, command)?.check(node, command)?;
    }

    info!(
        "Starting the energy logger on cpu {} and {} busy loop(s) on cpus [{}]...",
        plan.logger_cpu,
        plan.busy_loops.len(),
        format_cpu_list(&plan.loaded_cpus)
    );
    let failures = Mutex::new(Vec::new());
    thread::scope(|s| {
        for command in plan.tasks() {
            let failures = &failures;
            s.spawn(move || {
                let result = executor
                    .run_on_node(node, command)
                    .and_then(|output| output.check(node, command));
                if let Err(e) = result {
                    error!("{e:#}");
                    failures
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(format!("{e:#}"));
                }
            });
        }
        // the scope joins every task before returning
    });

    let failures = failures.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
    if !failures.is_empty() {
        bail!("{} task(s) of the experiment failed:\n{}", failures.len(), failures.join("\n"));
    }
    info!("Experiment completed!");
    Ok(ExperimentReport { topology, plan })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSCPU: &str = "# The following is the parsable format\n# CPU,Node\n0,0\n1,1\n2,0\n3,1\n4,0\n5,1\n6,0\n7,1\n";

    /// Records the commands and answers the topology query.
    struct MockExecutor {
        calls: Mutex<Vec<(String, String)>>,
        failing: Option<&'static str>,
    }

    impl MockExecutor {
        fn new(failing: Option<&'static str>) -> MockExecutor {
            MockExecutor {
                calls: Mutex::new(Vec::new()),
                failing,
            }
        }

        fn commands(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
        }
    }

    impl RemoteExecutor for MockExecutor {
        fn run_on_node(&self, node: &str, command: &str) -> anyhow::Result<CommandOutput> {
            self.calls.lock().unwrap().push((node.to_owned(), command.to_owned()));
            let failed = self.failing.map_or(false, |pattern| command.contains(pattern));
            let stdout_lines = if command == TOPOLOGY_COMMAND {
                LSCPU.lines().map(str::to_owned).collect()
            } else {
                Vec::new()
            };
            Ok(CommandOutput {
                stdout_lines,
                stderr: if failed { String::from("boom") } else { String::new() },
                status: if failed { 1 } else { 0 },
            })
        }
    }

    #[test]
    fn test_parse_topology() -> anyhow::Result<()> {
        let lines: Vec<&str> = LSCPU.lines().collect();
        let topology = parse_topology(&lines)?;
        assert_eq!(topology.len(), 2);
        assert_eq!(topology[&0], vec![0, 2, 4, 6]);
        assert_eq!(topology[&1], vec![1, 3, 5, 7]);

        assert!(parse_topology(&["0;1"]).is_err());
        assert!(parse_topology(&["# only comments"]).is_err());
        Ok(())
    }

    #[test]
    fn test_utilization_range() {
        assert!(ExperimentConfig::new("node-0", 60.0, 0.5).is_ok());
        assert!(ExperimentConfig::new("node-0", 60.0, 0.0).is_ok());
        assert!(ExperimentConfig::new("node-0", 60.0, 1.0).is_ok());
        assert!(matches!(
            ExperimentConfig::new("node-0", 60.0, 1.5),
            Err(ConfigError::OutOfRange { name: "utilization", .. })
        ));
        assert!(ExperimentConfig::new("node-0", 0.0, 0.5).is_err());
        assert!(matches!(
            ExperimentConfig::new("node-0", 1e20, 0.5),
            Err(ConfigError::TooLong { name: "duration", .. })
        ));
    }

    #[test]
    fn test_loaded_cpu_count() {
        assert_eq!(loaded_cpu_count(4, 0.5), 2);
        assert_eq!(loaded_cpu_count(4, 0.6), 2);
        assert_eq!(loaded_cpu_count(4, 1.0), 4);
        assert_eq!(loaded_cpu_count(4, 0.0), 0);
    }

    #[test]
    fn test_plan() -> anyhow::Result<()> {
        let lines: Vec<&str> = LSCPU.lines().collect();
        let topology = parse_topology(&lines)?;
        let config = ExperimentConfig::new("node-0", 60.0, 0.5)?;
        let plan = plan_experiment(&config, &topology)?;

        assert_eq!(
            plan.setup,
            vec![
                "mkdir -p energy",
                "sudo cpupower -c all frequency-set -g userspace",
                "sudo cpupower -c 0,2,4,6 frequency-set -f 0.8GHz",
                "sudo cpupower -c 1,3,5,7 frequency-set -f 0.8GHz",
            ]
        );
        assert_eq!(plan.logger_cpu, 0);
        assert_eq!(
            plan.logger,
            "taskset -c 0 cli_log_cpu log --output energy/energy.csv --duration 60 --channels energy:0,energy:1"
        );
        assert_eq!(plan.loaded_cpus, vec![1, 3]);
        assert_eq!(
            plan.busy_loops,
            vec!["taskset -c 1 cli_log_cpu busy --duration 60", "taskset -c 3 cli_log_cpu busy --duration 60"]
        );
        assert_eq!(plan.tasks().count(), 3);
        Ok(())
    }

    #[test]
    fn test_plan_needs_two_sockets() -> anyhow::Result<()> {
        let topology = parse_topology(&["0,0", "1,0"])?;
        let config = ExperimentConfig::new("node-0", 10.0, 1.0)?;
        assert!(plan_experiment(&config, &topology).is_err());
        Ok(())
    }

    #[test]
    fn test_run_experiment() -> anyhow::Result<()> {
        let executor = MockExecutor::new(None);
        let mut config = ExperimentConfig::new("node-0", 30.0, 1.0)?;
        config.disable_turbo = true;
        config.workdir = Some(String::from("power-exp"));
        let report = run_experiment(&executor, &config)?;

        assert_eq!(report.plan.loaded_cpus, vec![1, 3, 5, 7]);
        let commands = executor.commands();
        // topology + turbo + mkdir + governor + 2 frequencies, then 1 logger + 4 busy loops
        assert_eq!(commands.len(), 6 + 5);
        assert_eq!(commands[0], TOPOLOGY_COMMAND);
        assert!(commands[1].contains("no_turbo"));
        assert_eq!(commands[2], "cd power-exp && mkdir -p energy");
        let tasks = &commands[6..];
        assert!(tasks.iter().any(|c| c.starts_with("cd power-exp && taskset -c 0 cli_log_cpu log")));
        assert_eq!(tasks.iter().filter(|c| c.contains(" busy ")).count(), 4);
        assert!(executor.calls.lock().unwrap().iter().all(|(node, _)| node == "node-0"));
        Ok(())
    }

    #[test]
    fn test_failed_task_is_reported_after_all_tasks() -> anyhow::Result<()> {
        let executor = MockExecutor::new(Some("taskset -c 3 "));
        let config = ExperimentConfig::new("node-0", 30.0, 1.0)?;
        let err = run_experiment(&executor, &config).err().expect("one busy loop fails");
        assert!(err.to_string().contains("1 task(s)"));
        // the other tasks still ran
        assert_eq!(executor.commands().iter().filter(|c| c.contains("taskset")).count(), 5);
        Ok(())
    }

    #[test]
    fn test_failed_setup_aborts() -> anyhow::Result<()> {
        let executor = MockExecutor::new(Some("frequency-set -g"));
        let config = ExperimentConfig::new("node-0", 30.0, 0.5)?;
        assert!(run_experiment(&executor, &config).is_err());
        assert!(!executor.commands().iter().any(|c| c.contains("taskset")));
        Ok(())
    }
}

//! Synthetic cpu load: threads that spin for a fixed wall-clock duration.

use std::{
    hint::black_box,
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{error::ConfigError, logger::Cancellation};

/// Number of spin iterations between two checks of the clock and of the cancellation flag.
const SPINS_PER_CHECK: u32 = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct LoadConfig {
    pub duration: Duration,
    pub threads: usize,
    /// If set, thread `i` is pinned to `cores[i]`. Must have one cpu per thread.
    pub cores: Option<Vec<u32>>,
}

impl LoadConfig {
    pub fn new(duration_secs: f64, threads: usize, cores: Option<Vec<u32>>) -> Result<LoadConfig, ConfigError> {
        let duration = crate::duration_from_secs(duration_secs)?;
        let threads = match &cores {
            Some(cores) => cores.len(),
            None => threads,
        };
        if threads == 0 {
            return Err(ConfigError::OutOfRange {
                name: "threads",
                value: 0.0,
                min: 1.0,
                max: f64::INFINITY,
            });
        }
        Ok(LoadConfig {
            duration,
            threads,
            cores,
        })
    }
}

/// What one busy thread did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadReport {
    pub index: usize,
    /// cpu the thread was pinned to, if pinning was asked and succeeded
    pub pinned_to: Option<u32>,
    pub spins: u64,
    pub interrupted: bool,
}

/// Pins the calling thread to `cpu`.
pub fn pin_current_thread(cpu: u32) -> std::io::Result<()> {
    // SAFETY: cpu_set_t is a plain bitmask for which all zeroes is the empty set,
    // and pthread_self() is always a valid thread handle for the calling thread.
    let result = unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu as usize, &mut cpuset);
        libc::pthread_setaffinity_np(libc::pthread_self(), std::mem::size_of::<libc::cpu_set_t>(), &cpuset)
    };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::from_raw_os_error(result))
    }
}

/// Spins until `duration` elapses or `cancel` is set. Returns the number of spins and whether it was cancelled.
fn spin(duration: Duration, cancel: &Cancellation) -> (u64, bool) {
    let start = Instant::now();
    let mut spins: u64 = 0;
    let mut acc: u64 = 0;
    loop {
        for i in 0..SPINS_PER_CHECK {
            acc = black_box(acc.wrapping_add(i as u64));
        }
        spins += SPINS_PER_CHECK as u64;
        if start.elapsed() >= duration {
            return (spins, false);
        }
        if cancel.is_cancelled() {
            return (spins, true);
        }
    }
}

/// Busies `config.threads` threads for `config.duration`, and waits for all of them.
pub fn run_busy_load(config: &LoadConfig, cancel: &Cancellation) -> Vec<ThreadReport> {
    info!(
        "busy loop on {} thread(s) for {:?}{}",
        config.threads,
        config.duration,
        match &config.cores {
            Some(cores) => format!(", pinned to cpus {}", crate::format_cpu_list(cores)),
            None => String::new(),
        }
    );
    thread::scope(|s| {
        let handles: Vec<_> = (0..config.threads)
            .map(|index| {
                let cpu = config.cores.as_ref().and_then(|cores| cores.get(index).copied());
                s.spawn(move || {
                    let pinned_to = cpu.and_then(|cpu| match pin_current_thread(cpu) {
                        Ok(()) => Some(cpu),
                        Err(e) => {
                            warn!("failed to pin busy thread {index} to cpu {cpu}, it runs unpinned: {e}");
                            None
                        }
                    });
                    let (spins, interrupted) = spin(config.duration, cancel);
                    debug!("busy thread {index} done after {spins} spins");
                    ThreadReport {
                        index,
                        pinned_to,
                        spins,
                        interrupted,
                    }
                })
            })
            .collect();
        // barrier: every thread is joined before returning
        handles
            .into_iter()
            .enumerate()
            .map(|(index, h)| {
                h.join().unwrap_or(ThreadReport {
                    index,
                    pinned_to: None,
                    spins: 0,
                    interrupted: true,
                })
            })
            .collect()
    })
}

use std::{path::Path, time::Duration};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cpu_probes::{
    channel::parse_channel_list,
    frequency::SysfsFrequencySampler,
    msr::MsrUncoreSampler,
    overflow::{counter_deltas, power_series, PowerConfig, DEFAULT_MODULUS},
    powercap::{PowercapSampler, POWERCAP_RAPL_PATH},
    utilization::UtilizationSampler,
    Channel, Sampler,
};

fn first_cpu() -> u32 {
    cpu_probes::online_cpus().ok().and_then(|cpus| cpus.first().copied()).unwrap_or(0)
}

fn bench_samplers(c: &mut Criterion) {
    let cpu = first_cpu();

    // criterion config
    let mut group = c.benchmark_group("samplers");
    group
        .significance_level(0.01)
        .sample_size(200)
        .warm_up_time(Duration::from_secs(2))
        .measurement_time(Duration::from_secs(10));

    let mut run_bench = |name: &str, channels: &str, sampler: &mut dyn Sampler| {
        let channels: Vec<Channel> = parse_channel_list(channels).unwrap();
        group.bench_function(BenchmarkId::new(name, channels.len()), |b| {
            b.iter(|| {
                sampler.poll().unwrap();
                for c in &channels {
                    // prevent compiler optimizations from removing the read
                    black_box(sampler.read(c).unwrap());
                }
            })
        });
    };

    // The samplers that can't be opened on this machine are skipped.
    match PowercapSampler::open(Path::new(POWERCAP_RAPL_PATH), &parse_channel_list("energy:0").unwrap()) {
        Ok(mut sampler) => run_bench("powercap", "energy:0", &mut sampler),
        Err(e) => eprintln!("skipping powercap: {e:#}"),
    }
    let freq_channel = format!("freq:{cpu}");
    let mut sysfs = SysfsFrequencySampler::default();
    if sysfs.read(&freq_channel.parse().unwrap()).is_ok() {
        run_bench("sysfs-freq", &freq_channel, &mut sysfs);
    } else {
        eprintln!("skipping sysfs-freq: no cpufreq for cpu {cpu}");
    }
    match MsrUncoreSampler::open(cpu) {
        Ok(mut sampler) => run_bench("msr-uncore", "uncore", &mut sampler),
        Err(e) => eprintln!("skipping msr-uncore: {e:#}"),
    }
    // dominated by the measurement window, hence a short one
    let mut utilization = UtilizationSampler::new(Duration::from_millis(1));
    run_bench("procfs-util", &format!("util:{cpu}"), &mut utilization);
    group.finish();
}

fn bench_corrector(c: &mut Criterion) {
    let n = 100_000;
    let timestamps: Vec<f64> = (0..n).map(|i| i as f64 * 0.01).collect();
    // wraps every ~430 samples
    let raw: Vec<f64> = (0..n).map(|i| (i as f64 * 1e7) % DEFAULT_MODULUS).collect();
    let config = PowerConfig::default();

    let mut group = c.benchmark_group("corrector");
    group.bench_function("deltas", |b| b.iter(|| counter_deltas(black_box(&raw), DEFAULT_MODULUS).unwrap()));
    group.bench_function("power", |b| {
        b.iter(|| power_series(black_box(&timestamps), black_box(&raw), &config).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_samplers, bench_corrector);
criterion_main!(benches);

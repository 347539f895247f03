use std::{
    fs,
    thread,
    time::{Duration, Instant},
};

use cpu_probes::{
    channel::parse_channel_list,
    logger::{Cancellation, CsvSink, LoggerConfig, Outcome, TimeSeriesLogger},
    overflow::{power_of_energy_series, PowerConfig},
    series::TimeSeries,
    Channel, SampleError, Sampler, Source,
};

/// In-memory sampler: every channel is a counter that increases by `step` at each poll.
struct FakeSampler {
    step: f64,
    value: f64,
    polls: usize,
}

impl FakeSampler {
    fn new(step: f64) -> FakeSampler {
        FakeSampler {
            step,
            value: 0.0,
            polls: 0,
        }
    }
}

impl Sampler for FakeSampler {
    fn poll(&mut self) -> Result<(), SampleError> {
        self.polls += 1;
        self.value += self.step;
        Ok(())
    }

    fn read(&mut self, _channel: &Channel) -> Result<f64, SampleError> {
        Ok(self.value)
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn xy() -> Vec<Channel> {
    vec![
        Channel::named("x", Source::Utilization { cpu: 0 }),
        Channel::named("y", Source::Utilization { cpu: 1 }),
    ]
}

fn data_rows(csv: &str) -> Vec<Vec<f64>> {
    csv.lines()
        .skip(1)
        .map(|line| line.split(',').map(|f| f.parse().expect("numeric field")).collect())
        .collect()
}

#[test]
fn two_seconds_every_second() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("xy.csv");

    let config = LoggerConfig::from_secs(2.0, 1.0)?;
    let mut logger = TimeSeriesLogger::new(xy(), FakeSampler::new(1.0), config)?;
    let sink = CsvSink::create(&path, logger.channels())?;
    let start = Instant::now();
    let summary = logger.run(sink, &Cancellation::new())?;
    assert!(start.elapsed() >= Duration::from_secs(2));

    assert_eq!(summary.outcome, Outcome::Completed);
    let content = fs::read_to_string(&path)?;
    assert_eq!(content.lines().next(), Some("timestamp,x,y"));
    let rows = data_rows(&content);
    assert!(rows.len() == 2 || rows.len() == 3, "{} rows", rows.len());
    assert_eq!(rows.len(), summary.rows);
    for row in &rows {
        assert_eq!(row.len(), 3);
        assert!(row[1] >= 0.0 && row[2] >= 0.0);
    }
    // the timestamps stay within [start, start + duration]
    let first = rows[0][0];
    assert!(rows.iter().all(|r| r[0] >= first && r[0] <= first + 2.0));
    Ok(())
}

#[test]
fn timestamps_never_decrease() -> anyhow::Result<()> {
    init_logging();
    let config = LoggerConfig::from_secs(0.2, 0.0)?;
    let mut logger = TimeSeriesLogger::new(xy(), FakeSampler::new(1.0), config)?;
    let sink = CsvSink::new(Vec::new(), logger.channels())?;
    let summary = logger.run(sink, &Cancellation::new())?;
    assert!(summary.rows > 1);

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fast.csv");
    let config = LoggerConfig::from_secs(0.2, 0.0)?;
    let mut logger = TimeSeriesLogger::new(xy(), FakeSampler::new(1.0), config)?;
    logger.run(CsvSink::create(&path, logger.channels())?, &Cancellation::new())?;

    let series = TimeSeries::load(&path)?;
    assert!(series.len() > 1);
    assert!(series.is_monotonic());
    Ok(())
}

#[test]
fn header_matches_the_channel_order() -> anyhow::Result<()> {
    let channels = parse_channel_list("energy:1,util:3,freq:0,uncore")?;
    let sink = CsvSink::new(Vec::new(), &channels)?;
    let out = String::from_utf8(sink.finish()?)?;
    assert_eq!(out, "timestamp,energy_zone_1,cpu_core_3,core_0_freq,uncore_freq\n");
    assert_eq!(out.trim_end().split(',').count(), 1 + channels.len());
    Ok(())
}

#[test]
fn cancellation_leaves_a_valid_csv() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("interrupted.csv");

    let config = LoggerConfig::from_secs(60.0, 0.05)?;
    let mut logger = TimeSeriesLogger::new(xy(), FakeSampler::new(1.0), config)?;
    let sink = CsvSink::create(&path, logger.channels())?;
    let cancel = Cancellation::new();
    let remote = cancel.clone();

    let start = Instant::now();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        remote.cancel();
    });
    let summary = logger.run(sink, &cancel)?;
    canceller.join().expect("canceller panicked");
    assert!(start.elapsed() < Duration::from_secs(30));

    assert_eq!(summary.outcome, Outcome::Interrupted);
    let content = fs::read_to_string(&path)?;
    assert!(content.ends_with('\n'), "no partial row");
    let rows = data_rows(&content);
    assert_eq!(rows.len(), summary.rows);
    assert!(rows.iter().all(|r| r.len() == 3));
    Ok(())
}

#[test]
fn logged_energy_to_power() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("energy.csv");

    // +1 J (in µJ) per iteration
    let channels = parse_channel_list("energy:0")?;
    let config = LoggerConfig::from_secs(0.5, 0.1)?;
    let mut logger = TimeSeriesLogger::new(channels, FakeSampler::new(1_000_000.0), config)?;
    let summary = logger.run(CsvSink::create(&path, logger.channels())?, &Cancellation::new())?;
    assert!(summary.rows >= 3);

    let series = TimeSeries::load(&path)?;
    let powers = power_of_energy_series(&series, &PowerConfig::default())?;
    assert_eq!(powers.len(), 1);
    assert_eq!(powers[0].0, "power_zone_0");
    assert_eq!(powers[0].1.len(), summary.rows - 1);
    for point in &powers[0].1 {
        let watts = point.watts.expect("iterations are at least 0.1 s apart");
        assert!(watts > 0.0 && watts <= 1.0 / 0.09, "{watts} W");
    }
    Ok(())
}

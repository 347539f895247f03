//! Turns a wrapping energy counter series into energy deltas and power.
//!
//! ## Overflows
//!
//! RAPL counters overflow after some time, which depends on the consumption
//! of the monitored domain. This time can be lower than one minute.
//! The correction below assumes that no more than one overflow occurs between
//! two samples. That is, the sampling frequency must be high enough: with two
//! overflows between samples, the computed delta is wrong and nothing detects it.

use std::io::Write;

use log::debug;

use crate::{channel::TIMESTAMP_COLUMN, error::CorrectionError, series::TimeSeries};

/// Default modulus of the energy counters: they are 32-bit registers.
pub const DEFAULT_MODULUS: f64 = 4_294_967_296.0; // 2^32

/// Default conversion from the counter unit to Joules: powercap counts micro-Joules.
pub const MICROJOULES: f64 = 0.000_001;

/// How raw counter values are turned into Joules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerConfig {
    /// The counter wraps around to zero when it reaches this value.
    pub modulus: f64,
    /// Joules per counter unit.
    pub unit_to_joules: f64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        PowerConfig {
            modulus: DEFAULT_MODULUS,
            unit_to_joules: MICROJOULES,
        }
    }
}

/// The increase of a counter between two consecutive samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterDelta {
    pub delta: f64,
    /// `true` if the counter is assumed to have wrapped between the two samples.
    pub wrapped: bool,
}

/// Corrects one raw difference `current - previous` of a counter that wraps at `modulus`.
///
/// A decrease larger than half the modulus is one wraparound. A smaller decrease
/// (e.g. a counter reset) is returned unchanged.
pub fn correct_delta(previous: f64, current: f64, modulus: f64) -> CounterDelta {
    let d = current - previous;
    if d < -modulus / 2.0 {
        CounterDelta {
            delta: d + modulus,
            wrapped: true,
        }
    } else {
        CounterDelta { delta: d, wrapped: false }
    }
}

/// Returns the `n-1` corrected deltas of `n` raw counter values.
pub fn counter_deltas(raw: &[f64], modulus: f64) -> Result<Vec<CounterDelta>, CorrectionError> {
    if raw.len() < 2 {
        return Err(CorrectionError::InsufficientSamples { got: raw.len() });
    }
    Ok(raw.windows(2).map(|w| correct_delta(w[0], w[1], modulus)).collect())
}

/// Average power over the interval between two samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerPoint {
    /// timestamp of the end of the interval
    pub timestamp: f64,
    /// `None` if the interval is empty or negative (duplicate timestamp, clock going backward)
    pub watts: Option<f64>,
    pub wrapped: bool,
}

/// Computes the power series of one energy counter channel.
pub fn power_series(timestamps: &[f64], raw: &[f64], config: &PowerConfig) -> Result<Vec<PowerPoint>, CorrectionError> {
    if timestamps.len() != raw.len() {
        return Err(CorrectionError::LengthMismatch {
            timestamps: timestamps.len(),
            values: raw.len(),
        });
    }
    let deltas = counter_deltas(raw, config.modulus)?;
    let points = timestamps
        .windows(2)
        .zip(deltas)
        .map(|(t, d)| {
            let dt = t[1] - t[0];
            let watts = if dt > 0.0 {
                Some(d.delta * config.unit_to_joules / dt)
            } else {
                debug!("empty interval at t={}, power undefined", t[1]);
                None
            };
            PowerPoint {
                timestamp: t[1],
                watts,
                wrapped: d.wrapped,
            }
        })
        .collect();
    Ok(points)
}

/// The power series of every `energy_zone_<z>` column of an energy time series,
/// as (`power_zone_<z>`, points) pairs.
pub fn power_of_energy_series(
    series: &TimeSeries,
    config: &PowerConfig,
) -> Result<Vec<(String, Vec<PowerPoint>)>, CorrectionError> {
    let mut powers = Vec::new();
    for name in series.columns_with_prefix(ENERGY_PREFIX) {
        let zone = &name[ENERGY_PREFIX.len()..];
        let points = power_series(&series.timestamps, series.column(name)?, config)?;
        powers.push((format!("{POWER_PREFIX}{zone}"), points));
    }
    if powers.is_empty() {
        return Err(CorrectionError::MissingColumn(format!("{ENERGY_PREFIX}*")));
    }
    Ok(powers)
}

pub const ENERGY_PREFIX: &str = "energy_zone_";
pub const POWER_PREFIX: &str = "power_zone_";

/// Writes power series that share the same timestamps as a csv time series:
/// `timestamp,power_zone_<z>,...`. Undefined values are empty fields.
///
/// Returns the number of undefined values.
pub fn write_power_csv<W: Write>(powers: &[(String, Vec<PowerPoint>)], out: W) -> anyhow::Result<usize> {
    let mut writer = csv::Writer::from_writer(out);
    let mut header = vec![TIMESTAMP_COLUMN];
    header.extend(powers.iter().map(|(name, _)| name.as_str()));
    writer.write_record(&header)?;

    let mut undefined = 0;
    let rows = powers.first().map_or(0, |(_, points)| points.len());
    for i in 0..rows {
        let mut record = vec![format!("{:.6}", powers[0].1[i].timestamp)];
        for (_, points) in powers {
            match points[i].watts {
                Some(w) => record.push(w.to_string()),
                None => {
                    undefined += 1;
                    record.push(String::new());
                }
            }
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(undefined)
}

//! Combination of the power series of repeated runs of the same experiment.

use log::info;

use crate::{
    error::CorrectionError,
    overflow::{power_of_energy_series, PowerConfig, PowerPoint},
    series::TimeSeries,
};

/// Mean and standard deviation of one power zone, per time index.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneStats {
    /// `power_zone_<z>`
    pub name: String,
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CombinedRuns {
    /// seconds since the first power point of the first run
    pub timestamps: Vec<f64>,
    pub zones: Vec<ZoneStats>,
    pub runs: usize,
}

impl CombinedRuns {
    /// Header of the csv output: `timestamp,power_zone_<z>_mean,power_zone_<z>_std,...`
    pub fn header(&self) -> Vec<String> {
        let mut header = vec![String::from(crate::channel::TIMESTAMP_COLUMN)];
        for zone in &self.zones {
            header.push(format!("{}_mean", zone.name));
            header.push(format!("{}_std", zone.name));
        }
        header
    }

    pub fn write_csv<W: std::io::Write>(&self, out: W) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(self.header())?;
        for (i, t) in self.timestamps.iter().enumerate() {
            let mut record = vec![format!("{t:.6}")];
            for zone in &self.zones {
                record.push(format_value(zone.mean[i]));
                record.push(format_value(zone.std[i]));
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Formats a power value for a csv field; undefined values are empty fields.
pub fn format_value(v: f64) -> String {
    if v.is_finite() {
        v.to_string()
    } else {
        String::new()
    }
}

fn watts(points: &[PowerPoint]) -> Vec<f64> {
    points.iter().map(|p| p.watts.unwrap_or(f64::NAN)).collect()
}

/// Combines the energy series of several runs into per-zone power statistics.
///
/// Every run is truncated to the length of the shortest one. The zones are those of the
/// first run; a run that lacks one of them is an error.
pub fn combine_runs(runs: &[TimeSeries], config: &PowerConfig) -> Result<CombinedRuns, CorrectionError> {
    if runs.is_empty() {
        return Err(CorrectionError::InsufficientSamples { got: 0 });
    }

    let mut per_run = Vec::with_capacity(runs.len());
    for run in runs {
        per_run.push(power_of_energy_series(run, config)?);
    }
    let len = per_run
        .iter()
        .flat_map(|zones| zones.iter().map(|(_, points)| points.len()))
        .min()
        .unwrap_or(0);
    if per_run.iter().any(|zones| zones.first().map_or(0, |z| z.1.len()) != len) {
        info!("runs have different lengths, truncating all of them to {len} power points");
    }

    let zone_names: Vec<String> = per_run[0].iter().map(|(name, _)| name.clone()).collect();
    let mut zones = Vec::with_capacity(zone_names.len());
    for name in zone_names {
        let mut columns = Vec::with_capacity(per_run.len());
        for run in &per_run {
            let points = run
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, points)| points)
                .ok_or_else(|| CorrectionError::MissingColumn(name.replacen("power", "energy", 1)))?;
            columns.push(watts(&points[..len]));
        }
        let (mean, std) = mean_std_by_index(&columns, len);
        zones.push(ZoneStats { name, mean, std });
    }

    // relative to the first power point of the first run
    let first_power_points = &per_run[0][0].1;
    let t0 = first_power_points.first().map_or(0.0, |p| p.timestamp);
    let timestamps = first_power_points[..len].iter().map(|p| p.timestamp - t0).collect();
    Ok(CombinedRuns {
        timestamps,
        zones,
        runs: runs.len(),
    })
}

/// Mean and population standard deviation across the columns, for each of the first `len` indices.
/// `NaN` values (undefined power) are skipped; an index without any value gives `NaN`.
fn mean_std_by_index(columns: &[Vec<f64>], len: usize) -> (Vec<f64>, Vec<f64>) {
    let mut mean = Vec::with_capacity(len);
    let mut std = Vec::with_capacity(len);
    for i in 0..len {
        let values: Vec<f64> = columns.iter().map(|c| c[i]).filter(|v| !v.is_nan()).collect();
        let n = values.len() as f64;
        let m = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / n;
        mean.push(m);
        std.push(variance.sqrt());
    }
    (mean, std)
}

/// Quantile `q` in [0, 1] of sorted values, with linear interpolation between the closest ranks.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Bounds outside of which a value is an outlier: `[Q1 - 1.5 IQR, Q3 + 1.5 IQR]`.
/// `None` if there is no finite value.
pub fn iqr_bounds(values: &[f64]) -> Option<(f64, f64)> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let iqr = q3 - q1;
    Some((q1 - 1.5 * iqr, q3 + 1.5 * iqr))
}

/// Minimum and maximum of the values that are not outliers.
pub fn filtered_range(values: &[f64]) -> Option<(f64, f64)> {
    let (lower, upper) = iqr_bounds(values)?;
    values
        .iter()
        .copied()
        .filter(|v| v.is_finite() && *v >= lower && *v <= upper)
        .fold(None, |range, v| match range {
            None => Some((v, v)),
            Some((min, max)) => Some((min.min(v), max.max(v))),
        })
}

/// Outlier-free range of the mean power over all the zones.
pub fn power_range(combined: &CombinedRuns) -> Option<(f64, f64)> {
    combined
        .zones
        .iter()
        .filter_map(|z| filtered_range(&z.mean))
        .reduce(|(min_a, max_a), (min_b, max_b)| (min_a.min(min_b), max_a.max(max_b)))
}

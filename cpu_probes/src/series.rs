//! In-memory view of a csv time series written by the logger.

use std::{fs::File, io::Read, path::Path};

use anyhow::{anyhow, Context};

use crate::{channel::TIMESTAMP_COLUMN, error::CorrectionError};

/// A closed time series: the timestamps and one column of values per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub timestamps: Vec<f64>,
    /// (channel name, values), in header order
    pub columns: Vec<(String, Vec<f64>)>,
}

impl TimeSeries {
    pub fn load(path: &Path) -> anyhow::Result<TimeSeries> {
        let file = File::open(path).with_context(|| format!("open {}", path.to_string_lossy()))?;
        TimeSeries::from_reader(file).with_context(|| format!("read time series {}", path.to_string_lossy()))
    }

    /// Parses a csv time series. Empty fields are read as `NaN`.
    pub fn from_reader<R: Read>(reader: R) -> anyhow::Result<TimeSeries> {
        let mut reader = csv::Reader::from_reader(reader);
        let headers = reader.headers()?.clone();
        let mut names = headers.iter();
        match names.next() {
            Some(TIMESTAMP_COLUMN) => (),
            other => return Err(anyhow!("the first column should be '{TIMESTAMP_COLUMN}', not {other:?}")),
        }
        let mut columns: Vec<(String, Vec<f64>)> = names.map(|n| (n.to_owned(), Vec::new())).collect();
        let mut timestamps = Vec::new();

        for (i, record) in reader.records().enumerate() {
            let record = record?;
            let parse = |field: &str| -> anyhow::Result<f64> {
                if field.is_empty() {
                    Ok(f64::NAN)
                } else {
                    field
                        .trim()
                        .parse()
                        .with_context(|| format!("row {}: invalid number '{field}'", i + 1))
                }
            };
            let mut fields = record.iter();
            let timestamp = fields.next().ok_or_else(|| anyhow!("row {}: empty row", i + 1))?;
            timestamps.push(parse(timestamp)?);
            for (column, field) in columns.iter_mut().zip(fields) {
                column.1.push(parse(field)?);
            }
        }
        Ok(TimeSeries { timestamps, columns })
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn column(&self, name: &str) -> Result<&[f64], CorrectionError> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| values.as_slice())
            .ok_or_else(|| CorrectionError::MissingColumn(name.to_owned()))
    }

    /// Names of the columns that start with `prefix`, in header order.
    pub fn columns_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.columns
            .iter()
            .map(|(n, _)| n.as_str())
            .filter(move |n| n.starts_with(prefix))
    }

    /// `true` if no timestamp is smaller than the previous one.
    pub fn is_monotonic(&self) -> bool {
        self.timestamps.windows(2).all(|w| w[0] <= w[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_series() -> anyhow::Result<()> {
        let csv = "timestamp,energy_zone_0,energy_zone_1\n1.0,10,20\n2.0,15,\n";
        let series = TimeSeries::from_reader(csv.as_bytes())?;
        assert_eq!(series.len(), 2);
        assert_eq!(series.timestamps, vec![1.0, 2.0]);
        assert_eq!(series.column("energy_zone_0")?, &[10.0, 15.0]);
        let zone1 = series.column("energy_zone_1")?;
        assert_eq!(zone1[0], 20.0);
        assert!(zone1[1].is_nan());
        assert!(series.is_monotonic());
        let energy: Vec<&str> = series.columns_with_prefix("energy_zone_").collect();
        assert_eq!(energy, vec!["energy_zone_0", "energy_zone_1"]);
        Ok(())
    }

    #[test]
    fn test_missing_column() -> anyhow::Result<()> {
        let series = TimeSeries::from_reader("timestamp,x\n1,2\n".as_bytes())?;
        assert_eq!(series.column("y"), Err(CorrectionError::MissingColumn("y".to_owned())));
        Ok(())
    }

    #[test]
    fn test_invalid_series() {
        assert!(TimeSeries::from_reader("time,x\n1,2\n".as_bytes()).is_err());
        assert!(TimeSeries::from_reader("timestamp,x\n1,abc\n".as_bytes()).is_err());
    }
}

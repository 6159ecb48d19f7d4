use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::WriterBuilder;
use tempfile::NamedTempFile;
use tracing::info;

use crate::records::{CorrelationPivot, CorrelationRecord};

pub const LONG_FILE: &str = "rolling_correlation_long.csv";
pub const WIDE_FILE: &str = "rolling_correlation_wide.csv";

/// Write `rows` to `dir` in long and wide layout. Each file is written to a
/// temp file in the same directory and renamed into place.
pub fn write_correlation_exports(dir: &Path, rows: &[CorrelationRecord]) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let long = dir.join(LONG_FILE);
    let wide = dir.join(WIDE_FILE);
    write_long(&long, rows)?;
    write_wide(&wide, rows)?;
    Ok(vec![long, wide])
}

fn write_long(path: &Path, rows: &[CorrelationRecord]) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(path.parent().unwrap_or(Path::new(".")))?;
    {
        let mut wtr = WriterBuilder::new().from_writer(tmp.as_file_mut());
        for r in rows {
            wtr.serialize(r)?;
        }
        wtr.flush()?;
    }
    tmp.persist(path)?;
    info!("wrote {} ({} rows)", path.display(), rows.len());
    Ok(())
}

fn write_wide(path: &Path, rows: &[CorrelationRecord]) -> Result<()> {
    let pivot = CorrelationPivot::from_long(rows);
    let mut tmp = NamedTempFile::new_in(path.parent().unwrap_or(Path::new(".")))?;
    {
        let mut wtr = WriterBuilder::new().from_writer(tmp.as_file_mut());
        let mut header = vec!["Date".to_string()];
        header.extend(pivot.columns.iter().cloned());
        wtr.write_record(&header)?;
        for (date, cells) in &pivot.rows {
            let mut record = Vec::with_capacity(cells.len() + 1);
            record.push(date.format("%Y-%m-%d").to_string());
            record.extend(
                cells
                    .iter()
                    .map(|v| v.map(|v| v.to_string()).unwrap_or_default()),
            );
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
    }
    tmp.persist(path)?;
    info!(
        "wrote {} ({} dates x {} series)",
        path.display(),
        pivot.rows.len(),
        pivot.columns.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn row(day: u32, pair: &str, window: u32, v: Option<f64>) -> CorrelationRecord {
        CorrelationRecord {
            date: NaiveDate::from_ymd_opt(2024, 5, day).unwrap(),
            pair: pair.into(),
            window,
            rolling_correlation: v,
        }
    }

    #[test]
    fn test_exports_long_and_wide() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![
            row(1, "A/B", 7, None),
            row(2, "A/B", 7, Some(0.5)),
            row(1, "A/C", 7, Some(-0.25)),
            row(2, "A/C", 7, None),
        ];
        let written = write_correlation_exports(dir.path(), &rows).unwrap();
        assert_eq!(written.len(), 2);

        let long = fs::read_to_string(dir.path().join(LONG_FILE)).unwrap();
        let mut lines = long.lines();
        assert_eq!(lines.next(), Some("Date,Pair,Window,RollingCorrelation"));
        assert_eq!(lines.next(), Some("2024-05-01,A/B,7,"));
        assert_eq!(lines.next(), Some("2024-05-02,A/B,7,0.5"));

        let wide = fs::read_to_string(dir.path().join(WIDE_FILE)).unwrap();
        let lines: Vec<&str> = wide.lines().collect();
        assert_eq!(lines, vec!["Date,A/B (7d),A/C (7d)", "2024-05-01,,-0.25", "2024-05-02,0.5,"]);
    }

    #[test]
    fn test_export_overwrites_previous_files() {
        let dir = tempfile::tempdir().unwrap();
        write_correlation_exports(dir.path(), &[row(1, "A/B", 7, Some(0.1))]).unwrap();
        write_correlation_exports(dir.path(), &[row(3, "X/Y", 15, Some(0.9))]).unwrap();
        let wide = fs::read_to_string(dir.path().join(WIDE_FILE)).unwrap();
        assert_eq!(wide.lines().next(), Some("Date,X/Y (15d)"));
        assert_eq!(wide.lines().count(), 2);
    }
}

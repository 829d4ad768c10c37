//! Copies weekly totals from a points sheet into an LMS gradebook export.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use tracing::{debug, error, info};

use crate::config::GradebookColumns;
use crate::GraderError;

#[derive(Debug, Clone, PartialEq)]
pub struct GradebookSummary {
    pub output: PathBuf,
    pub week_column: String,
    pub filled: usize,
    /// Gradebook ids with no points-sheet row; written as 0.
    pub missing: Vec<String>,
}

/// `uni` -> `total_points` from a points sheet. A sentinel or empty total is
/// an error.
pub fn read_totals(path: &Path, sentinel: &str) -> Result<HashMap<String, f64>, GraderError> {
    if !path.exists() {
        return Err(GraderError::MissingFile {
            path: path.to_path_buf(),
        });
    }
    let csv_err = |source| GraderError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_err)?;
    let headers = reader.headers().map_err(csv_err)?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| GraderError::Gradebook(format!("{} has no {name} column", path.display())))
    };
    let uni_col = column("uni")?;
    let total_col = column("total_points")?;

    let mut totals = HashMap::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let uni = record.get(uni_col).unwrap_or_default();
        let total = record.get(total_col).unwrap_or_default();
        if uni.is_empty() {
            return Err(GraderError::Gradebook(format!("row without a uni: {record:?}")));
        }
        if total.is_empty() || total == sentinel {
            return Err(GraderError::Gradebook(format!("total_points for {uni} is {total:?}")));
        }
        let points: f64 = total
            .parse()
            .map_err(|_| GraderError::Gradebook(format!("total_points for {uni} is not a number: {total:?}")))?;
        totals.insert(uni.to_string(), points);
    }
    Ok(totals)
}

/// `Week #1` must not match `Week #11`.
fn has_week_marker(header: &str, marker: &str) -> bool {
    header.match_indices(marker).any(|(at, _)| {
        !header[at + marker.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    })
}

/// The single header containing `marker`.
pub fn find_week_column(headers: &StringRecord, marker: &str) -> Result<usize, GraderError> {
    let matches: Vec<(usize, &str)> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| has_week_marker(h, marker))
        .collect();
    match matches.as_slice() {
        [(index, header)] => {
            info!(column = *header, "using gradebook week column");
            Ok(*index)
        }
        _ => Err(GraderError::Gradebook(format!(
            "expected exactly one column containing {marker:?}, found {:?}",
            matches.iter().map(|(_, h)| *h).collect::<Vec<_>>()
        ))),
    }
}

pub fn populate_gradebook(
    sheet_path: &Path,
    gradebook_path: &Path,
    output_path: &Path,
    week_num: u32,
    columns: &GradebookColumns,
    sentinel: &str,
) -> Result<GradebookSummary, GraderError> {
    if output_path.exists() {
        return Err(GraderError::OutputExists {
            path: output_path.to_path_buf(),
        });
    }
    if !gradebook_path.exists() {
        return Err(GraderError::MissingFile {
            path: gradebook_path.to_path_buf(),
        });
    }
    let totals = read_totals(sheet_path, sentinel)?;

    let csv_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| GraderError::Csv { path, source }
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(gradebook_path)
        .map_err(csv_err(gradebook_path))?;
    let headers = reader.headers().map_err(csv_err(gradebook_path))?.clone();
    let week_col = find_week_column(&headers, &columns.week_marker(week_num))?;
    let id_col = headers
        .iter()
        .position(|h| h == columns.id_column)
        .ok_or_else(|| GraderError::Gradebook(format!("gradebook has no {:?} column", columns.id_column)))?;

    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record.map_err(csv_err(gradebook_path))?);
    }
    if rows.is_empty() {
        return Err(GraderError::Gradebook("gradebook export has no rows".to_string()));
    }

    let mut filled = 0;
    let mut missing = Vec::new();
    let rows: Vec<StringRecord> = rows
        .into_iter()
        .map(|record| {
            let id = record.get(id_col).unwrap_or_default().trim();
            // LMS exports carry a points-possible row with no id
            if id.is_empty() {
                debug!(row = ?record, "gradebook row without id left as is");
                return record;
            }
            let points = match totals.get(id) {
                Some(points) => *points,
                None => {
                    error!(id, "not in the points sheet (observer or unregistered?), filling 0");
                    missing.push(id.to_string());
                    0.0
                }
            };
            filled += 1;
            record
                .iter()
                .enumerate()
                .map(|(i, value)| if i == week_col { points.to_string() } else { value.to_string() })
                .collect()
        })
        .collect();

    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| GraderError::Gradebook(format!("creating {}: {e}", parent.display())))?;
    }
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(output_path)
        .map_err(csv_err(output_path))?;
    writer.write_record(&headers).map_err(csv_err(output_path))?;
    for row in &rows {
        writer.write_record(row).map_err(csv_err(output_path))?;
    }
    writer
        .flush()
        .map_err(|e| GraderError::Gradebook(format!("flushing {}: {e}", output_path.display())))?;

    info!(output = %output_path.display(), filled, missing = missing.len(), "gradebook populated");
    Ok(GradebookSummary {
        output: output_path.to_path_buf(),
        week_column: headers.get(week_col).unwrap_or_default().to_string(),
        filled,
        missing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHEET: &str = "uni,Codeforces_contest,Topcoder_contest,contest_points,practice_points,total_points,exceptions
abc123,2,MANUAL,2,1,3,0
def456,0,MANUAL,0,0.5,0.5,1
";

    const GRADEBOOK: &str = "Student,ID,SIS User ID,Week #1 Problems (123),Week #11 Problems (456)
Points Possible,,,10,10
\"Lovelace, Ada\",1,abc123,,
\"Hopper, Grace\",2,gh777,,
";

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, text).expect("write fixture");
        path
    }

    #[test]
    fn fills_week_column_and_zero_for_missing_students() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sheet = write(dir.path(), "grades_1.csv", SHEET);
        let gradebook = write(dir.path(), "export.csv", GRADEBOOK);
        let output = dir.path().join("gradebook_1.csv");

        let summary = populate_gradebook(&sheet, &gradebook, &output, 1, &GradebookColumns::default(), "MANUAL")
            .expect("populate");
        assert_eq!(summary.week_column, "Week #1 Problems (123)");
        assert_eq!(summary.filled, 2);
        assert_eq!(summary.missing, vec!["gh777".to_string()]);

        let text = std::fs::read_to_string(&output).expect("read");
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[1], "Points Possible,,,10,10");
        assert_eq!(lines[2], "\"Lovelace, Ada\",1,abc123,3,");
        assert_eq!(lines[3], "\"Hopper, Grace\",2,gh777,0,");

        let again = populate_gradebook(&sheet, &gradebook, &output, 1, &GradebookColumns::default(), "MANUAL");
        assert!(matches!(again, Err(GraderError::OutputExists { .. })));
    }

    #[test]
    fn ambiguous_week_column_is_rejected() {
        let headers = StringRecord::from(vec!["Week #1 A", "Week #1 B", "SIS User ID"]);
        assert!(find_week_column(&headers, "Week #1").is_err());
        let headers = StringRecord::from(vec!["Week #1 A", "Week #11 B"]);
        assert_eq!(find_week_column(&headers, "Week #1").expect("week 1"), 0);
        assert_eq!(find_week_column(&headers, "Week #11").expect("week 11"), 1);
        assert!(find_week_column(&headers, "Week #2").is_err());
    }

    #[test]
    fn sentinel_total_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sheet = write(
            dir.path(),
            "grades_2.csv",
            "uni,total_points\nabc123,MANUAL\n",
        );
        let err = read_totals(&sheet, "MANUAL").expect_err("sentinel");
        assert!(matches!(err, GraderError::Gradebook(_)));
    }
}

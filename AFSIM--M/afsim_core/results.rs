use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_logging::LogLevel;
use walkdir::WalkDir;

use crate::{
    error::{AfsimError, Result},
    helper::ServiceTelemetry,
};

/// Default row cap for CSV queries.
pub const DEFAULT_MAX_ROWS: usize = 1000;
/// Default line cap for event and archive queries.
pub const DEFAULT_MAX_LINES: usize = 500;
const EXPORT_MAX_ROWS: usize = 100_000;

/// Result file flavours written by AFSIM runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultFormat {
    /// Archived event replay.
    Aer,
    /// Event log.
    Evt,
    /// Tabular output.
    Csv,
    /// JSON output.
    Json,
}

impl ResultFormat {
    /// Every supported format.
    pub const ALL: [Self; 4] = [Self::Aer, Self::Evt, Self::Csv, Self::Json];

    /// Extension without the dot.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Aer => "aer",
            Self::Evt => "evt",
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }

    /// Parses `csv`, `.csv` or `CSV`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let wanted = raw.trim().trim_start_matches('.');
        Self::ALL
            .into_iter()
            .find(|format| format.extension().eq_ignore_ascii_case(wanted))
    }

    /// Format implied by the file extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::parse)
    }
}

impl fmt::Display for ResultFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// One discovered result file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultFileInfo {
    /// Path as found during the scan.
    pub file_path: String,
    /// Format from the extension.
    pub format: ResultFormat,
    /// Size on disk.
    pub size_bytes: u64,
    /// Modification time, RFC 3339.
    pub created_at: Option<String>,
}

/// Rows read from a CSV file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvQuery {
    /// Queried file.
    pub file_path: String,
    /// Selected columns.
    pub columns: Vec<String>,
    /// Number of returned rows.
    pub row_count: usize,
    /// Rows keyed by column.
    pub rows: Vec<IndexMap<String, String>>,
}

/// Leading lines of an event or archive file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinesQuery {
    /// Queried file.
    pub file_path: String,
    /// Number of returned lines.
    pub line_count: usize,
    /// The lines.
    pub lines: Vec<String>,
}

/// Totals for a results directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    /// Scanned directory.
    pub directory: String,
    /// Number of result files.
    pub total_files: usize,
    /// File count per format.
    pub by_format: IndexMap<String, usize>,
    /// Sum of file sizes.
    pub total_size_bytes: u64,
}

/// Discovery and light querying of run outputs.
#[derive(Debug, Clone)]
pub struct ResultsHandler {
    results_dir: PathBuf,
    telemetry: Option<ServiceTelemetry>,
}

impl ResultsHandler {
    /// Creates a handler rooted at the run output directory.
    #[must_use]
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: ServiceTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Default scan root.
    #[must_use]
    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Recursively lists result files.
    ///
    /// With `run_id`, scanning starts in the first subdirectory whose name
    /// contains it. A missing directory yields an empty list.
    pub fn list_result_files(
        &self,
        run_id: Option<&str>,
        directory: Option<&Path>,
        formats: Option<&[ResultFormat]>,
    ) -> Vec<ResultFileInfo> {
        let mut root = directory.map_or_else(|| self.results_dir.clone(), Path::to_path_buf);
        if let Some(run_id) = run_id.filter(|id| !id.is_empty()) {
            root = find_run_dir(&root, run_id).unwrap_or_else(|| root.join(run_id));
        }
        let allowed = formats.unwrap_or(&ResultFormat::ALL[..]);
        let files: Vec<ResultFileInfo> = walk_files(&root)
            .into_iter()
            .filter_map(|path| {
                let format = ResultFormat::from_path(&path)?;
                if !allowed.contains(&format) {
                    return None;
                }
                let meta = fs::metadata(&path).ok()?;
                let created_at = meta
                    .modified()
                    .ok()
                    .map(|time| DateTime::<Utc>::from(time).to_rfc3339());
                Some(ResultFileInfo {
                    file_path: path.display().to_string(),
                    format,
                    size_bytes: meta.len(),
                    created_at,
                })
            })
            .collect();
        self.log(
            LogLevel::Debug,
            "results.listed",
            json!({ "directory": root.display().to_string(), "count": files.len() }),
        );
        files
    }

    /// Reads up to `max_rows` CSV rows, optionally restricted to `columns`.
    pub fn query_csv(
        &self,
        path: &Path,
        columns: Option<&[String]>,
        max_rows: usize,
    ) -> Result<CsvQuery> {
        ensure_exists(path)?;
        if ResultFormat::from_path(path) != Some(ResultFormat::Csv) {
            return Err(AfsimError::InvalidArgument(format!(
                "Expected .csv file, got: {}",
                path.display()
            )));
        }
        let text = read_lossy(path)?;
        let mut records = parse_csv(&text).into_iter();
        let header = records.next().unwrap_or_default();
        let selected: Vec<String> = match columns {
            Some(columns) if !columns.is_empty() => columns.to_vec(),
            _ => header.clone(),
        };
        let rows: Vec<IndexMap<String, String>> = records
            .take(max_rows)
            .map(|record| {
                selected
                    .iter()
                    .filter_map(|column| {
                        let index = header.iter().position(|h| h == column)?;
                        Some((column.clone(), record.get(index).cloned().unwrap_or_default()))
                    })
                    .collect()
            })
            .collect();
        self.log(
            LogLevel::Debug,
            "results.csv.queried",
            json!({ "path": path.display().to_string(), "rows": rows.len() }),
        );
        Ok(CsvQuery {
            file_path: path.display().to_string(),
            columns: selected,
            row_count: rows.len(),
            rows,
        })
    }

    /// Reads the first `max_lines` lines of an `.evt` or `.aer` file.
    pub fn query_lines(&self, path: &Path, max_lines: usize) -> Result<LinesQuery> {
        ensure_exists(path)?;
        let lines: Vec<String> = read_lossy(path)?
            .lines()
            .take(max_lines)
            .map(str::to_owned)
            .collect();
        self.log(
            LogLevel::Debug,
            "results.lines.queried",
            json!({ "path": path.display().to_string(), "lines": lines.len() }),
        );
        Ok(LinesQuery {
            file_path: path.display().to_string(),
            line_count: lines.len(),
            lines,
        })
    }

    /// Writes the file as a JSON array and returns the output path.
    ///
    /// CSV rows become objects; other files become `{line, content}` records.
    pub fn export_to_json(&self, path: &Path, output: Option<&Path>) -> Result<PathBuf> {
        ensure_exists(path)?;
        let records: Vec<Value> = if ResultFormat::from_path(path) == Some(ResultFormat::Csv) {
            self.query_csv(path, None, EXPORT_MAX_ROWS)?
                .rows
                .into_iter()
                .map(|row| json!(row))
                .collect()
        } else {
            read_lossy(path)?
                .lines()
                .enumerate()
                .map(|(index, line)| json!({ "line": index + 1, "content": line }))
                .collect()
        };
        let target = output.map_or_else(|| path.with_extension("json"), Path::to_path_buf);
        if target == path {
            return Err(AfsimError::InvalidArgument(format!(
                "Export target is the source file: {}",
                path.display()
            )));
        }
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, serde_json::to_string_pretty(&records)?)?;
        self.log(
            LogLevel::Info,
            "results.exported",
            json!({ "source": path.display().to_string(), "target": target.display().to_string(), "records": records.len() }),
        );
        Ok(target)
    }

    /// Counts result files per format.
    #[must_use]
    pub fn summary(&self, directory: Option<&Path>) -> ResultSummary {
        let root = directory.map_or_else(|| self.results_dir.clone(), Path::to_path_buf);
        let files = self.list_result_files(None, Some(&root), None);
        let mut by_format = IndexMap::new();
        for file in &files {
            *by_format.entry(file.format.to_string()).or_insert(0) += 1;
        }
        ResultSummary {
            directory: root.display().to_string(),
            total_files: files.len(),
            by_format,
            total_size_bytes: files.iter().map(|file| file.size_bytes).sum(),
        }
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

/// Result files (`.aer`, `.evt`, `.csv`, `.json`) below `dir`, sorted.
#[must_use]
pub fn scan_result_files(dir: &Path) -> Vec<PathBuf> {
    walk_files(dir)
        .into_iter()
        .filter(|path| ResultFormat::from_path(path).is_some())
        .collect()
}

fn walk_files(root: &Path) -> Vec<PathBuf> {
    if !root.is_dir() {
        return Vec::new();
    }
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .collect();
    files.sort();
    files
}

fn find_run_dir(root: &Path, run_id: &str) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(root)
        .ok()?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter(|path| {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().contains(run_id))
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

fn ensure_exists(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(AfsimError::NotFound(format!(
            "Result file not found: {}",
            path.display()
        )))
    }
}

fn read_lossy(path: &Path) -> Result<String> {
    Ok(String::from_utf8_lossy(&fs::read(path)?).into_owned())
}

/// Splits CSV text into records. Quoted fields may hold commas, doubled
/// quotes and line breaks.
fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.trim_start_matches('\u{feff}').chars().peekable();
    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(ch),
            }
            continue;
        }
        match ch {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(ch),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records.retain(|record| !(record.len() == 1 && record[0].is_empty()));
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn formats_parse_loosely() {
        assert_eq!(ResultFormat::parse(".AER"), Some(ResultFormat::Aer));
        assert_eq!(ResultFormat::parse("csv"), Some(ResultFormat::Csv));
        assert_eq!(ResultFormat::parse("txt"), None);
    }

    #[test]
    fn csv_parser_handles_quotes() {
        let records = parse_csv("a,b\r\n\"x, y\",\"say \"\"hi\"\"\"\n\"multi\nline\",2\n\n");
        assert_eq!(records.len(), 3);
        assert_eq!(records[1], vec!["x, y", "say \"hi\""]);
        assert_eq!(records[2], vec!["multi\nline", "2"]);
    }

    #[test]
    fn lists_and_filters_by_run_and_format() {
        let dir = tempdir().unwrap();
        let run_dir = dir.path().join("alpha-1234");
        write(&run_dir.join("tracks.csv"), "t,x\n0,1\n");
        write(&run_dir.join("nested/replay.aer"), "aer");
        write(&run_dir.join("simulation.log"), "log");
        write(&dir.path().join("beta-9999/events.evt"), "evt");

        let handler = ResultsHandler::new(dir.path());
        assert_eq!(handler.list_result_files(None, None, None).len(), 3);
        let run_files = handler.list_result_files(Some("1234"), None, None);
        assert_eq!(run_files.len(), 2);
        let only_csv = handler.list_result_files(Some("1234"), None, Some(&[ResultFormat::Csv]));
        assert_eq!(only_csv.len(), 1);
        assert_eq!(only_csv[0].size_bytes, 8);
        assert!(handler.list_result_files(Some("zzzz"), None, None).is_empty());
        assert_eq!(scan_result_files(&run_dir).len(), 2);
    }

    #[test]
    fn csv_query_selects_columns_and_caps_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tracks.csv");
        write(&path, "time,platform,alt\n0,f1,100\n1,f1,110\n2,f2,90\n");
        let handler = ResultsHandler::new(dir.path());
        let all = handler.query_csv(&path, None, DEFAULT_MAX_ROWS).unwrap();
        assert_eq!(all.columns, vec!["time", "platform", "alt"]);
        assert_eq!(all.row_count, 3);
        let some = handler
            .query_csv(&path, Some(&["alt".to_owned(), "ghost".to_owned()]), 2)
            .unwrap();
        assert_eq!(some.row_count, 2);
        assert_eq!(some.rows[1].get("alt").map(String::as_str), Some("110"));
        assert!(some.rows[0].get("ghost").is_none());
    }

    #[test]
    fn csv_query_rejects_missing_and_wrong_files() {
        let dir = tempdir().unwrap();
        let handler = ResultsHandler::new(dir.path());
        let missing = handler
            .query_csv(&dir.path().join("none.csv"), None, 10)
            .unwrap_err();
        assert_eq!(missing.kind(), "not_found");
        let evt = dir.path().join("events.evt");
        write(&evt, "x");
        assert_eq!(
            handler.query_csv(&evt, None, 10).unwrap_err().kind(),
            "invalid_argument"
        );
    }

    #[test]
    fn export_writes_line_records() {
        let dir = tempdir().unwrap();
        let evt = dir.path().join("events.evt");
        write(&evt, "first\nsecond\nthird\n");
        let handler = ResultsHandler::new(dir.path());
        let lines = handler.query_lines(&evt, 2).unwrap();
        assert_eq!(lines.lines, vec!["first", "second"]);

        let out = handler.export_to_json(&evt, None).unwrap();
        assert_eq!(out, dir.path().join("events.json"));
        let exported: Vec<Value> = serde_json::from_str(&fs::read_to_string(out).unwrap()).unwrap();
        assert_eq!(exported.len(), 3);
        assert_eq!(exported[1], json!({ "line": 2, "content": "second" }));
    }

    #[test]
    fn export_csv_rows_and_summary() {
        let dir = tempdir().unwrap();
        let csv = dir.path().join("run/tracks.csv");
        write(&csv, "a,b\n1,2\n");
        let handler = ResultsHandler::new(dir.path());
        let out = handler
            .export_to_json(&csv, Some(&dir.path().join("exports/tracks.json")))
            .unwrap();
        let exported: Value = serde_json::from_str(&fs::read_to_string(out).unwrap()).unwrap();
        assert_eq!(exported, json!([{ "a": "1", "b": "2" }]));

        let summary = handler.summary(None);
        assert_eq!(summary.total_files, 2);
        assert_eq!(summary.by_format.get("csv"), Some(&1));
        assert_eq!(summary.by_format.get("json"), Some(&1));
    }

    #[test]
    fn exporting_json_onto_itself_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.json");
        write(&path, "[]");
        let handler = ResultsHandler::new(dir.path());
        assert_eq!(
            handler.export_to_json(&path, None).unwrap_err().kind(),
            "invalid_argument"
        );
    }
}

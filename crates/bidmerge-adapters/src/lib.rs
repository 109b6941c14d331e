//! Spreadsheet readers, source discovery and header reconciliation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bidmerge_core::{CanonicalRow, Cell, CellValue, ProfileSpec, SourceTable};
use calamine::{open_workbook, Data, Reader, Xlsx};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "bidmerge-adapters";

pub const XLSX_EXTENSION: &str = "xlsx";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading workbook {path}: {message}")]
    Workbook { path: String, message: String },
    #[error("workbook {0} has no worksheets")]
    EmptyWorkbook(String),
    #[error("no readable source files ({failed} unreadable)")]
    NoInputFiles { failed: usize },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Reads one source file into a [`SourceTable`].
pub trait TableReader: Send + Sync {
    fn extensions(&self) -> &[&'static str];

    fn read_table(&self, path: &Path) -> Result<SourceTable, AdapterError>;
}

/// First worksheet of an `.xlsx` workbook; first row is the header row.
#[derive(Debug, Default, Clone, Copy)]
pub struct XlsxTableReader;

impl TableReader for XlsxTableReader {
    fn extensions(&self) -> &[&'static str] {
        &[XLSX_EXTENSION]
    }

    fn read_table(&self, path: &Path) -> Result<SourceTable, AdapterError> {
        let display = path.display().to_string();
        let mut workbook = open_workbook::<Xlsx<_>, _>(path).map_err(|e| AdapterError::Workbook {
            path: display.clone(),
            message: e.to_string(),
        })?;
        let sheet = workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| AdapterError::EmptyWorkbook(display.clone()))?;
        let range = workbook
            .worksheet_range(&sheet)
            .map_err(|e| AdapterError::Workbook {
                path: display.clone(),
                message: e.to_string(),
            })?;

        let source_name = file_name_of(path);
        let mut rows = range.rows();
        let Some(header_row) = rows.next() else {
            return Ok(SourceTable::new(source_name, Vec::new()));
        };
        let headers = header_row
            .iter()
            .map(|d| cell_from_data(d).map(|v| v.render()).unwrap_or_default())
            .collect();

        let mut table = SourceTable::new(source_name, headers);
        for row in rows {
            table.push_row(row.iter().map(cell_from_data).collect());
        }
        Ok(table)
    }
}

pub fn cell_from_data(data: &Data) -> Cell {
    match data {
        Data::Empty | Data::Error(_) => None,
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::text(s.clone()),
        Data::Int(i) => Some(CellValue::Int(*i)),
        Data::Float(f) => CellValue::Float(*f).normalize(),
        Data::Bool(b) => Some(CellValue::Bool(*b)),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(CellValue::DateTime)
            .or_else(|| CellValue::Float(dt.as_f64()).normalize()),
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Source files in `dir`, sorted by name.
///
/// Hidden files, Office lock files (`~$...`) and any name in `exclude` (the
/// run's own artifacts) are skipped.
pub fn discover_source_files(
    dir: &Path,
    extensions: &[&str],
    exclude: &[String],
) -> Result<Vec<PathBuf>, AdapterError> {
    let entries = fs::read_dir(dir).map_err(|e| AdapterError::Io {
        context: format!("listing {}", dir.display()),
        source: e,
    })?;

    let mut files = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .filter(|path| {
            let name = file_name_of(path);
            let ext_ok = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|ext| extensions.iter().any(|want| ext.eq_ignore_ascii_case(want)))
                .unwrap_or(false);
            ext_ok && !name.starts_with('.') && !name.starts_with("~$") && !exclude.contains(&name)
        })
        .collect::<Vec<_>>();
    files.sort_by_key(|path| file_name_of(path));
    Ok(files)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub file: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub tables: Vec<SourceTable>,
    pub failures: Vec<FileFailure>,
}

/// Reads every discovered source file of a run, in discovery order.
#[derive(Clone)]
pub struct DatasetLoader {
    reader: Arc<dyn TableReader>,
}

impl DatasetLoader {
    pub fn new(reader: Arc<dyn TableReader>) -> Self {
        Self { reader }
    }

    pub fn xlsx() -> Self {
        Self::new(Arc::new(XlsxTableReader))
    }

    /// Unreadable files are logged and skipped; zero readable files is
    /// [`AdapterError::NoInputFiles`].
    pub fn load(&self, dir: &Path, exclude: &[String]) -> Result<LoadReport, AdapterError> {
        let files = discover_source_files(dir, self.reader.extensions(), exclude)?;
        let mut report = LoadReport::default();

        for path in files {
            match self.reader.read_table(&path) {
                Ok(table) => {
                    debug!(file = %table.source_name, rows = table.rows.len(), "read source file");
                    report.tables.push(table);
                }
                Err(err) => {
                    let file = file_name_of(&path);
                    warn!(file = %file, error = %err, "skipping unreadable source file");
                    report.failures.push(FileFailure {
                        file,
                        error: err.to_string(),
                    });
                }
            }
        }

        if report.tables.is_empty() {
            return Err(AdapterError::NoInputFiles {
                failed: report.failures.len(),
            });
        }
        Ok(report)
    }
}

/// Where each raw column of a table lands in a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    /// Per raw column: index into `profile.fields`, or `None` when dropped.
    pub targets: Vec<Option<usize>>,
    /// Headers with no canonical field in the profile.
    pub unmapped: Vec<String>,
    /// Headers whose field was already claimed by an earlier column.
    pub shadowed: Vec<String>,
}

impl ColumnMapping {
    pub fn dropped(&self) -> usize {
        self.unmapped.len() + self.shadowed.len()
    }
}

/// Pure function of (headers, profile). The first column mapping to a field
/// wins; later ones are discarded.
pub fn column_mapping(headers: &[String], profile: &ProfileSpec) -> ColumnMapping {
    let mut claimed = vec![false; profile.fields.len()];
    let mut mapping = ColumnMapping {
        targets: Vec::with_capacity(headers.len()),
        unmapped: Vec::new(),
        shadowed: Vec::new(),
    };

    for header in headers {
        match profile.resolve_header(header) {
            Some(index) if !claimed[index] => {
                claimed[index] = true;
                mapping.targets.push(Some(index));
            }
            Some(_) => {
                mapping.targets.push(None);
                mapping.shadowed.push(header.clone());
            }
            None => {
                mapping.targets.push(None);
                mapping.unmapped.push(header.clone());
            }
        }
    }
    mapping
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub rows: Vec<CanonicalRow>,
    pub mapping: ColumnMapping,
}

/// Project a source table onto the profile's canonical fields.
pub fn reconcile(table: &SourceTable, profile: &ProfileSpec) -> Reconciled {
    let mapping = column_mapping(&table.headers, profile);
    if mapping.dropped() > 0 {
        debug!(
            file = %table.source_name,
            profile = %profile.id,
            unmapped = ?mapping.unmapped,
            shadowed = ?mapping.shadowed,
            "dropping columns outside the canonical schema"
        );
    }

    let width = profile.fields.len();
    let rows = table
        .rows
        .iter()
        .map(|cells| {
            let mut row = CanonicalRow::empty(width);
            for (cell, target) in cells.iter().zip(&mapping.targets) {
                if let Some(index) = target {
                    row.set(*index, cell.clone());
                }
            }
            row
        })
        .collect();

    Reconciled { rows, mapping }
}

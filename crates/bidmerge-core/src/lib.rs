//! Core tabular model and schema profiles for bidmerge.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "bidmerge-core";

/// A single non-null spreadsheet value.
///
/// Missing cells are represented as `None` at the row level (see [`Cell`]),
/// never as an empty string or a `NaN` sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    DateTime(NaiveDateTime),
}

pub type Cell = Option<CellValue>;

impl CellValue {
    /// Collapse blank text and `NaN` to null.
    pub fn normalize(self) -> Cell {
        match self {
            CellValue::Text(text) if text.trim().is_empty() => None,
            CellValue::Float(value) if value.is_nan() => None,
            other => Some(other),
        }
    }

    pub fn text(value: impl Into<String>) -> Cell {
        CellValue::Text(value.into()).normalize()
    }

    /// Flat-file rendering shared by the CSV encoder and the destination store.
    pub fn render(&self) -> String {
        match self {
            CellValue::Text(text) => text.clone(),
            CellValue::Int(value) => value.to_string(),
            CellValue::Float(value) if value.fract() == 0.0 && value.abs() < 1e15 => {
                format!("{}", *value as i64)
            }
            CellValue::Float(value) => value.to_string(),
            CellValue::Bool(true) => "True".to_string(),
            CellValue::Bool(false) => "False".to_string(),
            CellValue::DateTime(dt) => {
                if dt.num_seconds_from_midnight() == 0 && dt.nanosecond() == 0 {
                    dt.format("%Y-%m-%d").to_string()
                } else {
                    dt.format("%Y-%m-%d %H:%M:%S").to_string()
                }
            }
        }
    }
}

/// Rows of one source spreadsheet, headers kept verbatim and in file order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceTable {
    pub source_name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl SourceTable {
    pub fn new(source_name: impl Into<String>, headers: Vec<String>) -> Self {
        Self {
            source_name: source_name.into(),
            headers,
            rows: Vec::new(),
        }
    }

    /// Append a row, padding or truncating it to the header width.
    pub fn push_row(&mut self, mut cells: Vec<Cell>) {
        cells.resize(self.headers.len(), None);
        self.rows.push(cells);
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<&CellValue> {
        self.rows.get(row)?.get(column)?.as_ref()
    }
}

/// A row aligned to the field list of one profile.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRow {
    values: Vec<Cell>,
}

impl CanonicalRow {
    pub fn empty(width: usize) -> Self {
        Self {
            values: vec![None; width],
        }
    }

    pub fn from_values(values: Vec<Cell>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Cell] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&CellValue> {
        self.values.get(index)?.as_ref()
    }

    pub fn set(&mut self, index: usize, value: Cell) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value;
        }
    }

    pub fn is_vacuous(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }

    /// Rendered values, used as the identity for exact-duplicate detection.
    pub fn rendered(&self) -> Vec<Option<String>> {
        self.values
            .iter()
            .map(|v| v.as_ref().map(CellValue::render))
            .collect()
    }
}

/// The consolidated, cleaned rows of one run under one profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidatedDataset {
    pub profile: ProfileId,
    pub fields: Vec<String>,
    pub rows: Vec<CanonicalRow>,
}

impl ConsolidatedDataset {
    pub fn new(profile: &ProfileSpec) -> Self {
        Self {
            profile: profile.id,
            fields: profile.fields.clone(),
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn value(&self, row: usize, field: &str) -> Option<&CellValue> {
        let index = self.fields.iter().position(|f| f == field)?;
        self.rows.get(row)?.get(index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileId {
    TenderBid,
    EprocTender,
}

impl ProfileId {
    pub const ALL: [ProfileId; 2] = [ProfileId::TenderBid, ProfileId::EprocTender];

    pub fn as_str(self) -> &'static str {
        match self {
            ProfileId::TenderBid => "tender-bid",
            ProfileId::EprocTender => "eproc-tender",
        }
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown profile `{0}` (expected tender-bid or eproc-tender)")]
pub struct UnknownProfile(pub String);

impl FromStr for ProfileId {
    type Err = UnknownProfile;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tender-bid" => Ok(ProfileId::TenderBid),
            "eproc-tender" => Ok(ProfileId::EprocTender),
            other => Err(UnknownProfile(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactFormat {
    Csv,
    Xlsx,
}

impl ArtifactFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ArtifactFormat::Csv => "csv",
            ArtifactFormat::Xlsx => "xlsx",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderAlias {
    pub header: String,
    pub field: String,
}

/// A named canonical schema: destination table, ordered fields, header aliases
/// and the row-cleanup rules that apply to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSpec {
    pub id: ProfileId,
    pub table: String,
    #[serde(default)]
    pub artifact_prefix: String,
    #[serde(default)]
    pub drop_duplicate_rows: bool,
    pub fields: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<HeaderAlias>,
}

impl ProfileSpec {
    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == field)
    }

    /// Map a raw header onto the index of a retained canonical field.
    ///
    /// Aliases are consulted in declaration order, then the canonical names
    /// themselves. An alias pointing at a field outside `fields` resolves to
    /// `None`, same as an unknown header.
    pub fn resolve_header(&self, raw: &str) -> Option<usize> {
        let header = raw.trim();
        if let Some(alias) = self.aliases.iter().find(|a| a.header == header) {
            return self.field_index(&alias.field);
        }
        self.field_index(header)
    }

    pub fn artifact_file_name(&self, run_id: &str, format: ArtifactFormat) -> String {
        format!(
            "{}merged_data_{run_id}.{}",
            self.artifact_prefix,
            format.extension()
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("profile {0} is not registered")]
    MissingProfile(ProfileId),
    #[error("profile {0} is registered more than once")]
    DuplicateProfile(ProfileId),
    #[error("profile {profile}: `{name}` is not a valid column identifier")]
    InvalidIdentifier { profile: ProfileId, name: String },
    #[error("profile {profile}: field `{field}` is listed twice")]
    DuplicateField { profile: ProfileId, field: String },
    #[error("profile {0} has no fields")]
    NoFields(ProfileId),
    #[error("profile {profile}: artifact prefix `{prefix}` may only use letters, digits, `_` and `-`")]
    InvalidArtifactPrefix { profile: ProfileId, prefix: String },
}

/// Declarative profile → table → field list registry consumed by the loader,
/// the reconciler and the destination store alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRegistry {
    pub profiles: Vec<ProfileSpec>,
}

const TENDER_BID_FIELDS: &[&str] = &[
    "user_name",
    "bid_no",
    "name_of_work",
    "category",
    "ministry_and_department",
    "quantity",
    "emd",
    "exemption",
    "estimation_value",
    "state",
    "location",
    "apply_mode",
    "website_link",
    "document_link",
    "attachment_link",
    "end_date",
];

// Truncated variants come from scrapers that clip header cells.
const TENDER_BID_ALIASES: &[(&str, &str)] = &[
    ("user name", "user_name"),
    ("Bid No", "bid_no"),
    ("Name of Work", "name_of_work"),
    ("name of Wc", "name_of_work"),
    ("category", "category"),
    ("Ministry and Department", "ministry_and_department"),
    ("and Depa", "ministry_and_department"),
    ("Quantity", "quantity"),
    ("EMD", "emd"),
    ("Exemption", "exemption"),
    ("Estimation Value", "estimation_value"),
    ("mation Va", "estimation_value"),
    ("state", "state"),
    ("location", "location"),
    ("Apply Mode", "apply_mode"),
    ("Apply Mod", "apply_mode"),
    ("Website Link", "website_link"),
    ("ebsite Li", "website_link"),
    ("Document Link", "document_link"),
    ("Document link", "document_link"),
    ("cument li", "document_link"),
    ("Attachment Link", "attachment_link"),
    ("Attachment link", "attachment_link"),
    ("tachment l", "attachment_link"),
    ("End Date", "end_date"),
];

const EPROC_TENDER_FIELDS: &[&str] = &[
    "dept_unit",
    "tender_no",
    "tender_title",
    "status",
    "work_area",
    "due_datetime",
];

const EPROC_TENDER_ALIASES: &[(&str, &str)] = &[
    ("Deptt./Rly. Unit", "dept_unit"),
    ("Tender No", "tender_no"),
    ("Tender Title", "tender_title"),
    ("Status", "status"),
    ("Work Area", "work_area"),
    ("Due Date/Time", "due_datetime"),
];

fn build_profile(
    id: ProfileId,
    table: &str,
    artifact_prefix: &str,
    drop_duplicate_rows: bool,
    fields: &[&str],
    aliases: &[(&str, &str)],
) -> ProfileSpec {
    ProfileSpec {
        id,
        table: table.to_string(),
        artifact_prefix: artifact_prefix.to_string(),
        drop_duplicate_rows,
        fields: fields.iter().map(|f| f.to_string()).collect(),
        aliases: aliases
            .iter()
            .map(|(header, field)| HeaderAlias {
                header: header.to_string(),
                field: field.to_string(),
            })
            .collect(),
    }
}

impl SchemaRegistry {
    pub fn builtin() -> Self {
        Self {
            profiles: vec![
                build_profile(
                    ProfileId::TenderBid,
                    "gem_data",
                    "",
                    false,
                    TENDER_BID_FIELDS,
                    TENDER_BID_ALIASES,
                ),
                build_profile(
                    ProfileId::EprocTender,
                    "tender",
                    "ireps_",
                    true,
                    EPROC_TENDER_FIELDS,
                    EPROC_TENDER_ALIASES,
                ),
            ],
        }
    }

    pub fn get(&self, id: ProfileId) -> Result<&ProfileSpec, RegistryError> {
        self.profiles
            .iter()
            .find(|p| p.id == id)
            .ok_or(RegistryError::MissingProfile(id))
    }

    /// Check that every profile is present once, that table and field names
    /// are safe to splice into DDL, and that artifact prefixes stay inside a
    /// run directory.
    pub fn validate(&self) -> Result<(), RegistryError> {
        for id in ProfileId::ALL {
            match self.profiles.iter().filter(|p| p.id == id).count() {
                0 => return Err(RegistryError::MissingProfile(id)),
                1 => {}
                _ => return Err(RegistryError::DuplicateProfile(id)),
            }
        }

        for profile in &self.profiles {
            if profile.fields.is_empty() {
                return Err(RegistryError::NoFields(profile.id));
            }
            if !is_artifact_prefix(&profile.artifact_prefix) {
                return Err(RegistryError::InvalidArtifactPrefix {
                    profile: profile.id,
                    prefix: profile.artifact_prefix.clone(),
                });
            }
            let names = std::iter::once(&profile.table)
                .chain(profile.fields.iter())
                .chain(profile.aliases.iter().map(|a| &a.field));
            for name in names {
                if !is_sql_identifier(name) {
                    return Err(RegistryError::InvalidIdentifier {
                        profile: profile.id,
                        name: name.clone(),
                    });
                }
            }
            let mut seen = HashSet::new();
            for field in &profile.fields {
                if !seen.insert(field.as_str()) {
                    return Err(RegistryError::DuplicateField {
                        profile: profile.id,
                        field: field.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// `[a-z_][a-z0-9_]*`, the only column and table names the store will create.
pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Empty, or `[A-Za-z0-9_-]+`.
pub fn is_artifact_prefix(prefix: &str) -> bool {
    prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

//! Export profile, filters, options, and manifest shapes

use chrono::{DateTime, Utc};
use serde::Serialize;

/// The 16 output columns, in wire order
pub const EXPORT_COLUMNS: [&str; 16] = [
    "national_id",
    "counter",
    "first_name",
    "last_name",
    "gender",
    "mobile",
    "reg_center",
    "reg_status",
    "group_code",
    "student_type",
    "school_code",
    "mentor_id",
    "mentor_name",
    "mentor_mobile",
    "allocation_date",
    "year_code",
];

/// Counter infix expected per gender code
pub fn counter_infix(gender: u8) -> Option<&'static str> {
    match gender {
        0 => Some("373"),
        1 => Some("357"),
        _ => None,
    }
}

/// Versioned export profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportProfile {
    pub name: &'static str,
    pub version: &'static str,
    pub sensitive_columns: &'static [&'static str],
    pub excel_risky_columns: &'static [&'static str],
}

impl ExportProfile {
    pub fn full_name(&self) -> String {
        format!("{}_{}", self.name, self.version)
    }
}

/// The profile this service targets
pub const SABT_V1: ExportProfile = ExportProfile {
    name: "SABT",
    version: "V1",
    sensitive_columns: &["national_id", "counter", "mobile", "mentor_id", "school_code"],
    excel_risky_columns: &["first_name", "last_name", "mentor_name"],
};

/// Point-in-time marker the data source reads against
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSnapshot {
    pub marker: String,
    pub created_at: DateTime<Utc>,
}

/// Incremental export window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportDeltaWindow {
    pub created_at_watermark: DateTime<Utc>,
    pub id_watermark: i64,
}

/// Row selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportFilters {
    pub year: i32,
    pub center: Option<u8>,
    pub delta: Option<ExportDeltaWindow>,
}

impl ExportFilters {
    pub fn new(year: i32) -> Self {
        Self {
            year,
            center: None,
            delta: None,
        }
    }

    pub fn center_label(&self) -> String {
        match self.center {
            Some(center) => center.to_string(),
            None => "ALL".to_string(),
        }
    }
}

/// Output line terminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Newline {
    Crlf,
    Lf,
}

impl Newline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Newline::Crlf => "\r\n",
            Newline::Lf => "\n",
        }
    }

    pub fn is_crlf(&self) -> bool {
        matches!(self, Newline::Crlf)
    }
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Xlsx,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Xlsx => "xlsx",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }
}

/// Writer options
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub chunk_size: usize,
    pub include_bom: bool,
    pub newline: Newline,
    pub excel_mode: bool,
    pub output_format: OutputFormat,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            chunk_size: 50_000,
            include_bom: false,
            newline: Newline::Crlf,
            excel_mode: true,
            output_format: OutputFormat::Csv,
        }
    }
}

/// Raw row handed over by the data source
#[derive(Debug, Clone)]
pub struct StudentExportRow {
    pub id: i64,
    pub national_id: String,
    pub counter: String,
    pub first_name: String,
    pub last_name: String,
    pub gender: i64,
    pub mobile: String,
    pub reg_center: i64,
    pub reg_status: i64,
    pub group_code: i64,
    pub school_code: Option<i64>,
    pub mentor_id: Option<String>,
    pub mentor_name: Option<String>,
    pub mentor_mobile: Option<String>,
    pub allocation_date: DateTime<Utc>,
    pub year_code: String,
    pub created_at: DateTime<Utc>,
}

/// Fully normalized, validated output record; every field is text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRecord {
    pub national_id: String,
    pub counter: String,
    pub first_name: String,
    pub last_name: String,
    pub gender: String,
    pub mobile: String,
    pub reg_center: String,
    pub reg_status: String,
    pub group_code: String,
    pub student_type: String,
    pub school_code: String,
    pub mentor_id: String,
    pub mentor_name: String,
    pub mentor_mobile: String,
    pub allocation_date: String,
    pub year_code: String,
}

impl ExportRecord {
    /// Cell values in `EXPORT_COLUMNS` order
    pub fn values(&self) -> [&str; 16] {
        [
            &self.national_id,
            &self.counter,
            &self.first_name,
            &self.last_name,
            &self.gender,
            &self.mobile,
            &self.reg_center,
            &self.reg_status,
            &self.group_code,
            &self.student_type,
            &self.school_code,
            &self.mentor_id,
            &self.mentor_name,
            &self.mentor_mobile,
            &self.allocation_date,
            &self.year_code,
        ]
    }
}

/// Per-file manifest entry
#[derive(Debug, Clone, Serialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub sha256: String,
    pub row_count: u64,
    pub byte_size: u64,
    pub sheets: Vec<(String, u64)>,
}

/// Sidecar manifest describing one finished export
#[derive(Debug, Clone)]
pub struct ExportManifest {
    pub profile: ExportProfile,
    pub filters: ExportFilters,
    pub snapshot: ExportSnapshot,
    pub generated_at: DateTime<Utc>,
    pub total_rows: u64,
    pub files: Vec<ExportManifestFile>,
    pub timestamp: String,
    pub chunk_size: usize,
    pub format: OutputFormat,
    pub csv_bom: bool,
    pub crlf: bool,
    pub excel_safety: serde_json::Value,
}

/// Sort key names recorded in the manifest
pub const SORT_KEYS: [&str; 5] = [
    "year_code",
    "reg_center",
    "group_code",
    "school_code",
    "national_id",
];

impl ExportManifest {
    /// Manifest JSON body, compact and key-sorted for byte determinism
    pub fn to_json(&self) -> serde_json::Value {
        let mut filters = serde_json::json!({
            "year": self.filters.year,
            "center": self.filters.center,
        });
        if let Some(delta) = &self.filters.delta {
            filters["delta"] = serde_json::json!({
                "created_at_watermark": delta.created_at_watermark.to_rfc3339(),
                "id_watermark": delta.id_watermark,
            });
        }
        let mut payload = serde_json::json!({
            "profile": self.profile.full_name(),
            "filters": filters,
            "snapshot": {
                "marker": self.snapshot.marker,
                "created_at": self.snapshot.created_at.to_rfc3339(),
            },
            "generated_at": self.generated_at.to_rfc3339(),
            "total_rows": self.total_rows,
            "files": self.files,
            "metadata": {
                "timestamp": self.timestamp,
                "files_order": self.files.iter().map(|file| file.name.clone()).collect::<Vec<_>>(),
                "chunk_size": self.chunk_size,
                "sort_keys": SORT_KEYS,
                "config": {
                    "format": self.format.as_str(),
                    "csv_bom": self.csv_bom,
                    "crlf": self.crlf,
                },
            },
            "format": self.format.as_str(),
            "excel_safety": self.excel_safety,
        });
        if let Some(delta) = &self.filters.delta {
            payload["delta_window"] = serde_json::json!({
                "created_at_watermark": delta.created_at_watermark.to_rfc3339(),
                "id_watermark": delta.id_watermark,
            });
        }
        payload
    }
}

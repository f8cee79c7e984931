//! The export pipeline: query → normalize → sort → chunked write → manifest

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use sabt_clock::{Clock, Sleeper};
use sabt_metrics::ServiceMetrics;
use sabt_retry::{execute_with_retry, RetryPolicy};

use crate::csv_writer::{write_csv_chunk, WrittenFile};
use crate::error::{is_transient_error, ExportError, ExportResult};
use crate::fsio::{atomic_write, cleanup_partials};
use crate::models::{
    counter_infix, ExportFilters, ExportManifest, ExportManifestFile, ExportOptions, ExportProfile,
    ExportRecord, ExportSnapshot, OutputFormat, StudentExportRow,
};
use crate::xlsx_writer::write_xlsx_chunk;

/// Supplies rows for an export run; runs on the blocking worker
pub trait ExportDataSource: Send + Sync {
    fn fetch_rows(
        &self,
        filters: &ExportFilters,
        snapshot: &ExportSnapshot,
    ) -> ExportResult<Vec<StudentExportRow>>;
}

/// Roster of special schools per year
pub trait SpecialSchoolsRoster: Send + Sync {
    fn is_special(&self, year: i32, school_code: Option<i64>) -> bool;
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^09\d{9}$").expect("static regex"))
}

fn counter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{2}(357|373)\d{4}$").expect("static regex"))
}

const MANIFEST_NAME: &str = "export_manifest.json";

/// Deterministic exporter for the SABT_V1 profile
pub struct SabtExporter {
    data_source: Arc<dyn ExportDataSource>,
    roster: Arc<dyn SpecialSchoolsRoster>,
    output_dir: PathBuf,
    profile: ExportProfile,
    clock: Arc<dyn Clock>,
    sleeper: Box<dyn Sleeper>,
    retry_policy: RetryPolicy,
    metrics: Arc<ServiceMetrics>,
}

impl SabtExporter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data_source: Arc<dyn ExportDataSource>,
        roster: Arc<dyn SpecialSchoolsRoster>,
        output_dir: PathBuf,
        profile: ExportProfile,
        clock: Arc<dyn Clock>,
        sleeper: Box<dyn Sleeper>,
        retry_policy: RetryPolicy,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            data_source,
            roster,
            output_dir,
            profile,
            clock,
            sleeper,
            retry_policy,
            metrics,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn observe_phase(&self, phase: &str, started: f64) {
        self.metrics
            .exporter_duration_seconds
            .with_label_values(&[phase])
            .observe(self.clock.monotonic() - started);
    }

    fn with_retry<T>(
        &self,
        op: &str,
        correlation_id: &str,
        f: impl FnMut() -> ExportResult<T>,
    ) -> ExportResult<T> {
        execute_with_retry(
            f,
            &self.retry_policy,
            self.sleeper.as_ref(),
            is_transient_error,
            &self.metrics,
            correlation_id,
            op,
        )
        .map_err(|exhausted| {
            if is_transient_error(&exhausted.last_error) {
                ExportError::RetryExhausted {
                    op: exhausted.op,
                    last_error: exhausted.last_error.to_string(),
                }
            } else {
                exhausted.last_error
            }
        })
    }

    /// Run one export end to end, returning the manifest.
    ///
    /// Output is fully deterministic for identical inputs apart from
    /// `generated_at` and the filename timestamp.
    pub fn run(
        &self,
        filters: &ExportFilters,
        options: &ExportOptions,
        snapshot: &ExportSnapshot,
        clock_now: DateTime<Utc>,
        correlation_id: &str,
    ) -> ExportResult<ExportManifest> {
        if options.chunk_size == 0 {
            return Err(ExportError::validation("chunk_size"));
        }
        std::fs::create_dir_all(&self.output_dir)?;
        cleanup_partials(&self.output_dir)?;
        let manifest_path = self.output_dir.join(MANIFEST_NAME);
        if manifest_path.exists() {
            let _ = std::fs::remove_file(&manifest_path);
        }

        let query_started = self.clock.monotonic();
        let sorted_rows = self.with_retry("exporter.query", correlation_id, || {
            let rows = self.data_source.fetch_rows(filters, snapshot)?;
            if rows.is_empty() {
                return Err(ExportError::Empty);
            }
            let mut records = rows
                .iter()
                .map(|row| self.normalize_row(row, filters))
                .collect::<ExportResult<Vec<_>>>()?;
            sort_records(&mut records);
            Ok(records)
        });
        self.observe_phase("query", query_started);
        let sorted_rows = sorted_rows?;

        let timestamp = clock_now.format("%Y%m%d%H%M%S").to_string();

        let write_started = self.clock.monotonic();
        let files = self.with_retry("exporter.write", correlation_id, || {
            cleanup_partials(&self.output_dir)?;
            self.write_chunks(&sorted_rows, filters, options, &timestamp)
        });
        self.observe_phase("write", write_started);
        let files = files?;

        let total_rows: u64 = files.iter().map(|file| file.row_count).sum();
        let format = options.output_format;
        let bytes: u64 = files.iter().map(|file| file.byte_size).sum();
        self.metrics
            .exporter_bytes_total
            .with_label_values(&[format.as_str()])
            .inc_by(bytes);
        self.metrics
            .export_rows_total
            .with_label_values(&[format.as_str()])
            .inc_by(total_rows);

        let manifest = ExportManifest {
            profile: self.profile.clone(),
            filters: filters.clone(),
            snapshot: snapshot.clone(),
            generated_at: clock_now,
            total_rows,
            files: files
                .iter()
                .map(|file| ExportManifestFile {
                    name: file.name.clone(),
                    sha256: file.sha256.clone(),
                    row_count: file.row_count,
                    byte_size: file.byte_size,
                    sheets: file.sheets.clone(),
                })
                .collect(),
            timestamp: timestamp.clone(),
            chunk_size: options.chunk_size,
            format,
            csv_bom: format == OutputFormat::Csv && options.include_bom,
            crlf: options.newline.is_crlf(),
            excel_safety: serde_json::json!({
                "formula_guard": options.excel_mode,
                "always_guarded_columns": self.profile.excel_risky_columns,
                "sensitive_columns_as_text": self.profile.sensitive_columns,
            }),
        };

        let payload = serde_json::to_vec(&manifest.to_json())
            .map_err(|err| ExportError::Io(err.to_string()))?;
        let finalize_started = self.clock.monotonic();
        let finalize = self.with_retry("exporter.finalize", correlation_id, || {
            atomic_write(&manifest_path, &payload)
        });
        self.observe_phase("finalize", finalize_started);
        finalize?;

        Ok(manifest)
    }

    fn write_chunks(
        &self,
        records: &[ExportRecord],
        filters: &ExportFilters,
        options: &ExportOptions,
        timestamp: &str,
    ) -> ExportResult<Vec<WrittenFile>> {
        let mut files = Vec::new();
        for (index, chunk) in records.chunks(options.chunk_size).enumerate() {
            let seq = index + 1;
            let name = self.build_filename(filters, timestamp, seq, options.output_format);
            let path = self.output_dir.join(&name);
            let written = match options.output_format {
                OutputFormat::Csv => write_csv_chunk(&path, chunk, &self.profile, options)?,
                OutputFormat::Xlsx => {
                    let sheet_name = format!("Sheet_{seq:03}");
                    write_xlsx_chunk(&path, chunk, &sheet_name, &self.profile, options)?
                }
            };
            files.push(written);
        }
        Ok(files)
    }

    fn build_filename(
        &self,
        filters: &ExportFilters,
        timestamp: &str,
        seq: usize,
        format: OutputFormat,
    ) -> String {
        format!(
            "export_{}_{}-{}_{}_{:03}.{}",
            self.profile.full_name(),
            filters.year,
            filters.center_label(),
            timestamp,
            seq,
            format.extension()
        )
    }

    fn normalize_row(
        &self,
        row: &StudentExportRow,
        filters: &ExportFilters,
    ) -> ExportResult<ExportRecord> {
        if !matches!(row.reg_center, 0..=2) {
            return Err(ExportError::validation("reg_center"));
        }
        if !matches!(row.reg_status, 0 | 1 | 3) {
            return Err(ExportError::validation("reg_status"));
        }
        if !matches!(row.gender, 0 | 1) {
            return Err(ExportError::validation("gender"));
        }
        let gender = row.gender as u8;

        let mobile = sabt_text::sanitize_phone(Some(&row.mobile));
        if !phone_re().is_match(&mobile) {
            return Err(ExportError::validation("mobile"));
        }

        let counter = sabt_text::normalize_cell(Some(&row.counter));
        if !counter_re().is_match(&counter) {
            return Err(ExportError::validation("counter"));
        }
        let expected_infix = counter_infix(gender).ok_or_else(|| ExportError::validation("gender"))?;
        if &counter[2..5] != expected_infix {
            return Err(ExportError::validation("counter_prefix"));
        }

        let school_code = match row.school_code {
            Some(code) => format!("{code:06}"),
            None => String::new(),
        };
        let student_type = u8::from(self.roster.is_special(filters.year, row.school_code));

        Ok(ExportRecord {
            national_id: sabt_text::normalize_cell(Some(&row.national_id)),
            counter,
            first_name: sabt_text::normalize_cell(Some(&row.first_name)),
            last_name: sabt_text::normalize_cell(Some(&row.last_name)),
            gender: gender.to_string(),
            mobile,
            reg_center: row.reg_center.to_string(),
            reg_status: row.reg_status.to_string(),
            group_code: row.group_code.to_string(),
            student_type: student_type.to_string(),
            school_code,
            mentor_id: sabt_text::normalize_cell(row.mentor_id.as_deref()),
            mentor_name: sabt_text::normalize_cell(row.mentor_name.as_deref()),
            mentor_mobile: sabt_text::sanitize_phone(row.mentor_mobile.as_deref()),
            allocation_date: row
                .allocation_date
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            year_code: sabt_text::normalize_cell(Some(&row.year_code)),
        })
    }
}

fn int_key(value: &str, default: i64) -> i64 {
    value.parse::<i64>().unwrap_or(default)
}

/// Stable lexicographic sort over the profile's sort keys
pub fn sort_records(records: &mut [ExportRecord]) {
    records.sort_by(|a, b| {
        a.year_code
            .cmp(&b.year_code)
            .then_with(|| int_key(&a.reg_center, 0).cmp(&int_key(&b.reg_center, 0)))
            .then_with(|| int_key(&a.group_code, 0).cmp(&int_key(&b.group_code, 0)))
            .then_with(|| int_key(&a.school_code, 999_999).cmp(&int_key(&b.school_code, 999_999)))
            .then_with(|| a.national_id.cmp(&b.national_id))
    });
}

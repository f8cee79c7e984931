// End-to-end exporter pipeline tests: determinism, chunking, Excel safety,
// atomic manifests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use sabt_clock::{FrozenClock, TickSleeper};
use sabt_export::{
    ExportDataSource, ExportError, ExportFilters, ExportOptions, ExportResult, ExportSnapshot,
    Newline, OutputFormat, SabtExporter, SpecialSchoolsRoster, StudentExportRow, SABT_V1,
};
use sabt_metrics::ServiceMetrics;
use sabt_retry::RetryPolicy;
use tempfile::TempDir;

struct FixedRows {
    rows: Vec<StudentExportRow>,
}

impl ExportDataSource for FixedRows {
    fn fetch_rows(
        &self,
        _filters: &ExportFilters,
        _snapshot: &ExportSnapshot,
    ) -> ExportResult<Vec<StudentExportRow>> {
        Ok(self.rows.clone())
    }
}

struct FlakySource {
    rows: Vec<StudentExportRow>,
    failures: AtomicUsize,
}

impl ExportDataSource for FlakySource {
    fn fetch_rows(
        &self,
        _filters: &ExportFilters,
        _snapshot: &ExportSnapshot,
    ) -> ExportResult<Vec<StudentExportRow>> {
        if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            (n > 0).then(|| n - 1)
        }).is_ok()
        {
            return Err(ExportError::Io("connection reset".into()));
        }
        Ok(self.rows.clone())
    }
}

struct Roster {
    special: HashSet<i64>,
}

impl SpecialSchoolsRoster for Roster {
    fn is_special(&self, _year: i32, school_code: Option<i64>) -> bool {
        school_code
            .map(|code| self.special.contains(&code))
            .unwrap_or(false)
    }
}

fn row(national_id: &str, counter: &str, gender: i64) -> StudentExportRow {
    StudentExportRow {
        id: 1,
        national_id: national_id.to_string(),
        counter: counter.to_string(),
        first_name: "نام".to_string(),
        last_name: "خانوادگی".to_string(),
        gender,
        mobile: "09123456789".to_string(),
        reg_center: 1,
        reg_status: 3,
        group_code: 12,
        school_code: Some(654_321),
        mentor_id: Some("150".to_string()),
        mentor_name: Some("مربی".to_string()),
        mentor_mobile: Some("09120000000".to_string()),
        allocation_date: Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap(),
        year_code: "1403".to_string(),
        created_at: Utc.with_ymd_and_hms(2024, 3, 19, 8, 0, 0).unwrap(),
    }
}

fn exporter_with(
    source: Arc<dyn ExportDataSource>,
    dir: &TempDir,
    namespace: &str,
) -> SabtExporter {
    let clock = Arc::new(FrozenClock::at(
        Utc.with_ymd_and_hms(2024, 3, 20, 12, 30, 0).unwrap(),
    ));
    let sleeper = TickSleeper::new(Arc::clone(&clock));
    SabtExporter::new(
        source,
        Arc::new(Roster {
            special: HashSet::from([654_321]),
        }),
        dir.path().to_path_buf(),
        SABT_V1,
        clock,
        Box::new(sleeper),
        RetryPolicy::default(),
        Arc::new(ServiceMetrics::new(namespace).unwrap()),
    )
}

fn snapshot() -> ExportSnapshot {
    ExportSnapshot {
        marker: "snapshot-test".to_string(),
        created_at: Utc.with_ymd_and_hms(2024, 3, 20, 12, 29, 0).unwrap(),
    }
}

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 20, 12, 30, 0).unwrap()
}

#[test]
fn persian_input_row_is_folded_and_guarded() {
    let dir = TempDir::new().unwrap();
    let mut sample = row("۰۰۱۲۳۴۵۶۷۸", "993730001", 0);
    sample.mobile = "۰۹۱۲۳۴۵۶۷۸۹".to_string();
    sample.first_name = "=SUM(A1:A2)".to_string();
    let exporter = exporter_with(
        Arc::new(FixedRows { rows: vec![sample] }),
        &dir,
        "exp_guard",
    );
    let manifest = exporter
        .run(
            &ExportFilters::new(1403),
            &ExportOptions::default(),
            &snapshot(),
            now(),
            "corr-guard",
        )
        .unwrap();

    assert_eq!(manifest.total_rows, 1);
    let file = dir.path().join(&manifest.files[0].name);
    let content = std::fs::read_to_string(&file).unwrap();
    let data_line = content.lines().nth(1).unwrap();
    assert!(data_line.starts_with("\"0012345678\""));
    assert!(data_line.contains("'=SUM(A1:A2)"));
    assert!(data_line.contains("\"09123456789\""));
    // Roster lookup derives student_type 1 for the listed school.
    assert!(data_line.contains(",1,\"654321\","));
}

#[test]
fn double_run_produces_identical_file_bytes() {
    let rows = vec![
        row("0000000002", "993730002", 0),
        row("0000000001", "993730001", 0),
    ];
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let options = ExportOptions::default();

    let run = |dir: &TempDir, ns: &str| {
        let exporter = exporter_with(Arc::new(FixedRows { rows: rows.clone() }), dir, ns);
        exporter
            .run(&ExportFilters::new(1403), &options, &snapshot(), now(), "corr-det")
            .unwrap()
    };
    let first = run(&dir_a, "exp_det_a");
    let second = run(&dir_b, "exp_det_b");

    assert_eq!(first.files[0].sha256, second.files[0].sha256);
    assert_eq!(first.files[0].byte_size, second.files[0].byte_size);
    let bytes_a = std::fs::read(dir_a.path().join(&first.files[0].name)).unwrap();
    let bytes_b = std::fs::read(dir_b.path().join(&second.files[0].name)).unwrap();
    assert_eq!(bytes_a, bytes_b);
}

#[test]
fn rows_are_sorted_by_profile_keys() {
    let mut early = row("0000000009", "993730009", 0);
    early.reg_center = 0;
    let late = row("0000000001", "993730001", 0);
    let dir = TempDir::new().unwrap();
    let exporter = exporter_with(
        Arc::new(FixedRows {
            rows: vec![late.clone(), early.clone()],
        }),
        &dir,
        "exp_sort",
    );
    let manifest = exporter
        .run(
            &ExportFilters::new(1403),
            &ExportOptions::default(),
            &snapshot(),
            now(),
            "corr-sort",
        )
        .unwrap();
    let content = std::fs::read_to_string(dir.path().join(&manifest.files[0].name)).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    // reg_center 0 sorts before reg_center 1.
    assert!(lines[1].contains("0000000009"));
    assert!(lines[2].contains("0000000001"));
}

#[test]
fn chunking_at_exact_multiple_has_no_empty_tail_file() {
    let rows: Vec<StudentExportRow> = (0..4)
        .map(|i| row(&format!("000000000{i}"), &format!("99373000{i}"), 0))
        .collect();
    let dir = TempDir::new().unwrap();
    let exporter = exporter_with(Arc::new(FixedRows { rows }), &dir, "exp_chunk");
    let options = ExportOptions {
        chunk_size: 2,
        ..ExportOptions::default()
    };
    let manifest = exporter
        .run(&ExportFilters::new(1403), &options, &snapshot(), now(), "corr-chunk")
        .unwrap();
    assert_eq!(manifest.files.len(), 2);
    assert_eq!(manifest.files[0].row_count, 2);
    assert_eq!(manifest.files[1].row_count, 2);
    assert!(manifest.files[0].name.ends_with("_001.csv"));
    assert!(manifest.files[1].name.ends_with("_002.csv"));
}

#[test]
fn empty_result_set_is_terminal() {
    let dir = TempDir::new().unwrap();
    let exporter = exporter_with(Arc::new(FixedRows { rows: vec![] }), &dir, "exp_empty");
    let err = exporter
        .run(
            &ExportFilters::new(1403),
            &ExportOptions::default(),
            &snapshot(),
            now(),
            "corr-empty",
        )
        .unwrap_err();
    assert!(matches!(err, ExportError::Empty));
}

#[test]
fn wrong_counter_prefix_for_gender_fails_validation() {
    let dir = TempDir::new().unwrap();
    // Gender 1 requires the 357 infix.
    let exporter = exporter_with(
        Arc::new(FixedRows {
            rows: vec![row("0000000001", "993730001", 1)],
        }),
        &dir,
        "exp_counter",
    );
    let err = exporter
        .run(
            &ExportFilters::new(1403),
            &ExportOptions::default(),
            &snapshot(),
            now(),
            "corr-counter",
        )
        .unwrap_err();
    assert_eq!(err.code(), "EXPORT_VALIDATION_ERROR:counter_prefix");
}

#[test]
fn transient_query_failures_are_retried() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(FlakySource {
        rows: vec![row("0000000001", "993730001", 0)],
        failures: AtomicUsize::new(2),
    });
    let exporter = exporter_with(source, &dir, "exp_retry");
    let manifest = exporter
        .run(
            &ExportFilters::new(1403),
            &ExportOptions::default(),
            &snapshot(),
            now(),
            "corr-retry",
        )
        .unwrap();
    assert_eq!(manifest.total_rows, 1);
}

#[test]
fn manifest_lists_files_in_disk_order_with_digests() {
    let rows: Vec<StudentExportRow> = (0..3)
        .map(|i| row(&format!("000000000{i}"), &format!("99373000{i}"), 0))
        .collect();
    let dir = TempDir::new().unwrap();
    let exporter = exporter_with(Arc::new(FixedRows { rows }), &dir, "exp_manifest");
    let options = ExportOptions {
        chunk_size: 2,
        include_bom: true,
        ..ExportOptions::default()
    };
    let manifest = exporter
        .run(&ExportFilters::new(1403), &options, &snapshot(), now(), "corr-manifest")
        .unwrap();

    let raw = std::fs::read_to_string(dir.path().join("export_manifest.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed["profile"], "SABT_V1");
    assert_eq!(parsed["total_rows"], 3);
    assert_eq!(parsed["metadata"]["config"]["csv_bom"], true);
    assert_eq!(parsed["metadata"]["config"]["crlf"], true);
    let names: Vec<String> = parsed["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|file| file["name"].as_str().unwrap().to_string())
        .collect();
    let expected: Vec<String> = manifest.files.iter().map(|f| f.name.clone()).collect();
    assert_eq!(names, expected);
    for file in parsed["files"].as_array().unwrap() {
        assert_eq!(file["sha256"].as_str().unwrap().len(), 64);
    }
    // No partials survive a successful run.
    assert!(!dir
        .path()
        .read_dir()
        .unwrap()
        .any(|entry| entry.unwrap().path().to_string_lossy().ends_with(".part")));
}

#[test]
fn xlsx_export_writes_one_sheet_per_chunk() {
    let rows: Vec<StudentExportRow> = (0..3)
        .map(|i| row(&format!("000000000{i}"), &format!("99373000{i}"), 0))
        .collect();
    let dir = TempDir::new().unwrap();
    let exporter = exporter_with(Arc::new(FixedRows { rows }), &dir, "exp_xlsx");
    let options = ExportOptions {
        chunk_size: 2,
        output_format: OutputFormat::Xlsx,
        ..ExportOptions::default()
    };
    let manifest = exporter
        .run(&ExportFilters::new(1403), &options, &snapshot(), now(), "corr-xlsx")
        .unwrap();

    assert_eq!(manifest.files.len(), 2);
    assert_eq!(manifest.files[0].sheets, vec![("Sheet_001".to_string(), 2)]);
    assert_eq!(manifest.files[1].sheets, vec![("Sheet_002".to_string(), 1)]);

    let book =
        umya_spreadsheet::reader::xlsx::read(dir.path().join(&manifest.files[0].name)).unwrap();
    let sheet = book.get_sheet_by_name("Sheet_001").unwrap();
    // Leading zeros survive because cells are stored as text.
    assert_eq!(sheet.get_value((1_u32, 2_u32)), "0000000000");
}

#[test]
fn delta_window_round_trips_through_the_manifest() {
    let dir = TempDir::new().unwrap();
    let exporter = exporter_with(
        Arc::new(FixedRows {
            rows: vec![row("0000000001", "993730001", 0)],
        }),
        &dir,
        "exp_delta",
    );
    let mut filters = ExportFilters::new(1403);
    filters.delta = Some(sabt_export::ExportDeltaWindow {
        created_at_watermark: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        id_watermark: 9_000,
    });
    exporter
        .run(&filters, &ExportOptions::default(), &snapshot(), now(), "corr-delta")
        .unwrap();

    let raw = std::fs::read_to_string(dir.path().join("export_manifest.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed["delta_window"]["id_watermark"], 9_000);
    assert_eq!(parsed["filters"]["delta"]["id_watermark"], 9_000);
    assert!(parsed["delta_window"]["created_at_watermark"]
        .as_str()
        .unwrap()
        .starts_with("2024-03-01"));
}

#[test]
fn thousand_row_batch_chunks_and_counts_consistently() {
    let rows: Vec<StudentExportRow> = (0..1_000)
        .map(|i| {
            let mut sample = row(&format!("{i:010}"), &format!("99373{:04}", i % 10_000), 0);
            sample.group_code = (i % 7) as i64;
            sample
        })
        .collect();
    let dir = TempDir::new().unwrap();
    let exporter = exporter_with(Arc::new(FixedRows { rows }), &dir, "exp_big");
    let options = ExportOptions {
        chunk_size: 300,
        ..ExportOptions::default()
    };
    let manifest = exporter
        .run(&ExportFilters::new(1403), &options, &snapshot(), now(), "corr-big")
        .unwrap();

    assert_eq!(manifest.total_rows, 1_000);
    assert_eq!(manifest.files.len(), 4);
    let per_file: Vec<u64> = manifest.files.iter().map(|file| file.row_count).collect();
    assert_eq!(per_file, vec![300, 300, 300, 100]);

    // Every published file matches its manifest byte size.
    for file in &manifest.files {
        let bytes = std::fs::read(dir.path().join(&file.name)).unwrap();
        assert_eq!(bytes.len() as u64, file.byte_size);
    }
}

#[test]
fn lf_option_produces_lf_only_output() {
    let dir = TempDir::new().unwrap();
    let exporter = exporter_with(
        Arc::new(FixedRows {
            rows: vec![row("0000000001", "993730001", 0)],
        }),
        &dir,
        "exp_lf",
    );
    let options = ExportOptions {
        newline: Newline::Lf,
        ..ExportOptions::default()
    };
    let manifest = exporter
        .run(&ExportFilters::new(1403), &options, &snapshot(), now(), "corr-lf")
        .unwrap();
    let bytes = std::fs::read(dir.path().join(&manifest.files[0].name)).unwrap();
    assert!(!bytes.contains(&b'\r'));
}

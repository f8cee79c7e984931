//! XLSX chunk writer backed by umya-spreadsheet
//!
//! Every cell is stored as a string so Excel cannot coerce national ids or
//! counters into numbers. One sheet per chunk file, named after the chunk
//! sequence.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::csv_writer::{column_masks, WrittenFile};
use crate::error::{ExportError, ExportResult};
use crate::fsio::{part_path, publish_part};
use crate::models::{ExportOptions, ExportProfile, ExportRecord, EXPORT_COLUMNS};

/// Write one XLSX chunk atomically
pub fn write_xlsx_chunk(
    path: &Path,
    records: &[ExportRecord],
    sheet_name: &str,
    profile: &ExportProfile,
    options: &ExportOptions,
) -> ExportResult<WrittenFile> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut book = umya_spreadsheet::new_file_empty_worksheet();
    let sheet = book
        .new_sheet(sheet_name)
        .map_err(|err| ExportError::Io(format!("xlsx sheet create failed: {err}")))?;

    let (_quote_mask, guard_mask) = column_masks(profile, options.excel_mode);

    for (col, header) in EXPORT_COLUMNS.iter().enumerate() {
        sheet
            .get_cell_mut(((col + 1) as u32, 1_u32))
            .set_value_string(*header);
    }
    for (row_index, record) in records.iter().enumerate() {
        let values = record.values();
        for (col, (value, guard)) in values.iter().zip(&guard_mask).enumerate() {
            let cell_value = if *guard {
                sabt_text::guard_formula((*value).to_string(), Some(value))
            } else {
                (*value).to_string()
            };
            sheet
                .get_cell_mut(((col + 1) as u32, (row_index + 2) as u32))
                .set_value_string(cell_value);
        }
    }

    let temp = part_path(path);
    umya_spreadsheet::writer::xlsx::write(&book, &temp)
        .map_err(|err| ExportError::Io(format!("xlsx write failed: {err}")))?;

    let bytes = std::fs::read(&temp)?;
    publish_part(&temp, path)?;

    Ok(WrittenFile {
        name: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: path.to_path_buf(),
        sha256: hex::encode(Sha256::digest(&bytes)),
        row_count: records.len() as u64,
        byte_size: bytes.len() as u64,
        sheets: vec![(sheet_name.to_string(), records.len() as u64)],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExportOptions, SABT_V1};
    use tempfile::TempDir;

    fn record(counter: &str) -> ExportRecord {
        ExportRecord {
            national_id: "0012345678".into(),
            counter: counter.into(),
            first_name: "=cmd".into(),
            last_name: "x".into(),
            gender: "0".into(),
            mobile: "09123456789".into(),
            reg_center: "1".into(),
            reg_status: "3".into(),
            group_code: "12".into(),
            student_type: "1".into(),
            school_code: "654321".into(),
            mentor_id: "150".into(),
            mentor_name: "m".into(),
            mentor_mobile: "09120000000".into(),
            allocation_date: "2024-03-20T12:00:00Z".into(),
            year_code: "1403".into(),
        }
    }

    #[test]
    fn writes_sheet_with_string_cells() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.xlsx");
        let written = write_xlsx_chunk(
            &path,
            &[record("993730001")],
            "Sheet_001",
            &SABT_V1,
            &ExportOptions::default(),
        )
        .unwrap();
        assert!(path.exists());
        assert!(!part_path(&path).exists());
        assert_eq!(written.sheets, vec![("Sheet_001".to_string(), 1)]);

        let book = umya_spreadsheet::reader::xlsx::read(&path).unwrap();
        let sheet = book.get_sheet_by_name("Sheet_001").unwrap();
        assert_eq!(sheet.get_value((1_u32, 2_u32)), "0012345678");
        // Leading-zero national id survives as text.
        assert_eq!(sheet.get_value((1_u32, 1_u32)), "national_id");
        assert_eq!(sheet.get_value((3_u32, 2_u32)), "'=cmd");
    }

    #[test]
    fn digest_matches_published_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.xlsx");
        let written = write_xlsx_chunk(
            &path,
            &[record("993730001")],
            "Sheet_001",
            &SABT_V1,
            &ExportOptions::default(),
        )
        .unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(written.sha256, hex::encode(Sha256::digest(&bytes)));
        assert_eq!(written.byte_size, bytes.len() as u64);
    }
}

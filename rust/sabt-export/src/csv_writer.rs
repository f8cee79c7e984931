//! Excel-safe CSV chunk writer
//!
//! Sensitive columns are always quoted; other cells only when content
//! demands it. The `csv` ecosystem crate cannot express a per-column quote
//! mask, so rows are serialized directly.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::ExportResult;
use crate::fsio::atomic_write;
use crate::models::{ExportOptions, ExportProfile, ExportRecord, EXPORT_COLUMNS};

/// One published output file
#[derive(Debug, Clone)]
pub struct WrittenFile {
    pub name: String,
    pub path: PathBuf,
    pub sha256: String,
    pub row_count: u64,
    pub byte_size: u64,
    pub sheets: Vec<(String, u64)>,
}

const BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

fn serialize_row(values: &[&str], quote_mask: &[bool], newline: &str) -> String {
    let mut rendered = Vec::with_capacity(values.len());
    for (value, force_quote) in values.iter().zip(quote_mask) {
        let needs_quote = *force_quote
            || value.contains(',')
            || value.contains('"')
            || value.contains('\r')
            || value.contains('\n');
        let escaped = value.replace('"', "\"\"");
        if needs_quote {
            rendered.push(format!("\"{escaped}\""));
        } else {
            rendered.push(escaped);
        }
    }
    format!("{}{newline}", rendered.join(","))
}

/// Per-column masks derived from the profile
pub fn column_masks(profile: &ExportProfile, excel_mode: bool) -> (Vec<bool>, Vec<bool>) {
    let quote_mask: Vec<bool> = EXPORT_COLUMNS
        .iter()
        .map(|column| profile.sensitive_columns.contains(column))
        .collect();
    let guard_mask: Vec<bool> = EXPORT_COLUMNS
        .iter()
        .map(|column| excel_mode || profile.excel_risky_columns.contains(column))
        .collect();
    (quote_mask, guard_mask)
}

fn guarded_values(record: &ExportRecord, guard_mask: &[bool]) -> Vec<String> {
    record
        .values()
        .iter()
        .zip(guard_mask)
        .map(|(value, guard)| {
            if *guard {
                sabt_text::guard_formula((*value).to_string(), Some(value))
            } else {
                (*value).to_string()
            }
        })
        .collect()
}

/// Write one CSV chunk atomically and return its digest and sizes
pub fn write_csv_chunk(
    path: &Path,
    records: &[ExportRecord],
    profile: &ExportProfile,
    options: &ExportOptions,
) -> ExportResult<WrittenFile> {
    let newline = options.newline.as_str();
    let (quote_mask, guard_mask) = column_masks(profile, options.excel_mode);

    let mut buffer: Vec<u8> = Vec::new();
    if options.include_bom {
        buffer.extend_from_slice(BOM);
    }
    let header_mask = vec![true; EXPORT_COLUMNS.len()];
    buffer.extend_from_slice(serialize_row(&EXPORT_COLUMNS, &header_mask, newline).as_bytes());
    for record in records {
        let cells = guarded_values(record, &guard_mask);
        let refs: Vec<&str> = cells.iter().map(String::as_str).collect();
        buffer.extend_from_slice(serialize_row(&refs, &quote_mask, newline).as_bytes());
    }

    atomic_write(path, &buffer)?;

    let digest = hex::encode(Sha256::digest(&buffer));
    Ok(WrittenFile {
        name: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: path.to_path_buf(),
        sha256: digest,
        row_count: records.len() as u64,
        byte_size: buffer.len() as u64,
        sheets: Vec::new(),
    })
}

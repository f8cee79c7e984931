// sabt-export: Excel-safe spreadsheet exports for the Sabt registration
// system
//
// One pipeline, two output formats. Files become visible only through
// `.part → fsync → rename`, and every run ends with a manifest listing
// hashes, sizes, and row counts in on-disk order.

pub mod csv_writer;
pub mod error;
pub mod exporter;
pub mod fsio;
pub mod models;
pub mod xlsx_writer;

pub use csv_writer::{write_csv_chunk, WrittenFile};
pub use error::{is_transient_error, ExportError, ExportResult};
pub use exporter::{sort_records, ExportDataSource, SabtExporter, SpecialSchoolsRoster};
pub use models::{
    counter_infix, ExportDeltaWindow, ExportFilters, ExportManifest, ExportManifestFile,
    ExportOptions, ExportProfile, ExportRecord, ExportSnapshot, Newline, OutputFormat,
    StudentExportRow, EXPORT_COLUMNS, SABT_V1, SORT_KEYS,
};
pub use xlsx_writer::write_xlsx_chunk;

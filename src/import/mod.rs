//! Bulk import of task files.

pub mod importer;
pub mod reader;

pub use importer::{ImportReport, Importer};
pub use reader::{Compression, RecordStream, open_records, records_from_reader, records_from_values};

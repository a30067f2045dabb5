//! Schema inference from sample CSV input.
//!
//! Inference is a one-off pass at startup. Its result is an ordinary
//! [`Schema`] used thereafter exactly like a hand-written one.

use super::column::ColumnDefinition;
use super::definition::Schema;
use crate::error::Result;
use crate::types::DataType;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Options for CSV schema inference.
#[derive(Clone, Debug)]
pub struct InferOptions {
    /// Maximum number of data rows sampled; `None` reads everything.
    pub max_rows: Option<usize>,
    /// Field delimiter.
    pub delimiter: u8,
    /// Columns to mark as primary key.
    pub primary_key: Vec<String>,
}

impl Default for InferOptions {
    fn default() -> Self {
        Self {
            max_rows: Some(1000),
            delimiter: b',',
            primary_key: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct ColumnSniffer {
    int: bool,
    float: bool,
    boolean: bool,
    seen_value: bool,
    seen_empty: bool,
}

impl ColumnSniffer {
    fn new() -> Self {
        Self {
            int: true,
            float: true,
            boolean: true,
            seen_value: false,
            seen_empty: false,
        }
    }

    fn observe(&mut self, cell: &str) {
        let cell = cell.trim();
        if cell.is_empty() {
            self.seen_empty = true;
            return;
        }
        self.seen_value = true;
        self.int &= cell.parse::<i64>().is_ok();
        self.float &= cell.parse::<f64>().is_ok();
        self.boolean &= cell.eq_ignore_ascii_case("true") || cell.eq_ignore_ascii_case("false");
    }

    fn data_type(&self) -> DataType {
        if !self.seen_value {
            DataType::String
        } else if self.int {
            DataType::Int
        } else if self.float {
            DataType::Float
        } else if self.boolean {
            DataType::Boolean
        } else {
            DataType::String
        }
    }
}

/// Infers a schema from a CSV reader with a header line.
pub fn schema_from_csv_reader<R: Read>(
    name: &str,
    reader: R,
    options: &InferOptions,
) -> Result<Schema> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(options.delimiter)
        .flexible(true)
        .from_reader(reader);
    let headers: Vec<String> = csv.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let mut sniffers = vec![ColumnSniffer::new(); headers.len()];

    let mut sampled = 0usize;
    for record in csv.records() {
        if options.max_rows.is_some_and(|max| sampled >= max) {
            break;
        }
        let record = record?;
        for (i, sniffer) in sniffers.iter_mut().enumerate() {
            sniffer.observe(record.get(i).unwrap_or(""));
        }
        sampled += 1;
    }
    debug!(table = name, rows = sampled, columns = headers.len(), "inferred csv schema");

    let columns = headers
        .into_iter()
        .zip(sniffers)
        .map(|(header, sniffer)| {
            let primary_key = options.primary_key.iter().any(|pk| *pk == header);
            ColumnDefinition::new(header, sniffer.data_type())
                .nullable(sniffer.seen_empty || !sniffer.seen_value)
                .primary_key(primary_key)
        })
        .collect();
    Schema::new(name, columns)
}

/// Infers a schema from a CSV file.
pub fn schema_from_csv_path(
    name: &str,
    path: impl AsRef<Path>,
    options: &InferOptions,
) -> Result<Schema> {
    let file = std::fs::File::open(path)?;
    schema_from_csv_reader(name, file, options)
}

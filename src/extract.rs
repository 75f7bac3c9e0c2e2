use std::collections::BTreeSet;
use std::io::{Cursor, Read};

use flate2::read::GzDecoder;
use ndarray::Array2;
use regex::Regex;
use tracing::info;
use zip::ZipArchive;

use crate::error::OmicError;

/// A parsed archive member: labelled numeric matrix with
/// `row_labels.len() == values.nrows()` and `col_labels.len() == values.ncols()`.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub row_labels: Vec<String>,
    pub col_labels: Vec<String>,
    pub values: Array2<f32>,
}

impl RawTable {
    /// Transpose the table. Hosted count matrices store features as rows
    /// and cells as columns; the container wants cells on the row axis.
    pub fn transposed(self) -> RawTable {
        let values = self.values.reversed_axes().as_standard_layout().into_owned();
        RawTable {
            row_labels: self.col_labels,
            col_labels: self.row_labels,
            values,
        }
    }
}

/// Parse every member of a decrypted zip archive into a [`RawTable`].
///
/// Members ending in `.gz` are gunzipped first. Field separator is `,`,
/// the first row carries column labels, the first column row labels, and
/// every remaining cell must parse as floating point.
pub fn extract_tables(
    archive_name: &str,
    plaintext: &[u8],
) -> Result<Vec<(String, RawTable)>, OmicError> {
    let mut archive =
        ZipArchive::new(Cursor::new(plaintext)).map_err(|err| OmicError::Parse {
            member: archive_name.to_string(),
            reason: format!("not a zip archive: {err}"),
        })?;

    let mut tables = Vec::new();
    for index in 0..archive.len() {
        let mut member = archive.by_index(index).map_err(|err| OmicError::Parse {
            member: archive_name.to_string(),
            reason: err.to_string(),
        })?;
        if member.is_dir() {
            continue;
        }
        let member_name = member.name().to_string();
        let mut bytes = Vec::new();
        member
            .read_to_end(&mut bytes)
            .map_err(|err| OmicError::Parse {
                member: member_name.clone(),
                reason: err.to_string(),
            })?;

        let text = if member_name.ends_with(".gz") {
            let mut decoder = GzDecoder::new(bytes.as_slice());
            let mut out = String::new();
            decoder
                .read_to_string(&mut out)
                .map_err(|err| OmicError::Parse {
                    member: member_name.clone(),
                    reason: format!("gzip: {err}"),
                })?;
            out
        } else {
            String::from_utf8(bytes).map_err(|err| OmicError::Parse {
                member: member_name.clone(),
                reason: format!("not utf-8: {err}"),
            })?
        };

        let table = parse_member(&member_name, &text)?;
        tables.push((member_name, table));
    }
    Ok(tables)
}

fn parse_member(member: &str, text: &str) -> Result<RawTable, OmicError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(text.as_bytes());

    let mut col_labels: Vec<String> = Vec::new();
    let mut row_labels: Vec<String> = Vec::new();
    let mut data: Vec<f32> = Vec::new();

    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|err| OmicError::Parse {
            member: member.to_string(),
            reason: err.to_string(),
        })?;
        if record.is_empty() {
            continue;
        }
        if line == 0 {
            col_labels = record.iter().skip(1).map(str::to_string).collect();
            continue;
        }
        let mut fields = record.iter();
        let label = fields.next().unwrap_or_default();
        row_labels.push(label.trim().to_string());
        for (column, field) in fields.enumerate() {
            let value: f32 = field.trim().parse().map_err(|_| OmicError::Parse {
                member: member.to_string(),
                reason: format!("non-numeric cell at row {line}, column {}", column + 1),
            })?;
            data.push(value);
        }
    }

    if col_labels.is_empty() || row_labels.is_empty() {
        return Err(OmicError::Parse {
            member: member.to_string(),
            reason: "table has no data rows".to_string(),
        });
    }
    let shape = (row_labels.len(), col_labels.len());
    let values = Array2::from_shape_vec(shape, data).map_err(|_| OmicError::Parse {
        member: member.to_string(),
        reason: "ragged rows".to_string(),
    })?;
    Ok(RawTable {
        row_labels,
        col_labels,
        values,
    })
}

/// Pre-alignment guard: all tables describing one cell population must
/// agree on the sample count before any row is zipped to another table's.
pub fn check_sample_counts<'a>(
    tables: impl IntoIterator<Item = &'a RawTable>,
) -> Result<usize, OmicError> {
    let counts: BTreeSet<usize> = tables.into_iter().map(|t| t.row_labels.len()).collect();
    match counts.len() {
        1 => Ok(counts.into_iter().next().unwrap()),
        _ => Err(OmicError::InconsistentSampleCount {
            counts: counts.into_iter().collect(),
        }),
    }
}

/// Keep only columns whose label carries the species marker, stripping the
/// marker from survivors. Returns the number of dropped columns.
pub fn filter_marked_columns(table: RawTable, marker: &Regex) -> (RawTable, usize) {
    let keep: Vec<usize> = table
        .col_labels
        .iter()
        .enumerate()
        .filter(|(_, label)| marker.is_match(label))
        .map(|(index, _)| index)
        .collect();
    let dropped = table.col_labels.len() - keep.len();
    if dropped > 0 {
        info!(dropped, "removing columns without species marker");
    }
    let col_labels = keep
        .iter()
        .map(|&index| marker.replace(&table.col_labels[index], "").into_owned())
        .collect();
    let values = table.values.select(ndarray::Axis(1), &keep);
    (
        RawTable {
            row_labels: table.row_labels,
            col_labels,
            values,
        },
        dropped,
    )
}

/// Drop feature columns that are zero across every sample. Returns the
/// number of dropped columns.
pub fn drop_allzero_columns(table: RawTable) -> (RawTable, usize) {
    let keep: Vec<usize> = (0..table.values.ncols())
        .filter(|&column| table.values.column(column).iter().any(|&v| v != 0.0))
        .collect();
    let dropped = table.values.ncols() - keep.len();
    if dropped > 0 {
        info!(dropped, "removing all-zero feature columns");
    }
    let col_labels = keep
        .iter()
        .map(|&index| table.col_labels[index].clone())
        .collect();
    let values = table.values.select(ndarray::Axis(1), &keep);
    (
        RawTable {
            row_labels: table.row_labels,
            col_labels,
            values,
        },
        dropped,
    )
}

/// Post-parse guard: two tables over the same population must list the
/// same cells in the same order.
pub fn check_cell_alignment(
    left_name: &str,
    left: &RawTable,
    right_name: &str,
    right: &RawTable,
) -> Result<(), OmicError> {
    check_sample_counts([left, right])?;
    for (position, (a, b)) in left.row_labels.iter().zip(&right.row_labels).enumerate() {
        if a != b {
            return Err(OmicError::SampleAlignment {
                left: left_name.to_string(),
                right: right_name.to_string(),
                position,
                left_id: a.clone(),
                right_id: b.clone(),
            });
        }
    }
    Ok(())
}

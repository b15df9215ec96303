//! # Input Tables and Sample Alignment
//!
//! Expression and confounder tables are read with the polars CSV reader into a
//! column-major [`NumericTable`] keyed by sample id. Missing cells (empty, `NA`,
//! `NaN`) and infinities become `NaN`; text columns other than the id column
//! are skipped with a warning. Tables are never mutated after loading.
//!
//! [`SampleAlignment`] intersects the two tables' sample ids and gathers
//! aligned vectors and matrices, in expression-table order.

use ahash::{AHashMap, AHashSet};
use flate2::read::GzDecoder;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use polars::prelude::*;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use thiserror::Error;

/// Cell values read as missing, in addition to empty fields.
const MISSING_MARKERS: [&str; 4] = ["NA", "NaN", "nan", "N/A"];

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("No sample-id column was found in '{path}'. Expected one of: {candidates}.")]
    MissingSampleIdColumn { path: String, candidates: String },

    #[error("Sample id '{0}' appears more than once. Sample ids must be unique.")]
    DuplicateSampleId(String),

    #[error("Row {0} has an empty sample id.")]
    EmptySampleId(usize),

    #[error("The column '{0}' was not found.")]
    ColumnNotFound(String),

    #[error("The column '{0}' appears more than once.")]
    DuplicateColumn(String),

    #[error("Column '{column}' has {found} values but the table has {expected} samples.")]
    ColumnLength {
        column: String,
        found: usize,
        expected: usize,
    },
}

/// Numeric columns indexed by sample id.
#[derive(Debug, Clone)]
pub struct NumericTable {
    sample_ids: Vec<String>,
    row_index: AHashMap<String, usize>,
    columns: AHashMap<String, Array1<f64>>,
    column_order: Vec<String>,
}

/// Sample id → gene column → expression level.
pub type ExpressionTable = NumericTable;
/// Sample id → confounder column → score.
pub type ConfounderTable = NumericTable;

impl NumericTable {
    pub fn from_columns(
        sample_ids: Vec<String>,
        columns: Vec<(String, Vec<f64>)>,
    ) -> Result<Self, DataError> {
        let mut row_index = AHashMap::with_capacity(sample_ids.len());
        for (row, id) in sample_ids.iter().enumerate() {
            if id.is_empty() {
                return Err(DataError::EmptySampleId(row + 1));
            }
            if row_index.insert(id.clone(), row).is_some() {
                return Err(DataError::DuplicateSampleId(id.clone()));
            }
        }

        let mut table = AHashMap::with_capacity(columns.len());
        let mut column_order = Vec::with_capacity(columns.len());
        for (name, values) in columns {
            if values.len() != sample_ids.len() {
                return Err(DataError::ColumnLength {
                    column: name,
                    found: values.len(),
                    expected: sample_ids.len(),
                });
            }
            let values = Array1::from_iter(
                values
                    .into_iter()
                    .map(|v| if v.is_finite() { v } else { f64::NAN }),
            );
            if table.insert(name.clone(), values).is_some() {
                return Err(DataError::DuplicateColumn(name));
            }
            column_order.push(name);
        }

        Ok(Self {
            sample_ids,
            row_index,
            columns: table,
            column_order,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn row_of(&self, sample_id: &str) -> Option<usize> {
        self.row_index.get(sample_id).copied()
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_order
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.columns.get(name).map(|c| c.view())
    }
}

/// Reads a CSV or TSV file (optionally gzip-compressed) into a [`NumericTable`].
///
/// The separator follows the extension: `.csv` is comma separated, everything
/// else is tab separated. The id column is the first of `id_columns` present in
/// the header. When `wanted` is given only those columns are converted.
pub fn load_table(
    path: &Path,
    id_columns: &[String],
    wanted: Option<&[String]>,
) -> Result<NumericTable, DataError> {
    let display = path.display().to_string();
    let compressed = display.ends_with(".gz");
    let stem = display.trim_end_matches(".gz");
    let separator = if stem.ends_with(".csv") { b',' } else { b'\t' };

    let options = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(None)
        .with_parse_options(
            CsvParseOptions::default()
                .with_separator(separator)
                .with_null_values(Some(NullValues::AllColumns(
                    MISSING_MARKERS.iter().map(|m| (*m).into()).collect(),
                ))),
        );

    let df = if compressed {
        let mut bytes = Vec::new();
        GzDecoder::new(File::open(path)?).read_to_end(&mut bytes)?;
        CsvReader::new(Cursor::new(bytes)).with_options(options).finish()?
    } else {
        CsvReader::new(File::open(path)?).with_options(options).finish()?
    };

    let header: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();
    let id_column = id_columns
        .iter()
        .find(|candidate| header.contains(*candidate))
        .ok_or_else(|| DataError::MissingSampleIdColumn {
            path: display.clone(),
            candidates: id_columns.join(", "),
        })?;

    let sample_ids = read_sample_ids(&df, id_column)?;

    let keep: Option<AHashSet<&str>> =
        wanted.map(|names| names.iter().map(String::as_str).collect());
    let mut columns = Vec::new();
    let mut skipped_text = Vec::new();
    for name in header.iter().filter(|name| *name != id_column) {
        if keep.as_ref().is_some_and(|set| !set.contains(name.as_str())) {
            continue;
        }
        let column = df.column(name)?;
        if column.dtype() == &DataType::String {
            skipped_text.push(name.clone());
            continue;
        }
        let casted = column.cast(&DataType::Float64)?;
        let values: Vec<f64> = casted
            .f64()?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        columns.push((name.clone(), values));
    }

    if !skipped_text.is_empty() {
        log::warn!(
            "Ignoring {} non-numeric column(s) in '{display}': {}",
            skipped_text.len(),
            skipped_text.join(", ")
        );
    }
    log::info!(
        "Loaded '{display}': {} samples, {} numeric columns",
        sample_ids.len(),
        columns.len()
    );

    NumericTable::from_columns(sample_ids, columns)
}

fn read_sample_ids(df: &DataFrame, id_column: &str) -> Result<Vec<String>, DataError> {
    let ids = df.column(id_column)?.cast(&DataType::String)?;
    let ids = ids.as_materialized_series().str()?;
    ids.into_iter()
        .enumerate()
        .map(|(row, id)| match id.map(str::trim) {
            Some(text) if !text.is_empty() => Ok(text.to_string()),
            _ => Err(DataError::EmptySampleId(row + 1)),
        })
        .collect()
}

/// Rows shared by an expression table and a confounder table.
#[derive(Debug, Clone)]
pub struct SampleAlignment {
    sample_ids: Vec<String>,
    expression_rows: Vec<usize>,
    confounder_rows: Vec<usize>,
}

impl SampleAlignment {
    pub fn new(expression: &ExpressionTable, confounders: &ConfounderTable) -> Self {
        let mut sample_ids = Vec::new();
        let mut expression_rows = Vec::new();
        let mut confounder_rows = Vec::new();
        for (row, id) in expression.sample_ids().iter().enumerate() {
            if let Some(other) = confounders.row_of(id) {
                sample_ids.push(id.clone());
                expression_rows.push(row);
                confounder_rows.push(other);
            }
        }

        if sample_ids.is_empty() {
            log::warn!(
                "The expression table ({} samples) and the confounder table ({} samples) share no sample ids",
                expression.n_samples(),
                confounders.n_samples()
            );
        } else {
            log::info!(
                "Aligned {} samples ({} expression, {} confounder)",
                sample_ids.len(),
                expression.n_samples(),
                confounders.n_samples()
            );
        }

        Self {
            sample_ids,
            expression_rows,
            confounder_rows,
        }
    }

    pub fn len(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_ids.is_empty()
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    /// The named expression column over the aligned samples.
    pub fn expression_column(&self, table: &ExpressionTable, name: &str) -> Option<Array1<f64>> {
        table
            .column(name)
            .map(|column| column.select(Axis(0), &self.expression_rows))
    }

    /// An aligned `samples × confounders` matrix, columns in `names` order.
    pub fn confounder_matrix(
        &self,
        table: &ConfounderTable,
        names: &[String],
    ) -> Result<Array2<f64>, DataError> {
        let mut matrix = Array2::from_elem((self.len(), names.len()), f64::NAN);
        for (j, name) in names.iter().enumerate() {
            let column = table
                .column(name)
                .ok_or_else(|| DataError::ColumnNotFound(name.clone()))?;
            for (i, &row) in self.confounder_rows.iter().enumerate() {
                matrix[[i, j]] = column[row];
            }
        }
        Ok(matrix)
    }
}

/// A confounder matrix after degenerate columns were removed and the rest
/// optionally standardized.
#[derive(Debug, Clone)]
pub struct PreparedConfounders {
    pub matrix: Array2<f64>,
    pub names: Vec<String>,
    /// Removed columns with the reason.
    pub dropped: Vec<(String, String)>,
}

/// Drops all-missing and constant columns (when `drop_degenerate`) and
/// z-scores the remainder over their observed values (when `standardize`).
/// Missing cells stay `NaN`.
pub fn prepare_confounders(
    matrix: &Array2<f64>,
    names: &[String],
    drop_degenerate: bool,
    standardize: bool,
) -> PreparedConfounders {
    let mut kept_columns = Vec::with_capacity(names.len());
    let mut kept_names = Vec::with_capacity(names.len());
    let mut dropped = Vec::new();

    for (j, name) in names.iter().enumerate() {
        let column = matrix.column(j);
        let observed: Vec<f64> = column.iter().copied().filter(|v| v.is_finite()).collect();
        let (mean, sd) = mean_and_sd(&observed);

        let reason = if observed.is_empty() {
            Some("all values missing")
        } else if !(sd > 0.0) {
            Some("zero variance")
        } else {
            None
        };

        if let Some(reason) = reason {
            if drop_degenerate {
                log::warn!("Dropping confounder '{name}': {reason}");
                dropped.push((name.clone(), reason.to_string()));
                continue;
            }
            kept_columns.push(column.to_owned());
        } else if standardize {
            kept_columns.push(column.mapv(|v| (v - mean) / sd));
        } else {
            kept_columns.push(column.to_owned());
        }
        kept_names.push(name.clone());
    }

    let mut prepared = Array2::from_elem((matrix.nrows(), kept_columns.len()), f64::NAN);
    for (j, column) in kept_columns.iter().enumerate() {
        prepared.column_mut(j).assign(column);
    }

    PreparedConfounders {
        matrix: prepared,
        names: kept_names,
        dropped,
    }
}

/// Mean and sample standard deviation (n - 1 denominator).
fn mean_and_sd(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, 0.0);
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    (mean, variance.sqrt())
}

//!
//! Readers for the delimited tables gepsim consumes.
//!
//! Every reader accepts plain or gzip'd files. Files ending in `.tsv`/`.txt` (optionally
//! followed by `.gz`) are tab separated, everything else is read as CSV. The first column
//! of a table is its row identifier.
//!
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use fxhash::{FxHashMap, FxHashSet};
use ndarray::{Array2, Axis};

use crate::errors::{DataError, Result};
use crate::models::{
    CellPool, CellRecord, ExpressionScale, ExpressionTable, FractionTable, FractionVector,
};
use crate::utils::{delimiter_for, get_dynamic_reader};

pub const CELL_ID_COLUMN: &str = "cell_id";
pub const CELL_TYPE_COLUMN: &str = "cell_type";
pub const PATIENT_COLUMNS: &[&str] = &["sample_id", "patient_id"];

type TableReader = csv::Reader<BufReader<Box<dyn Read>>>;

fn open_table(path: &Path) -> Result<TableReader> {
    let reader = get_dynamic_reader(path)?;
    Ok(csv::ReaderBuilder::new()
        .delimiter(delimiter_for(path))
        .has_headers(true)
        .from_reader(reader))
}

fn parse_value(path: &Path, line: usize, field: &str) -> Result<f64> {
    field.trim().parse::<f64>().map_err(|e| DataError::ParseError {
        path: path.display().to_string(),
        line,
        message: format!("'{}': {}", field, e),
    })
}

fn missing_column(path: &Path, column: &str) -> DataError {
    DataError::ParseError {
        path: path.display().to_string(),
        line: 1,
        message: format!("missing required column '{}'", column),
    }
}

///
/// Read a sample-by-gene (or cell-by-gene) numeric table.
///
/// # Arguments
///
/// - path: path to the table; the header holds the column names after the id column
///
pub fn read_expression_table(path: &Path) -> Result<ExpressionTable> {
    let mut rdr = open_table(path)?;
    let columns: Vec<String> = rdr.headers()?.iter().skip(1).map(String::from).collect();

    let mut ids = Vec::new();
    let mut values = Vec::new();
    for (i, record) in rdr.records().enumerate() {
        let record = record?;
        ids.push(record.get(0).unwrap_or_default().to_string());
        for field in record.iter().skip(1) {
            values.push(parse_value(path, i + 2, field)?);
        }
    }

    if ids.is_empty() {
        return Err(DataError::EmptyTable(path.display().to_string()));
    }

    let values = Array2::from_shape_vec((ids.len(), columns.len()), values)
        .map_err(|e| DataError::ShapeMismatch(format!("{}: {}", path.display(), e)))?;

    ExpressionTable::new(ids, columns, values)
}

///
/// Read per-cell metadata. Requires `cell_id`, `cell_type` and a patient column
/// (`sample_id` or `patient_id`); any further column is kept as a grouping column.
///
pub fn read_cell_metadata(path: &Path) -> Result<Vec<CellRecord>> {
    let mut rdr = open_table(path)?;
    let headers = rdr.headers()?.clone();
    let find = |name: &str| headers.iter().position(|h| h == name);

    let id_col = find(CELL_ID_COLUMN).ok_or_else(|| missing_column(path, CELL_ID_COLUMN))?;
    let type_col = find(CELL_TYPE_COLUMN).ok_or_else(|| missing_column(path, CELL_TYPE_COLUMN))?;
    let patient_col = PATIENT_COLUMNS
        .iter()
        .find_map(|c| find(*c))
        .ok_or_else(|| missing_column(path, PATIENT_COLUMNS[0]))?;

    let mut cells = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or_default();

        let mut cell = CellRecord::new(
            field(id_col).to_string(),
            field(type_col).to_string(),
            field(patient_col).to_string(),
        );
        for (i, name) in headers.iter().enumerate() {
            if i != id_col && i != type_col && i != patient_col {
                cell = cell.with_group(name, field(i));
            }
        }
        cells.push(cell);
    }

    if cells.is_empty() {
        return Err(DataError::EmptyTable(path.display().to_string()));
    }

    Ok(cells)
}

///
/// Build a [`CellPool`] from a cell-by-gene expression table and the matching metadata.
/// Cells missing from the metadata are left out of the pool.
///
/// # Arguments
///
/// - expression_path: cell-by-gene table
/// - metadata_path: per-cell metadata, see [`read_cell_metadata`]
/// - scale: scale the expression table is stored in
///
pub fn read_cell_pool(
    expression_path: &Path,
    metadata_path: &Path,
    scale: ExpressionScale,
) -> Result<CellPool> {
    let table = read_expression_table(expression_path)?.into_linear(scale);
    let mut metadata: FxHashMap<String, CellRecord> = read_cell_metadata(metadata_path)?
        .into_iter()
        .map(|c| (c.cell_id.clone(), c))
        .collect();

    let mut rows = Vec::new();
    let mut cells = Vec::new();
    for (i, cell_id) in table.sample_ids.iter().enumerate() {
        if let Some(cell) = metadata.remove(cell_id) {
            rows.push(i);
            cells.push(cell);
        }
    }

    if cells.is_empty() {
        return Err(DataError::EmptyTable(format!(
            "no cell of {} is described in {}",
            expression_path.display(),
            metadata_path.display()
        )));
    }

    let expression = table.values.select(Axis(0), &rows);
    CellPool::new(cells, table.genes, expression)
}

///
/// Read a two-column identifier mapping, e.g. reference sample id to cancer type.
///
pub fn read_id_mapping(path: &Path) -> Result<FxHashMap<String, String>> {
    let mut rdr = open_table(path)?;
    let mut mapping = FxHashMap::default();
    for (i, record) in rdr.records().enumerate() {
        let record = record?;
        match (record.get(0), record.get(1)) {
            (Some(key), Some(value)) => {
                mapping.insert(key.to_string(), value.to_string());
            }
            _ => {
                return Err(DataError::ParseError {
                    path: path.display().to_string(),
                    line: i + 2,
                    message: "expected two columns".to_string(),
                });
            }
        }
    }
    Ok(mapping)
}

///
/// Read marker genes per cell type from a `cell_type,gene` table.
///
pub fn read_marker_genes(path: &Path) -> Result<BTreeMap<String, Vec<String>>> {
    let mut markers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (cell_type, gene) in read_id_pairs(path)? {
        markers.entry(cell_type).or_default().push(gene);
    }
    if markers.is_empty() {
        return Err(DataError::EmptyTable(path.display().to_string()));
    }
    Ok(markers)
}

fn read_id_pairs(path: &Path) -> Result<Vec<(String, String)>> {
    let mut rdr = open_table(path)?;
    let mut pairs = Vec::new();
    for record in rdr.records() {
        let record = record?;
        if let (Some(a), Some(b)) = (record.get(0), record.get(1)) {
            pairs.push((a.to_string(), b.to_string()));
        }
    }
    Ok(pairs)
}

///
/// Read a gene list, one gene per line. Blank lines and repeats are skipped.
///
pub fn read_gene_list(path: &Path) -> Result<Vec<String>> {
    let reader = get_dynamic_reader(path)?;
    let mut seen = FxHashSet::default();
    let mut genes = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let gene = line.trim();
        if !gene.is_empty() && seen.insert(gene.to_string()) {
            genes.push(gene.to_string());
        }
    }
    Ok(genes)
}

///
/// Read a fraction table (`sample_id,<cell types...>`).
///
pub fn read_fraction_table(path: &Path) -> Result<FractionTable> {
    let table = read_expression_table(path)?;
    let mut fractions = FractionTable::new(table.genes.clone());
    for (i, sample_id) in table.sample_ids.iter().enumerate() {
        fractions.push(FractionVector::new(
            sample_id.clone(),
            table.row(i).to_vec(),
        ))?;
    }
    Ok(fractions)
}

use std::collections::BTreeMap;

use fxhash::{FxHashMap, FxHashSet};
use ndarray::{Array2, ArrayView1, Axis};

use crate::errors::{DataError, Result};

/// Column of the cell metadata naming the dataset a cell was collected in.
pub const DATASET_COLUMN: &str = "dataset_id";

#[derive(Debug, Clone, PartialEq)]
pub struct CellRecord {
    pub cell_id: String,
    pub cell_type: String,
    /// Patient (or source sample) the cell was collected from.
    pub patient_id: String,
    /// Auxiliary grouping columns, e.g. `dataset_id` or a cluster label.
    pub groups: FxHashMap<String, String>,
}

impl CellRecord {
    pub fn new(cell_id: String, cell_type: String, patient_id: String) -> Self {
        Self {
            cell_id,
            cell_type,
            patient_id,
            groups: FxHashMap::default(),
        }
    }

    pub fn with_group(mut self, column: &str, value: &str) -> Self {
        self.groups.insert(column.to_string(), value.to_string());
        self
    }

    pub fn group(&self, column: &str) -> Option<&str> {
        self.groups.get(column).map(String::as_str)
    }
}

///
/// The single cells a generation job draws from.
///
/// Expression is held in linear space, one row per cell, one column per gene. Every cell
/// shares the same gene universe. The pool is read-only once built: the restriction
/// methods consume it and return a new pool.
///
#[derive(Debug, Clone)]
pub struct CellPool {
    cells: Vec<CellRecord>,
    genes: Vec<String>,
    expression: Array2<f64>,
    index: FxHashMap<String, usize>,
    by_type: BTreeMap<String, Vec<usize>>,
}

impl CellPool {
    pub fn new(cells: Vec<CellRecord>, genes: Vec<String>, expression: Array2<f64>) -> Result<Self> {
        if expression.nrows() != cells.len() || expression.ncols() != genes.len() {
            return Err(DataError::ShapeMismatch(format!(
                "expression matrix is {}x{}, expected {} cells x {} genes",
                expression.nrows(),
                expression.ncols(),
                cells.len(),
                genes.len()
            )));
        }

        let mut index = FxHashMap::default();
        let mut by_type: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, cell) in cells.iter().enumerate() {
            if index.insert(cell.cell_id.clone(), i).is_some() {
                return Err(DataError::DuplicateId(cell.cell_id.clone()));
            }
            by_type.entry(cell.cell_type.clone()).or_default().push(i);
        }

        Ok(Self {
            cells,
            genes,
            expression,
            index,
            by_type,
        })
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn cells(&self) -> &[CellRecord] {
        &self.cells
    }

    pub fn cell(&self, position: usize) -> &CellRecord {
        &self.cells[position]
    }

    /// Cell types present in the pool, sorted.
    pub fn cell_types(&self) -> Vec<&str> {
        self.by_type.keys().map(String::as_str).collect()
    }

    /// Positions of all cells of one type; empty when the type is absent.
    pub fn cells_of_type(&self, cell_type: &str) -> &[usize] {
        self.by_type
            .get(cell_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn position(&self, cell_id: &str) -> Option<usize> {
        self.index.get(cell_id).copied()
    }

    pub fn expression_row(&self, position: usize) -> ArrayView1<'_, f64> {
        self.expression.row(position)
    }

    pub fn expression_of(&self, cell_id: &str) -> Result<ArrayView1<'_, f64>> {
        let position = self
            .position(cell_id)
            .ok_or_else(|| DataError::UnknownId(cell_id.to_string()))?;
        Ok(self.expression_row(position))
    }

    ///
    /// Keep only the cells for which `keep` returns true.
    ///
    pub fn filter_cells<F>(self, keep: F) -> Result<Self>
    where
        F: Fn(&CellRecord, ArrayView1<f64>) -> bool,
    {
        let kept: Vec<usize> = (0..self.cells.len())
            .filter(|i| keep(&self.cells[*i], self.expression.row(*i)))
            .collect();

        if kept.len() == self.cells.len() {
            return Ok(self);
        }

        let expression = self.expression.select(Axis(0), &kept);
        let cells = kept.iter().map(|i| self.cells[*i].clone()).collect();
        CellPool::new(cells, self.genes, expression)
    }

    ///
    /// Drop cells whose share of genes expressed below 1 (linear scale) is above `threshold`.
    ///
    pub fn drop_sparse_cells(self, threshold: f64) -> Result<Self> {
        let n_genes = self.genes.len().max(1) as f64;
        self.filter_cells(|_, row| {
            let low = row.iter().filter(|v| **v < 1.0).count() as f64;
            low / n_genes <= threshold
        })
    }

    /// Keep only cells whose `column` group value is in `values`.
    pub fn restrict_to_groups(self, column: &str, values: &[String]) -> Result<Self> {
        let wanted: FxHashSet<&str> = values.iter().map(String::as_str).collect();
        self.filter_cells(|cell, _| cell.group(column).is_some_and(|v| wanted.contains(v)))
    }

    pub fn restrict_to_cell_types(self, cell_types: &[String]) -> Result<Self> {
        let wanted: FxHashSet<&str> = cell_types.iter().map(String::as_str).collect();
        self.filter_cells(|cell, _| wanted.contains(cell.cell_type.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::array;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[fixture]
    fn pool() -> CellPool {
        let cells = vec![
            CellRecord::new("c1".into(), "B".into(), "p1".into()).with_group(DATASET_COLUMN, "d1"),
            CellRecord::new("c2".into(), "T".into(), "p1".into()).with_group(DATASET_COLUMN, "d2"),
            CellRecord::new("c3".into(), "B".into(), "p2".into()).with_group(DATASET_COLUMN, "d1"),
        ];
        let genes = vec!["g1".to_string(), "g2".to_string(), "g3".to_string()];
        let expression = array![[5.0, 0.0, 0.0], [2.0, 3.0, 4.0], [1.0, 1.0, 0.5]];
        CellPool::new(cells, genes, expression).unwrap()
    }

    #[rstest]
    fn test_cells_grouped_by_type(pool: CellPool) {
        assert_eq!(pool.cell_types(), vec!["B", "T"]);
        assert_eq!(pool.cells_of_type("B"), &[0, 2]);
        assert!(pool.cells_of_type("NK").is_empty());
    }

    #[rstest]
    fn test_duplicate_ids_rejected() {
        let cells = vec![
            CellRecord::new("c1".into(), "B".into(), "p1".into()),
            CellRecord::new("c1".into(), "B".into(), "p1".into()),
        ];
        let result = CellPool::new(cells, vec!["g1".into()], array![[1.0], [2.0]]);
        assert!(matches!(result, Err(DataError::DuplicateId(id)) if id == "c1"));
    }

    #[rstest]
    fn test_shape_checked() {
        let cells = vec![CellRecord::new("c1".into(), "B".into(), "p1".into())];
        let result = CellPool::new(cells, vec!["g1".into()], array![[1.0, 2.0]]);
        assert!(matches!(result, Err(DataError::ShapeMismatch(_))));
    }

    #[rstest]
    fn test_drop_sparse_cells(pool: CellPool) {
        // c1 has 2 of 3 genes below 1
        let pool = pool.drop_sparse_cells(0.5).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.position("c1"), None);
        assert_eq!(pool.cells_of_type("B"), &[1]);
        assert_eq!(pool.expression_of("c3").unwrap().to_vec(), vec![1.0, 1.0, 0.5]);
    }

    #[rstest]
    fn test_restrict_to_groups(pool: CellPool) {
        let pool = pool
            .restrict_to_groups(DATASET_COLUMN, &["d1".to_string()])
            .unwrap();
        assert_eq!(pool.cell_types(), vec!["B"]);
        assert_eq!(pool.len(), 2);
    }
}

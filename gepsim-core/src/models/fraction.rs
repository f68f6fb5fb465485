use serde::{Deserialize, Serialize};

use crate::errors::{DataError, Result};

///
/// Cell-type proportions of one synthetic sample.
///
/// `fractions` is positional: entry `i` belongs to the `i`-th cell type of the
/// [`FractionTable`] holding the vector.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FractionVector {
    pub sample_id: String,
    pub fractions: Vec<f64>,
}

impl FractionVector {
    pub fn new(sample_id: String, fractions: Vec<f64>) -> Self {
        Self {
            sample_id,
            fractions,
        }
    }

    pub fn total(&self) -> f64 {
        self.fractions.iter().sum()
    }

    /// Indices of the cell types with a non-zero fraction.
    pub fn active(&self) -> Vec<usize> {
        self.fractions
            .iter()
            .enumerate()
            .filter(|(_, f)| **f > 0.0)
            .map(|(i, _)| i)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FractionTable {
    pub cell_types: Vec<String>,
    pub rows: Vec<FractionVector>,
}

impl FractionTable {
    pub fn new(cell_types: Vec<String>) -> Self {
        Self {
            cell_types,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(cell_types: Vec<String>, rows: Vec<FractionVector>) -> Result<Self> {
        let mut table = Self::new(cell_types);
        for row in rows {
            table.push(row)?;
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push(&mut self, row: FractionVector) -> Result<()> {
        if row.fractions.len() != self.cell_types.len() {
            return Err(DataError::ShapeMismatch(format!(
                "sample {} has {} fractions, expected one per cell type ({})",
                row.sample_id,
                row.fractions.len(),
                self.cell_types.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn extend(&mut self, other: FractionTable) -> Result<()> {
        if other.cell_types != self.cell_types {
            return Err(DataError::ShapeMismatch(format!(
                "cell types differ: {:?} vs {:?}",
                self.cell_types, other.cell_types
            )));
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    pub fn cell_type_index(&self, cell_type: &str) -> Option<usize> {
        self.cell_types.iter().position(|c| c == cell_type)
    }

    pub fn sample_ids(&self) -> Vec<&str> {
        self.rows.iter().map(|r| r.sample_id.as_str()).collect()
    }

    /// Keep only the rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            cell_types: self.cell_types.clone(),
            rows: indices.iter().map(|i| self.rows[*i].clone()).collect(),
        }
    }

    pub fn truncate(&mut self, len: usize) {
        self.rows.truncate(len);
    }
}

use fxhash::{FxHashMap, FxHashSet};
use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::errors::{DataError, Result};
use crate::utils::{exp2_m1, normalize_to_tpm};

/// Scale an expression table is stored in on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpressionScale {
    /// `log2(x + 1)` of the linear value
    #[default]
    #[serde(rename = "log2_p1")]
    Log2P1,
    #[serde(rename = "linear")]
    Linear,
}

///
/// A sample-by-gene table of expression values.
///
/// Used for the reference cohort and for reading back persisted synthetic profiles.
///
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionTable {
    pub sample_ids: Vec<String>,
    pub genes: Vec<String>,
    pub values: Array2<f64>,
}

impl ExpressionTable {
    pub fn new(sample_ids: Vec<String>, genes: Vec<String>, values: Array2<f64>) -> Result<Self> {
        if values.nrows() != sample_ids.len() || values.ncols() != genes.len() {
            return Err(DataError::ShapeMismatch(format!(
                "values are {}x{}, expected {} samples x {} genes",
                values.nrows(),
                values.ncols(),
                sample_ids.len(),
                genes.len()
            )));
        }

        for ids in [&sample_ids, &genes] {
            let mut seen = FxHashSet::default();
            if let Some(dup) = ids.iter().find(|id| !seen.insert(id.as_str())) {
                return Err(DataError::DuplicateId(dup.clone()));
            }
        }

        Ok(Self {
            sample_ids,
            genes,
            values,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn n_genes(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_ids.is_empty()
    }

    pub fn row(&self, i: usize) -> ArrayView1<'_, f64> {
        self.values.row(i)
    }

    pub fn position(&self, sample_id: &str) -> Option<usize> {
        self.sample_ids.iter().position(|s| s == sample_id)
    }

    /// Convert the values to linear space.
    pub fn into_linear(mut self, scale: ExpressionScale) -> Self {
        if scale == ExpressionScale::Log2P1 {
            self.values.mapv_inplace(exp2_m1);
        }
        self
    }

    pub fn normalize_rows_to_tpm(&mut self) {
        for row in self.values.axis_iter_mut(Axis(0)) {
            normalize_to_tpm(row);
        }
    }

    ///
    /// Re-index the columns onto `genes`. Genes absent from this table are filled with 0,
    /// genes absent from `genes` are dropped.
    ///
    pub fn align_to_genes(&self, genes: &[String]) -> Self {
        let lookup = self.gene_lookup();
        let mut values = Array2::<f64>::zeros((self.n_samples(), genes.len()));
        for (j, gene) in genes.iter().enumerate() {
            if let Some(k) = lookup.get(gene.as_str()) {
                values.column_mut(j).assign(&self.values.column(*k));
            }
        }

        Self {
            sample_ids: self.sample_ids.clone(),
            genes: genes.to_vec(),
            values,
        }
    }

    ///
    /// Keep only the requested genes that this table has, in the requested order.
    ///
    pub fn select_genes(&self, genes: &[String]) -> Result<Self> {
        let lookup = self.gene_lookup();
        let (kept, columns): (Vec<String>, Vec<usize>) = genes
            .iter()
            .filter_map(|g| lookup.get(g.as_str()).map(|k| (g.clone(), *k)))
            .unzip();

        if kept.is_empty() {
            return Err(DataError::EmptyTable(
                "none of the requested genes are present".to_string(),
            ));
        }

        Ok(Self {
            sample_ids: self.sample_ids.clone(),
            genes: kept,
            values: self.values.select(Axis(1), &columns),
        })
    }

    pub fn select_samples(&self, indices: &[usize]) -> Self {
        Self {
            sample_ids: indices.iter().map(|i| self.sample_ids[*i].clone()).collect(),
            genes: self.genes.clone(),
            values: self.values.select(Axis(0), indices),
        }
    }

    fn gene_lookup(&self) -> FxHashMap<&str, usize> {
        self.genes
            .iter()
            .enumerate()
            .map(|(i, g)| (g.as_str(), i))
            .collect()
    }
}

use gepsim_core::ReferenceCohort;
use gepsim_core::utils::quantile_sorted;
use ndarray::Axis;
use rayon::prelude::*;

use super::centroid::check_genes;
use super::{FilterState, ProfileFilter, Verdict};
use crate::errors::Result;
use crate::mixer::ProfileBatch;

///
/// Per-gene range filter. Each gene gets a `[lower, upper]` range from quantiles of the
/// reference cohort; a profile passes when at least `min_fraction` of its genes fall inside
/// their range.
///
#[derive(Debug, Clone)]
pub struct QuantileRangeFilter {
    genes: Vec<String>,
    lower: Vec<f64>,
    median: Vec<f64>,
    upper: Vec<f64>,
    min_fraction: f64,
}

impl QuantileRangeFilter {
    pub fn new(cohort: &ReferenceCohort, quantiles: [f64; 3], min_fraction: f64) -> Result<Self> {
        let profiles = cohort.profiles();
        let [q_lower, q_median, q_upper] = quantiles;

        let mut lower = Vec::with_capacity(profiles.n_genes());
        let mut median = Vec::with_capacity(profiles.n_genes());
        let mut upper = Vec::with_capacity(profiles.n_genes());
        for column in profiles.values.axis_iter(Axis(1)) {
            let mut sorted = column.to_vec();
            sorted.sort_by(|a, b| a.total_cmp(b));
            lower.push(quantile_sorted(&sorted, q_lower));
            median.push(quantile_sorted(&sorted, q_median));
            upper.push(quantile_sorted(&sorted, q_upper));
        }
        tracing::info!(
            "quantile_range filter: {} genes, quantiles {:?}, min fraction in range {}",
            lower.len(),
            quantiles,
            min_fraction
        );

        Ok(Self {
            genes: profiles.genes.clone(),
            lower,
            median,
            upper,
            min_fraction,
        })
    }

    /// Reference median per gene.
    pub fn median(&self) -> &[f64] {
        &self.median
    }

    /// Share of the genes of row `i` inside their reference range.
    pub fn fraction_in_range(&self, batch: &ProfileBatch, i: usize) -> f64 {
        if self.genes.is_empty() {
            return 0.0;
        }
        let inside = batch
            .row(i)
            .iter()
            .zip(self.lower.iter().zip(&self.upper))
            .filter(|(v, (lo, hi))| **lo <= **v && **v <= **hi)
            .count();
        inside as f64 / self.genes.len() as f64
    }
}

impl ProfileFilter for QuantileRangeFilter {
    fn name(&self) -> &'static str {
        "quantile_range"
    }

    fn accept(&self, batch: &ProfileBatch, _state: &FilterState) -> Result<Verdict> {
        check_genes(self.name(), &self.genes, &batch.genes)?;
        let accepted = (0..batch.len())
            .into_par_iter()
            .filter(|i| self.fraction_in_range(batch, *i) >= self.min_fraction)
            .collect();
        Ok(Verdict {
            accepted,
            ..Default::default()
        })
    }

    fn threshold(&self, _state: &FilterState) -> f64 {
        self.min_fraction
    }
}

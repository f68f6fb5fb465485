use gepsim_core::ReferenceCohort;
use gepsim_core::utils::{l1_distance, median, quantile_sorted};
use ndarray::{Array1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{FilterState, ProfileFilter, Verdict};
use crate::errors::{Result, SimulationError};
use crate::mixer::ProfileBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CentroidKind {
    Mean,
    #[default]
    Median,
}

///
/// Accepts profiles whose L1 distance to the reference centroid falls inside the band
/// spanned by quantiles of the reference samples' own distances to that centroid.
///
#[derive(Debug, Clone)]
pub struct CentroidBand {
    genes: Vec<String>,
    centroid: Array1<f64>,
    lower: f64,
    upper: f64,
}

impl CentroidBand {
    pub fn new(
        cohort: &ReferenceCohort,
        kind: CentroidKind,
        lower_quantile: Option<f64>,
        upper_quantile: f64,
    ) -> Result<Self> {
        let profiles = cohort.profiles();
        let centroid = match kind {
            CentroidKind::Mean => profiles.values.mean_axis(Axis(0)).ok_or_else(|| {
                SimulationError::InsufficientData("reference cohort is empty".to_string())
            })?,
            CentroidKind::Median => profiles
                .values
                .axis_iter(Axis(1))
                .map(|column| median(&column.to_vec()).unwrap_or_default())
                .collect(),
        };

        let mut distances: Vec<f64> = profiles
            .values
            .axis_iter(Axis(0))
            .map(|row| l1_distance(row, centroid.view()))
            .collect();
        distances.sort_by(|a, b| a.total_cmp(b));

        let lower = lower_quantile
            .map(|q| quantile_sorted(&distances, q))
            .unwrap_or(0.0);
        let upper = quantile_sorted(&distances, upper_quantile);
        tracing::info!(
            "centroid_band filter: {} reference samples, L1 band [{:.1}, {:.1}]",
            distances.len(),
            lower,
            upper
        );

        Ok(Self {
            genes: profiles.genes.clone(),
            centroid,
            lower,
            upper,
        })
    }

    pub fn band(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }

    pub fn distance(&self, batch: &ProfileBatch, i: usize) -> f64 {
        l1_distance(batch.row(i), self.centroid.view())
    }
}

impl ProfileFilter for CentroidBand {
    fn name(&self) -> &'static str {
        "centroid_band"
    }

    fn accept(&self, batch: &ProfileBatch, _state: &FilterState) -> Result<Verdict> {
        check_genes(self.name(), &self.genes, &batch.genes)?;
        let accepted = (0..batch.len())
            .into_par_iter()
            .filter(|i| {
                let d = self.distance(batch, *i);
                self.lower <= d && d <= self.upper
            })
            .collect();
        Ok(Verdict {
            accepted,
            ..Default::default()
        })
    }

    fn threshold(&self, _state: &FilterState) -> f64 {
        self.upper
    }
}

/// Candidates must be laid out on the reference genes.
pub(super) fn check_genes(filter: &str, reference: &[String], candidates: &[String]) -> Result<()> {
    if reference != candidates {
        return Err(SimulationError::InvalidArgument(format!(
            "{} filter: candidate profiles have {} genes that do not match the {} reference genes",
            filter,
            candidates.len(),
            reference.len()
        )));
    }
    Ok(())
}

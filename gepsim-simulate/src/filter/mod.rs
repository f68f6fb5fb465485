//!
//! Reference-similarity filters for synthetic profiles.
//!
//! A [`FilterChain`] runs one or more [`ProfileFilter`]s in order, each seeing only the
//! candidates the previous ones accepted. Filters are stateless apart from the
//! [`FilterState`] they are handed, which the generation loop persists between rounds.
//!
use std::collections::BTreeMap;

use fxhash::FxHashMap;
use gepsim_core::utils::normalize_to_tpm;
use gepsim_core::{ExpressionTable, ReferenceCohort};
use ndarray::Axis;
use serde::{Deserialize, Serialize};

use crate::consts::{
    DEFAULT_GENE_QUANTILES, DEFAULT_MIN_ACCEPTED_PER_ROUND, DEFAULT_MIN_FRACTION_IN_RANGE,
};
use crate::errors::{Result, SimulationError};
use crate::mixer::ProfileBatch;

pub mod centroid;
pub mod marker;
pub mod neighbors;
pub mod quantile_range;

pub use centroid::{CentroidBand, CentroidKind};
pub use marker::{MarkerPanel, MarkerRatioFilter, Reducer};
pub use quantile_range::QuantileRangeFilter;

pub const SUPPORTED_POLICIES: &[&str] = &["marker_ratio", "centroid_band", "quantile_range"];

///
/// Filter state that outlives a round: the current radius quantile of the marker-ratio
/// filter and how many accepted samples each reference point has been credited with.
///
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterState {
    #[serde(default)]
    pub quantile: Option<f64>,
    #[serde(default)]
    pub quota_usage: BTreeMap<String, usize>,
}

impl FilterState {
    /// Credit each reference point once per accepted sample.
    pub fn commit_credits<'a, I>(&mut self, credits: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for reference in credits {
            *self.quota_usage.entry(reference.clone()).or_insert(0) += 1;
        }
    }
}

/// Accepted candidates of one filter, as indices into the batch it was given.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Verdict {
    pub accepted: Vec<usize>,
    /// Reference point credited for an accepted candidate, keyed by candidate index
    pub credits: FxHashMap<usize, String>,
}

impl Verdict {
    pub fn accept_all(n: usize) -> Self {
        Self {
            accepted: (0..n).collect(),
            credits: FxHashMap::default(),
        }
    }
}

/// What happened in the round that was just persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundOutcome {
    pub round: u64,
    pub accepted_in_round: usize,
    pub accepted: usize,
    pub target: usize,
}

pub trait ProfileFilter: Send + Sync {
    fn name(&self) -> &'static str;

    ///
    /// Decide which profiles of `batch` pass. Must not mutate the filter state; credits are
    /// committed by the caller for the candidates that are finally kept.
    ///
    fn accept(&self, batch: &ProfileBatch, state: &FilterState) -> Result<Verdict>;

    /// Relax the filter after a round with too few acceptances.
    fn adapt(&self, _outcome: &RoundOutcome, _state: &mut FilterState) -> Result<()> {
        Ok(())
    }

    /// The threshold currently in effect, for logging and the job summary.
    fn threshold(&self, state: &FilterState) -> f64;
}

#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn ProfileFilter>>,
    genes: Option<Vec<usize>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn ProfileFilter>>) -> Self {
        Self {
            filters,
            genes: None,
        }
    }

    ///
    /// Compare on a gene subset: candidate profiles are restricted to these columns and
    /// renormalised to TPM before filtering.
    ///
    pub fn with_gene_subset(mut self, columns: Vec<usize>) -> Self {
        self.genes = Some(columns);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn apply(&self, batch: &ProfileBatch, state: &FilterState) -> Result<Verdict> {
        let restricted;
        let batch = match &self.genes {
            Some(columns) => {
                restricted = restrict_columns(batch, columns);
                &restricted
            }
            None => batch,
        };

        let mut verdict = Verdict::accept_all(batch.len());
        for filter in &self.filters {
            if verdict.accepted.is_empty() {
                break;
            }
            let candidates = batch.select(&verdict.accepted);
            let step = filter.accept(&candidates, state)?;
            tracing::debug!(
                "{} kept {} of {} candidates",
                filter.name(),
                step.accepted.len(),
                candidates.len()
            );

            let mut credits: FxHashMap<usize, String> = FxHashMap::default();
            let accepted: Vec<usize> = step
                .accepted
                .iter()
                .map(|j| {
                    let original = verdict.accepted[*j];
                    if let Some(reference) = step
                        .credits
                        .get(j)
                        .or_else(|| verdict.credits.get(&original))
                    {
                        credits.insert(original, reference.clone());
                    }
                    original
                })
                .collect();
            verdict = Verdict { accepted, credits };
        }
        Ok(verdict)
    }

    pub fn adapt(&self, outcome: &RoundOutcome, state: &mut FilterState) -> Result<()> {
        for filter in &self.filters {
            filter.adapt(outcome, state)?;
        }
        Ok(())
    }

    pub fn thresholds(&self, state: &FilterState) -> BTreeMap<String, f64> {
        self.filters
            .iter()
            .map(|f| (f.name().to_string(), f.threshold(state)))
            .collect()
    }
}

fn restrict_columns(batch: &ProfileBatch, columns: &[usize]) -> ProfileBatch {
    let mut tpm = batch.tpm.select(Axis(1), columns);
    for row in tpm.axis_iter_mut(Axis(0)) {
        normalize_to_tpm(row);
    }
    ProfileBatch {
        sample_ids: batch.sample_ids.clone(),
        genes: columns.iter().map(|c| batch.genes[*c].clone()).collect(),
        tpm,
    }
}

/// Reference material the filter policies are built from.
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    /// Real profiles, already aligned to the genes the filters compare on
    pub cohort: Option<ReferenceCohort>,
    pub markers: Option<BTreeMap<String, Vec<String>>>,
    /// Precomputed marker-ratio projection of the reference samples
    pub projection: Option<ExpressionTable>,
}

fn default_radius_quantile() -> f64 {
    0.95
}

fn default_min_accepted() -> usize {
    DEFAULT_MIN_ACCEPTED_PER_ROUND
}

fn default_upper_quantile() -> f64 {
    0.95
}

fn default_gene_quantiles() -> [f64; 3] {
    DEFAULT_GENE_QUANTILES
}

fn default_min_fraction() -> f64 {
    DEFAULT_MIN_FRACTION_IN_RANGE
}

///
/// A filter as written in a job file, tagged by `policy`:
///
/// ```toml
/// [[filter]]
/// policy = "centroid_band"
/// centroid = "median"
/// upper_quantile = 0.95
/// ```
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FilterPolicy {
    MarkerRatio {
        /// Quantile of the reference nearest-neighbour distances used as the radius
        #[serde(default = "default_radius_quantile")]
        quantile: f64,
        #[serde(default)]
        reducer: Reducer,
        /// Per-reference cap on credits within one round
        #[serde(default)]
        n_top: Option<usize>,
        /// Per-reference cap on credits within the job
        #[serde(default)]
        quota: Option<usize>,
        /// Rounds accepting fewer samples than this widen the radius
        #[serde(default = "default_min_accepted")]
        min_accepted: usize,
    },
    CentroidBand {
        #[serde(default)]
        centroid: CentroidKind,
        #[serde(default)]
        lower_quantile: Option<f64>,
        #[serde(default = "default_upper_quantile")]
        upper_quantile: f64,
    },
    QuantileRange {
        /// Reference lower, median and upper quantile per gene
        #[serde(default = "default_gene_quantiles")]
        quantiles: [f64; 3],
        #[serde(default = "default_min_fraction")]
        min_fraction: f64,
    },
}

impl FilterPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            FilterPolicy::MarkerRatio { .. } => "marker_ratio",
            FilterPolicy::CentroidBand { .. } => "centroid_band",
            FilterPolicy::QuantileRange { .. } => "quantile_range",
        }
    }

    pub fn validate(&self) -> Result<()> {
        let in_unit = |q: f64| (0.0..=1.0).contains(&q);
        match self {
            FilterPolicy::MarkerRatio {
                quantile, n_top, quota, ..
            } => {
                if !in_unit(*quantile) {
                    return Err(invalid(self, format!("quantile {} is outside [0, 1]", quantile)));
                }
                if *n_top == Some(0) || *quota == Some(0) {
                    return Err(invalid(self, "n_top and quota must be at least 1".to_string()));
                }
            }
            FilterPolicy::CentroidBand {
                lower_quantile,
                upper_quantile,
                ..
            } => {
                let lower = lower_quantile.unwrap_or(0.0);
                if !in_unit(lower) || !in_unit(*upper_quantile) || lower > *upper_quantile {
                    return Err(invalid(
                        self,
                        format!("quantile band [{:?}, {}] is malformed", lower_quantile, upper_quantile),
                    ));
                }
            }
            FilterPolicy::QuantileRange {
                quantiles: [lower, median, upper],
                min_fraction,
            } => {
                if !in_unit(*lower) || !in_unit(*upper) || !(lower <= median && median <= upper) {
                    return Err(invalid(self, format!("quantiles {:?} are malformed", [lower, median, upper])));
                }
                if !in_unit(*min_fraction) {
                    return Err(invalid(self, format!("min_fraction {} is outside [0, 1]", min_fraction)));
                }
            }
        }
        Ok(())
    }

    ///
    /// Build the filter.
    ///
    /// # Arguments
    ///
    /// - reference: reference material; policies fail with `MissingReference` when theirs is absent
    /// - genes: genes of the candidate profiles the filter will see
    /// - target: number of samples the job generates, for the default per-reference quota
    ///
    pub fn build(
        &self,
        reference: &ReferenceData,
        genes: &[String],
        target: usize,
    ) -> Result<Box<dyn ProfileFilter>> {
        self.validate()?;
        match self {
            FilterPolicy::MarkerRatio {
                quantile,
                reducer,
                n_top,
                quota,
                min_accepted,
            } => {
                let markers = reference.markers.as_ref().ok_or_else(|| {
                    SimulationError::MissingReference(
                        "marker_ratio filter needs a marker gene table".to_string(),
                    )
                })?;
                let panel = MarkerPanel::new(markers, genes, *reducer)?;
                let projection = match (&reference.projection, &reference.cohort) {
                    (Some(projection), _) => panel.select_projection(projection)?,
                    (None, Some(cohort)) => panel.project_table(cohort.profiles())?,
                    (None, None) => {
                        return Err(SimulationError::MissingReference(
                            "marker_ratio filter needs a reference cohort or a precomputed projection"
                                .to_string(),
                        ));
                    }
                };
                Ok(Box::new(MarkerRatioFilter::new(
                    panel,
                    projection,
                    *quantile,
                    *n_top,
                    *quota,
                    *min_accepted,
                    target,
                )?))
            }
            FilterPolicy::CentroidBand {
                centroid,
                lower_quantile,
                upper_quantile,
            } => {
                let cohort = require_cohort(self, reference)?;
                Ok(Box::new(CentroidBand::new(
                    cohort,
                    *centroid,
                    *lower_quantile,
                    *upper_quantile,
                )?))
            }
            FilterPolicy::QuantileRange {
                quantiles,
                min_fraction,
            } => {
                let cohort = require_cohort(self, reference)?;
                Ok(Box::new(QuantileRangeFilter::new(
                    cohort,
                    *quantiles,
                    *min_fraction,
                )?))
            }
        }
    }
}

fn invalid(policy: &FilterPolicy, message: String) -> SimulationError {
    SimulationError::InvalidArgument(format!("{} filter: {}", policy.name(), message))
}

fn require_cohort<'a>(policy: &FilterPolicy, reference: &'a ReferenceData) -> Result<&'a ReferenceCohort> {
    reference.cohort.as_ref().ok_or_else(|| {
        SimulationError::MissingReference(format!(
            "{} filter needs a reference cohort",
            policy.name()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use gepsim_core::ExpressionScale;
    use ndarray::{Array2, array};
    use pretty_assertions::assert_eq;
    use rstest::*;

    struct KeepEven;

    impl ProfileFilter for KeepEven {
        fn name(&self) -> &'static str {
            "keep_even"
        }

        fn accept(&self, batch: &ProfileBatch, _state: &FilterState) -> Result<Verdict> {
            Ok(Verdict {
                accepted: (0..batch.len()).filter(|i| i % 2 == 0).collect(),
                credits: FxHashMap::default(),
            })
        }

        fn threshold(&self, _state: &FilterState) -> f64 {
            0.0
        }
    }

    fn batch(n: usize) -> ProfileBatch {
        ProfileBatch {
            sample_ids: (0..n).map(|i| format!("s_{}", i)).collect(),
            genes: vec!["g1".into(), "g2".into()],
            tpm: Array2::from_elem((n, 2), 500_000.0),
        }
    }

    #[rstest]
    fn test_chain_maps_indices_back() {
        let chain = FilterChain::new(vec![Box::new(KeepEven), Box::new(KeepEven)]);
        let verdict = chain.apply(&batch(8), &FilterState::default()).unwrap();
        // 0,2,4,6 then every other of those
        assert_eq!(verdict.accepted, vec![0, 4]);
    }

    #[rstest]
    fn test_gene_subset_is_renormalised() {
        let restricted = restrict_columns(&batch(1), &[1]);
        assert_eq!(restricted.tpm, array![[1e6]]);
        assert_eq!(restricted.genes, vec!["g2".to_string()]);
    }

    #[rstest]
    #[case(FilterPolicy::CentroidBand { centroid: CentroidKind::Mean, lower_quantile: None, upper_quantile: 0.9 })]
    #[case(FilterPolicy::QuantileRange { quantiles: DEFAULT_GENE_QUANTILES, min_fraction: 0.9 })]
    #[case(FilterPolicy::MarkerRatio { quantile: 0.9, reducer: Reducer::Max, n_top: None, quota: None, min_accepted: 50 })]
    fn test_missing_reference(#[case] policy: FilterPolicy) {
        let result = policy.build(&ReferenceData::default(), &["g1".to_string()], 10);
        assert!(matches!(result, Err(SimulationError::MissingReference(_))));
    }

    #[rstest]
    fn test_marker_ratio_needs_cohort_or_projection() {
        let mut markers = BTreeMap::new();
        markers.insert("A".to_string(), vec!["g1".to_string()]);
        let reference = ReferenceData {
            cohort: None,
            markers: Some(markers),
            projection: None,
        };
        let policy = FilterPolicy::MarkerRatio {
            quantile: 0.9,
            reducer: Reducer::Max,
            n_top: None,
            quota: None,
            min_accepted: 50,
        };
        let result = policy.build(&reference, &["g1".to_string()], 10);
        assert!(matches!(result, Err(SimulationError::MissingReference(_))));
    }

    #[rstest]
    fn test_malformed_band_rejected() {
        let policy = FilterPolicy::CentroidBand {
            centroid: CentroidKind::Median,
            lower_quantile: Some(0.9),
            upper_quantile: 0.5,
        };
        let cohort = ReferenceCohort::new(
            ExpressionTable::new(vec!["r".into()], vec!["g1".into()], array![[1.0]]).unwrap(),
            ExpressionScale::Linear,
        )
        .unwrap();
        let reference = ReferenceData {
            cohort: Some(cohort),
            ..Default::default()
        };
        assert!(matches!(
            policy.build(&reference, &["g1".to_string()], 10),
            Err(SimulationError::InvalidArgument(_))
        ));
    }

    #[rstest]
    fn test_policy_from_toml() {
        let policy: FilterPolicy =
            toml::from_str("policy = \"quantile_range\"\nmin_fraction = 0.9\n").unwrap();
        assert_eq!(
            policy,
            FilterPolicy::QuantileRange {
                quantiles: DEFAULT_GENE_QUANTILES,
                min_fraction: 0.9
            }
        );
    }
}

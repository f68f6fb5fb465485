use std::collections::BTreeMap;

use fxhash::FxHashMap;
use gepsim_core::ExpressionTable;
use gepsim_core::utils::{median, quantile_sorted, round_to};
use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use super::neighbors::{nearest_other_distances, within_radius};
use super::{FilterState, ProfileFilter, RoundOutcome, Verdict};
use crate::consts::{
    DEFAULT_N_TOP, QUANTILE_CEILING, QUANTILE_DECIMALS, QUANTILE_FINE_FROM, QUANTILE_FINE_STEP,
    QUANTILE_STEP,
};
use crate::errors::{Result, SimulationError};
use crate::mixer::ProfileBatch;

/// How the expression of a cell type's marker genes is summarised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    Mean,
    #[default]
    Max,
    Median,
    Sum,
}

impl Reducer {
    pub fn reduce(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            Reducer::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Reducer::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Reducer::Median => median(values).unwrap_or_default(),
            Reducer::Sum => values.iter().sum(),
        }
    }
}

///
/// Marker genes per cell type. A profile projects to one ratio per cell type: its reduced
/// marker expression divided by the sum over all cell types.
///
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerPanel {
    cell_types: Vec<String>,
    markers: Vec<Vec<String>>,
    reducer: Reducer,
}

impl MarkerPanel {
    ///
    /// Keep, per cell type, the marker genes present in `genes`. Every cell type needs at
    /// least one.
    ///
    pub fn new(
        markers: &BTreeMap<String, Vec<String>>,
        genes: &[String],
        reducer: Reducer,
    ) -> Result<Self> {
        let known: FxHashMap<&str, usize> = gene_lookup(genes);
        let mut cell_types = Vec::with_capacity(markers.len());
        let mut kept = Vec::with_capacity(markers.len());
        for (cell_type, marker_genes) in markers {
            let present: Vec<String> = marker_genes
                .iter()
                .filter(|g| known.contains_key(g.as_str()))
                .cloned()
                .collect();
            if present.is_empty() {
                return Err(SimulationError::InvalidArgument(format!(
                    "none of the marker genes of {} are in the profiles",
                    cell_type
                )));
            }
            cell_types.push(cell_type.clone());
            kept.push(present);
        }

        Ok(Self {
            cell_types,
            markers: kept,
            reducer,
        })
    }

    pub fn cell_types(&self) -> &[String] {
        &self.cell_types
    }

    fn columns(&self, genes: &[String]) -> Result<Vec<Vec<usize>>> {
        let lookup = gene_lookup(genes);
        self.markers
            .iter()
            .map(|markers| {
                markers
                    .iter()
                    .map(|g| {
                        lookup.get(g.as_str()).copied().ok_or_else(|| {
                            SimulationError::InvalidArgument(format!("marker gene {} is missing", g))
                        })
                    })
                    .collect()
            })
            .collect()
    }

    fn project_row(&self, columns: &[Vec<usize>], profile: ArrayView1<f64>) -> Vec<f64> {
        let mut scores: Vec<f64> = columns
            .iter()
            .map(|cols| {
                let values: Vec<f64> = cols.iter().map(|c| profile[*c]).collect();
                self.reducer.reduce(&values)
            })
            .collect();
        let total: f64 = scores.iter().sum();
        if total > 0.0 {
            scores.iter_mut().for_each(|s| *s /= total);
        }
        scores
    }

    pub fn project(&self, genes: &[String], values: &Array2<f64>) -> Result<Array2<f64>> {
        let columns = self.columns(genes)?;
        let mut points = Array2::<f64>::zeros((values.nrows(), self.cell_types.len()));
        for (profile, mut point) in values.axis_iter(Axis(0)).zip(points.axis_iter_mut(Axis(0))) {
            let ratios = self.project_row(&columns, profile);
            point.iter_mut().zip(ratios).for_each(|(p, r)| *p = r);
        }
        Ok(points)
    }

    pub fn project_table(&self, table: &ExpressionTable) -> Result<Projection> {
        Ok(Projection {
            ids: table.sample_ids.clone(),
            points: self.project(&table.genes, &table.values)?,
        })
    }

    ///
    /// Use a precomputed projection whose columns are cell types, reordered to this panel.
    ///
    pub fn select_projection(&self, table: &ExpressionTable) -> Result<Projection> {
        let lookup = gene_lookup(&table.genes);
        let columns = self
            .cell_types
            .iter()
            .map(|c| {
                lookup.get(c.as_str()).copied().ok_or_else(|| {
                    SimulationError::InvalidArgument(format!(
                        "precomputed projection has no column for {}",
                        c
                    ))
                })
            })
            .collect::<Result<Vec<usize>>>()?;

        Ok(Projection {
            ids: table.sample_ids.clone(),
            points: table.values.select(Axis(1), &columns),
        })
    }
}

fn gene_lookup(genes: &[String]) -> FxHashMap<&str, usize> {
    genes
        .iter()
        .enumerate()
        .map(|(i, g)| (g.as_str(), i))
        .collect()
}

/// Reference samples in the marker-ratio space.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub ids: Vec<String>,
    pub points: Array2<f64>,
}

///
/// Radius filter in the marker-ratio space with per-reference quota balancing.
///
/// The radius is a quantile of the reference points' nearest-other-point distances. A
/// candidate passes when some reference point within the radius (inclusive) still has
/// credit left: at most `n_top` candidates per reference point and round, and at most
/// `quota` over the whole job.
///
pub struct MarkerRatioFilter {
    panel: MarkerPanel,
    reference: Projection,
    nn_distances: Vec<f64>,
    quantile: f64,
    n_top: usize,
    quota: usize,
    min_accepted: usize,
}

impl MarkerRatioFilter {
    pub fn new(
        panel: MarkerPanel,
        reference: Projection,
        quantile: f64,
        n_top: Option<usize>,
        quota: Option<usize>,
        min_accepted: usize,
        target: usize,
    ) -> Result<Self> {
        let n_ref = reference.ids.len();
        if n_ref < 2 {
            return Err(SimulationError::InsufficientData(format!(
                "marker_ratio filter needs at least 2 reference samples, got {}",
                n_ref
            )));
        }

        let quota = quota.unwrap_or_else(|| target.div_ceil(n_ref).max(1));
        let n_top = n_top.unwrap_or(DEFAULT_N_TOP).min(quota);
        let nn_distances = nearest_other_distances(&reference.points);

        let filter = Self {
            panel,
            reference,
            nn_distances,
            quantile,
            n_top,
            quota,
            min_accepted,
        };
        tracing::info!(
            "marker_ratio filter: {} reference points, quota {}, n_top {}, radius {} at quantile {}",
            n_ref,
            quota,
            n_top,
            filter.radius_at(quantile),
            quantile
        );
        Ok(filter)
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    pub fn n_top(&self) -> usize {
        self.n_top
    }

    pub fn reference_ids(&self) -> &[String] {
        &self.reference.ids
    }

    pub fn current_quantile(&self, state: &FilterState) -> f64 {
        state.quantile.unwrap_or(self.quantile)
    }

    pub fn radius_at(&self, quantile: f64) -> f64 {
        quantile_sorted(&self.nn_distances, quantile)
    }

    fn usage(&self, state: &FilterState, r: usize) -> usize {
        state
            .quota_usage
            .get(&self.reference.ids[r])
            .copied()
            .unwrap_or(0)
    }
}

impl ProfileFilter for MarkerRatioFilter {
    fn name(&self) -> &'static str {
        "marker_ratio"
    }

    fn accept(&self, batch: &ProfileBatch, state: &FilterState) -> Result<Verdict> {
        let points = self.panel.project(&batch.genes, &batch.tpm)?;
        let radius = self.radius_at(self.current_quantile(state));

        let mut available: Vec<(usize, usize)> = (0..self.reference.ids.len())
            .map(|r| (self.usage(state, r), r))
            .filter(|(used, _)| *used < self.quota)
            .collect();
        available.sort();
        let references: Vec<usize> = available.iter().map(|(_, r)| *r).collect();
        let hits = within_radius(&self.reference.points, &references, &points, radius);

        let mut claimed = vec![false; batch.len()];
        let mut verdict = Verdict::default();
        for ((used, r), neighbours) in available.iter().zip(hits) {
            let cap = self.n_top.min(self.quota - used);
            let mut taken = 0;
            for (candidate, _) in neighbours {
                if taken == cap {
                    break;
                }
                if !claimed[candidate] {
                    claimed[candidate] = true;
                    verdict
                        .credits
                        .insert(candidate, self.reference.ids[*r].clone());
                    taken += 1;
                }
            }
        }

        verdict.accepted = (0..batch.len()).filter(|c| claimed[*c]).collect();
        Ok(verdict)
    }

    fn adapt(&self, outcome: &RoundOutcome, state: &mut FilterState) -> Result<()> {
        if outcome.accepted >= outcome.target {
            return Ok(());
        }
        let remaining_before = outcome.target - (outcome.accepted - outcome.accepted_in_round);
        let floor = self.min_accepted.min(remaining_before);
        if outcome.accepted_in_round >= floor {
            return Ok(());
        }

        let quantile = self.current_quantile(state);
        if quantile >= QUANTILE_CEILING {
            return Err(SimulationError::LowYield {
                accepted: outcome.accepted,
                target: outcome.target,
                threshold: quantile,
            });
        }

        let step = if quantile < QUANTILE_FINE_FROM {
            QUANTILE_STEP
        } else {
            QUANTILE_FINE_STEP
        };
        let widened = round_to((quantile + step).min(QUANTILE_CEILING), QUANTILE_DECIMALS);
        state.quantile = Some(widened);
        tracing::warn!(
            "round {}: {} accepted (floor {}), widening radius quantile to {}, radius {}",
            outcome.round,
            outcome.accepted_in_round,
            floor,
            widened,
            self.radius_at(widened)
        );
        Ok(())
    }

    fn threshold(&self, state: &FilterState) -> f64 {
        self.current_quantile(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::array;
    use pretty_assertions::assert_eq;
    use rstest::*;

    fn genes() -> Vec<String> {
        vec!["g1".into(), "g2".into()]
    }

    fn panel() -> MarkerPanel {
        let mut markers = BTreeMap::new();
        markers.insert("A".to_string(), vec!["g1".to_string()]);
        markers.insert("B".to_string(), vec!["g2".to_string(), "g9".to_string()]);
        MarkerPanel::new(&markers, &genes(), Reducer::Max).unwrap()
    }

    #[fixture]
    fn filter() -> MarkerRatioFilter {
        // every reference point is 0.3536 from its nearest neighbour
        let reference = Projection {
            ids: vec!["r1".into(), "r2".into(), "r3".into()],
            points: array![[0.5, 0.5], [0.75, 0.25], [1.0, 0.0]],
        };
        MarkerRatioFilter::new(panel(), reference, 0.9, None, Some(1), 50, 3).unwrap()
    }

    fn batch(rows: Array2<f64>) -> ProfileBatch {
        ProfileBatch {
            sample_ids: (0..rows.nrows()).map(|i| format!("s_{}", i)).collect(),
            genes: genes(),
            tpm: rows,
        }
    }

    #[rstest]
    #[case(vec![1.0, 2.0, 3.0], Reducer::Mean, 2.0)]
    #[case(vec![1.0, 2.0, 3.0], Reducer::Max, 3.0)]
    #[case(vec![1.0, 2.0, 4.0], Reducer::Median, 2.0)]
    #[case(vec![1.0, 2.0, 3.0], Reducer::Sum, 6.0)]
    fn test_reducers(#[case] values: Vec<f64>, #[case] reducer: Reducer, #[case] expected: f64) {
        assert_eq!(reducer.reduce(&values), expected);
    }

    #[rstest]
    fn test_projection_ratios() {
        let points = panel()
            .project(&genes(), &array![[300_000.0, 100_000.0], [0.0, 0.0]])
            .unwrap();
        assert_eq!(points, array![[0.75, 0.25], [0.0, 0.0]]);
    }

    #[rstest]
    fn test_boundary_is_inclusive(filter: MarkerRatioFilter) {
        // (0.25, 0.75) is exactly one radius from r1, (0.0, 1.0) is further from everything
        let candidates = batch(array![[250_000.0, 750_000.0], [0.0, 1e6]]);
        let verdict = filter.accept(&candidates, &FilterState::default()).unwrap();
        assert_eq!(verdict.accepted, vec![0]);
        assert_eq!(verdict.credits[&0], "r1");
    }

    #[rstest]
    fn test_quota_is_never_exceeded(filter: MarkerRatioFilter) {
        let candidates = batch(Array2::from_elem((5, 2), 500_000.0));
        let mut state = FilterState::default();

        let verdict = filter.accept(&candidates, &state).unwrap();
        // r1 and r2 both reach the candidates, one credit each
        assert_eq!(verdict.accepted.len(), 2);
        state.commit_credits(verdict.credits.values());
        assert_eq!(state.quota_usage["r1"], 1);
        assert_eq!(state.quota_usage["r2"], 1);

        let verdict = filter.accept(&candidates, &state).unwrap();
        assert!(verdict.accepted.is_empty());
    }

    #[rstest]
    fn test_default_quota_and_n_top() {
        let reference = Projection {
            ids: vec!["r1".into(), "r2".into(), "r3".into()],
            points: array![[0.5, 0.5], [0.75, 0.25], [1.0, 0.0]],
        };
        let filter = MarkerRatioFilter::new(panel(), reference, 0.9, None, None, 50, 10).unwrap();
        assert_eq!(filter.quota(), 4);
        assert_eq!(filter.n_top(), 4);
    }

    #[rstest]
    fn test_low_yield_widens_then_fails(filter: MarkerRatioFilter) {
        let mut state = FilterState::default();
        let outcome = RoundOutcome {
            round: 0,
            accepted_in_round: 0,
            accepted: 0,
            target: 3,
        };
        filter.adapt(&outcome, &mut state).unwrap();
        assert_eq!(state.quantile, Some(0.901));

        state.quantile = Some(0.999);
        filter.adapt(&outcome, &mut state).unwrap();
        assert_eq!(state.quantile, Some(0.9991));

        state.quantile = Some(QUANTILE_CEILING);
        let err = filter.adapt(&outcome, &mut state).unwrap_err();
        assert!(matches!(err, SimulationError::LowYield { accepted: 0, target: 3, .. }));
    }

    #[rstest]
    fn test_enough_yield_keeps_radius(filter: MarkerRatioFilter) {
        let mut state = FilterState::default();
        // only 2 samples were still missing, both accepted
        let outcome = RoundOutcome {
            round: 4,
            accepted_in_round: 2,
            accepted: 3,
            target: 3,
        };
        filter.adapt(&outcome, &mut state).unwrap();
        assert_eq!(state.quantile, None);
    }

    #[rstest]
    fn test_select_projection_reorders_columns() {
        let table = ExpressionTable::new(
            vec!["r1".into()],
            vec!["B".into(), "A".into()],
            array![[0.2, 0.8]],
        )
        .unwrap();
        let projection = panel().select_projection(&table).unwrap();
        assert_eq!(projection.points, array![[0.8, 0.2]]);
    }
}

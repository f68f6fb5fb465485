//!
//! The resumable generation loop.
//!
//! Each round draws fraction vectors, picks cells, mixes them, filters the profiles and
//! appends the accepted samples to the output tables. The job state is rewritten after the
//! tables, so an interrupted job picks up after its last complete round.
//!
use std::fs;
use std::path::PathBuf;

use gepsim_core::CellPool;
use indicatif::{ProgressBar, ProgressStyle};

use crate::artifacts::{
    ArtifactPaths, ArtifactWriter, DatasetBundle, GenerationSummary, read_json, write_json,
};
use crate::consts::{FILTERED_BATCH_SIZE, MAX_EMPTY_ROUNDS, UNFILTERED_BATCH_SIZE, VERSION};
use crate::errors::{Result, SimulationError};
use crate::filter::{FilterChain, RoundOutcome, Verdict};
use crate::fractions::FractionStrategy;
use crate::mixer::{Mixer, MixerOptions};
use crate::picker::{CellPicker, PickerOptions, SampledCellSet};
use crate::rng::{Stream, stream_rng};
use crate::state::{GenerationState, Resume, reconcile};

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub name: String,
    pub output_dir: PathBuf,
    pub n_samples: usize,
    pub cell_types: Vec<String>,
    pub strategy: FractionStrategy,
    pub picker: PickerOptions,
    pub mixer: MixerOptions,
    /// Random when unset; a resumed job keeps the seed it started with
    pub seed: Option<u64>,
    pub batch_size: Option<usize>,
    /// Stop after this many rounds in one invocation
    pub max_rounds: Option<u64>,
    pub show_progress: bool,
}

pub struct BulkGepGenerator<'a> {
    pool: &'a CellPool,
    params: GenerationParams,
    filters: FilterChain,
    paths: ArtifactPaths,
}

impl<'a> BulkGepGenerator<'a> {
    pub fn new(pool: &'a CellPool, params: GenerationParams, filters: FilterChain) -> Result<Self> {
        if params.n_samples == 0 {
            return Err(SimulationError::InvalidArgument(
                "n_samples must be at least 1".to_string(),
            ));
        }
        if params.batch_size == Some(0) {
            return Err(SimulationError::InvalidArgument(
                "batch_size must be at least 1".to_string(),
            ));
        }
        params.strategy.validate(&params.cell_types)?;
        params
            .mixer
            .method
            .check_cell_budget(params.picker.total_cells, params.cell_types.len())?;

        let paths = ArtifactPaths::new(&params.output_dir, &params.name);
        Ok(Self {
            pool,
            params,
            filters,
            paths,
        })
    }

    pub fn paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    /// Candidates mixed per round. Filtered jobs use larger rounds since most candidates are rejected.
    pub fn batch_size(&self) -> usize {
        let default = if self.filters.is_empty() {
            UNFILTERED_BATCH_SIZE
        } else {
            FILTERED_BATCH_SIZE
        };
        self.params
            .batch_size
            .unwrap_or(default)
            .min(self.params.n_samples)
    }

    fn has_quota_table(&self) -> bool {
        self.filters.names().contains(&"marker_ratio")
    }

    ///
    /// Run the job until `n_samples` samples are accepted, resuming from partial output
    /// when a previous invocation was interrupted.
    ///
    /// Returns the summary of the job; `completed` is false when `max_rounds` stopped it early.
    ///
    pub fn run(&self) -> Result<GenerationSummary> {
        if self.paths.is_complete() {
            tracing::info!(
                "{} already exists, reusing the previous result",
                self.paths.bundle.display()
            );
            return read_json(&self.paths.summary);
        }

        let picker = CellPicker::new(self.pool, self.params.picker.clone())?;
        let mixer = Mixer::new(self.pool, self.params.mixer.clone())?;
        let (mut state, writer) = self.start()?;

        let target = self.params.n_samples;
        let batch_size = self.batch_size();
        let progress = self.progress_bar(state.accepted);
        let mut rounds_run = 0;
        let mut empty_rounds = 0;
        let mut low_yield = None;

        while state.accepted < target {
            if self.params.max_rounds.is_some_and(|max| rounds_run >= max) {
                tracing::info!(
                    "stopping after {} rounds with {} of {} samples, rerun to resume",
                    rounds_run,
                    state.accepted,
                    target
                );
                break;
            }

            let round = state.round;
            let prefix = format!("s_{}_{}", self.params.strategy.name(), round);
            let mut rng = stream_rng(state.seed, Stream::Fractions, round, 0);
            let fractions =
                self.params
                    .strategy
                    .generate(batch_size, &self.params.cell_types, &prefix, &mut rng)?;

            let cells = picker.pick(&fractions, state.seed, round)?;
            let profiles = picker.install(|| mixer.mix(&cells, &fractions, state.seed, round))?;
            let verdict = if self.filters.is_empty() {
                Verdict::accept_all(profiles.len())
            } else {
                picker.install(|| self.filters.apply(&profiles, &state.filter))?
            };

            let Verdict {
                accepted: mut kept,
                credits,
            } = verdict;
            kept.truncate(target - state.accepted);
            state
                .filter
                .commit_credits(kept.iter().filter_map(|i| credits.get(i)));

            let kept_cells: Vec<SampledCellSet> = kept.iter().map(|i| cells[*i].clone()).collect();
            writer.append_round(&fractions.select(&kept), &profiles.select(&kept), &kept_cells)?;

            empty_rounds = if kept.is_empty() { empty_rounds + 1 } else { 0 };
            state.accepted += kept.len();
            state.candidates += profiles.len();
            state.round += 1;
            rounds_run += 1;

            let outcome = RoundOutcome {
                round,
                accepted_in_round: kept.len(),
                accepted: state.accepted,
                target,
            };
            let adapted = self.filters.adapt(&outcome, &mut state.filter);
            if self.has_quota_table() {
                writer.write_neighbors(&state.filter.quota_usage)?;
            }
            state.save(&self.paths)?;

            tracing::debug!(
                "round {}: {} of {} candidates accepted, thresholds {:?}",
                round,
                kept.len(),
                profiles.len(),
                self.filters.thresholds(&state.filter)
            );
            progress.inc(kept.len() as u64);

            match adapted {
                Ok(()) if empty_rounds >= MAX_EMPTY_ROUNDS => {
                    let thresholds = self.filters.thresholds(&state.filter);
                    tracing::warn!(
                        "round {}: no candidate accepted in {} consecutive rounds, thresholds {:?}",
                        round,
                        empty_rounds,
                        thresholds
                    );
                    low_yield = Some(SimulationError::LowYield {
                        accepted: state.accepted,
                        target,
                        threshold: thresholds.values().copied().fold(f64::NAN, f64::max),
                    });
                    break;
                }
                Ok(()) => {}
                Err(e @ SimulationError::LowYield { .. }) => {
                    low_yield = Some(e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        progress.finish_and_clear();

        let completed = state.accepted >= target;
        let summary = self.summary(&state, completed);
        tracing::info!(
            "{}: {} of {} samples accepted in {} rounds, acceptance ratio {:.4}, thresholds {:?}",
            summary.name,
            summary.accepted,
            summary.target,
            summary.rounds,
            summary.acceptance_ratio,
            summary.thresholds
        );

        if let Some(e) = low_yield {
            return Err(e);
        }
        if completed {
            self.finish(&summary)?;
        }
        Ok(summary)
    }

    fn start(&self) -> Result<(GenerationState, ArtifactWriter<'_>)> {
        match reconcile(&self.paths, self.has_quota_table()) {
            Ok(Resume::Continue(state)) => {
                tracing::info!(
                    "resuming {} at round {} with {} samples accepted",
                    self.params.name,
                    state.round,
                    state.accepted
                );
                if self.params.seed.is_some_and(|seed| seed != state.seed) {
                    tracing::warn!(
                        "keeping seed {} of the interrupted job instead of the configured one",
                        state.seed
                    );
                }
                Ok((state, ArtifactWriter::resume(&self.paths)))
            }
            Ok(Resume::Fresh) => self.start_fresh(),
            Err(SimulationError::CorruptState(reason)) => {
                tracing::warn!("discarding partial output of {}: {}", self.params.name, reason);
                self.paths.remove_partials()?;
                self.start_fresh()
            }
            Err(e) => Err(e),
        }
    }

    fn start_fresh(&self) -> Result<(GenerationState, ArtifactWriter<'_>)> {
        let state = GenerationState::new(self.params.seed.unwrap_or_else(rand::random));
        let writer =
            ArtifactWriter::create(&self.paths, &self.params.cell_types, self.pool.genes())?;
        if self.has_quota_table() {
            writer.write_neighbors(&state.filter.quota_usage)?;
        }
        state.save(&self.paths)?;
        tracing::info!(
            "generating {} samples for {} with seed {}",
            self.params.n_samples,
            self.params.name,
            state.seed
        );
        Ok((state, writer))
    }

    fn summary(&self, state: &GenerationState, completed: bool) -> GenerationSummary {
        let acceptance_ratio = if state.candidates > 0 {
            state.accepted as f64 / state.candidates as f64
        } else {
            0.0
        };
        GenerationSummary {
            name: self.params.name.clone(),
            accepted: state.accepted,
            target: self.params.n_samples,
            rounds: state.round,
            candidates: state.candidates,
            acceptance_ratio,
            thresholds: self.filters.thresholds(&state.filter),
            completed,
        }
    }

    fn finish(&self, summary: &GenerationSummary) -> Result<()> {
        let info = format!(
            "gepsim {}: {} synthetic bulk profiles of {} cell types, {} fractions, filters {:?}",
            VERSION,
            summary.accepted,
            self.params.cell_types.len(),
            self.params.strategy.name(),
            self.filters.names()
        );
        DatasetBundle::from_tables(&self.paths, info, summary.clone())?.write(&self.paths.bundle)?;
        write_json(&self.paths.summary, summary)?;
        fs::remove_file(&self.paths.state)?;
        Ok(())
    }

    fn progress_bar(&self, position: usize) -> ProgressBar {
        if !self.params.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(self.params.n_samples as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        {
            pb.set_style(style);
        }
        pb.set_message(format!("generating {}", self.params.name));
        pb.set_position(position as u64);
        pb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use gepsim_core::{CellRecord, ExpressionScale, ExpressionTable, ReferenceCohort};
    use ndarray::Array2;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use tempfile::tempdir;

    use crate::artifacts::read_sample_ids;
    use crate::filter::{CentroidBand, CentroidKind};
    use crate::mixer::MixMethod;

    #[fixture]
    fn pool() -> CellPool {
        let mut cells = Vec::new();
        let mut rows = Vec::new();
        for i in 0..10 {
            cells.push(CellRecord::new(format!("a{}", i), "A".into(), "p1".into()));
            rows.extend([10.0 + i as f64, 1.0, 0.0]);
            cells.push(CellRecord::new(format!("b{}", i), "B".into(), "p1".into()));
            rows.extend([0.0, 5.0, 20.0 + i as f64]);
        }
        CellPool::new(
            cells,
            vec!["g1".into(), "g2".into(), "g3".into()],
            Array2::from_shape_vec((20, 3), rows).unwrap(),
        )
        .unwrap()
    }

    fn params(dir: &std::path::Path, n_samples: usize) -> GenerationParams {
        GenerationParams {
            name: "unit".into(),
            output_dir: dir.to_path_buf(),
            n_samples,
            cell_types: vec!["A".into(), "B".into()],
            strategy: FractionStrategy::Random { ranges: None },
            picker: PickerOptions {
                total_cells: 10,
                per_patient: false,
                with_replacement: false,
                threads: Some(2),
            },
            mixer: MixerOptions::default(),
            seed: Some(5),
            batch_size: Some(4),
            max_rounds: None,
            show_progress: false,
        }
    }

    #[rstest]
    fn test_unfiltered_job_completes(pool: CellPool) {
        let dir = tempdir().unwrap();
        let generator = BulkGepGenerator::new(&pool, params(dir.path(), 10), FilterChain::default()).unwrap();
        assert_eq!(generator.batch_size(), 4);

        let summary = generator.run().unwrap();
        assert!(summary.completed);
        assert_eq!(summary.accepted, 10);
        assert_eq!(summary.rounds, 3);
        assert_eq!(summary.candidates, 12);

        let ids = read_sample_ids(&generator.paths().fractions).unwrap();
        assert_eq!(ids.len(), 10);
        assert_eq!(ids[0], "s_random_0_0");
        assert_eq!(ids[9], "s_random_2_1");
        assert!(!generator.paths().state.exists());

        let bundle = DatasetBundle::read(&generator.paths().bundle).unwrap();
        assert_eq!(bundle.sample_ids, ids);
        assert_eq!(bundle.genes.len(), 3);
    }

    #[rstest]
    fn test_finished_job_is_reused(pool: CellPool) {
        let dir = tempdir().unwrap();
        let generator = BulkGepGenerator::new(&pool, params(dir.path(), 4), FilterChain::default()).unwrap();
        let first = generator.run().unwrap();

        let mut again = params(dir.path(), 4);
        again.seed = Some(99);
        let second = BulkGepGenerator::new(&pool, again, FilterChain::default())
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(first, second);
    }

    #[rstest]
    fn test_max_rounds_leaves_resumable_state(pool: CellPool) {
        let dir = tempdir().unwrap();
        let mut p = params(dir.path(), 10);
        p.max_rounds = Some(1);
        let generator = BulkGepGenerator::new(&pool, p, FilterChain::default()).unwrap();

        let summary = generator.run().unwrap();
        assert!(!summary.completed);
        assert_eq!(summary.accepted, 4);
        let state: GenerationState = read_json(&generator.paths().state).unwrap();
        assert_eq!(state.round, 1);
        assert_eq!(state.seed, 5);
    }

    #[rstest]
    fn test_missing_cell_type_fails(pool: CellPool) {
        let dir = tempdir().unwrap();
        let mut p = params(dir.path(), 4);
        p.cell_types.push("C".into());
        let generator = BulkGepGenerator::new(&pool, p, FilterChain::default()).unwrap();
        assert!(matches!(
            generator.run(),
            Err(SimulationError::InsufficientData(_))
        ));
    }

    #[rstest]
    fn test_zero_samples_rejected(pool: CellPool) {
        let dir = tempdir().unwrap();
        assert!(BulkGepGenerator::new(&pool, params(dir.path(), 0), FilterChain::default()).is_err());
    }

    #[rstest]
    #[case(MixMethod::WeightedMix, 1, false)]
    #[case(MixMethod::WeightedMix, 0, true)]
    #[case(MixMethod::WeightedMix, 2, true)]
    #[case(MixMethod::Average, 1, true)]
    fn test_cell_budget_checked_up_front(
        pool: CellPool,
        #[case] method: MixMethod,
        #[case] total_cells: usize,
        #[case] ok: bool,
    ) {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        let mut p = params(&out, 4);
        p.mixer.method = method;
        p.picker.total_cells = total_cells;

        let generator = BulkGepGenerator::new(&pool, p, FilterChain::default());
        assert_eq!(generator.is_ok(), ok);
        if !ok {
            assert!(matches!(generator, Err(SimulationError::InvalidArgument(_))));
            assert!(!out.exists());
        }
    }

    #[rstest]
    fn test_unsatisfiable_band_stops_with_low_yield(pool: CellPool) {
        let dir = tempdir().unwrap();
        // two identical samples expressing only g2: the band is [0, 0]
        let reference = ExpressionTable::new(
            vec!["r1".into(), "r2".into()],
            vec!["g1".into(), "g2".into(), "g3".into()],
            Array2::from_shape_vec((2, 3), vec![0.0, 1.0, 0.0, 0.0, 1.0, 0.0]).unwrap(),
        )
        .unwrap();
        let cohort = ReferenceCohort::new(reference, ExpressionScale::Linear).unwrap();
        let band = CentroidBand::new(&cohort, CentroidKind::Median, None, 0.95).unwrap();
        assert_eq!(band.band(), (0.0, 0.0));

        let generator = BulkGepGenerator::new(
            &pool,
            params(dir.path(), 4),
            FilterChain::new(vec![Box::new(band)]),
        )
        .unwrap();
        match generator.run() {
            Err(SimulationError::LowYield {
                accepted,
                target,
                threshold,
            }) => {
                assert_eq!(accepted, 0);
                assert_eq!(target, 4);
                assert_eq!(threshold, 0.0);
            }
            other => panic!("expected low yield, got {:?}", other),
        }

        let state: GenerationState = read_json(&generator.paths().state).unwrap();
        assert_eq!(state.round, MAX_EMPTY_ROUNDS);
        assert_eq!(state.candidates, 4 * MAX_EMPTY_ROUNDS as usize);
    }
}

//!
//! Persisted counters of a generation job, and the reconciliation of partial output
//! when a job is restarted.
//!
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::artifacts::{ArtifactPaths, read_json, read_neighbors, read_sample_ids, write_json};
use crate::errors::{Result, SimulationError};
use crate::filter::FilterState;

///
/// Everything a job needs to continue after the last fully persisted round.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationState {
    /// Samples accepted and persisted so far
    pub accepted: usize,
    /// Next round to run
    pub round: u64,
    /// Profiles mixed over all rounds so far
    pub candidates: usize,
    pub seed: u64,
    #[serde(default)]
    pub filter: FilterState,
}

impl GenerationState {
    pub fn new(seed: u64) -> Self {
        Self {
            accepted: 0,
            round: 0,
            candidates: 0,
            seed,
            filter: FilterState::default(),
        }
    }

    pub fn save(&self, paths: &ArtifactPaths) -> Result<()> {
        write_json(&paths.state, self)
    }
}

/// Round encoded in a sample id `s_<strategy>_<round>_<index>`.
pub fn round_of(sample_id: &str) -> Option<u64> {
    let mut fields = sample_id.rsplit('_');
    fields.next()?;
    fields.next()?.parse().ok()
}

/// How a job starts.
#[derive(Debug, Clone, PartialEq)]
pub enum Resume {
    /// No usable partial output; start from round 0
    Fresh,
    Continue(GenerationState),
}

///
/// Check the partial output of an interrupted job against its state file.
///
/// The sample ids of the fraction table, profile table and audit trail must be the same
/// set, of the size the state records, and the round of the last id must precede the
/// state's next round. With `quota_table` the credit table must match the state's credits.
/// Any disagreement is reported as `CorruptState`.
///
pub fn reconcile(paths: &ArtifactPaths, quota_table: bool) -> Result<Resume> {
    if !paths.has_partials() {
        return Ok(Resume::Fresh);
    }
    if !paths.state.exists() {
        return Err(SimulationError::CorruptState(format!(
            "{} is missing",
            paths.state.display()
        )));
    }
    let state: GenerationState = read_json(&paths.state)
        .map_err(|e| SimulationError::CorruptState(format!("{}: {}", paths.state.display(), e)))?;

    let mut sets = Vec::with_capacity(3);
    let mut last_id = None;
    for path in [&paths.fractions, &paths.profiles, &paths.audit] {
        let ids = read_sample_ids(path)
            .map_err(|e| SimulationError::CorruptState(format!("{}: {}", path.display(), e)))?;
        if path == &paths.fractions {
            last_id = ids.last().cloned();
        }
        sets.push(ids.into_iter().collect::<BTreeSet<String>>());
    }

    let common: BTreeSet<&String> = sets[0]
        .iter()
        .filter(|id| sets[1].contains(*id) && sets[2].contains(*id))
        .collect();
    if sets.iter().any(|s| s.len() != common.len()) {
        return Err(SimulationError::CorruptState(format!(
            "partial tables hold {}, {} and {} samples but only {} are shared",
            sets[0].len(),
            sets[1].len(),
            sets[2].len(),
            common.len()
        )));
    }
    if common.len() != state.accepted {
        return Err(SimulationError::CorruptState(format!(
            "{} samples persisted but the state records {}",
            common.len(),
            state.accepted
        )));
    }

    if let Some(id) = last_id {
        match round_of(&id) {
            Some(round) if round < state.round => {}
            _ => {
                return Err(SimulationError::CorruptState(format!(
                    "last sample {} does not belong to a round before {}",
                    id, state.round
                )));
            }
        }
    }

    if quota_table {
        let credits = if paths.neighbors.exists() {
            read_neighbors(&paths.neighbors)?
        } else {
            Default::default()
        };
        if credits != state.filter.quota_usage {
            return Err(SimulationError::CorruptState(format!(
                "{} disagrees with the state's reference credits",
                paths.neighbors.display()
            )));
        }
    }

    Ok(Resume::Continue(state))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::fs;

    use gepsim_core::{FractionTable, FractionVector};
    use ndarray::Array2;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use tempfile::{TempDir, tempdir};

    use crate::artifacts::ArtifactWriter;
    use crate::mixer::ProfileBatch;
    use crate::picker::{CellDraw, SampledCellSet};

    fn persist_round(paths: &ArtifactPaths, ids: &[&str]) {
        let fractions = FractionTable::with_rows(
            vec!["A".into()],
            ids.iter()
                .map(|id| FractionVector::new(id.to_string(), vec![1.0]))
                .collect(),
        )
        .unwrap();
        let profiles = ProfileBatch {
            sample_ids: ids.iter().map(|id| id.to_string()).collect(),
            genes: vec!["g1".into()],
            tpm: Array2::from_elem((ids.len(), 1), 1e6),
        };
        let cells: Vec<SampledCellSet> = ids
            .iter()
            .map(|id| SampledCellSet {
                sample_id: id.to_string(),
                patient_id: None,
                draws: vec![CellDraw {
                    cell_type: "A".into(),
                    n_cell: 1,
                    cell_ids: vec!["c1".into()],
                    positions: vec![0],
                }],
            })
            .collect();
        ArtifactWriter::resume(paths)
            .append_round(&fractions, &profiles, &cells)
            .unwrap();
    }

    #[fixture]
    fn job() -> (TempDir, ArtifactPaths) {
        let dir = tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path(), "job");
        ArtifactWriter::create(&paths, &["A".to_string()], &["g1".to_string()]).unwrap();
        persist_round(&paths, &["s_segment_0_0", "s_segment_0_1"]);
        persist_round(&paths, &["s_segment_2_0"]);

        let mut state = GenerationState::new(11);
        state.accepted = 3;
        state.round = 3;
        state.candidates = 30;
        state.save(&paths).unwrap();
        (dir, paths)
    }

    #[rstest]
    #[case("s_segment_12_7", Some(12))]
    #[case("s_seg_random_3_0", Some(3))]
    #[case("s_random_x_0", None)]
    #[case("s0", None)]
    fn test_round_of(#[case] id: &str, #[case] expected: Option<u64>) {
        assert_eq!(round_of(id), expected);
    }

    #[rstest]
    fn test_nothing_on_disk_is_fresh() {
        let dir = tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path(), "job");
        assert_eq!(reconcile(&paths, false).unwrap(), Resume::Fresh);
    }

    #[rstest]
    fn test_consistent_output_resumes(job: (TempDir, ArtifactPaths)) {
        let (_dir, paths) = job;
        match reconcile(&paths, false).unwrap() {
            Resume::Continue(state) => {
                assert_eq!(state.accepted, 3);
                assert_eq!(state.round, 3);
                assert_eq!(state.seed, 11);
            }
            Resume::Fresh => panic!("expected to resume"),
        }
    }

    #[rstest]
    fn test_diverging_tables_are_corrupt(job: (TempDir, ArtifactPaths)) {
        let (_dir, paths) = job;
        let mut profiles = fs::read_to_string(&paths.profiles).unwrap();
        profiles.push_str("s_segment_3_0,19.93\n");
        fs::write(&paths.profiles, profiles).unwrap();
        assert!(matches!(
            reconcile(&paths, false),
            Err(SimulationError::CorruptState(_))
        ));
    }

    #[rstest]
    fn test_state_count_mismatch_is_corrupt(job: (TempDir, ArtifactPaths)) {
        let (_dir, paths) = job;
        let mut state: GenerationState = read_json(&paths.state).unwrap();
        state.accepted = 2;
        state.save(&paths).unwrap();
        assert!(matches!(
            reconcile(&paths, false),
            Err(SimulationError::CorruptState(_))
        ));
    }

    #[rstest]
    fn test_round_suffix_must_precede_state_round(job: (TempDir, ArtifactPaths)) {
        let (_dir, paths) = job;
        let mut state: GenerationState = read_json(&paths.state).unwrap();
        state.round = 2;
        state.save(&paths).unwrap();
        assert!(matches!(
            reconcile(&paths, false),
            Err(SimulationError::CorruptState(_))
        ));
    }

    #[rstest]
    fn test_missing_state_is_corrupt(job: (TempDir, ArtifactPaths)) {
        let (_dir, paths) = job;
        fs::remove_file(&paths.state).unwrap();
        assert!(matches!(
            reconcile(&paths, false),
            Err(SimulationError::CorruptState(_))
        ));
    }

    #[rstest]
    fn test_quota_table_must_match(job: (TempDir, ArtifactPaths)) {
        let (_dir, paths) = job;
        let mut state: GenerationState = read_json(&paths.state).unwrap();
        state.filter.quota_usage = BTreeMap::from([("r1".to_string(), 2), ("r2".to_string(), 1)]);
        state.save(&paths).unwrap();

        let writer = ArtifactWriter::resume(&paths);
        writer
            .write_neighbors(&BTreeMap::from([("r1".to_string(), 2)]))
            .unwrap();
        assert!(matches!(
            reconcile(&paths, true),
            Err(SimulationError::CorruptState(_))
        ));

        writer.write_neighbors(&state.filter.quota_usage).unwrap();
        assert!(matches!(reconcile(&paths, true), Ok(Resume::Continue(_))));
    }
}

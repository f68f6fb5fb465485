use fxhash::{FxHashMap, FxHashSet};

use crate::errors::{DataError, Result};
use crate::models::expression::{ExpressionScale, ExpressionTable};

///
/// Real-sample profiles used as a similarity yardstick.
///
/// Values are kept in linear TPM units (every profile sums to one million).
/// A cohort is never mutated by generation; the restriction methods return new cohorts.
///
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceCohort {
    profiles: ExpressionTable,
}

impl ReferenceCohort {
    pub fn new(table: ExpressionTable, scale: ExpressionScale) -> Result<Self> {
        if table.is_empty() {
            return Err(DataError::EmptyTable("reference cohort".to_string()));
        }
        let mut profiles = table.into_linear(scale);
        profiles.normalize_rows_to_tpm();
        Ok(Self { profiles })
    }

    pub fn profiles(&self) -> &ExpressionTable {
        &self.profiles
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.profiles.sample_ids
    }

    pub fn len(&self) -> usize {
        self.profiles.n_samples()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    ///
    /// Keep the samples whose group, looked up in `sample_groups`, is one of `groups`.
    ///
    pub fn restrict_to_groups(
        &self,
        sample_groups: &FxHashMap<String, String>,
        groups: &[String],
    ) -> Result<Self> {
        let wanted: FxHashSet<&str> = groups.iter().map(String::as_str).collect();
        let kept: Vec<usize> = self
            .profiles
            .sample_ids
            .iter()
            .enumerate()
            .filter(|(_, id)| {
                sample_groups
                    .get(id.as_str())
                    .is_some_and(|g| wanted.contains(g.as_str()))
            })
            .map(|(i, _)| i)
            .collect();

        if kept.is_empty() {
            return Err(DataError::EmptyTable(format!(
                "no reference sample belongs to {:?}",
                groups
            )));
        }

        Ok(Self {
            profiles: self.profiles.select_samples(&kept),
        })
    }

    /// Re-index onto the single-cell gene universe, filling missing genes with 0.
    pub fn align_to_genes(&self, genes: &[String]) -> Self {
        let mut profiles = self.profiles.align_to_genes(genes);
        profiles.normalize_rows_to_tpm();
        Self { profiles }
    }

    /// Restrict to a gene subset and renormalise each profile to the TPM scale.
    pub fn restrict_genes(&self, genes: &[String]) -> Result<Self> {
        let mut profiles = self.profiles.select_genes(genes)?;
        profiles.normalize_rows_to_tpm();
        Ok(Self { profiles })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::array;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[fixture]
    fn cohort() -> ReferenceCohort {
        let table = ExpressionTable::new(
            vec!["tcga_1".into(), "tcga_2".into(), "tcga_3".into()],
            vec!["g1".into(), "g2".into()],
            array![[1.0, 3.0], [2.0, 2.0], [4.0, 0.0]],
        )
        .unwrap();
        ReferenceCohort::new(table, ExpressionScale::Linear).unwrap()
    }

    #[rstest]
    fn test_profiles_in_tpm(cohort: ReferenceCohort) {
        assert_eq!(cohort.profiles().row(0).to_vec(), vec![250_000.0, 750_000.0]);
    }

    #[rstest]
    fn test_restrict_to_groups(cohort: ReferenceCohort) {
        let mut groups = FxHashMap::default();
        groups.insert("tcga_1".to_string(), "LUAD".to_string());
        groups.insert("tcga_3".to_string(), "LUAD".to_string());
        groups.insert("tcga_2".to_string(), "BRCA".to_string());

        let luad = cohort
            .restrict_to_groups(&groups, &["LUAD".to_string()])
            .unwrap();
        assert_eq!(luad.sample_ids(), &["tcga_1".to_string(), "tcga_3".to_string()]);

        let none = cohort.restrict_to_groups(&groups, &["COAD".to_string()]);
        assert!(matches!(none, Err(DataError::EmptyTable(_))));
    }

    #[rstest]
    fn test_restrict_genes_renormalises(cohort: ReferenceCohort) {
        let subset = cohort.restrict_genes(&["g1".to_string()]).unwrap();
        assert_eq!(subset.profiles().values.column(0).to_vec(), vec![1e6, 1e6, 1e6]);
    }

    #[rstest]
    fn test_empty_cohort_rejected() {
        let table = ExpressionTable::new(vec![], vec!["g1".into()], ndarray::Array2::zeros((0, 1)))
            .unwrap();
        assert!(ReferenceCohort::new(table, ExpressionScale::Linear).is_err());
    }
}

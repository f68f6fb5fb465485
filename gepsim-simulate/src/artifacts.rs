//!
//! On-disk output of a generation job.
//!
//! Row tables are append-only and keyed by sample id; every round appends to each of them
//! before the job state is rewritten. The dataset bundle and summary are written once,
//! when the target is reached.
//!
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use csv::WriterBuilder;
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use gepsim_core::io::{read_expression_table, read_fraction_table};
use gepsim_core::utils::round_to;
use gepsim_core::{FractionTable, FractionVector};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::consts::FRACTION_DECIMALS;
use crate::errors::{Result, SimulationError};
use crate::mixer::ProfileBatch;
use crate::picker::SampledCellSet;

pub const AUDIT_HEADER: [&str; 4] = ["sample_id", "cell_type", "n_cell", "selected_cell_id"];
pub const NEIGHBOR_HEADER: [&str; 2] = ["reference_id", "n_neighbors"];

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactPaths {
    pub fractions: PathBuf,
    pub profiles: PathBuf,
    pub audit: PathBuf,
    pub neighbors: PathBuf,
    pub state: PathBuf,
    pub bundle: PathBuf,
    pub summary: PathBuf,
}

impl ArtifactPaths {
    pub fn new(output_dir: &Path, name: &str) -> Self {
        Self {
            fractions: output_dir.join(format!("generated_frac_{}.csv", name)),
            profiles: output_dir.join(format!("simu_bulk_exp_{}_log2cpm1p.csv", name)),
            audit: output_dir.join(format!("simu_bulk_exp_{}_sampled_sc_cell_id.csv", name)),
            neighbors: output_dir.join(format!("ref2n_neighbors_{}.csv", name)),
            state: output_dir.join(format!("generation_state_{}.json", name)),
            bundle: output_dir.join(format!("simu_bulk_exp_{}_dataset.json.gz", name)),
            summary: output_dir.join(format!("simu_bulk_exp_{}_summary.json", name)),
        }
    }

    /// Files a partially finished job leaves behind.
    pub fn partials(&self) -> [&Path; 5] {
        [
            &self.fractions,
            &self.profiles,
            &self.audit,
            &self.neighbors,
            &self.state,
        ]
    }

    pub fn has_partials(&self) -> bool {
        self.partials().iter().any(|p| p.exists())
    }

    pub fn is_complete(&self) -> bool {
        self.bundle.exists() && self.summary.exists()
    }

    pub fn remove_partials(&self) -> Result<()> {
        for path in self.partials() {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

///
/// Write `contents` next to `path` and rename it into place, so readers only ever see
/// the old or the new file.
///
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, &serde_json::to_vec_pretty(value)?)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

fn fraction_field(value: f64) -> String {
    round_to(value, FRACTION_DECIMALS).to_string()
}

///
/// Appends one round of output to the row tables.
///
pub struct ArtifactWriter<'a> {
    paths: &'a ArtifactPaths,
}

impl<'a> ArtifactWriter<'a> {
    ///
    /// Start a job from scratch: truncate the row tables and write their headers.
    ///
    pub fn create(paths: &'a ArtifactPaths, cell_types: &[String], genes: &[String]) -> Result<Self> {
        if let Some(dir) = paths.fractions.parent() {
            fs::create_dir_all(dir)?;
        }
        write_header(&paths.fractions, cell_types)?;
        write_header(&paths.profiles, genes)?;

        let mut audit = WriterBuilder::new().from_path(&paths.audit)?;
        audit.write_record(AUDIT_HEADER)?;
        audit.flush()?;

        Ok(Self { paths })
    }

    /// Continue appending to the tables of an interrupted job.
    pub fn resume(paths: &'a ArtifactPaths) -> Self {
        Self { paths }
    }

    pub fn append_round(
        &self,
        fractions: &FractionTable,
        profiles: &ProfileBatch,
        cells: &[SampledCellSet],
    ) -> Result<()> {
        let mut writer = appender(&self.paths.fractions)?;
        for row in &fractions.rows {
            let mut record = Vec::with_capacity(row.fractions.len() + 1);
            record.push(row.sample_id.clone());
            record.extend(row.fractions.iter().map(|f| fraction_field(*f)));
            writer.write_record(&record)?;
        }
        writer.flush()?;

        let log2 = profiles.to_log2();
        let mut writer = appender(&self.paths.profiles)?;
        for (sample_id, row) in profiles.sample_ids.iter().zip(log2.rows()) {
            let mut record = Vec::with_capacity(row.len() + 1);
            record.push(sample_id.clone());
            record.extend(row.iter().map(|v| v.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;

        let mut writer = appender(&self.paths.audit)?;
        for set in cells {
            for draw in &set.draws {
                writer.write_record([
                    set.sample_id.as_str(),
                    draw.cell_type.as_str(),
                    draw.n_cell.to_string().as_str(),
                    draw.cell_ids.join(";").as_str(),
                ])?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    /// Rewrite the per-reference credit table.
    pub fn write_neighbors(&self, usage: &BTreeMap<String, usize>) -> Result<()> {
        write_atomic(&self.paths.neighbors, &neighbor_table(usage)?)
    }
}

fn write_header(path: &Path, columns: &[String]) -> Result<()> {
    let mut writer = WriterBuilder::new().from_path(path)?;
    let mut header = Vec::with_capacity(columns.len() + 1);
    header.push("sample_id");
    header.extend(columns.iter().map(String::as_str));
    writer.write_record(&header)?;
    writer.flush()?;
    Ok(())
}

fn appender(path: &Path) -> Result<csv::Writer<BufWriter<File>>> {
    let file = OpenOptions::new().append(true).open(path)?;
    Ok(WriterBuilder::new()
        .has_headers(false)
        .from_writer(BufWriter::new(file)))
}

///
/// Write a standalone fraction table in the layout of the job's fraction table.
///
pub fn write_fraction_table(path: &Path, table: &FractionTable) -> Result<()> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    let mut header = Vec::with_capacity(table.cell_types.len() + 1);
    header.push("sample_id");
    header.extend(table.cell_types.iter().map(String::as_str));
    writer.write_record(&header)?;
    for row in &table.rows {
        let mut record = Vec::with_capacity(row.fractions.len() + 1);
        record.push(row.sample_id.clone());
        record.extend(row.fractions.iter().map(|f| fraction_field(*f)));
        writer.write_record(&record)?;
    }
    let contents = writer
        .into_inner()
        .map_err(|e| SimulationError::Io(std::io::Error::other(e.to_string())))?;
    write_atomic(path, &contents)
}

fn neighbor_table(usage: &BTreeMap<String, usize>) -> Result<Vec<u8>> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(NEIGHBOR_HEADER)?;
    for (reference, n) in usage {
        writer.write_record([reference.as_str(), n.to_string().as_str()])?;
    }
    writer
        .into_inner()
        .map_err(|e| SimulationError::Io(std::io::Error::other(e.to_string())))
}

///
/// Sample ids of a row table in file order, one entry per row (the audit trail has one row
/// per sample and cell type).
///
pub fn read_sample_ids(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut ids = Vec::new();
    for record in reader.records() {
        let record = record?;
        ids.push(record.get(0).unwrap_or_default().to_string());
    }
    Ok(ids)
}

pub fn read_neighbors(path: &Path) -> Result<BTreeMap<String, usize>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut usage = BTreeMap::new();
    for record in reader.records() {
        let record = record?;
        let reference = record.get(0).unwrap_or_default().to_string();
        let n = record
            .get(1)
            .unwrap_or_default()
            .parse::<usize>()
            .map_err(|e| {
                SimulationError::CorruptState(format!("{}: {}", path.display(), e))
            })?;
        usage.insert(reference, n);
    }
    Ok(usage)
}

/// What a finished job reports.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub name: String,
    pub accepted: usize,
    pub target: usize,
    pub rounds: u64,
    /// Profiles mixed over all rounds, accepted or not
    pub candidates: usize,
    pub acceptance_ratio: f64,
    /// Threshold in effect at the end, per filter
    pub thresholds: BTreeMap<String, f64>,
    pub completed: bool,
}

///
/// The combined dataset: fractions and `log2(TPM + 1)` profiles of every accepted sample,
/// in the same row order.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetBundle {
    pub info: String,
    pub cell_types: Vec<String>,
    pub genes: Vec<String>,
    pub sample_ids: Vec<String>,
    pub fractions: Vec<Vec<f64>>,
    pub profiles: Vec<Vec<f64>>,
    pub summary: GenerationSummary,
}

impl DatasetBundle {
    ///
    /// Assemble the bundle from the finished row tables.
    ///
    pub fn from_tables(paths: &ArtifactPaths, info: String, summary: GenerationSummary) -> Result<Self> {
        let fractions = read_fraction_table(&paths.fractions)?;
        let profiles = read_expression_table(&paths.profiles)?;
        if fractions.sample_ids() != profiles.sample_ids {
            return Err(SimulationError::CorruptState(format!(
                "{} and {} list different samples",
                paths.fractions.display(),
                paths.profiles.display()
            )));
        }

        Ok(Self {
            info,
            cell_types: fractions.cell_types.clone(),
            genes: profiles.genes.clone(),
            sample_ids: profiles.sample_ids.clone(),
            fractions: fractions.rows.into_iter().map(|r| r.fractions).collect(),
            profiles: profiles.values.rows().into_iter().map(|r| r.to_vec()).collect(),
            summary,
        })
    }

    pub fn fraction_table(&self) -> Result<FractionTable> {
        Ok(FractionTable::with_rows(
            self.cell_types.clone(),
            self.sample_ids
                .iter()
                .zip(&self.fractions)
                .map(|(id, f)| FractionVector::new(id.clone(), f.clone()))
                .collect(),
        )?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        serde_json::to_writer(&mut encoder, self)?;
        write_atomic(path, &encoder.finish()?)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(
            MultiGzDecoder::new(file),
        ))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::picker::CellDraw;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use tempfile::tempdir;

    fn cell_types() -> Vec<String> {
        vec!["A".into(), "B".into()]
    }

    fn genes() -> Vec<String> {
        vec!["g1".into(), "g2".into()]
    }

    fn round_output(ids: &[&str]) -> (FractionTable, ProfileBatch, Vec<SampledCellSet>) {
        let fractions = FractionTable::with_rows(
            cell_types(),
            ids.iter()
                .map(|id| FractionVector::new(id.to_string(), vec![0.25, 0.75]))
                .collect(),
        )
        .unwrap();
        let profiles = ProfileBatch {
            sample_ids: ids.iter().map(|id| id.to_string()).collect(),
            genes: genes(),
            tpm: ndarray::Array2::from_elem((ids.len(), 2), 500_000.0),
        };
        let cells = ids
            .iter()
            .map(|id| SampledCellSet {
                sample_id: id.to_string(),
                patient_id: None,
                draws: vec![CellDraw {
                    cell_type: "A".into(),
                    n_cell: 2,
                    cell_ids: vec!["c1".into(), "c2".into()],
                    positions: vec![0, 1],
                }],
            })
            .collect();
        (fractions, profiles, cells)
    }

    #[rstest]
    fn test_file_names() {
        let paths = ArtifactPaths::new(Path::new("out"), "demo");
        assert_eq!(paths.fractions, PathBuf::from("out/generated_frac_demo.csv"));
        assert_eq!(paths.profiles, PathBuf::from("out/simu_bulk_exp_demo_log2cpm1p.csv"));
        assert_eq!(paths.neighbors, PathBuf::from("out/ref2n_neighbors_demo.csv"));
    }

    #[rstest]
    fn test_rounds_are_appended() {
        let dir = tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path(), "demo");
        let writer = ArtifactWriter::create(&paths, &cell_types(), &genes()).unwrap();

        let (f, p, c) = round_output(&["s_fragment_0_0", "s_fragment_0_1"]);
        writer.append_round(&f, &p, &c).unwrap();
        let (f, p, c) = round_output(&["s_fragment_1_0"]);
        ArtifactWriter::resume(&paths).append_round(&f, &p, &c).unwrap();

        assert_eq!(
            read_sample_ids(&paths.fractions).unwrap(),
            vec!["s_fragment_0_0", "s_fragment_0_1", "s_fragment_1_0"]
        );
        let audit = fs::read_to_string(&paths.audit).unwrap();
        assert!(audit.starts_with("sample_id,cell_type,n_cell,selected_cell_id\n"));
        assert!(audit.contains("s_fragment_1_0,A,2,c1;c2\n"));

        let profiles = read_expression_table(&paths.profiles).unwrap();
        // log2(500000 + 1) rounded to 2 decimals
        assert_eq!(profiles.row(2).to_vec(), vec![18.93, 18.93]);
        let fractions = read_fraction_table(&paths.fractions).unwrap();
        assert_eq!(fractions.rows[0].fractions, vec![0.25, 0.75]);
    }

    #[rstest]
    fn test_neighbor_table_round_trip() {
        let dir = tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path(), "demo");
        let writer = ArtifactWriter::create(&paths, &cell_types(), &genes()).unwrap();

        let mut usage = BTreeMap::new();
        usage.insert("TCGA-01".to_string(), 3);
        usage.insert("TCGA-02".to_string(), 1);
        writer.write_neighbors(&usage).unwrap();
        assert_eq!(read_neighbors(&paths.neighbors).unwrap(), usage);
        assert!(!dir.path().join("ref2n_neighbors_demo.csv.tmp").exists());
    }

    #[rstest]
    fn test_bundle_from_tables() {
        let dir = tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path(), "demo");
        let writer = ArtifactWriter::create(&paths, &cell_types(), &genes()).unwrap();
        let (f, p, c) = round_output(&["s_random_0_0", "s_random_0_1"]);
        writer.append_round(&f, &p, &c).unwrap();

        let summary = GenerationSummary {
            name: "demo".into(),
            accepted: 2,
            target: 2,
            rounds: 1,
            candidates: 2,
            acceptance_ratio: 1.0,
            ..Default::default()
        };
        let bundle = DatasetBundle::from_tables(&paths, "test".into(), summary).unwrap();
        bundle.write(&paths.bundle).unwrap();

        let read = DatasetBundle::read(&paths.bundle).unwrap();
        assert_eq!(read, bundle);
        assert_eq!(read.profiles, vec![vec![18.93, 18.93], vec![18.93, 18.93]]);
        assert_eq!(read.fraction_table().unwrap().len(), 2);
    }

    #[rstest]
    fn test_remove_partials() {
        let dir = tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path(), "demo");
        ArtifactWriter::create(&paths, &cell_types(), &genes()).unwrap();
        assert!(paths.has_partials());
        paths.remove_partials().unwrap();
        assert!(!paths.has_partials());
    }

    #[rstest]
    fn test_standalone_fraction_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fractions.csv");
        let (table, _, _) = round_output(&["s_segment_0", "s_segment_1"]);
        write_fraction_table(&path, &table).unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "sample_id,A,B\ns_segment_0,0.25,0.75\ns_segment_1,0.25,0.75\n"
        );
        assert_eq!(read_fraction_table(&path).unwrap(), table);
    }

    #[rstest]
    fn test_fraction_field_rounding() {
        assert_eq!(fraction_field(0.333333), "0.3333");
        assert_eq!(fraction_field(1.0), "1");
    }
}

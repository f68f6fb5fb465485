use std::ffi::OsStr;
use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;

use flate2::read::MultiGzDecoder;
use ndarray::{ArrayView1, ArrayViewMut1};

use crate::errors::{DataError, Result};

/// Scale of the relative-abundance unit used throughout: values of one profile sum to this.
pub const TPM_SCALE: f64 = 1e6;

///
/// Get a reader for either a gzip'd or non-gzip'd file.
///
/// # Arguments
///
/// - path: path to the file to read
///
pub fn get_dynamic_reader(path: &Path) -> Result<BufReader<Box<dyn Read>>> {
    let is_gzipped = path.extension() == Some(OsStr::new("gz"));
    let file = File::open(path)
        .map_err(|e| DataError::FileReadError(format!("{}: {}", path.display(), e)))?;
    let file: Box<dyn Read> = match is_gzipped {
        true => Box::new(MultiGzDecoder::new(file)),
        false => Box::new(file),
    };

    let reader = BufReader::new(file);

    Ok(reader)
}

///
/// Pick the field delimiter for a delimited text table from its file name.
/// `.tsv`, `.txt` and their gzip'd variants are tab separated, everything else is comma separated.
///
pub fn delimiter_for(path: &Path) -> u8 {
    let name = path
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or_default()
        .trim_end_matches(".gz");

    if name.ends_with(".tsv") || name.ends_with(".txt") {
        b'\t'
    } else {
        b','
    }
}

///
/// Quantile of a set of values using linear interpolation between the closest ranks
/// (the default method of numpy and pandas). Returns `None` for an empty input.
///
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(quantile_sorted(&sorted, q))
}

///
/// Same as [`quantile`], for values that are already sorted ascending and non-empty.
///
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

pub fn median(values: &[f64]) -> Option<f64> {
    quantile(values, 0.5)
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// `log2(x + 1)`
pub fn log2_p1(value: f64) -> f64 {
    (value + 1.0).log2()
}

/// Inverse of [`log2_p1`].
pub fn exp2_m1(value: f64) -> f64 {
    value.exp2() - 1.0
}

///
/// Rescale a linear-space profile in place so that it sums to [`TPM_SCALE`].
/// An all-zero profile is left untouched.
///
pub fn normalize_to_tpm(mut profile: ArrayViewMut1<f64>) {
    let total: f64 = profile.sum();
    if total > 0.0 {
        profile.mapv_inplace(|v| v / total * TPM_SCALE);
    }
}

pub fn l1_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum()
}

pub fn euclidean_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

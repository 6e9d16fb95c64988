//! Input matrices and the sample design.
//!
//! Everything here is plain row-major storage over genomic windows
//! (rows, ordered by coordinate and contiguous per chromosome) and
//! samples (columns). Counts are immutable after construction; offsets
//! live on the [`Dataset`] and only ever accumulate.
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A contiguous run of windows belonging to one chromosome, as a
/// half-open range of window indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChromSpan {
    pub name: String,
    pub start: usize,
    pub end: usize,
}

impl ChromSpan {
    pub fn new(name: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            name: name.into(),
            start,
            end,
        }
    }
    pub fn len(&self) -> usize {
        self.end - self.start
    }
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Row-major windows x samples matrix of reals. Used for offsets,
/// control covariates, and posterior probabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealMatrix {
    values: Vec<f64>,
    rows: usize,
    cols: usize,
}

impl RealMatrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            values: vec![0f64; rows * cols],
            rows,
            cols,
        }
    }
    /// Build from a row-major vector; the row count is inferred.
    pub fn from_vec(values: Vec<f64>, cols: usize) -> Result<Self> {
        if cols == 0 || values.len() % cols != 0 {
            return Err(Error::DimensionMismatch {
                context: "RealMatrix::from_vec",
                unit: "columns dividing the buffer length",
                expected: cols.max(1),
                found: values.len(),
            });
        }
        let rows = values.len() / cols;
        Ok(Self { values, rows, cols })
    }
    pub fn rows(&self) -> usize {
        self.rows
    }
    pub fn cols(&self) -> usize {
        self.cols
    }
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.cols + col]
    }
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.values[row * self.cols + col] = value;
    }
    pub fn row(&self, row: usize) -> &[f64] {
        &self.values[row * self.cols..(row + 1) * self.cols]
    }
    pub(crate) fn row_mut(&mut self, row: usize) -> &mut [f64] {
        &mut self.values[row * self.cols..(row + 1) * self.cols]
    }
    pub fn values(&self) -> &[f64] {
        &self.values
    }
    pub(crate) fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }
    /// Element-wise addition; shapes must agree.
    pub fn add(&mut self, other: &RealMatrix) -> Result<()> {
        if self.rows != other.rows || self.cols != other.cols {
            return Err(Error::DimensionMismatch {
                context: "RealMatrix::add",
                unit: "cells",
                expected: self.values.len(),
                found: other.values.len(),
            });
        }
        self.values
            .iter_mut()
            .zip(other.values.iter())
            .for_each(|(x, y)| *x += y);
        Ok(())
    }
}

/// Non-negative read counts per window and sample, with the chromosome
/// spans that partition the window axis. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountMatrix {
    counts: Vec<u32>,
    windows: usize,
    samples: usize,
    spans: Vec<ChromSpan>,
}

impl CountMatrix {
    /// `counts` is row-major windows x samples. The spans must be sorted,
    /// non-empty, and tile `0..windows` without gaps.
    pub fn new(counts: Vec<u32>, samples: usize, spans: Vec<ChromSpan>) -> Result<Self> {
        if samples == 0 || counts.len() % samples != 0 {
            return Err(Error::DimensionMismatch {
                context: "CountMatrix::new",
                unit: "samples dividing the buffer length",
                expected: samples.max(1),
                found: counts.len(),
            });
        }
        let windows = counts.len() / samples;
        if windows == 0 {
            return Err(Error::DimensionMismatch {
                context: "CountMatrix::new",
                unit: "windows",
                expected: 1,
                found: 0,
            });
        }
        let mut cursor = 0;
        for span in &spans {
            if span.start != cursor || span.is_empty() {
                return Err(Error::BadSpans(format!(
                    "span {} covers [{}, {}) but the previous span ended at {}",
                    span.name, span.start, span.end, cursor
                )));
            }
            cursor = span.end;
        }
        if cursor != windows {
            return Err(Error::BadSpans(format!(
                "spans end at {} but the matrix has {} windows",
                cursor, windows
            )));
        }
        Ok(Self {
            counts,
            windows,
            samples,
            spans,
        })
    }
    pub fn windows(&self) -> usize {
        self.windows
    }
    pub fn samples(&self) -> usize {
        self.samples
    }
    pub fn spans(&self) -> &[ChromSpan] {
        &self.spans
    }
    pub fn get(&self, window: usize, sample: usize) -> u32 {
        self.counts[window * self.samples + sample]
    }
    pub fn row(&self, window: usize) -> &[u32] {
        &self.counts[window * self.samples..(window + 1) * self.samples]
    }
}

/// Per-sample condition label and replicate id. Condition indices are
/// assigned in order of first appearance of each label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Design {
    conditions: Vec<String>,
    assignment: Vec<usize>,
    replicates: Vec<u32>,
}

impl Design {
    pub fn new<S: AsRef<str>>(samples: &[(S, u32)]) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::EmptyDesign);
        }
        let mut conditions: Vec<String> = vec![];
        let mut assignment = vec![];
        let mut replicates = vec![];
        for (label, replicate) in samples {
            let label = label.as_ref();
            let idx = match conditions.iter().position(|c| c == label) {
                Some(idx) => idx,
                None => {
                    conditions.push(label.to_string());
                    conditions.len() - 1
                }
            };
            assignment.push(idx);
            replicates.push(*replicate);
        }
        Ok(Self {
            conditions,
            assignment,
            replicates,
        })
    }
    pub fn n_samples(&self) -> usize {
        self.assignment.len()
    }
    pub fn n_conditions(&self) -> usize {
        self.conditions.len()
    }
    pub fn condition_of(&self, sample: usize) -> usize {
        self.assignment[sample]
    }
    pub fn replicate_of(&self, sample: usize) -> u32 {
        self.replicates[sample]
    }
    pub fn condition_name(&self, condition: usize) -> &str {
        &self.conditions[condition]
    }
    pub fn samples_of(&self, condition: usize) -> impl Iterator<Item = usize> + '_ {
        self.assignment
            .iter()
            .enumerate()
            .filter(move |(_, &c)| c == condition)
            .map(|(j, _)| j)
    }
}

/// Counts, offsets, design and the optional control covariate, bundled
/// and shape-checked once. The offsets start at zero and accumulate via
/// [`Dataset::add_offsets`]; they are never replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    counts: CountMatrix,
    offsets: RealMatrix,
    design: Design,
    control: Option<RealMatrix>,
}

impl Dataset {
    pub fn new(counts: CountMatrix, design: Design) -> Result<Self> {
        if design.n_samples() != counts.samples() {
            return Err(Error::DimensionMismatch {
                context: "Dataset::new",
                unit: "samples",
                expected: counts.samples(),
                found: design.n_samples(),
            });
        }
        let offsets = RealMatrix::zeros(counts.windows(), counts.samples());
        Ok(Self {
            counts,
            offsets,
            design,
            control: None,
        })
    }
    /// Attach log-scale control counts; they enter every state's mean
    /// model as a covariate, not as an offset.
    pub fn with_control(mut self, control: RealMatrix) -> Result<Self> {
        self.check_shape("Dataset::with_control", &control)?;
        self.control = Some(control);
        Ok(self)
    }
    /// Accumulate normalization offsets on top of the existing ones.
    pub fn add_offsets(&mut self, extra: &RealMatrix) -> Result<()> {
        self.check_shape("Dataset::add_offsets", extra)?;
        self.offsets.add(extra)
    }
    fn check_shape(&self, context: &'static str, matrix: &RealMatrix) -> Result<()> {
        if matrix.rows() != self.counts.windows() || matrix.cols() != self.counts.samples() {
            return Err(Error::DimensionMismatch {
                context,
                unit: "cells",
                expected: self.counts.windows() * self.counts.samples(),
                found: matrix.rows() * matrix.cols(),
            });
        }
        Ok(())
    }
    pub fn counts(&self) -> &CountMatrix {
        &self.counts
    }
    pub fn offsets(&self) -> &RealMatrix {
        &self.offsets
    }
    pub fn design(&self) -> &Design {
        &self.design
    }
    pub fn control(&self) -> Option<&RealMatrix> {
        self.control.as_ref()
    }
    pub fn windows(&self) -> usize {
        self.counts.windows()
    }
    pub fn samples(&self) -> usize {
        self.counts.samples()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_dataset() -> Dataset {
        let spans = vec![ChromSpan::new("chr1", 0, 2), ChromSpan::new("chr2", 2, 3)];
        let counts = CountMatrix::new(vec![1, 2, 3, 4, 5, 6], 2, spans).unwrap();
        let design = Design::new(&[("input", 1), ("input", 2)]).unwrap();
        Dataset::new(counts, design).unwrap()
    }

    #[test]
    fn at_least_one_window_is_required() {
        assert!(CountMatrix::new(vec![], 2, vec![]).is_err());
        assert!(CountMatrix::new(vec![], 1, vec![]).is_err());
    }

    #[test]
    fn spans_must_tile_the_window_axis() {
        let bad = vec![ChromSpan::new("chr1", 0, 1), ChromSpan::new("chr2", 2, 3)];
        assert!(CountMatrix::new(vec![0; 6], 2, bad).is_err());
        let short = vec![ChromSpan::new("chr1", 0, 2)];
        assert!(CountMatrix::new(vec![0; 6], 2, short).is_err());
    }

    #[test]
    fn design_indexes_conditions_by_first_appearance() {
        let design =
            Design::new(&[("ctrl", 1), ("treat", 1), ("ctrl", 2), ("treat", 2)]).unwrap();
        assert_eq!(design.n_conditions(), 2);
        assert_eq!(design.condition_of(0), 0);
        assert_eq!(design.condition_of(1), 1);
        assert_eq!(design.condition_of(2), 0);
        assert_eq!(design.samples_of(1).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(design.condition_name(1), "treat");
    }

    #[test]
    fn add_offsets_accumulates() {
        let mut once = toy_dataset();
        let mut twice = toy_dataset();
        let o1 = RealMatrix::from_vec(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6], 2).unwrap();
        let o2 = RealMatrix::from_vec(vec![1.0; 6], 2).unwrap();
        let mut sum = o1.clone();
        sum.add(&o2).unwrap();
        once.add_offsets(&sum).unwrap();
        twice.add_offsets(&o1).unwrap();
        twice.add_offsets(&o2).unwrap();
        assert_eq!(once.offsets(), twice.offsets());
    }

    #[test]
    fn offset_shape_is_enforced() {
        let mut data = toy_dataset();
        let bad = RealMatrix::zeros(3, 3);
        assert!(data.add_offsets(&bad).is_err());
    }
}

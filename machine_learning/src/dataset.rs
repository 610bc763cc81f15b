use std::{fs, num::NonZeroUsize, ops::Range, path::Path};

use log::debug;
use ndarray::{Array2, ArrayView2, Axis, s};

use crate::{MlErr, Result};

/// A batch of examples: one flattened feature row per example and its class id.
#[derive(Debug, Clone)]
pub struct Batch {
    features: Array2<f32>,
    labels: Vec<usize>,
}

impl Batch {
    /// Creates a new `Batch` from class-index labels.
    ///
    /// # Arguments
    /// * `features` - A `[n, feature_dim]` matrix, one row per example.
    /// * `labels` - The class id of each row.
    ///
    /// # Returns
    /// A new `Batch` or an error if the amount of rows and labels differ.
    pub fn new(features: Array2<f32>, labels: Vec<usize>) -> Result<Self> {
        if features.nrows() != labels.len() {
            return Err(MlErr::SizeMismatch {
                what: "batch labels",
                got: labels.len(),
                expected: features.nrows(),
            });
        }

        Ok(Self { features, labels })
    }

    /// Creates a new `Batch` from one-hot encoded labels, each row is decoded to the
    /// index of its first maximum.
    ///
    /// # Arguments
    /// * `features` - A `[n, feature_dim]` matrix, one row per example.
    /// * `one_hot` - A `[n, classes]` matrix.
    pub fn from_one_hot(features: Array2<f32>, one_hot: ArrayView2<f32>) -> Result<Self> {
        let labels = one_hot.outer_iter().map(|row| argmax(row.iter())).collect();
        Self::new(features, labels)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn features(&self) -> ArrayView2<'_, f32> {
        self.features.view()
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Borrows the entire batch.
    pub fn view(&self) -> BatchView<'_> {
        BatchView {
            features: self.features.view(),
            labels: &self.labels,
        }
    }
}

/// Borrowed batch view (zero-copy), used to hand contiguous shards to replicas.
#[derive(Debug, Clone, Copy)]
pub struct BatchView<'a> {
    pub features: ArrayView2<'a, f32>,
    pub labels: &'a [usize],
}

impl<'a> BatchView<'a> {
    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Returns the contiguous sub-range `[range.start, range.end)` of this view.
    ///
    /// # Panics
    /// If `range` is out of bounds.
    pub fn slice(self, range: Range<usize>) -> BatchView<'a> {
        BatchView {
            features: self.features.slice_move(s![range.clone(), ..]),
            labels: &self.labels[range],
        }
    }
}

/// Index of the first maximum value, `0` for an empty iterator.
fn argmax<'a, I: Iterator<Item = &'a f32>>(values: I) -> usize {
    let mut best = f32::NEG_INFINITY;
    let mut idx = 0;

    for (i, &v) in values.enumerate() {
        if v > best {
            best = v;
            idx = i;
        }
    }

    idx
}

/// The contract every batch provider has to fulfill for training, validation and enrollment.
pub trait DataSource {
    /// Returns the next batch, the last one of a pass may be smaller than `batch_size`.
    /// Returns `None` once the pass is exhausted until `reset_batch_counter` is called.
    fn next_batch(&mut self) -> Option<Batch>;

    /// The total amount of examples in the source.
    fn num_examples(&self) -> usize;

    /// Rewinds the source to its first batch.
    fn reset_batch_counter(&mut self);

    /// The configured amount of examples per batch.
    fn batch_size(&self) -> usize;

    /// The amount of speaker classes labels are drawn from.
    fn spkr_num(&self) -> usize;
}

/// A data source holding every example in memory.
#[derive(Debug, Clone)]
pub struct InMemoryDataSource {
    features: Array2<f32>,
    labels: Vec<usize>,
    batch_size: NonZeroUsize,
    spkr_num: usize,
    cursor: usize,
}

impl InMemoryDataSource {
    /// Creates a new `InMemoryDataSource`.
    ///
    /// # Arguments
    /// * `features` - A `[n, feature_dim]` matrix, one row per example.
    /// * `labels` - The class id of each row.
    /// * `batch_size` - The amount of examples per batch.
    /// * `spkr_num` - The amount of speaker classes.
    ///
    /// # Returns
    /// A new `InMemoryDataSource` or an error if the rows and labels mismatch or a
    /// label is not a valid class id.
    pub fn new(
        features: Array2<f32>,
        labels: Vec<usize>,
        batch_size: NonZeroUsize,
        spkr_num: usize,
    ) -> Result<Self> {
        if features.nrows() != labels.len() {
            return Err(MlErr::SizeMismatch {
                what: "dataset labels",
                got: labels.len(),
                expected: features.nrows(),
            });
        }

        if let Some(&label) = labels.iter().find(|&&label| label >= spkr_num) {
            return Err(MlErr::LabelOutOfRange {
                label,
                classes: spkr_num,
            });
        }

        Ok(Self {
            features,
            labels,
            batch_size,
            spkr_num,
            cursor: 0,
        })
    }

    /// Loads a data source from a csv file where every line is `label,f_0,f_1,...,f_k`.
    ///
    /// # Arguments
    /// * `path` - The csv file.
    /// * `batch_size` - The amount of examples per batch.
    /// * `spkr_num` - The amount of speaker classes.
    pub fn from_csv<P: AsRef<Path>>(
        path: P,
        batch_size: NonZeroUsize,
        spkr_num: usize,
    ) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;

        let mut labels = Vec::new();
        let mut data = Vec::new();
        let mut width = None;

        for (i, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let mut fields = line.split(',').map(str::trim);
            let label = fields
                .next()
                .and_then(|field| field.parse::<usize>().ok())
                .ok_or_else(|| MlErr::Dataset {
                    line: i + 1,
                    reason: "the first field must be a class id".into(),
                })?;

            let start = data.len();
            for field in fields {
                let value = field.parse::<f32>().map_err(|e| MlErr::Dataset {
                    line: i + 1,
                    reason: format!("invalid feature {field:?}: {e}"),
                })?;
                data.push(value);
            }

            let row_width = data.len() - start;
            match width {
                None => width = Some(row_width),
                Some(w) if w != row_width => {
                    return Err(MlErr::Dataset {
                        line: i + 1,
                        reason: format!("expected {w} features, got {row_width}"),
                    });
                }
                Some(_) => {}
            }

            labels.push(label);
        }

        let features = Array2::from_shape_vec((labels.len(), width.unwrap_or(0)), data)?;
        debug!(examples = labels.len(); "loaded csv dataset from {}", path.as_ref().display());
        Self::new(features, labels, batch_size, spkr_num)
    }

    /// The dimension of every feature row.
    pub fn feature_dim(&self) -> usize {
        self.features.len_of(Axis(1))
    }
}

impl DataSource for InMemoryDataSource {
    fn next_batch(&mut self) -> Option<Batch> {
        let total = self.labels.len();
        if self.cursor >= total {
            return None;
        }

        let end = (self.cursor + self.batch_size.get()).min(total);
        let features = self.features.slice(s![self.cursor..end, ..]).to_owned();
        let labels = self.labels[self.cursor..end].to_vec();

        self.cursor = end;
        Some(Batch { features, labels })
    }

    fn num_examples(&self) -> usize {
        self.labels.len()
    }

    fn reset_batch_counter(&mut self) {
        self.cursor = 0;
    }

    fn batch_size(&self) -> usize {
        self.batch_size.get()
    }

    fn spkr_num(&self) -> usize {
        self.spkr_num
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use ndarray::array;

    use super::*;

    fn source(batch_size: usize) -> InMemoryDataSource {
        let features = Array2::from_shape_fn((5, 2), |(i, j)| (i * 2 + j) as f32);
        let labels = vec![0, 1, 2, 0, 1];
        InMemoryDataSource::new(features, labels, NonZeroUsize::new(batch_size).unwrap(), 3)
            .unwrap()
    }

    #[test]
    fn batches_respect_batch_size_and_reset() {
        let mut ds = source(2);

        let b1 = ds.next_batch().unwrap();
        assert_eq!(b1.labels(), &[0, 1]);
        assert_eq!(b1.features(), array![[0., 1.], [2., 3.]]);

        let b2 = ds.next_batch().unwrap();
        assert_eq!(b2.labels(), &[2, 0]);

        let b3 = ds.next_batch().unwrap();
        assert_eq!(b3.len(), 1);
        assert!(ds.next_batch().is_none());

        ds.reset_batch_counter();
        assert_eq!(ds.next_batch().unwrap().labels(), &[0, 1]);
    }

    #[test]
    fn one_hot_labels_decode_to_first_max() {
        let features = Array2::zeros((3, 1));
        let one_hot = array![[0., 1., 0.], [1., 0., 0.], [0., 0.5, 0.5]];
        let batch = Batch::from_one_hot(features, one_hot.view()).unwrap();
        assert_eq!(batch.labels(), &[1, 0, 1]);
    }

    #[test]
    fn view_slice_is_contiguous() {
        let ds = source(5);
        let batch = Batch::new(ds.features.clone(), ds.labels.clone()).unwrap();
        let shard = batch.view().slice(2..4);

        assert_eq!(shard.labels, &[2, 0]);
        assert_eq!(shard.features, array![[4., 5.], [6., 7.]]);
    }

    #[test]
    fn rejects_out_of_range_labels() {
        let features = Array2::zeros((2, 1));
        let err = InMemoryDataSource::new(features, vec![0, 4], NonZeroUsize::MIN, 3);
        assert!(matches!(
            err,
            Err(MlErr::LabelOutOfRange {
                label: 4,
                classes: 3
            })
        ));
    }

    #[test]
    fn csv_loading() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0, 1.0, 2.0").unwrap();
        writeln!(file, "2, 3.0, 4.0").unwrap();
        writeln!(file).unwrap();

        let mut ds = InMemoryDataSource::from_csv(file.path(), NonZeroUsize::MIN, 3).unwrap();
        assert_eq!(ds.num_examples(), 2);
        assert_eq!(ds.feature_dim(), 2);

        let b = ds.next_batch().unwrap();
        assert_eq!(b.labels(), &[0]);
        assert_eq!(b.features(), array![[1., 2.]]);
    }

    #[test]
    fn csv_ragged_rows_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0,1.0,2.0").unwrap();
        writeln!(file, "1,3.0").unwrap();

        let err = InMemoryDataSource::from_csv(file.path(), NonZeroUsize::MIN, 3);
        assert!(matches!(err, Err(MlErr::Dataset { line: 2, .. })));
    }
}
